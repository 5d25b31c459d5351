//! Device pairing state machine.
//!
//! A session walks `Loading -> Displaying -> AwaitingConfirmation ->
//! Succeeded`. `Cancelled` and `Aborted` are terminal and reachable from any
//! non-terminal phase. Each timer re-checks the session's liveness flag and
//! generation when it fires, so a session that has been closed or replaced
//! never commits.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;

use crate::config::{ConsoleConfig, PairingTimings};
use crate::error::{ConsoleError, ConsoleResult};
use crate::instances::InstanceRepository;
use crate::model::{Actor, ConnectionReport, Instance, PairingTarget};
use crate::operator_log;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum PairingPhase {
    Loading,
    Displaying { payload: String },
    AwaitingConfirmation,
    Succeeded,
    Cancelled,
    Aborted { reason: String },
}

impl PairingPhase {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Succeeded | Self::Cancelled | Self::Aborted { .. }
        )
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Displaying { .. } => "displaying",
            Self::AwaitingConfirmation => "awaiting_confirmation",
            Self::Succeeded => "succeeded",
            Self::Cancelled => "cancelled",
            Self::Aborted { .. } => "aborted",
        }
    }
}

/// State shared between a session's driver task and whoever may cancel it.
struct SessionShared {
    generation: u64,
    instance_id: String,
    live: AtomicBool,
    wake: Notify,
    phase: watch::Sender<PairingPhase>,
}

impl SessionShared {
    /// Moves to `next` unless a terminal phase has already been reached.
    fn advance(&self, next: PairingPhase) -> bool {
        let changed = self.phase.send_if_modified(|current| {
            if current.is_terminal() {
                return false;
            }
            *current = next.clone();
            true
        });
        if changed {
            operator_log::debug(
                module_path!(),
                format!(
                    "pairing instance={} generation={} phase={}",
                    self.instance_id,
                    self.generation,
                    next.name()
                ),
            );
        }
        changed
    }

    fn close(&self) {
        self.live.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    fn cancel(&self) {
        self.advance(PairingPhase::Cancelled);
        self.close();
    }
}

/// Caller-side view of one pairing session.
pub struct PairingSession {
    shared: Arc<SessionShared>,
    phase: watch::Receiver<PairingPhase>,
}

impl PairingSession {
    pub fn generation(&self) -> u64 {
        self.shared.generation
    }

    pub fn instance_id(&self) -> &str {
        &self.shared.instance_id
    }

    pub fn phase(&self) -> PairingPhase {
        self.phase.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PairingPhase> {
        self.phase.clone()
    }

    pub fn cancel(&self) {
        self.shared.cancel();
    }

    /// Resolves once the session reaches a terminal phase.
    pub async fn finished(&mut self) -> PairingPhase {
        loop {
            let phase = self.phase.borrow_and_update().clone();
            if phase.is_terminal() {
                return phase;
            }
            if self.phase.changed().await.is_err() {
                return self.phase.borrow().clone();
            }
        }
    }

    pub async fn wait(&mut self) -> ConsoleResult<()> {
        match self.finished().await {
            PairingPhase::Succeeded => Ok(()),
            PairingPhase::Cancelled => Err(ConsoleError::PairingAborted(
                "session cancelled".to_string(),
            )),
            PairingPhase::Aborted { reason } => Err(ConsoleError::PairingAborted(reason)),
            other => Err(ConsoleError::PairingAborted(format!(
                "session ended in phase {}",
                other.name()
            ))),
        }
    }
}

struct ActiveSession {
    shared: Arc<SessionShared>,
    task: JoinHandle<()>,
}

/// Owns at most one pairing session at a time.
pub struct PairingCoordinator {
    instances: Arc<InstanceRepository>,
    config: watch::Receiver<ConsoleConfig>,
    generation: AtomicU64,
    current: Mutex<Option<ActiveSession>>,
}

impl PairingCoordinator {
    pub fn new(instances: Arc<InstanceRepository>, config: watch::Receiver<ConsoleConfig>) -> Self {
        Self {
            instances,
            config,
            generation: AtomicU64::new(0),
            current: Mutex::new(None),
        }
    }

    /// Opens a session for `instance`, cancelling any session still running.
    pub fn open(&self, instance: &Instance, actor: &Actor) -> PairingSession {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (phase_tx, phase_rx) = watch::channel(PairingPhase::Loading);
        let shared = Arc::new(SessionShared {
            generation,
            instance_id: instance.id.clone(),
            live: AtomicBool::new(true),
            wake: Notify::new(),
            phase: phase_tx,
        });
        let timings = self.config.borrow().pairing;
        let driver = SessionDriver {
            shared: shared.clone(),
            instances: self.instances.clone(),
            instance: instance.clone(),
            actor: actor.clone(),
            timings,
        };
        let mut current = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(previous) = current.take() {
            operator_log::info(
                module_path!(),
                format!(
                    "pairing replaced instance={} generation={}",
                    previous.shared.instance_id, previous.shared.generation
                ),
            );
            previous.shared.cancel();
        }
        let task = tokio::spawn(driver.run());
        *current = Some(ActiveSession {
            shared: shared.clone(),
            task,
        });
        PairingSession {
            shared,
            phase: phase_rx,
        }
    }

    /// Cancels the current session, if any. Returns whether one was running.
    pub fn cancel(&self) -> bool {
        let current = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match current.as_ref() {
            Some(active) if !active.task.is_finished() => {
                active.shared.cancel();
                true
            }
            _ => false,
        }
    }

    /// Phase of the current session and the instance it targets.
    pub fn current(&self) -> Option<(String, PairingPhase)> {
        let current = match self.current.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        current.as_ref().map(|active| {
            (
                active.shared.instance_id.clone(),
                active.shared.phase.borrow().clone(),
            )
        })
    }
}

struct SessionDriver {
    shared: Arc<SessionShared>,
    instances: Arc<InstanceRepository>,
    instance: Instance,
    actor: Actor,
    timings: PairingTimings,
}

impl SessionDriver {
    fn is_live(&self) -> bool {
        self.shared.live.load(Ordering::SeqCst)
    }

    /// Sleeps for `ms` or until the session is closed; true if still live.
    async fn dwell(&self, ms: u64) -> bool {
        if !self.is_live() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
            _ = self.shared.wake.notified() => {}
        }
        self.is_live()
    }

    async fn run(self) {
        let target: PairingTarget = self.instance.target();
        let payload = match self
            .instances
            .request_pairing_material(&self.instance, &self.actor)
            .await
        {
            Ok(payload) => payload,
            Err(err) => {
                operator_log::warn(
                    module_path!(),
                    format!("pairing aborted instance={} err={err}", target.id),
                );
                self.shared.advance(PairingPhase::Aborted {
                    reason: err.to_string(),
                });
                self.shared.close();
                return;
            }
        };
        if !self.is_live() {
            return;
        }
        self.shared.advance(PairingPhase::Displaying { payload });

        if !self.dwell(self.timings.scan_dwell_ms).await {
            return;
        }
        self.shared.advance(PairingPhase::AwaitingConfirmation);

        if !self.dwell(self.timings.confirm_dwell_ms).await {
            return;
        }
        match self
            .instances
            .commit_connected(&target, &ConnectionReport::default())
            .await
        {
            Ok(_) => {
                self.shared.advance(PairingPhase::Succeeded);
            }
            Err(err) => {
                operator_log::warn(
                    module_path!(),
                    format!("pairing commit failed instance={} err={err}", target.id),
                );
                self.shared.advance(PairingPhase::Aborted {
                    reason: err.to_string(),
                });
                self.shared.close();
                return;
            }
        }
        self.instances.request_refresh();
        self.dwell(self.timings.close_grace_ms).await;
        self.shared.close();
    }
}
