use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;

use crate::backend::BackendTier;
use crate::config::ConsoleConfig;
use crate::error::{ConsoleError, ConsoleResult};
use crate::operator_log::{self, Level};

/// Runs an operation against the first tier that answers.
///
/// The tier plan is recomputed from the latest config on every call. Transport
/// and validation failures on a non-terminal tier fall through to the next
/// tier; any other failure, and every failure on the terminal tier, reaches the
/// caller unchanged. The router holds no data of its own.
pub struct BackendRouter<B: ?Sized> {
    label: &'static str,
    config: watch::Receiver<ConsoleConfig>,
    gateway: Option<Arc<B>>,
    mock: Option<Arc<B>>,
    database: Option<Arc<B>>,
}

impl<B: ?Sized + Send + Sync> BackendRouter<B> {
    pub fn new(label: &'static str, config: watch::Receiver<ConsoleConfig>) -> Self {
        Self {
            label,
            config,
            gateway: None,
            mock: None,
            database: None,
        }
    }

    pub fn with_tier(mut self, tier: BackendTier, backend: Arc<B>) -> Self {
        match tier {
            BackendTier::LiveGateway => self.gateway = Some(backend),
            BackendTier::LocalMock => self.mock = Some(backend),
            BackendTier::RemoteDatabase => self.database = Some(backend),
        }
        self
    }

    fn slot(&self, tier: BackendTier) -> Option<&Arc<B>> {
        match tier {
            BackendTier::LiveGateway => self.gateway.as_ref(),
            BackendTier::LocalMock => self.mock.as_ref(),
            BackendTier::RemoteDatabase => self.database.as_ref(),
        }
    }

    /// Tiers that are both enabled by config and wired for this entity kind.
    pub fn active_tiers(&self) -> Vec<BackendTier> {
        let config = self.config.borrow();
        BackendTier::plan(&config)
            .into_iter()
            .filter(|tier| self.slot(*tier).is_some())
            .collect()
    }

    pub async fn route<T, F, Fut>(&self, op: &str, call: F) -> ConsoleResult<T>
    where
        F: FnMut(Arc<B>) -> Fut,
        Fut: Future<Output = ConsoleResult<T>>,
    {
        self.route_tagged(op, call).await.map(|(_, value)| value)
    }

    /// Like [`route`](Self::route) but also reports which tier answered.
    pub async fn route_tagged<T, F, Fut>(
        &self,
        op: &str,
        mut call: F,
    ) -> ConsoleResult<(BackendTier, T)>
    where
        F: FnMut(Arc<B>) -> Fut,
        Fut: Future<Output = ConsoleResult<T>>,
    {
        let tiers = self.active_tiers();
        if operator_log::enabled(Level::Trace) {
            let plan = tiers
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",");
            operator_log::trace(
                module_path!(),
                format!("route op={}.{op} plan=[{plan}]", self.label),
            );
        }
        let Some(terminal) = tiers.last().copied() else {
            return Err(ConsoleError::validation(format!(
                "no backend tier available for {}.{op}",
                self.label
            )));
        };
        for tier in tiers {
            let Some(backend) = self.slot(tier).cloned() else {
                continue;
            };
            match call(backend).await {
                Ok(value) => {
                    operator_log::debug(
                        module_path!(),
                        format!("route op={}.{op} tier={tier} ok", self.label),
                    );
                    return Ok((tier, value));
                }
                Err(err) if tier != terminal && err.is_fallback_eligible() => {
                    operator_log::warn(
                        module_path!(),
                        format!(
                            "route op={}.{op} tier={tier} failed, falling back: {err}",
                            self.label
                        ),
                    );
                }
                Err(err) => {
                    operator_log::error(
                        module_path!(),
                        format!("route op={}.{op} tier={tier} failed: {err}", self.label),
                    );
                    return Err(err);
                }
            }
        }
        Err(ConsoleError::validation(format!(
            "no backend tier answered {}.{op}",
            self.label
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct TierStub {
        tier: BackendTier,
        outcome: ConsoleResult<&'static str>,
        calls: Arc<Mutex<Vec<BackendTier>>>,
    }

    impl TierStub {
        fn answer(&self) -> ConsoleResult<&'static str> {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(self.tier);
            }
            self.outcome.clone()
        }
    }

    fn router(
        config: ConsoleConfig,
        outcomes: [ConsoleResult<&'static str>; 3],
    ) -> (BackendRouter<TierStub>, Arc<Mutex<Vec<BackendTier>>>) {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (_tx, rx) = watch::channel(config);
        let [gateway, mock, database] = outcomes;
        let stub = |tier, outcome| {
            Arc::new(TierStub {
                tier,
                outcome,
                calls: calls.clone(),
            })
        };
        let router = BackendRouter::new("stub", rx)
            .with_tier(BackendTier::LiveGateway, stub(BackendTier::LiveGateway, gateway))
            .with_tier(BackendTier::LocalMock, stub(BackendTier::LocalMock, mock))
            .with_tier(
                BackendTier::RemoteDatabase,
                stub(BackendTier::RemoteDatabase, database),
            );
        (router, calls)
    }

    fn live_config() -> ConsoleConfig {
        let mut config = ConsoleConfig::default();
        config.gateway.base_url = "https://gw.example.com".to_string();
        config.gateway.api_key = "key".to_string();
        config
    }

    fn recorded(calls: &Arc<Mutex<Vec<BackendTier>>>) -> Vec<BackendTier> {
        calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    #[tokio::test]
    async fn transport_failure_falls_back_to_mock() -> anyhow::Result<()> {
        let (router, calls) = router(
            live_config(),
            [
                Err(ConsoleError::transport("500")),
                Ok("mock"),
                Ok("database"),
            ],
        );
        let (tier, value) = router
            .route_tagged("list", |stub| async move { stub.answer() })
            .await?;
        assert_eq!(tier, BackendTier::LocalMock);
        assert_eq!(value, "mock");
        assert_eq!(
            recorded(&calls),
            vec![BackendTier::LiveGateway, BackendTier::LocalMock]
        );
        Ok(())
    }

    #[tokio::test]
    async fn invalid_gateway_url_is_never_attempted() -> anyhow::Result<()> {
        let mut config = live_config();
        config.gateway.base_url = "gw.example.com".to_string();
        let (router, calls) = router(config, [Ok("gateway"), Ok("mock"), Ok("database")]);
        let value = router
            .route("list", |stub| async move { stub.answer() })
            .await?;
        assert_eq!(value, "mock");
        assert_eq!(recorded(&calls), vec![BackendTier::LocalMock]);
        Ok(())
    }

    #[tokio::test]
    async fn not_found_on_mock_is_surfaced() {
        let (router, calls) = router(
            ConsoleConfig::default(),
            [
                Ok("gateway"),
                Err(ConsoleError::not_found("inst-9")),
                Ok("database"),
            ],
        );
        let result = router
            .route("delete", |stub| async move { stub.answer() })
            .await;
        assert_eq!(result, Err(ConsoleError::not_found("inst-9")));
        assert_eq!(recorded(&calls), vec![BackendTier::LocalMock]);
    }

    #[tokio::test]
    async fn terminal_tier_errors_are_surfaced() {
        let config = ConsoleConfig {
            mock_mode: false,
            ..live_config()
        };
        let (router, calls) = router(
            config,
            [
                Err(ConsoleError::transport("gateway down")),
                Ok("mock"),
                Err(ConsoleError::transport("database down")),
            ],
        );
        let result = router
            .route("list", |stub| async move { stub.answer() })
            .await;
        assert_eq!(result, Err(ConsoleError::transport("database down")));
        assert_eq!(
            recorded(&calls),
            vec![BackendTier::LiveGateway, BackendTier::RemoteDatabase]
        );
    }

    #[tokio::test]
    async fn config_change_reshapes_the_plan() -> anyhow::Result<()> {
        let calls = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = watch::channel(ConsoleConfig::default());
        let router = BackendRouter::new("stub", rx)
            .with_tier(
                BackendTier::LocalMock,
                Arc::new(TierStub {
                    tier: BackendTier::LocalMock,
                    outcome: Ok("mock"),
                    calls: calls.clone(),
                }),
            )
            .with_tier(
                BackendTier::RemoteDatabase,
                Arc::new(TierStub {
                    tier: BackendTier::RemoteDatabase,
                    outcome: Ok("database"),
                    calls: calls.clone(),
                }),
            );
        assert_eq!(router.route("list", |p| async move { p.answer() }).await?, "mock");
        tx.send_modify(|config| config.mock_mode = false);
        assert_eq!(
            router.route("list", |p| async move { p.answer() }).await?,
            "database"
        );
        Ok(())
    }
}
