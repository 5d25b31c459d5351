//! Instance lifecycle on top of the tier router: permission checks, the quota
//! gate, and change notifications for listings.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{Mutex, broadcast, watch};

use crate::backend::database::{DatabaseClient, DatabaseInstanceBackend};
use crate::backend::gateway::{GatewayClient, GatewayInstanceBackend};
use crate::backend::mock::MockInstanceBackend;
use crate::backend::{BackendRouter, BackendTier, InstanceBackend};
use crate::config::ConsoleConfig;
use crate::error::{ConsoleError, ConsoleResult};
use crate::license::LicenseGate;
use crate::model::{
    Actor, ConnectionReport, Instance, InstanceStatus, NewInstance, PairingTarget,
};
use crate::operator_log;
use crate::store::SeedStore;

const EVENT_CAPACITY: usize = 64;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InstanceEvent {
    Created { instance: Instance },
    Deleted { id: String, name: String },
    Connected { instance: Instance },
    RefreshRequested,
}

pub struct InstanceRepository {
    router: BackendRouter<dyn InstanceBackend>,
    license: Arc<LicenseGate>,
    config: watch::Receiver<ConsoleConfig>,
    events: broadcast::Sender<InstanceEvent>,
    /// Held from the quota check until the new record exists, so concurrent
    /// creates cannot both claim the last seat.
    create_lock: Mutex<()>,
}

impl InstanceRepository {
    pub fn new(
        router: BackendRouter<dyn InstanceBackend>,
        license: Arc<LicenseGate>,
        config: watch::Receiver<ConsoleConfig>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            router,
            license,
            config,
            events,
            create_lock: Mutex::new(()),
        }
    }

    /// Wires all three tiers.
    pub fn wire(
        config: watch::Receiver<ConsoleConfig>,
        seeds: SeedStore,
        database: Arc<DatabaseClient>,
        license: Arc<LicenseGate>,
    ) -> Self {
        let gateway: Arc<dyn InstanceBackend> = Arc::new(GatewayInstanceBackend::new(
            GatewayClient::new(config.clone()),
            seeds.clone(),
        ));
        let mock: Arc<dyn InstanceBackend> = Arc::new(MockInstanceBackend::new(seeds));
        let remote: Arc<dyn InstanceBackend> = Arc::new(DatabaseInstanceBackend::new(database));
        let router = BackendRouter::new("instances", config.clone())
            .with_tier(BackendTier::LiveGateway, gateway)
            .with_tier(BackendTier::LocalMock, mock)
            .with_tier(BackendTier::RemoteDatabase, remote);
        Self::new(router, license, config)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.events.subscribe()
    }

    pub fn request_refresh(&self) {
        self.publish(InstanceEvent::RefreshRequested);
    }

    fn publish(&self, event: InstanceEvent) {
        // No subscribers is not an error.
        let _ = self.events.send(event);
    }

    async fn list_all(&self) -> ConsoleResult<Vec<Instance>> {
        self.router
            .route("list", |backend| async move { backend.list().await })
            .await
    }

    pub async fn list(&self, actor: &Actor) -> ConsoleResult<Vec<Instance>> {
        let instances = self.list_all().await?;
        let see_all = self
            .config
            .borrow()
            .role_settings(actor.role)
            .see_all_instances;
        if see_all {
            return Ok(instances);
        }
        Ok(instances
            .into_iter()
            .filter(|instance| actor.owns(instance))
            .collect())
    }

    pub async fn create(&self, name: &str, actor: &Actor) -> ConsoleResult<Instance> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ConsoleError::validation("instance name is empty"));
        }
        let _seat = self.create_lock.lock().await;
        self.license.ensure_can_create(actor.role).await?;
        let request = NewInstance {
            name: name.to_string(),
            owner_id: actor.user_id.clone(),
            owner_name: actor.name.clone(),
        };
        let request = &request;
        let (tier, mut instance) = self
            .router
            .route_tagged("create", |backend| async move { backend.create(request).await })
            .await?;
        instance.status = InstanceStatus::Connecting;
        operator_log::info(
            module_path!(),
            format!(
                "instance created id={} name={} owner={} tier={tier}",
                instance.id, instance.name, actor.user_id
            ),
        );
        self.publish(InstanceEvent::Created {
            instance: instance.clone(),
        });
        Ok(instance)
    }

    pub async fn delete(&self, instance: &Instance, actor: &Actor) -> ConsoleResult<()> {
        if !actor.owns(instance) && !actor.role.is_supervisor() {
            return Err(ConsoleError::PermissionDenied(format!(
                "{} may not delete instance {}",
                actor.user_id, instance.id
            )));
        }
        let (id, name) = (instance.id.as_str(), instance.name.as_str());
        self.router
            .route("delete", |backend| async move { backend.delete(id, name).await })
            .await?;
        operator_log::info(
            module_path!(),
            format!("instance deleted id={id} by={}", actor.user_id),
        );
        self.publish(InstanceEvent::Deleted {
            id: instance.id.clone(),
            name: instance.name.clone(),
        });
        Ok(())
    }

    /// Only the owner may pair a device to an instance.
    pub async fn request_pairing_material(
        &self,
        instance: &Instance,
        actor: &Actor,
    ) -> ConsoleResult<String> {
        if !actor.owns(instance) {
            return Err(ConsoleError::PermissionDenied(format!(
                "only the owner may pair instance {}",
                instance.id
            )));
        }
        let (id, name) = (instance.id.as_str(), instance.name.as_str());
        self.router
            .route("pairing_material", |backend| async move {
                backend.pairing_material(id, name).await
            })
            .await
    }

    pub async fn commit_connected(
        &self,
        target: &PairingTarget,
        report: &ConnectionReport,
    ) -> ConsoleResult<Instance> {
        let instance = self
            .router
            .route("mark_connected", |backend| async move {
                backend.mark_connected(target, report).await
            })
            .await?;
        operator_log::info(
            module_path!(),
            format!("instance connected id={}", instance.id),
        );
        self.publish(InstanceEvent::Connected {
            instance: instance.clone(),
        });
        Ok(instance)
    }

    /// Finds a visible instance by id or name.
    pub async fn find(&self, key: &str, actor: &Actor) -> ConsoleResult<Instance> {
        self.list(actor)
            .await?
            .into_iter()
            .find(|instance| instance.id == key || instance.name == key)
            .ok_or_else(|| ConsoleError::not_found(format!("instance {key}")))
    }

    /// Finds an instance by id or name whoever owns it. Callers that mutate
    /// must still go through the permission checks of `delete` and pairing.
    pub async fn find_any(&self, key: &str) -> ConsoleResult<Instance> {
        self.list_all()
            .await?
            .into_iter()
            .find(|instance| instance.id == key || instance.name == key)
            .ok_or_else(|| ConsoleError::not_found(format!("instance {key}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::license::{License, LicenseLimits, StaticLicenseSource, Usage};
    use crate::model::Role;
    use crate::store::MemoryKvStore;
    use crate::license::LicenseSource;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn mock_repository(config: ConsoleConfig) -> InstanceRepository {
        let (_tx, rx) = watch::channel(config);
        let seeds = SeedStore::new(Arc::new(MemoryKvStore::open()));
        let database = Arc::new(DatabaseClient::new(rx.clone()));
        let static_source = Arc::new(StaticLicenseSource {
            license: License::free(),
            usage: Usage::default(),
        });
        let license = Arc::new(LicenseGate::new(
            rx.clone(),
            static_source.clone(),
            static_source,
        ));
        InstanceRepository::wire(rx, seeds, database, license)
    }

    fn ana() -> Actor {
        Actor::new("u-ana", "Ana Lima", Role::Agent)
    }

    #[tokio::test]
    async fn agents_only_see_their_own_instances() -> anyhow::Result<()> {
        let repo = mock_repository(ConsoleConfig::default());
        let mine = repo.list(&ana()).await?;
        assert_eq!(mine.len(), 1);
        assert!(mine.iter().all(|instance| instance.owner_id == "u-ana"));

        let manager = Actor::new("u-marco", "Marco Reis", Role::Manager);
        assert_eq!(repo.list(&manager).await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn role_settings_can_widen_agent_visibility() -> anyhow::Result<()> {
        let mut config = ConsoleConfig::default();
        if let Some(agent) = config.roles.get_mut("agent") {
            agent.see_all_instances = true;
        }
        let repo = mock_repository(config);
        assert_eq!(repo.list(&ana()).await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn foreign_delete_resolves_then_is_denied() -> anyhow::Result<()> {
        let repo = mock_repository(ConsoleConfig::default());
        assert!(matches!(
            repo.find("inst-demo-2", &ana()).await,
            Err(ConsoleError::NotFound(_))
        ));
        let foreign = repo.find_any("inst-demo-2").await?;
        assert_eq!(foreign.owner_id, "u-marco");
        assert!(matches!(
            repo.delete(&foreign, &ana()).await,
            Err(ConsoleError::PermissionDenied(_))
        ));
        let manager = Actor::new("u-marco", "Marco Reis", Role::Manager);
        assert_eq!(repo.list(&manager).await?.len(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn create_returns_connecting_and_notifies() -> anyhow::Result<()> {
        let repo = mock_repository(ConsoleConfig::default());
        let mut events = repo.subscribe();
        let created = repo.create("  campanhas ", &ana()).await?;
        assert_eq!(created.name, "campanhas");
        assert_eq!(created.status, InstanceStatus::Connecting);
        assert_eq!(created.owner_id, "u-ana");
        match events.recv().await? {
            InstanceEvent::Created { instance } => assert_eq!(instance.id, created.id),
            other => panic!("unexpected event {other:?}"),
        }
        Ok(())
    }

    #[tokio::test]
    async fn blank_name_is_rejected() {
        let repo = mock_repository(ConsoleConfig::default());
        assert!(matches!(
            repo.create("   ", &ana()).await,
            Err(ConsoleError::Validation(_))
        ));
    }

    struct Recording {
        calls: Mutex<Vec<&'static str>>,
    }

    impl Recording {
        fn record(&self, op: &'static str) {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(op);
            }
        }

        fn calls(&self) -> Vec<&'static str> {
            self.calls.lock().map(|c| c.clone()).unwrap_or_default()
        }
    }

    #[async_trait]
    impl InstanceBackend for Recording {
        async fn list(&self) -> ConsoleResult<Vec<Instance>> {
            self.record("list");
            Ok(Vec::new())
        }

        async fn create(&self, _request: &NewInstance) -> ConsoleResult<Instance> {
            self.record("create");
            Err(ConsoleError::transport("unexpected"))
        }

        async fn delete(&self, _id: &str, _name: &str) -> ConsoleResult<()> {
            self.record("delete");
            Ok(())
        }

        async fn pairing_material(&self, _id: &str, _name: &str) -> ConsoleResult<String> {
            self.record("pairing_material");
            Ok("code".to_string())
        }

        async fn mark_connected(
            &self,
            _target: &PairingTarget,
            _report: &ConnectionReport,
        ) -> ConsoleResult<Instance> {
            self.record("mark_connected");
            Err(ConsoleError::transport("unexpected"))
        }
    }

    fn recording_repository(
        used_instances: u32,
    ) -> (InstanceRepository, Arc<Recording>) {
        let config = ConsoleConfig {
            mock_mode: false,
            ..ConsoleConfig::default()
        };
        let (_tx, rx) = watch::channel(config);
        let backend = Arc::new(Recording {
            calls: Mutex::new(Vec::new()),
        });
        let router = BackendRouter::<dyn InstanceBackend>::new("instances", rx.clone())
            .with_tier(BackendTier::RemoteDatabase, backend.clone());
        let source = Arc::new(StaticLicenseSource {
            license: License {
                limits: LicenseLimits {
                    max_seats: 1,
                    max_messages_per_month: 1_000,
                    max_contacts: 100,
                },
                addon_seats: 0,
                ..License::free()
            },
            usage: Usage {
                used_instances,
                ..Usage::default()
            },
        });
        let license = Arc::new(LicenseGate::new(rx.clone(), source.clone(), source));
        (InstanceRepository::new(router, license, rx), backend)
    }

    fn owned_by(owner: &str) -> Instance {
        Instance {
            id: "inst-x".to_string(),
            name: "x".to_string(),
            status: InstanceStatus::Connecting,
            phone: None,
            last_update: chrono::Utc::now(),
            messages_used: 0,
            messages_limit: 1_000,
            owner_id: owner.to_string(),
            owner_name: owner.to_string(),
            created_at: None,
        }
    }

    #[tokio::test]
    async fn quota_failure_issues_no_backend_call() {
        let (repo, backend) = recording_repository(1);
        assert_eq!(
            repo.create("sales", &ana()).await,
            Err(ConsoleError::QuotaExceeded { limit: 1 })
        );
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn non_owner_agent_cannot_delete_or_pair() {
        let (repo, backend) = recording_repository(0);
        let foreign = owned_by("u-marco");
        assert!(matches!(
            repo.delete(&foreign, &ana()).await,
            Err(ConsoleError::PermissionDenied(_))
        ));
        let manager = Actor::new("u-lead", "Lead", Role::Manager);
        assert!(matches!(
            repo.request_pairing_material(&foreign, &manager).await,
            Err(ConsoleError::PermissionDenied(_))
        ));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn manager_may_delete_any_instance() -> anyhow::Result<()> {
        let (repo, backend) = recording_repository(0);
        let manager = Actor::new("u-lead", "Lead", Role::Manager);
        repo.delete(&owned_by("u-ana"), &manager).await?;
        assert_eq!(backend.calls(), vec!["delete"]);
        Ok(())
    }

    /// Backend whose seat usage grows only once a create has landed.
    struct SeatCounter {
        created: AtomicU32,
    }

    #[async_trait]
    impl InstanceBackend for SeatCounter {
        async fn list(&self) -> ConsoleResult<Vec<Instance>> {
            Ok(Vec::new())
        }

        async fn create(&self, request: &NewInstance) -> ConsoleResult<Instance> {
            tokio::task::yield_now().await;
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Instance {
                id: format!("inst-{}", request.name),
                name: request.name.clone(),
                ..owned_by(&request.owner_id)
            })
        }

        async fn delete(&self, _id: &str, _name: &str) -> ConsoleResult<()> {
            Ok(())
        }

        async fn pairing_material(&self, _id: &str, _name: &str) -> ConsoleResult<String> {
            Ok("code".to_string())
        }

        async fn mark_connected(
            &self,
            target: &PairingTarget,
            _report: &ConnectionReport,
        ) -> ConsoleResult<Instance> {
            Err(ConsoleError::not_found(format!("instance {}", target.id)))
        }
    }

    #[async_trait]
    impl LicenseSource for SeatCounter {
        async fn license(&self) -> ConsoleResult<License> {
            Ok(License {
                limits: LicenseLimits {
                    max_seats: 1,
                    max_messages_per_month: 1_000,
                    max_contacts: 100,
                },
                addon_seats: 0,
                ..License::free()
            })
        }

        async fn usage(&self) -> ConsoleResult<Usage> {
            tokio::task::yield_now().await;
            Ok(Usage {
                used_instances: self.created.load(Ordering::SeqCst),
                ..Usage::default()
            })
        }
    }

    #[tokio::test]
    async fn concurrent_creates_cannot_share_the_last_seat() {
        let config = ConsoleConfig {
            mock_mode: false,
            ..ConsoleConfig::default()
        };
        let (_tx, rx) = watch::channel(config);
        let counter = Arc::new(SeatCounter {
            created: AtomicU32::new(0),
        });
        let router = BackendRouter::<dyn InstanceBackend>::new("instances", rx.clone())
            .with_tier(BackendTier::RemoteDatabase, counter.clone());
        let license = Arc::new(LicenseGate::new(rx.clone(), counter.clone(), counter.clone()));
        let repo = InstanceRepository::new(router, license, rx);

        let (actor_a, actor_b) = (ana(), ana());
        let (first, second) = tokio::join!(repo.create("a", &actor_a), repo.create("b", &actor_b));
        let rejected = [&first, &second]
            .into_iter()
            .filter(|result| matches!(result, Err(ConsoleError::QuotaExceeded { limit: 1 })))
            .count();
        assert_eq!(rejected, 1);
        assert!(first.is_ok() || second.is_ok());
        assert_eq!(counter.created.load(Ordering::SeqCst), 1);
    }
}
