//! Composition root: builds every service over one injected KV store.

use std::sync::Arc;

use anyhow::Context;

use crate::backend::database::DatabaseClient;
use crate::config::ConfigStore;
use crate::entities::EntityCatalog;
use crate::error::ConsoleResult;
use crate::instances::InstanceRepository;
use crate::license::{DatabaseLicenseSource, LicenseGate, LicenseSource, MockLicenseSource};
use crate::operator_log;
use crate::pairing::PairingCoordinator;
use crate::runtime_state::ConsolePaths;
use crate::store::{DynKvStore, FileKvStore, SeedStore};
use crate::webhooks::WebhookDispatcher;

pub struct Console {
    kv: DynKvStore,
    pub config: Arc<ConfigStore>,
    pub seeds: SeedStore,
    pub license: Arc<LicenseGate>,
    pub instances: Arc<InstanceRepository>,
    pub entities: Arc<EntityCatalog>,
    pub pairing: Arc<PairingCoordinator>,
    pub webhooks: Arc<WebhookDispatcher>,
}

impl Console {
    /// Opens the file-backed store under `paths`.
    pub fn open(paths: &ConsolePaths) -> anyhow::Result<Self> {
        let store_dir = paths.store_dir();
        let kv = FileKvStore::open(&store_dir)
            .with_context(|| format!("open store {}", store_dir.display()))?;
        let console = Self::with_store(Arc::new(kv))?;
        operator_log::debug(
            module_path!(),
            format!("console opened store={}", store_dir.display()),
        );
        Ok(console)
    }

    pub fn with_store(kv: DynKvStore) -> ConsoleResult<Self> {
        let config = Arc::new(ConfigStore::open(kv.clone())?);
        let seeds = SeedStore::new(kv.clone());
        Ok(Self::assemble(kv, config, seeds, None))
    }

    /// Like [`with_store`](Self::with_store) but with a caller-chosen license
    /// source for the non-mock path.
    pub fn with_license_source(
        kv: DynKvStore,
        license_source: Arc<dyn LicenseSource>,
    ) -> ConsoleResult<Self> {
        let config = Arc::new(ConfigStore::open(kv.clone())?);
        let seeds = SeedStore::new(kv.clone());
        Ok(Self::assemble(kv, config, seeds, Some(license_source)))
    }

    fn assemble(
        kv: DynKvStore,
        config: Arc<ConfigStore>,
        seeds: SeedStore,
        license_source: Option<Arc<dyn LicenseSource>>,
    ) -> Self {
        let rx = config.subscribe();
        let database = Arc::new(DatabaseClient::new(rx.clone()));
        let remote_license = license_source
            .unwrap_or_else(|| Arc::new(DatabaseLicenseSource::new(database.clone())));
        let license = Arc::new(LicenseGate::new(
            rx.clone(),
            Arc::new(MockLicenseSource::new(seeds.clone())),
            remote_license,
        ));
        let instances = Arc::new(InstanceRepository::wire(
            rx.clone(),
            seeds.clone(),
            database.clone(),
            license.clone(),
        ));
        let entities = Arc::new(EntityCatalog::new(rx.clone(), seeds.clone(), database));
        let pairing = Arc::new(PairingCoordinator::new(instances.clone(), rx.clone()));
        let webhooks = Arc::new(WebhookDispatcher::new(rx));
        Self {
            kv,
            config,
            seeds,
            license,
            instances,
            entities,
            pairing,
            webhooks,
        }
    }

    pub fn close(&self) -> ConsoleResult<()> {
        self.pairing.cancel();
        self.kv.close()
    }
}
