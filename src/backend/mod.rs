//! Tiered data access: one router, one backend implementation per tier, and
//! one normalization function per tier producing the canonical record shape.

use std::fmt;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::config::ConsoleConfig;
use crate::error::ConsoleResult;
use crate::model::{ConnectionReport, Instance, NewInstance, PairingTarget};
use crate::store::EntityKind;

pub mod database;
pub mod gateway;
pub mod mock;
pub mod router;

pub use router::BackendRouter;

/// Backends in fallback priority order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendTier {
    LiveGateway,
    LocalMock,
    RemoteDatabase,
}

impl BackendTier {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::LiveGateway => "live_gateway",
            Self::LocalMock => "local_mock",
            Self::RemoteDatabase => "remote_database",
        }
    }

    /// Tiers eligible under `config`, highest priority first. The database is
    /// always the terminal tier.
    pub fn plan(config: &ConsoleConfig) -> Vec<BackendTier> {
        let mut tiers = Vec::with_capacity(3);
        if config.gateway.is_valid() {
            tiers.push(Self::LiveGateway);
        }
        if config.mock_mode {
            tiers.push(Self::LocalMock);
        }
        tiers.push(Self::RemoteDatabase);
        tiers
    }
}

impl fmt::Display for BackendTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[async_trait]
pub trait InstanceBackend: Send + Sync {
    async fn list(&self) -> ConsoleResult<Vec<Instance>>;
    async fn create(&self, request: &NewInstance) -> ConsoleResult<Instance>;
    async fn delete(&self, id: &str, name: &str) -> ConsoleResult<()>;
    /// Returns the pairing payload as a single string (data URI or code).
    async fn pairing_material(&self, id: &str, name: &str) -> ConsoleResult<String>;
    async fn mark_connected(
        &self,
        target: &PairingTarget,
        report: &ConnectionReport,
    ) -> ConsoleResult<Instance>;
}

/// A record kind served by the generic entity repositories.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: EntityKind;

    fn id(&self) -> &str;
}

#[async_trait]
pub trait EntityBackend<E: Entity>: Send + Sync {
    async fn list(&self) -> ConsoleResult<Vec<E>>;
    async fn upsert(&self, record: &E) -> ConsoleResult<E>;
    async fn delete(&self, id: &str) -> ConsoleResult<()>;
}
