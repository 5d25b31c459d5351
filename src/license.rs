//! Seat quota: license limits compared against current usage.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::backend::BackendTier;
use crate::backend::database::DatabaseClient;
use crate::config::ConsoleConfig;
use crate::error::{ConsoleError, ConsoleResult};
use crate::fixtures;
use crate::model::{Instance, Role};
use crate::operator_log;
use crate::store::{EntityKind, SeedStore};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseLimits {
    pub max_seats: u32,
    pub max_messages_per_month: u64,
    pub max_contacts: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct License {
    pub tier: String,
    pub status: String,
    #[serde(default)]
    pub renewal_date: Option<DateTime<Utc>>,
    pub limits: LicenseLimits,
    #[serde(default)]
    pub addon_seats: u32,
    #[serde(default)]
    pub features: Vec<String>,
}

impl License {
    /// Used when no license has been provisioned yet.
    pub fn free() -> Self {
        Self {
            tier: "free".to_string(),
            status: "active".to_string(),
            renewal_date: None,
            limits: LicenseLimits {
                max_seats: 1,
                max_messages_per_month: 1_000,
                max_contacts: 500,
            },
            addon_seats: 0,
            features: Vec::new(),
        }
    }

    pub fn total_seats(&self) -> u32 {
        self.limits.max_seats.saturating_add(self.addon_seats)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub used_seats: u32,
    pub used_instances: u32,
    pub used_messages_this_month: u64,
    pub used_contacts: u64,
}

/// Read model handed to the UI.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseStatus {
    pub license: License,
    pub usage: Usage,
    pub total_seats: u32,
    pub remaining_seats: u32,
    pub enforcement_bypassed: bool,
    pub source: BackendTier,
}

impl LicenseStatus {
    pub fn quota_reached(&self) -> bool {
        self.usage.used_instances >= self.total_seats
    }
}

#[async_trait]
pub trait LicenseSource: Send + Sync {
    async fn license(&self) -> ConsoleResult<License>;
    async fn usage(&self) -> ConsoleResult<Usage>;
}

/// Fixed license and usage, for offline deployments and tests.
#[derive(Clone, Debug)]
pub struct StaticLicenseSource {
    pub license: License,
    pub usage: Usage,
}

#[async_trait]
impl LicenseSource for StaticLicenseSource {
    async fn license(&self) -> ConsoleResult<License> {
        Ok(self.license.clone())
    }

    async fn usage(&self) -> ConsoleResult<Usage> {
        Ok(self.usage.clone())
    }
}

pub struct MockLicenseSource {
    seeds: SeedStore,
}

impl MockLicenseSource {
    pub fn new(seeds: SeedStore) -> Self {
        Self { seeds }
    }
}

#[async_trait]
impl LicenseSource for MockLicenseSource {
    async fn license(&self) -> ConsoleResult<License> {
        let value = self
            .seeds
            .load_or_seed(fixtures::LICENSE_KEY, fixtures::license)?;
        serde_json::from_value(value)
            .map_err(|err| ConsoleError::store(format!("malformed mock license: {err}")))
    }

    async fn usage(&self) -> ConsoleResult<Usage> {
        let instances: Vec<Instance> = self.seeds.load(EntityKind::Instances)?;
        let profiles = self
            .seeds
            .load_or_seed(fixtures::PROFILES_KEY, fixtures::profiles)?;
        let contacts = self.seeds.load_raw(EntityKind::Contacts)?;
        Ok(Usage {
            used_seats: profiles.as_array().map(Vec::len).unwrap_or(0) as u32,
            used_instances: instances.len() as u32,
            used_messages_this_month: instances.iter().map(|i| i.messages_used).sum(),
            used_contacts: contacts.len() as u64,
        })
    }
}

pub struct DatabaseLicenseSource {
    client: Arc<DatabaseClient>,
}

impl DatabaseLicenseSource {
    pub fn new(client: Arc<DatabaseClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LicenseSource for DatabaseLicenseSource {
    async fn license(&self) -> ConsoleResult<License> {
        let rows = self
            .client
            .select("licenses", &[("limit", "1".to_string())])
            .await?;
        match rows.first() {
            Some(row) => normalize_database_license(row),
            None => Ok(License::free()),
        }
    }

    async fn usage(&self) -> ConsoleResult<Usage> {
        let used_seats = self.client.count("profiles").await?;
        let instances = self.client.select("instances", &[]).await?;
        let used_contacts = self.client.count("contacts").await?;
        Ok(Usage {
            used_seats: used_seats as u32,
            used_instances: instances.len() as u32,
            used_messages_this_month: instances
                .iter()
                .filter_map(|row| row.get("messages_used").and_then(Value::as_u64))
                .sum(),
            used_contacts,
        })
    }
}

/// License rows are flat: limits live beside the tier columns.
pub fn normalize_database_license(row: &Value) -> ConsoleResult<License> {
    let number = |key: &str| row.get(key).and_then(Value::as_u64);
    let text = |key: &str| row.get(key).and_then(Value::as_str).map(str::to_string);
    let max_seats = number("max_seats")
        .ok_or_else(|| ConsoleError::validation("license row without max_seats"))?;
    Ok(License {
        tier: text("tier").unwrap_or_else(|| "unknown".to_string()),
        status: text("status").unwrap_or_else(|| "active".to_string()),
        renewal_date: text("renewal_date")
            .and_then(|value| DateTime::parse_from_rfc3339(&value).ok())
            .map(|ts| ts.with_timezone(&Utc)),
        limits: LicenseLimits {
            max_seats: max_seats as u32,
            max_messages_per_month: number("max_messages_per_month").unwrap_or(0),
            max_contacts: number("max_contacts").unwrap_or(0),
        },
        addon_seats: number("addon_seats").unwrap_or(0) as u32,
        features: row
            .get("features")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default(),
    })
}

pub struct LicenseGate {
    config: watch::Receiver<ConsoleConfig>,
    mock: Arc<dyn LicenseSource>,
    database: Arc<dyn LicenseSource>,
}

impl LicenseGate {
    pub fn new(
        config: watch::Receiver<ConsoleConfig>,
        mock: Arc<dyn LicenseSource>,
        database: Arc<dyn LicenseSource>,
    ) -> Self {
        Self {
            config,
            mock,
            database,
        }
    }

    fn mock_mode(&self) -> bool {
        self.config.borrow().mock_mode
    }

    pub async fn status(&self) -> ConsoleResult<LicenseStatus> {
        let mock_mode = self.mock_mode();
        let (source, tier) = if mock_mode {
            (&self.mock, BackendTier::LocalMock)
        } else {
            (&self.database, BackendTier::RemoteDatabase)
        };
        let license = source.license().await?;
        let usage = source.usage().await?;
        let total_seats = license.total_seats();
        Ok(LicenseStatus {
            remaining_seats: total_seats.saturating_sub(usage.used_instances),
            total_seats,
            license,
            usage,
            enforcement_bypassed: mock_mode,
            source: tier,
        })
    }

    pub async fn remaining_seats(&self) -> ConsoleResult<u32> {
        Ok(self.status().await?.remaining_seats)
    }

    pub async fn quota_ok(&self, role: Role) -> ConsoleResult<bool> {
        match self.ensure_can_create(role).await {
            Ok(()) => Ok(true),
            Err(ConsoleError::QuotaExceeded { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Demo (mock) accounts and roles without quota enforcement always pass.
    pub async fn ensure_can_create(&self, role: Role) -> ConsoleResult<()> {
        let (mock_mode, enforce) = {
            let config = self.config.borrow();
            (config.mock_mode, config.role_settings(role).enforce_quota)
        };
        if mock_mode || !enforce {
            return Ok(());
        }
        let status = self.status().await?;
        if status.quota_reached() {
            operator_log::warn(
                module_path!(),
                format!(
                    "quota exceeded role={} used_instances={} total_seats={}",
                    role, status.usage.used_instances, status.total_seats
                ),
            );
            return Err(ConsoleError::QuotaExceeded {
                limit: status.total_seats,
            });
        }
        Ok(())
    }
}
