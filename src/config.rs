//! Versioned console configuration.
//!
//! The persisted record may be partial or written by an older release; every
//! read deep-merges it over the compiled defaults so new fields always carry a
//! value.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::error::{ConsoleError, ConsoleResult};
use crate::model::Role;
use crate::operator_log;
use crate::store::DynKvStore;

pub const CONFIG_VERSION: u32 = 2;
pub const CONFIG_KEY: &str = "config";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConsoleConfig {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_true")]
    pub mock_mode: bool,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub webhooks: WebhookConfig,
    #[serde(default)]
    pub pairing: PairingTimings,
    #[serde(default = "default_roles")]
    pub roles: BTreeMap<String, RoleSettings>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            version: CONFIG_VERSION,
            mock_mode: true,
            gateway: GatewayConfig::default(),
            database: DatabaseConfig::default(),
            webhooks: WebhookConfig::default(),
            pairing: PairingTimings::default(),
            roles: default_roles(),
        }
    }
}

impl ConsoleConfig {
    pub fn role_settings(&self, role: Role) -> RoleSettings {
        self.roles
            .get(role.as_str())
            .copied()
            .unwrap_or_else(|| RoleSettings::for_role(role))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub base_url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_key: String::new(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl GatewayConfig {
    /// Structural check only; no request is made.
    pub fn validate(&self) -> ConsoleResult<()> {
        validate_endpoint("gateway", &self.base_url, &self.api_key)
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_ok()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            api_key: String::new(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl DatabaseConfig {
    pub fn validate(&self) -> ConsoleResult<()> {
        validate_endpoint("database", &self.url, &self.api_key)
    }
}

fn validate_endpoint(label: &str, url: &str, key: &str) -> ConsoleResult<()> {
    let url = url.trim();
    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(ConsoleError::validation(format!(
            "{label} url must start with http:// or https://"
        )));
    }
    if key.trim().is_empty() {
        return Err(ConsoleError::validation(format!(
            "{label} api key is empty"
        )));
    }
    Ok(())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_webhook_urls")]
    pub urls: BTreeMap<String, String>,
    /// Per-delivery timeout, independent of the gateway's.
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            urls: default_webhook_urls(),
            timeout_ms: default_webhook_timeout_ms(),
        }
    }
}

impl WebhookConfig {
    pub fn url_for(&self, event: &str) -> Option<&str> {
        self.urls
            .get(event)
            .map(|url| url.trim())
            .filter(|url| !url.is_empty())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PairingTimings {
    #[serde(default = "default_scan_dwell_ms")]
    pub scan_dwell_ms: u64,
    #[serde(default = "default_confirm_dwell_ms")]
    pub confirm_dwell_ms: u64,
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
}

impl Default for PairingTimings {
    fn default() -> Self {
        Self {
            scan_dwell_ms: default_scan_dwell_ms(),
            confirm_dwell_ms: default_confirm_dwell_ms(),
            close_grace_ms: default_close_grace_ms(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSettings {
    #[serde(default = "default_true")]
    pub enforce_quota: bool,
    #[serde(default)]
    pub see_all_instances: bool,
}

impl RoleSettings {
    pub fn for_role(role: Role) -> Self {
        match role {
            Role::SuperAdmin => Self {
                enforce_quota: false,
                see_all_instances: true,
            },
            Role::Manager => Self {
                enforce_quota: true,
                see_all_instances: true,
            },
            Role::Agent => Self {
                enforce_quota: true,
                see_all_instances: false,
            },
        }
    }
}

fn default_version() -> u32 {
    CONFIG_VERSION
}

fn default_true() -> bool {
    true
}

fn default_timeout_ms() -> u64 {
    5_000
}

fn default_webhook_timeout_ms() -> u64 {
    10_000
}

fn default_scan_dwell_ms() -> u64 {
    4_000
}

fn default_confirm_dwell_ms() -> u64 {
    5_000
}

fn default_close_grace_ms() -> u64 {
    2_000
}

pub const WEBHOOK_EVENTS: &[&str] = &[
    "message.received",
    "message.sent",
    "instance.connected",
    "instance.disconnected",
    "campaign.finished",
];

fn default_webhook_urls() -> BTreeMap<String, String> {
    WEBHOOK_EVENTS
        .iter()
        .map(|event| (event.to_string(), String::new()))
        .collect()
}

fn default_roles() -> BTreeMap<String, RoleSettings> {
    Role::ALL
        .into_iter()
        .map(|role| (role.as_str().to_string(), RoleSettings::for_role(role)))
        .collect()
}

/// Deep merge: objects merge key by key, `null` keeps the base value, and any
/// other overlay value replaces the base wholesale.
pub fn merge_values(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            let mut merged = base.clone();
            for (key, value) in overlay {
                let next = match base.get(key) {
                    Some(existing) => merge_values(existing, value),
                    None => value.clone(),
                };
                merged.insert(key.clone(), next);
            }
            Value::Object(merged)
        }
        (base, Value::Null) => base.clone(),
        (_, overlay) => overlay.clone(),
    }
}

pub fn defaults_value() -> Value {
    serde_json::to_value(ConsoleConfig::default()).unwrap_or(Value::Object(Map::new()))
}

/// Merges a persisted (possibly partial, possibly older) record over defaults.
pub fn merge_config(partial: &Value) -> ConsoleResult<ConsoleConfig> {
    let upgraded = upgrade_legacy(partial);
    let merged = merge_values(&defaults_value(), &upgraded);
    let mut config: ConsoleConfig = serde_json::from_value(merged)
        .map_err(|err| ConsoleError::validation(format!("malformed console config: {err}")))?;
    config.version = CONFIG_VERSION;
    Ok(config)
}

/// Version 1 kept the gateway under `evolution {url, key}`.
fn upgrade_legacy(partial: &Value) -> Value {
    let version = partial
        .get("version")
        .and_then(Value::as_u64)
        .unwrap_or(1);
    if version >= 2 {
        return partial.clone();
    }
    let Some(mut object) = partial.as_object().cloned() else {
        return partial.clone();
    };
    if let Some(Value::Object(legacy)) = object.remove("evolution") {
        let mut gateway = Map::new();
        if let Some(url) = legacy.get("url") {
            gateway.insert("base_url".to_string(), url.clone());
        }
        if let Some(key) = legacy.get("key") {
            gateway.insert("api_key".to_string(), key.clone());
        }
        let existing = object.remove("gateway").unwrap_or(Value::Null);
        object.insert(
            "gateway".to_string(),
            merge_values(&Value::Object(gateway), &existing),
        );
    }
    Value::Object(object)
}

/// Process-wide config holder; inject it, do not reach for it globally.
pub struct ConfigStore {
    kv: DynKvStore,
    tx: watch::Sender<ConsoleConfig>,
}

impl ConfigStore {
    pub fn open(kv: DynKvStore) -> ConsoleResult<Self> {
        let config = match kv.get(CONFIG_KEY)? {
            Some(stored) => match merge_config(&stored) {
                Ok(config) => config,
                Err(err) => {
                    operator_log::warn(
                        module_path!(),
                        format!("ignoring stored config, using defaults: {err}"),
                    );
                    ConsoleConfig::default()
                }
            },
            None => ConsoleConfig::default(),
        };
        let (tx, _rx) = watch::channel(config);
        Ok(Self { kv, tx })
    }

    pub fn get(&self) -> ConsoleConfig {
        self.tx.borrow().clone()
    }

    /// Persists the whole record, then notifies subscribers.
    pub fn save(&self, mut config: ConsoleConfig) -> ConsoleResult<()> {
        config.version = CONFIG_VERSION;
        let value = serde_json::to_value(&config)
            .map_err(|err| ConsoleError::store(format!("encode config: {err}")))?;
        self.kv.put(CONFIG_KEY, &value)?;
        operator_log::info(
            module_path!(),
            format!(
                "config saved mock_mode={} gateway_valid={}",
                config.mock_mode,
                config.gateway.is_valid()
            ),
        );
        self.tx.send_replace(config);
        Ok(())
    }

    pub fn update(&self, apply: impl FnOnce(&mut ConsoleConfig)) -> ConsoleResult<ConsoleConfig> {
        let mut config = self.get();
        apply(&mut config);
        self.save(config.clone())?;
        Ok(config)
    }

    pub fn subscribe(&self) -> watch::Receiver<ConsoleConfig> {
        self.tx.subscribe()
    }

    /// Merges a partial YAML document over the current config and saves it.
    pub fn import_yaml(&self, path: &Path) -> anyhow::Result<ConsoleConfig> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("read config file {}", path.display()))?;
        if contents
            .lines()
            .all(|line| line.trim().is_empty() || line.trim().starts_with('#'))
        {
            return Ok(self.get());
        }
        let overlay: Value = serde_yaml_bw::from_str(&contents)
            .with_context(|| format!("parse config file {}", path.display()))?;
        let current = serde_json::to_value(self.get())?;
        let config = merge_config(&merge_values(&current, &overlay))?;
        self.save(config.clone())?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KvStore, MemoryKvStore};
    use serde_json::json;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn merge_is_idempotent() {
        let defaults = defaults_value();
        let partial = json!({
            "mock_mode": false,
            "gateway": {"base_url": "https://gw.example.com"},
            "roles": {"agent": {"enforce_quota": false}, "auditor": {"see_all_instances": true}}
        });
        let once = merge_values(&defaults, &partial);
        let twice = merge_values(&defaults, &once);
        assert_eq!(once, twice);
    }

    #[test]
    fn merge_populates_missing_nested_fields_and_keeps_siblings() -> anyhow::Result<()> {
        let config = merge_config(&json!({
            "gateway": {"api_key": "secret"},
            "pairing": {"scan_dwell_ms": 100},
            "roles": {"agent": {"see_all_instances": true}}
        }))?;
        assert_eq!(config.gateway.api_key, "secret");
        assert_eq!(config.gateway.timeout_ms, 5_000);
        assert_eq!(config.pairing.scan_dwell_ms, 100);
        assert_eq!(config.pairing.confirm_dwell_ms, 5_000);
        let agent = config.role_settings(Role::Agent);
        assert!(agent.see_all_instances);
        assert!(agent.enforce_quota);
        assert!(config.roles.contains_key("manager"));
        assert!(config.webhooks.urls.contains_key("instance.connected"));
        assert_eq!(config.webhooks.timeout_ms, 10_000);
        Ok(())
    }

    #[test]
    fn legacy_gateway_block_is_upgraded() -> anyhow::Result<()> {
        let config = merge_config(&json!({
            "version": 1,
            "evolution": {"url": "https://legacy.example.com", "key": "k1"}
        }))?;
        assert_eq!(config.gateway.base_url, "https://legacy.example.com");
        assert_eq!(config.gateway.api_key, "k1");
        assert_eq!(config.version, CONFIG_VERSION);
        Ok(())
    }

    #[test]
    fn gateway_validation_requires_http_scheme_and_key() {
        let mut gateway = GatewayConfig {
            base_url: "ftp://gw.example.com".to_string(),
            api_key: "k".to_string(),
            timeout_ms: 100,
        };
        assert!(!gateway.is_valid());
        gateway.base_url = "https://gw.example.com".to_string();
        assert!(gateway.is_valid());
        gateway.api_key = "  ".to_string();
        assert!(!gateway.is_valid());
    }

    #[test]
    fn save_persists_and_notifies() -> anyhow::Result<()> {
        let kv: DynKvStore = Arc::new(MemoryKvStore::open());
        let store = ConfigStore::open(kv.clone())?;
        let mut rx = store.subscribe();
        store.update(|config| config.mock_mode = false)?;
        assert!(rx.has_changed()?);
        assert!(!rx.borrow_and_update().mock_mode);
        let stored = kv.get(CONFIG_KEY)?.unwrap_or(Value::Null);
        assert_eq!(stored["mock_mode"], json!(false));

        let reopened = ConfigStore::open(kv)?;
        assert!(!reopened.get().mock_mode);
        Ok(())
    }

    #[test]
    fn import_yaml_merges_over_current() -> anyhow::Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("console.yaml");
        std::fs::write(
            &path,
            "gateway:\n  base_url: https://gw.example.com\n  api_key: abc\nwebhooks:\n  urls:\n    instance.connected: https://hooks.example.com/c\n",
        )?;
        let store = ConfigStore::open(Arc::new(MemoryKvStore::open()))?;
        store.update(|config| config.pairing.close_grace_ms = 10)?;
        let config = store.import_yaml(&path)?;
        assert!(config.gateway.is_valid());
        assert_eq!(config.pairing.close_grace_ms, 10);
        assert_eq!(
            config.webhooks.url_for("instance.connected"),
            Some("https://hooks.example.com/c")
        );
        assert_eq!(config.webhooks.url_for("message.received"), None);
        Ok(())
    }
}
