//! Live messaging-gateway tier (REST, `apikey` header).

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::watch;

use crate::backend::InstanceBackend;
use crate::config::{ConsoleConfig, GatewayConfig};
use crate::error::{ConsoleError, ConsoleResult};
use crate::model::{
    ConnectionReport, DEFAULT_MESSAGES_LIMIT, Instance, InstanceStatus, NewInstance,
    PairingTarget,
};
use crate::store::SeedStore;

/// Owners recorded locally; the gateway has no notion of console users.
pub const OWNERS_KEY: &str = "gateway_owners";

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerRecord {
    pub owner_id: String,
    pub owner_name: String,
}

pub struct GatewayClient {
    http: reqwest::Client,
    config: watch::Receiver<ConsoleConfig>,
}

impl GatewayClient {
    pub fn new(config: watch::Receiver<ConsoleConfig>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn current(&self) -> ConsoleResult<GatewayConfig> {
        let gateway = self.config.borrow().gateway.clone();
        gateway.validate()?;
        Ok(gateway)
    }

    pub async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
    ) -> ConsoleResult<Value> {
        let gateway = self.current()?;
        let url = format!("{}{}", gateway.base_url.trim().trim_end_matches('/'), path);
        let mut request = self
            .http
            .request(method, url.as_str())
            .header("apikey", gateway.api_key.trim())
            .timeout(Duration::from_millis(gateway.timeout_ms.max(250)));
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes);
            return Err(ConsoleError::transport(format!(
                "gateway {path} returned {status}: {}",
                body.trim()
            )));
        }
        if bytes.is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_slice(&bytes).map_err(|err| {
            ConsoleError::transport(format!("gateway {path} returned invalid json: {err}"))
        })
    }
}

pub struct GatewayInstanceBackend {
    client: GatewayClient,
    seeds: SeedStore,
}

impl GatewayInstanceBackend {
    pub fn new(client: GatewayClient, seeds: SeedStore) -> Self {
        Self { client, seeds }
    }

    fn owners(&self) -> ConsoleResult<BTreeMap<String, OwnerRecord>> {
        let value = self
            .seeds
            .load_or_seed(OWNERS_KEY, || Value::Object(Default::default()))?;
        serde_json::from_value(value)
            .map_err(|err| ConsoleError::store(format!("malformed owner index: {err}")))
    }

    fn save_owners(&self, owners: &BTreeMap<String, OwnerRecord>) -> ConsoleResult<()> {
        let value = serde_json::to_value(owners)
            .map_err(|err| ConsoleError::store(format!("encode owner index: {err}")))?;
        self.seeds.kv().put(OWNERS_KEY, &value)
    }
}

#[async_trait]
impl InstanceBackend for GatewayInstanceBackend {
    async fn list(&self) -> ConsoleResult<Vec<Instance>> {
        let response = self
            .client
            .request(Method::GET, "/instance/fetchInstances", None)
            .await?;
        let owners = self.owners()?;
        let rows = response.as_array().cloned().unwrap_or_default();
        rows.iter()
            .map(|row| normalize_gateway_instance(row, &owners))
            .collect()
    }

    async fn create(&self, request: &NewInstance) -> ConsoleResult<Instance> {
        let body = json!({
            "instanceName": request.name,
            "qrcode": true,
            "integration": "WHATSAPP-BAILEYS",
        });
        let response = self
            .client
            .request(Method::POST, "/instance/create", Some(&body))
            .await?;
        let mut owners = self.owners()?;
        owners.insert(
            request.name.clone(),
            OwnerRecord {
                owner_id: request.owner_id.clone(),
                owner_name: request.owner_name.clone(),
            },
        );
        self.save_owners(&owners)?;
        let mut instance = normalize_gateway_instance(&response, &owners)?;
        instance.status = InstanceStatus::Connecting;
        Ok(instance)
    }

    async fn delete(&self, _id: &str, name: &str) -> ConsoleResult<()> {
        self.client
            .request(Method::DELETE, &format!("/instance/delete/{name}"), None)
            .await?;
        let mut owners = self.owners()?;
        if owners.remove(name).is_some() {
            self.save_owners(&owners)?;
        }
        Ok(())
    }

    async fn pairing_material(&self, _id: &str, name: &str) -> ConsoleResult<String> {
        let response = self
            .client
            .request(Method::GET, &format!("/instance/connect/{name}"), None)
            .await?;
        normalize_gateway_pairing(&response)
    }

    async fn mark_connected(
        &self,
        target: &PairingTarget,
        report: &ConnectionReport,
    ) -> ConsoleResult<Instance> {
        let path = format!("/instance/connectionState/{}", target.name);
        let response = self.client.request(Method::GET, &path, None).await?;
        let state = response
            .get("instance")
            .unwrap_or(&response)
            .get("state")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if InstanceStatus::from_wire(state) != InstanceStatus::Connected {
            return Err(ConsoleError::transport(format!(
                "gateway reports instance {} as '{state}'",
                target.name
            )));
        }
        let owners = self.owners()?;
        let mut instances = self.list().await?;
        let position = instances
            .iter()
            .position(|instance| target.matches(instance))
            .ok_or_else(|| ConsoleError::not_found(format!("instance {}", target.id)))?;
        let mut instance = instances.swap_remove(position);
        instance.status = InstanceStatus::Connected;
        if report.phone.is_some() {
            instance.phone = report.phone.clone();
        }
        instance.last_update = Utc::now();
        if instance.owner_id.is_empty()
            && let Some(owner) = owners.get(&instance.name)
        {
            instance.owner_id = owner.owner_id.clone();
            instance.owner_name = owner.owner_name.clone();
        }
        Ok(instance)
    }
}

/// Accepts both the flat `fetchInstances` row and the `{instance: {...}}`
/// envelope returned by older gateways and by `create`.
pub fn normalize_gateway_instance(
    row: &Value,
    owners: &BTreeMap<String, OwnerRecord>,
) -> ConsoleResult<Instance> {
    let record = row.get("instance").filter(|v| v.is_object()).unwrap_or(row);
    let name = first_str(record, &["name", "instanceName"])
        .ok_or_else(|| ConsoleError::validation("gateway instance without a name"))?
        .to_string();
    let id = first_str(record, &["id", "instanceId"])
        .unwrap_or(name.as_str())
        .to_string();
    let status = first_str(record, &["connectionStatus", "status", "state"])
        .map(InstanceStatus::from_wire)
        .unwrap_or(InstanceStatus::Connecting);
    let phone = first_str(record, &["ownerJid", "owner", "number"]).map(phone_from_jid);
    let last_update = first_str(record, &["updatedAt", "lastUpdate"])
        .and_then(parse_timestamp)
        .unwrap_or_else(Utc::now);
    let created_at = first_str(record, &["createdAt"]).and_then(parse_timestamp);
    let messages_used = record
        .get("_count")
        .and_then(|count| count.get("Message"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let owner = owners.get(&name).cloned().unwrap_or_default();
    Ok(Instance {
        id,
        name,
        status,
        phone,
        last_update,
        messages_used,
        messages_limit: DEFAULT_MESSAGES_LIMIT,
        owner_id: owner.owner_id,
        owner_name: owner.owner_name,
        created_at,
    })
}

/// Collapses `{base64}`, `{qrcode: {base64}}`, `{qrcode: "..."}` and `{code}`
/// into one string, preferring a scannable image.
pub fn normalize_gateway_pairing(response: &Value) -> ConsoleResult<String> {
    let qrcode = response.get("qrcode");
    let image = response
        .get("base64")
        .and_then(Value::as_str)
        .or_else(|| qrcode.and_then(|q| q.get("base64")).and_then(Value::as_str))
        .or_else(|| qrcode.and_then(Value::as_str))
        .filter(|value| !value.is_empty());
    if let Some(image) = image {
        if image.starts_with("data:") {
            return Ok(image.to_string());
        }
        return Ok(format!("data:image/png;base64,{image}"));
    }
    response
        .get("pairingCode")
        .or_else(|| response.get("code"))
        .or_else(|| qrcode.and_then(|q| q.get("code")))
        .and_then(Value::as_str)
        .filter(|code| !code.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ConsoleError::validation("gateway returned no pairing payload"))
}

fn first_str<'a>(record: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| record.get(*key).and_then(Value::as_str))
        .filter(|value| !value.is_empty())
}

fn phone_from_jid(jid: &str) -> String {
    let number = jid.split('@').next().unwrap_or(jid);
    if number.starts_with('+') {
        number.to_string()
    } else {
        format!("+{number}")
    }
}

fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}
