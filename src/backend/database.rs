//! Remote database tier, spoken over a PostgREST-style HTTP interface.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde_json::{Map, Value, json};
use tokio::sync::watch;

use crate::backend::{Entity, EntityBackend, InstanceBackend};
use crate::config::{ConsoleConfig, DatabaseConfig};
use crate::error::{ConsoleError, ConsoleResult};
use crate::model::{
    ConnectionReport, DEFAULT_MESSAGES_LIMIT, Instance, InstanceStatus, NewInstance,
    PairingTarget,
};

pub struct DatabaseClient {
    http: reqwest::Client,
    config: watch::Receiver<ConsoleConfig>,
}

impl DatabaseClient {
    pub fn new(config: watch::Receiver<ConsoleConfig>) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
        }
    }

    fn current(&self) -> ConsoleResult<DatabaseConfig> {
        let database = self.config.borrow().database.clone();
        database.validate()?;
        Ok(database)
    }

    async fn send(
        &self,
        method: Method,
        table: &str,
        query: &[(&str, String)],
        body: Option<&Value>,
        prefer: Option<&str>,
    ) -> ConsoleResult<Vec<Value>> {
        let database = self.current()?;
        let url = format!(
            "{}/rest/v1/{table}",
            database.url.trim().trim_end_matches('/')
        );
        let key = database.api_key.trim();
        let mut request = self
            .http
            .request(method, url.as_str())
            .query(query)
            .header("apikey", key)
            .header("Authorization", format!("Bearer {key}"))
            .timeout(Duration::from_millis(database.timeout_ms.max(250)));
        if let Some(prefer) = prefer {
            request = request.header("Prefer", prefer);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        let response = request.send().await?;
        let status = response.status();
        let bytes = response.bytes().await?;
        if !status.is_success() {
            return Err(ConsoleError::transport(format!(
                "database {table} returned {status}: {}",
                String::from_utf8_lossy(&bytes).trim()
            )));
        }
        if bytes.is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(Value::Array(rows)) => Ok(rows),
            Ok(Value::Null) => Ok(Vec::new()),
            Ok(row) => Ok(vec![row]),
            Err(err) => Err(ConsoleError::transport(format!(
                "database {table} returned invalid json: {err}"
            ))),
        }
    }

    pub async fn select(&self, table: &str, filters: &[(&str, String)]) -> ConsoleResult<Vec<Value>> {
        let mut query = vec![("select", "*".to_string())];
        query.extend(filters.iter().cloned());
        self.send(Method::GET, table, &query, None, None).await
    }

    pub async fn insert(&self, table: &str, row: &Value) -> ConsoleResult<Vec<Value>> {
        self.send(
            Method::POST,
            table,
            &[],
            Some(row),
            Some("return=representation"),
        )
        .await
    }

    pub async fn upsert(&self, table: &str, row: &Value) -> ConsoleResult<Vec<Value>> {
        self.send(
            Method::POST,
            table,
            &[],
            Some(row),
            Some("resolution=merge-duplicates,return=representation"),
        )
        .await
    }

    pub async fn update(&self, table: &str, id: &str, patch: &Value) -> ConsoleResult<Vec<Value>> {
        self.send(
            Method::PATCH,
            table,
            &[("id", format!("eq.{id}"))],
            Some(patch),
            Some("return=representation"),
        )
        .await
    }

    pub async fn delete(&self, table: &str, id: &str) -> ConsoleResult<Vec<Value>> {
        self.send(
            Method::DELETE,
            table,
            &[("id", format!("eq.{id}"))],
            None,
            Some("return=representation"),
        )
        .await
    }

    pub async fn count(&self, table: &str) -> ConsoleResult<u64> {
        let rows = self
            .send(Method::GET, table, &[("select", "id".to_string())], None, None)
            .await?;
        Ok(rows.len() as u64)
    }
}

pub struct DatabaseInstanceBackend {
    client: std::sync::Arc<DatabaseClient>,
}

impl DatabaseInstanceBackend {
    pub fn new(client: std::sync::Arc<DatabaseClient>) -> Self {
        Self { client }
    }
}

const INSTANCES: &str = "instances";

#[async_trait]
impl InstanceBackend for DatabaseInstanceBackend {
    async fn list(&self) -> ConsoleResult<Vec<Instance>> {
        let rows = self
            .client
            .select(INSTANCES, &[("order", "created_at.asc".to_string())])
            .await?;
        rows.iter().map(normalize_database_instance).collect()
    }

    async fn create(&self, request: &NewInstance) -> ConsoleResult<Instance> {
        let now = Utc::now();
        let row = json!({
            "name": request.name,
            "status": InstanceStatus::Connecting.as_str(),
            "owner_id": request.owner_id,
            "owner_name": request.owner_name,
            "messages_used": 0,
            "messages_limit": DEFAULT_MESSAGES_LIMIT,
            "last_update": now.to_rfc3339(),
            "created_at": now.to_rfc3339(),
        });
        let rows = self.client.insert(INSTANCES, &row).await?;
        let created = rows
            .first()
            .ok_or_else(|| ConsoleError::validation("database insert returned no row"))?;
        normalize_database_instance(created)
    }

    async fn delete(&self, id: &str, _name: &str) -> ConsoleResult<()> {
        let rows = self.client.delete(INSTANCES, id).await?;
        if rows.is_empty() {
            return Err(ConsoleError::not_found(format!("instance {id}")));
        }
        Ok(())
    }

    async fn pairing_material(&self, _id: &str, _name: &str) -> ConsoleResult<String> {
        Err(ConsoleError::validation(
            "the remote database cannot issue pairing material",
        ))
    }

    async fn mark_connected(
        &self,
        target: &PairingTarget,
        report: &ConnectionReport,
    ) -> ConsoleResult<Instance> {
        let rows = self
            .client
            .select(INSTANCES, &[("id", format!("eq.{}", target.id))])
            .await?;
        let current = rows
            .first()
            .map(normalize_database_instance)
            .transpose()?
            .ok_or_else(|| ConsoleError::not_found(format!("instance {}", target.id)))?;
        if !target.matches(&current) {
            return Err(ConsoleError::not_found(format!(
                "instance {} was replaced after pairing started",
                target.id
            )));
        }
        let mut patch = json!({
            "status": InstanceStatus::Connected.as_str(),
            "last_update": Utc::now().to_rfc3339(),
        });
        if let (Some(phone), Some(object)) = (&report.phone, patch.as_object_mut()) {
            object.insert("phone".to_string(), json!(phone));
        }
        let rows = self.client.update(INSTANCES, &target.id, &patch).await?;
        let updated = rows
            .first()
            .ok_or_else(|| ConsoleError::not_found(format!("instance {}", target.id)))?;
        normalize_database_instance(updated)
    }
}

/// Database rows use snake_case columns and may carry `updated_at` instead of
/// `last_update`.
pub fn normalize_database_instance(row: &Value) -> ConsoleResult<Instance> {
    let text = |key: &str| row.get(key).and_then(Value::as_str).map(str::to_string);
    let id = match row.get("id") {
        Some(Value::String(id)) => id.clone(),
        Some(Value::Number(id)) => id.to_string(),
        _ => return Err(ConsoleError::validation("database instance row without id")),
    };
    let timestamp = |key: &str| {
        row.get(key)
            .and_then(Value::as_str)
            .and_then(|value| DateTime::parse_from_rfc3339(value).ok())
            .map(|ts| ts.with_timezone(&Utc))
    };
    Ok(Instance {
        name: text("name").unwrap_or_else(|| id.clone()),
        id,
        status: text("status")
            .map(|status| InstanceStatus::from_wire(&status))
            .unwrap_or_default(),
        phone: text("phone").filter(|phone| !phone.is_empty()),
        last_update: timestamp("last_update")
            .or_else(|| timestamp("updated_at"))
            .unwrap_or_else(Utc::now),
        messages_used: row
            .get("messages_used")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        messages_limit: row
            .get("messages_limit")
            .and_then(Value::as_u64)
            .unwrap_or(DEFAULT_MESSAGES_LIMIT),
        owner_id: text("owner_id").unwrap_or_default(),
        owner_name: text("owner_name").unwrap_or_default(),
        created_at: timestamp("created_at"),
    })
}

pub struct DatabaseEntityBackend<E> {
    client: std::sync::Arc<DatabaseClient>,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> DatabaseEntityBackend<E> {
    pub fn new(client: std::sync::Arc<DatabaseClient>) -> Self {
        Self {
            client,
            _entity: PhantomData,
        }
    }

    fn table() -> &'static str {
        E::KIND.key()
    }
}

#[async_trait]
impl<E: Entity> EntityBackend<E> for DatabaseEntityBackend<E> {
    async fn list(&self) -> ConsoleResult<Vec<E>> {
        let rows = self.client.select(Self::table(), &[]).await?;
        rows.into_iter().map(normalize_database_row::<E>).collect()
    }

    async fn upsert(&self, record: &E) -> ConsoleResult<E> {
        let row = denormalize_row(record)?;
        let rows = self.client.upsert(Self::table(), &row).await?;
        match rows.into_iter().next() {
            Some(row) => normalize_database_row(row),
            None => Ok(record.clone()),
        }
    }

    async fn delete(&self, id: &str) -> ConsoleResult<()> {
        let rows = self.client.delete(Self::table(), id).await?;
        if rows.is_empty() {
            return Err(ConsoleError::not_found(format!("{} {id}", E::KIND)));
        }
        Ok(())
    }
}

/// Converts a snake_case row into the camelCase shape the entity types use.
pub fn normalize_database_row<E: Entity>(row: Value) -> ConsoleResult<E> {
    let converted = rename_keys(row, snake_to_camel);
    serde_json::from_value(converted).map_err(|err| {
        ConsoleError::validation(format!("malformed {} row: {err}", E::KIND))
    })
}

fn denormalize_row<E: Entity>(record: &E) -> ConsoleResult<Value> {
    let value = serde_json::to_value(record)
        .map_err(|err| ConsoleError::validation(format!("encode {}: {err}", E::KIND)))?;
    Ok(rename_keys(value, camel_to_snake))
}

fn rename_keys(value: Value, rename: fn(&str) -> String) -> Value {
    match value {
        Value::Object(object) => Value::Object(
            object
                .into_iter()
                .map(|(key, value)| (rename(&key), value))
                .collect::<Map<String, Value>>(),
        ),
        other => other,
    }
}

fn snake_to_camel(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = false;
    for ch in key.chars() {
        if ch == '_' {
            upper = true;
        } else if upper {
            out.extend(ch.to_uppercase());
            upper = false;
        } else {
            out.push(ch);
        }
    }
    out
}

fn camel_to_snake(key: &str) -> String {
    let mut out = String::with_capacity(key.len() + 4);
    for ch in key.chars() {
        if ch.is_ascii_uppercase() {
            out.push('_');
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push(ch);
        }
    }
    out
}
