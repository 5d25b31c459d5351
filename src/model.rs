use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const DEFAULT_MESSAGES_LIMIT: u64 = 1_000;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceStatus {
    #[default]
    Connecting,
    Connected,
    Disconnected,
}

impl InstanceStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
        }
    }

    /// Maps the connection-state vocabulary used by gateways and database rows.
    pub fn from_wire(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "open" | "connected" | "online" => Self::Connected,
            "connecting" | "qrcode" | "pairing" => Self::Connecting,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Instance {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub status: InstanceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    pub last_update: DateTime<Utc>,
    #[serde(default)]
    pub messages_used: u64,
    #[serde(default = "default_messages_limit")]
    pub messages_limit: u64,
    #[serde(default)]
    pub owner_id: String,
    #[serde(default)]
    pub owner_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

impl Instance {
    pub fn target(&self) -> PairingTarget {
        PairingTarget {
            id: self.id.clone(),
            name: self.name.clone(),
            created_at: self.created_at,
        }
    }
}

fn default_messages_limit() -> u64 {
    DEFAULT_MESSAGES_LIMIT
}

/// Input for instance creation, shared by every tier.
#[derive(Clone, Debug)]
pub struct NewInstance {
    pub name: String,
    pub owner_id: String,
    pub owner_name: String,
}

/// Identifies the exact record a pairing session was opened against.
///
/// `created_at` distinguishes a record from a newer one that reuses its id.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PairingTarget {
    pub id: String,
    pub name: String,
    pub created_at: Option<DateTime<Utc>>,
}

impl PairingTarget {
    pub fn matches(&self, instance: &Instance) -> bool {
        if instance.id != self.id {
            return false;
        }
        match (self.created_at, instance.created_at) {
            (Some(expected), Some(actual)) => expected == actual,
            _ => instance.name == self.name,
        }
    }
}

/// Fields recorded when a pairing completes.
#[derive(Clone, Debug, Default)]
pub struct ConnectionReport {
    pub phone: Option<String>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    SuperAdmin,
    Manager,
    Agent,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::SuperAdmin, Role::Manager, Role::Agent];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SuperAdmin => "super_admin",
            Self::Manager => "manager",
            Self::Agent => "agent",
        }
    }

    /// Roles allowed to act on instances they do not own.
    pub fn is_supervisor(self) -> bool {
        matches!(self, Self::SuperAdmin | Self::Manager)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "super_admin" | "superadmin" => Ok(Self::SuperAdmin),
            "manager" => Ok(Self::Manager),
            "agent" => Ok(Self::Agent),
            other => Err(format!(
                "unknown role '{other}'; expected super_admin, manager or agent"
            )),
        }
    }
}

/// The caller on whose behalf a repository operation runs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    pub user_id: String,
    pub name: String,
    pub role: Role,
}

impl Actor {
    pub fn new(user_id: impl Into<String>, name: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: user_id.into(),
            name: name.into(),
            role,
        }
    }

    pub fn owns(&self, instance: &Instance) -> bool {
        instance.owner_id == self.user_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str, name: &str, created_at: Option<DateTime<Utc>>) -> Instance {
        Instance {
            id: id.to_string(),
            name: name.to_string(),
            status: InstanceStatus::Connecting,
            phone: None,
            last_update: Utc::now(),
            messages_used: 0,
            messages_limit: DEFAULT_MESSAGES_LIMIT,
            owner_id: "u1".to_string(),
            owner_name: "Ana".to_string(),
            created_at,
        }
    }

    #[test]
    fn gateway_states_map_to_status() {
        assert_eq!(InstanceStatus::from_wire("open"), InstanceStatus::Connected);
        assert_eq!(
            InstanceStatus::from_wire("connecting"),
            InstanceStatus::Connecting
        );
        assert_eq!(
            InstanceStatus::from_wire("close"),
            InstanceStatus::Disconnected
        );
    }

    #[test]
    fn role_parses_common_spellings() {
        assert_eq!("super-admin".parse::<Role>(), Ok(Role::SuperAdmin));
        assert_eq!("Manager".parse::<Role>(), Ok(Role::Manager));
        assert!("owner".parse::<Role>().is_err());
    }

    #[test]
    fn target_rejects_reused_identifier() {
        let created = Utc::now();
        let original = instance("inst-1", "sales", Some(created));
        let target = original.target();
        assert!(target.matches(&original));

        let reused = instance(
            "inst-1",
            "sales",
            Some(created + chrono::Duration::seconds(5)),
        );
        assert!(!target.matches(&reused));
    }

    #[test]
    fn instance_serializes_camel_case() -> anyhow::Result<()> {
        let value = serde_json::to_value(instance("inst-1", "sales", None))?;
        assert!(value.get("lastUpdate").is_some());
        assert!(value.get("ownerId").is_some());
        assert_eq!(value["status"], "connecting");
        Ok(())
    }
}
