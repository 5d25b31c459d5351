//! Secondary record kinds. They share one generic repository and are served by
//! the mock and database tiers only; the gateway knows nothing about them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;

use crate::backend::database::{DatabaseClient, DatabaseEntityBackend};
use crate::backend::mock::MockEntityBackend;
use crate::backend::{BackendRouter, BackendTier, Entity, EntityBackend};
use crate::config::ConsoleConfig;
use crate::error::{ConsoleError, ConsoleResult};
use crate::store::{EntityKind, SeedStore};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: String,
    pub name: String,
    pub phone: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: String,
    pub name: String,
    pub status: String,
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sent: u64,
    #[serde(default)]
    pub total: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub id: String,
    pub amount_cents: i64,
    pub currency: String,
    #[serde(default)]
    pub description: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Webhook {
    pub id: String,
    pub event: String,
    pub url: String,
    #[serde(default)]
    pub enabled: bool,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub contact_id: String,
    pub instance_id: String,
    #[serde(default)]
    pub last_message: String,
    #[serde(default)]
    pub unread: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub conversation_id: String,
    /// `in` or `out`.
    pub direction: String,
    pub body: String,
    pub sent_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub color: String,
}

macro_rules! entity {
    ($ty:ty, $kind:expr) => {
        impl Entity for $ty {
            const KIND: EntityKind = $kind;

            fn id(&self) -> &str {
                &self.id
            }
        }
    };
}

entity!(Contact, EntityKind::Contacts);
entity!(Campaign, EntityKind::Campaigns);
entity!(Transaction, EntityKind::Transactions);
entity!(Webhook, EntityKind::Webhooks);
entity!(Conversation, EntityKind::Conversations);
entity!(ChatMessage, EntityKind::Messages);
entity!(Tag, EntityKind::Tags);

pub struct EntityRepository<E: Entity> {
    router: BackendRouter<dyn EntityBackend<E>>,
}

impl<E: Entity> EntityRepository<E> {
    pub fn new(
        config: watch::Receiver<ConsoleConfig>,
        seeds: SeedStore,
        database: Arc<DatabaseClient>,
    ) -> Self {
        let mock: Arc<dyn EntityBackend<E>> = Arc::new(MockEntityBackend::<E>::new(seeds));
        let remote: Arc<dyn EntityBackend<E>> =
            Arc::new(DatabaseEntityBackend::<E>::new(database));
        Self::with_router(
            BackendRouter::new(E::KIND.key(), config)
                .with_tier(BackendTier::LocalMock, mock)
                .with_tier(BackendTier::RemoteDatabase, remote),
        )
    }

    pub fn with_router(router: BackendRouter<dyn EntityBackend<E>>) -> Self {
        Self { router }
    }

    pub async fn list(&self) -> ConsoleResult<Vec<E>> {
        self.router
            .route("list", |backend| async move { backend.list().await })
            .await
    }

    pub async fn upsert(&self, record: &E) -> ConsoleResult<E> {
        if record.id().trim().is_empty() {
            return Err(ConsoleError::validation(format!(
                "{} record without an id",
                E::KIND
            )));
        }
        self.router
            .route("upsert", |backend| async move { backend.upsert(record).await })
            .await
    }

    pub async fn delete(&self, id: &str) -> ConsoleResult<()> {
        self.router
            .route("delete", |backend| async move { backend.delete(id).await })
            .await
    }
}

/// One repository per secondary kind, addressable by [`EntityKind`] at runtime.
pub struct EntityCatalog {
    pub contacts: EntityRepository<Contact>,
    pub campaigns: EntityRepository<Campaign>,
    pub transactions: EntityRepository<Transaction>,
    pub webhooks: EntityRepository<Webhook>,
    pub conversations: EntityRepository<Conversation>,
    pub messages: EntityRepository<ChatMessage>,
    pub tags: EntityRepository<Tag>,
}

impl EntityCatalog {
    pub fn new(
        config: watch::Receiver<ConsoleConfig>,
        seeds: SeedStore,
        database: Arc<DatabaseClient>,
    ) -> Self {
        Self {
            contacts: EntityRepository::new(config.clone(), seeds.clone(), database.clone()),
            campaigns: EntityRepository::new(config.clone(), seeds.clone(), database.clone()),
            transactions: EntityRepository::new(config.clone(), seeds.clone(), database.clone()),
            webhooks: EntityRepository::new(config.clone(), seeds.clone(), database.clone()),
            conversations: EntityRepository::new(config.clone(), seeds.clone(), database.clone()),
            messages: EntityRepository::new(config.clone(), seeds.clone(), database.clone()),
            tags: EntityRepository::new(config, seeds, database),
        }
    }

    pub async fn list_json(&self, kind: EntityKind) -> ConsoleResult<Vec<Value>> {
        match kind {
            EntityKind::Instances => Err(ConsoleError::validation(
                "instances are served by the instance repository",
            )),
            EntityKind::Contacts => to_values(self.contacts.list().await?),
            EntityKind::Campaigns => to_values(self.campaigns.list().await?),
            EntityKind::Transactions => to_values(self.transactions.list().await?),
            EntityKind::Webhooks => to_values(self.webhooks.list().await?),
            EntityKind::Conversations => to_values(self.conversations.list().await?),
            EntityKind::Messages => to_values(self.messages.list().await?),
            EntityKind::Tags => to_values(self.tags.list().await?),
        }
    }
}

fn to_values<E: Entity>(records: Vec<E>) -> ConsoleResult<Vec<Value>> {
    records
        .iter()
        .map(|record| {
            serde_json::to_value(record)
                .map_err(|err| ConsoleError::store(format!("encode {}: {err}", E::KIND)))
        })
        .collect()
}
