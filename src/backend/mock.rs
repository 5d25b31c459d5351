//! Local mock tier backed by the seeded store. It only fails on missing
//! records or local I/O.

use std::marker::PhantomData;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::Utc;
use uuid::Uuid;

use crate::backend::{Entity, EntityBackend, InstanceBackend};
use crate::error::{ConsoleError, ConsoleResult};
use crate::model::{
    ConnectionReport, DEFAULT_MESSAGES_LIMIT, Instance, InstanceStatus, NewInstance,
    PairingTarget,
};
use crate::store::{EntityKind, SeedStore};

pub struct MockInstanceBackend {
    seeds: SeedStore,
}

impl MockInstanceBackend {
    pub fn new(seeds: SeedStore) -> Self {
        Self { seeds }
    }

    fn load(&self) -> ConsoleResult<Vec<Instance>> {
        self.seeds.load(EntityKind::Instances)
    }

    fn save(&self, instances: &[Instance]) -> ConsoleResult<()> {
        self.seeds.save(EntityKind::Instances, instances)
    }
}

#[async_trait]
impl InstanceBackend for MockInstanceBackend {
    async fn list(&self) -> ConsoleResult<Vec<Instance>> {
        self.load()
    }

    async fn create(&self, request: &NewInstance) -> ConsoleResult<Instance> {
        let mut instances = self.load()?;
        let now = Utc::now();
        let instance = Instance {
            id: format!("inst-{}", Uuid::new_v4().simple()),
            name: request.name.clone(),
            status: InstanceStatus::Connecting,
            phone: None,
            last_update: now,
            messages_used: 0,
            messages_limit: DEFAULT_MESSAGES_LIMIT,
            owner_id: request.owner_id.clone(),
            owner_name: request.owner_name.clone(),
            created_at: Some(now),
        };
        instances.push(instance.clone());
        self.save(&instances)?;
        Ok(instance)
    }

    async fn delete(&self, id: &str, _name: &str) -> ConsoleResult<()> {
        let mut instances = self.load()?;
        let before = instances.len();
        instances.retain(|instance| instance.id != id);
        if instances.len() == before {
            return Err(ConsoleError::not_found(format!("instance {id}")));
        }
        self.save(&instances)
    }

    async fn pairing_material(&self, id: &str, _name: &str) -> ConsoleResult<String> {
        let instances = self.load()?;
        if !instances.iter().any(|instance| instance.id == id) {
            return Err(ConsoleError::not_found(format!("instance {id}")));
        }
        let raw = Uuid::new_v4().simple().to_string().to_ascii_uppercase();
        let code = format!("{}-{}", &raw[..4], &raw[4..8]);
        let link = format!("wa-pair://{id}?code={code}");
        Ok(format!("data:text/plain;base64,{}", STANDARD.encode(link)))
    }

    async fn mark_connected(
        &self,
        target: &PairingTarget,
        report: &ConnectionReport,
    ) -> ConsoleResult<Instance> {
        let mut instances = self.load()?;
        let instance = instances
            .iter_mut()
            .find(|instance| instance.id == target.id)
            .ok_or_else(|| ConsoleError::not_found(format!("instance {}", target.id)))?;
        if !target.matches(instance) {
            return Err(ConsoleError::not_found(format!(
                "instance {} was replaced after pairing started",
                target.id
            )));
        }
        instance.status = InstanceStatus::Connected;
        if report.phone.is_some() {
            instance.phone = report.phone.clone();
        }
        instance.last_update = Utc::now();
        let updated = instance.clone();
        self.save(&instances)?;
        Ok(updated)
    }
}

pub struct MockEntityBackend<E> {
    seeds: SeedStore,
    _entity: PhantomData<fn() -> E>,
}

impl<E: Entity> MockEntityBackend<E> {
    pub fn new(seeds: SeedStore) -> Self {
        Self {
            seeds,
            _entity: PhantomData,
        }
    }
}

#[async_trait]
impl<E: Entity> EntityBackend<E> for MockEntityBackend<E> {
    async fn list(&self) -> ConsoleResult<Vec<E>> {
        self.seeds.load(E::KIND)
    }

    async fn upsert(&self, record: &E) -> ConsoleResult<E> {
        let mut records: Vec<E> = self.seeds.load(E::KIND)?;
        match records.iter_mut().find(|existing| existing.id() == record.id()) {
            Some(existing) => *existing = record.clone(),
            None => records.push(record.clone()),
        }
        self.seeds.save(E::KIND, &records)?;
        Ok(record.clone())
    }

    async fn delete(&self, id: &str) -> ConsoleResult<()> {
        let mut records: Vec<E> = self.seeds.load(E::KIND)?;
        let before = records.len();
        records.retain(|record| record.id() != id);
        if records.len() == before {
            return Err(ConsoleError::not_found(format!("{} {id}", E::KIND)));
        }
        self.seeds.save(E::KIND, &records)
    }
}
