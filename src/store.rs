//! Local key-value persistence for the mock tier and the console config.
//!
//! Every entity kind is stored as one JSON array under its own key and is
//! seeded from fixtures the first time it is read.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::{ConsoleError, ConsoleResult};
use crate::fixtures;
use crate::operator_log;
use crate::runtime_state;

/// Whole-record store with an explicit lifecycle. Construction is `open`.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> ConsoleResult<Option<Value>>;
    fn put(&self, key: &str, value: &Value) -> ConsoleResult<()>;
    fn close(&self) -> ConsoleResult<()>;
}

pub type DynKvStore = Arc<dyn KvStore>;

pub struct FileKvStore {
    dir: PathBuf,
    closed: AtomicBool,
}

impl FileKvStore {
    pub fn open(dir: impl Into<PathBuf>) -> ConsoleResult<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|err| {
            ConsoleError::store(format!("unable to open store at {}: {err}", dir.display()))
        })?;
        Ok(Self {
            dir,
            closed: AtomicBool::new(false),
        })
    }

    fn path(&self, key: &str) -> ConsoleResult<PathBuf> {
        if key.is_empty()
            || !key
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' || ch == '.')
        {
            return Err(ConsoleError::store(format!("invalid store key '{key}'")));
        }
        Ok(self.dir.join(format!("{key}.json")))
    }

    fn ensure_open(&self) -> ConsoleResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConsoleError::store("store is closed"));
        }
        Ok(())
    }
}

impl KvStore for FileKvStore {
    fn get(&self, key: &str) -> ConsoleResult<Option<Value>> {
        self.ensure_open()?;
        let path = self.path(key)?;
        runtime_state::read_json(&path)
            .map_err(|err| ConsoleError::store(format!("read {}: {err}", path.display())))
    }

    fn put(&self, key: &str, value: &Value) -> ConsoleResult<()> {
        self.ensure_open()?;
        let path = self.path(key)?;
        runtime_state::write_json(&path, value)
            .map_err(|err| ConsoleError::store(format!("write {}: {err}", path.display())))
    }

    fn close(&self) -> ConsoleResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<BTreeMap<String, Value>>,
    closed: AtomicBool,
}

impl MemoryKvStore {
    pub fn open() -> Self {
        Self::default()
    }
}

impl KvStore for MemoryKvStore {
    fn get(&self, key: &str) -> ConsoleResult<Option<Value>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConsoleError::store("store is closed"));
        }
        let entries = self
            .entries
            .lock()
            .map_err(|_| ConsoleError::store("memory store lock poisoned"))?;
        Ok(entries.get(key).cloned())
    }

    fn put(&self, key: &str, value: &Value) -> ConsoleResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ConsoleError::store("store is closed"));
        }
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| ConsoleError::store("memory store lock poisoned"))?;
        entries.insert(key.to_string(), value.clone());
        Ok(())
    }

    fn close(&self) -> ConsoleResult<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EntityKind {
    Instances,
    Contacts,
    Campaigns,
    Transactions,
    Webhooks,
    Conversations,
    Messages,
    Tags,
}

impl EntityKind {
    pub const ALL: [EntityKind; 8] = [
        EntityKind::Instances,
        EntityKind::Contacts,
        EntityKind::Campaigns,
        EntityKind::Transactions,
        EntityKind::Webhooks,
        EntityKind::Conversations,
        EntityKind::Messages,
        EntityKind::Tags,
    ];

    /// Store key and remote table name.
    pub fn key(self) -> &'static str {
        match self {
            Self::Instances => "instances",
            Self::Contacts => "contacts",
            Self::Campaigns => "campaigns",
            Self::Transactions => "transactions",
            Self::Webhooks => "webhooks",
            Self::Conversations => "conversations",
            Self::Messages => "messages",
            Self::Tags => "tags",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.key().eq_ignore_ascii_case(value.trim()))
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Fixture-seeded view over a [`KvStore`].
#[derive(Clone)]
pub struct SeedStore {
    kv: DynKvStore,
}

impl SeedStore {
    pub fn new(kv: DynKvStore) -> Self {
        Self { kv }
    }

    pub fn kv(&self) -> &DynKvStore {
        &self.kv
    }

    pub fn load_raw(&self, kind: EntityKind) -> ConsoleResult<Vec<Value>> {
        match self.load_or_seed(kind.key(), || Value::Array(fixtures::seed(kind)))? {
            Value::Array(items) => Ok(items),
            _ => Err(ConsoleError::store(format!(
                "stored value for '{kind}' is not an array"
            ))),
        }
    }

    /// Reads `key`, writing `seed()` first when the key has never been stored.
    pub fn load_or_seed(&self, key: &str, seed: impl FnOnce() -> Value) -> ConsoleResult<Value> {
        if let Some(value) = self.kv.get(key)? {
            return Ok(value);
        }
        let value = seed();
        self.kv.put(key, &value)?;
        operator_log::debug(module_path!(), format!("seeded key={key}"));
        Ok(value)
    }

    pub fn load<T: DeserializeOwned>(&self, kind: EntityKind) -> ConsoleResult<Vec<T>> {
        self.load_raw(kind)?
            .into_iter()
            .map(|value| {
                serde_json::from_value(value).map_err(|err| {
                    ConsoleError::store(format!("malformed '{kind}' record: {err}"))
                })
            })
            .collect()
    }

    pub fn save<T: Serialize>(&self, kind: EntityKind, items: &[T]) -> ConsoleResult<()> {
        let value = serde_json::to_value(items)
            .map_err(|err| ConsoleError::store(format!("encode '{kind}': {err}")))?;
        self.kv.put(kind.key(), &value)
    }
}
