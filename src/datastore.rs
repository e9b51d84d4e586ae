//! The external key-value transport this crate replicates over: a
//! `get`/`set` interface, generalized from raw strings to the small
//! closed set of value shapes this protocol's keyspace actually needs.
//! The implementation behind that interface is out of scope here.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::item::ItemSnapshot;

/// The value shapes written to or read from a datastore key under this
/// protocol.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(untagged)]
pub enum DatastoreValue {
    /// `{prefix}.classname` — a constant string, the producer's class
    /// name.
    ClassName(String),
    /// `{prefix}.all` — a full snapshot of every item currently in the
    /// producer's set.
    Snapshot(Vec<ItemSnapshot>),
    /// `{prefix}.pulsars` — the set of configured cadence tags, each
    /// initialized to an empty bundle.
    Pulsars(HashMap<String, Vec<String>>),
    /// `{prefix}.pulsars.{tag}` — the current bundle for one cadence.
    Bundle(Vec<String>),
}

/// An opaque `get(key) -> value` / `set(key, value)` store with no
/// native pub/sub. Implementations are expected to be eventually
/// consistent and to tolerate concurrent writers on unrelated keys.
#[async_trait]
pub trait Datastore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<DatastoreValue>>;
    async fn set(&self, key: &str, value: DatastoreValue) -> Result<()>;
}

/// In-process `Datastore` used by this crate's tests and the demo
/// binary: a mutex-guarded hash map keyed by the datastore key string.
#[derive(Debug, Default)]
pub struct InMemoryDatastore {
    entries: Mutex<HashMap<String, DatastoreValue>>,
}

impl InMemoryDatastore {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }
}

#[async_trait]
impl Datastore for InMemoryDatastore {
    async fn get(&self, key: &str) -> Result<Option<DatastoreValue>> {
        let entries = self
            .entries
            .lock()
            .map_err(|_| Error::TransportError("datastore lock poisoned".into()))?;
        Ok(entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: DatastoreValue) -> Result<()> {
        let mut entries = self
            .entries
            .lock()
            .map_err(|_| Error::TransportError("datastore lock poisoned".into()))?;
        entries.insert(key.to_string(), value);
        Ok(())
    }
}
