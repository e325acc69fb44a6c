// ============================================================================
// Session Store Contract
// ============================================================================
//
// A session store maps an opaque identity token to a key/value payload that
// survives between logical requests. The context layer only needs the four
// operations below; wire protocol and expiry mechanics belong to the store.
//
// ============================================================================

pub mod memory;

pub use memory::MemorySessionStore;

use crate::core::{ContextError, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Resolves `token` to its payload and refreshes its expiry.
    ///
    /// Unknown tokens and undecodable payloads both fail with
    /// [`ContextError::SessionNotFound`].
    async fn connect(&self, token: &str) -> Result<Storage>;

    /// Persists `session` under `token` with a refreshed expiry.
    async fn disconnect(&self, session: &Storage, token: &str) -> Result<()>;

    /// Mints a fresh token with an empty payload.
    async fn create(&self) -> Result<(String, Storage)>;

    async fn destroy(&self, token: &str) -> Result<bool>;
}

/// Attribute bag used for session payloads and per-request state.
///
/// Interior mutability lets every holder of the shared handle read and write
/// items without threading `&mut` through application code.
#[derive(Debug, Default)]
pub struct Storage {
    values: RwLock<BTreeMap<String, serde_json::Value>>,
}

impl Storage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(values: BTreeMap<String, serde_json::Value>) -> Self {
        Self {
            values: RwLock::new(values),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, BTreeMap<String, serde_json::Value>> {
        self.values.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, BTreeMap<String, serde_json::Value>> {
        self.values.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.read().get(key).cloned()
    }

    /// Typed read; `None` when the item is absent or has another shape.
    pub fn get_as<V: DeserializeOwned>(&self, key: &str) -> Option<V> {
        self.get(key).and_then(|v| serde_json::from_value(v).ok())
    }

    pub fn set(&self, key: &str, value: impl Serialize) -> Result<()> {
        let value =
            serde_json::to_value(value).map_err(|e| ContextError::Serialization(e.to_string()))?;
        self.write().insert(key.to_string(), value);
        Ok(())
    }

    pub fn remove(&self, key: &str) -> Option<serde_json::Value> {
        self.write().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    pub fn to_map(&self) -> BTreeMap<String, serde_json::Value> {
        self.read().clone()
    }

    /// MessagePack encoding of the current items.
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(rmp_serde::to_vec(&*self.read())?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        rmp_serde::from_slice(bytes)
            .map(Self::from_map)
            .map_err(|e| ContextError::Serialization(e.to_string()))
    }
}

impl Clone for Storage {
    fn clone(&self) -> Self {
        Self::from_map(self.to_map())
    }
}
