// # Memory Config Store
//
// In-memory implementation of ConfigStore.
//
// ## Purpose
//
// Backs unit and contract tests, and one-shot runs where the applied
// configuration does not need to survive a restart.
//
// ## Crash Behavior
//
// - Everything is lost on restart
// - Recovery replays nothing; the next full push recreates every object

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::Error;
use crate::traits::config_store::{ConfigStore, ConfigStoreFactory};

/// In-memory config store
///
/// Keys live in a `BTreeMap` behind a `RwLock`, so prefix scans come back
/// in key order.
///
/// # Example
///
/// ```rust,no_run
/// use cpe_core::store::MemoryConfigStore;
/// use cpe_core::traits::ConfigStore;
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let store = MemoryConfigStore::new();
///     store.set("/bgp", r#"{"localAs":65001}"#).await?;
///     assert!(store.get("/bgp").await?.is_some());
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone, Default)]
pub struct MemoryConfigStore {
    inner: Arc<RwLock<BTreeMap<String, String>>>,
}

impl MemoryConfigStore {
    /// Create a new empty memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store pre-seeded with key/value pairs
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let map = entries
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        Self {
            inner: Arc::new(RwLock::new(map)),
        }
    }

    /// Number of keys in the store
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    /// Whether the store is empty
    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }

    /// All keys, in order
    pub async fn keys(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        self.inner
            .write()
            .await
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.inner.write().await.remove(key);
        Ok(())
    }

    async fn get_all_by_prefix(&self, prefixes: &[&str]) -> Result<BTreeMap<String, String>, Error> {
        let guard = self.inner.read().await;
        Ok(guard
            .iter()
            .filter(|(k, _)| prefixes.iter().any(|p| k.starts_with(p)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn flush(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Factory for memory stores (configuration is ignored)
pub struct MemoryConfigStoreFactory;

#[async_trait]
impl ConfigStoreFactory for MemoryConfigStoreFactory {
    async fn create(&self, _config: &serde_json::Value) -> Result<Box<dyn ConfigStore>, Error> {
        Ok(Box::new(MemoryConfigStore::new()))
    }
}
