// # Config Store Trait
//
// Defines the interface for the persistent configuration store.
//
// ## Purpose
//
// The store is the single source of truth for what the agent last applied:
// - One JSON document per collection object (`/port/lan1`, `/subnet/wan1`, ...)
// - One JSON document per singleton (`/bgp`, `/dns`, ...)
// - The liveness checkpoint (`/status`)
//
// Reconciliation diffs incoming documents against what is stored here, and
// crash recovery replays it.
//
// ## Implementations
//
// - Memory: tests and ephemeral runs
// - File: JSON file with atomic writes and backup recovery
//
// ## Usage
//
// ```rust
// use cpe_core::{ConfigStore, MemoryConfigStore};
//
// #[tokio::main]
// async fn main() -> cpe_core::Result<()> {
//     let store = MemoryConfigStore::new();
//     store.set("/port/lan1", r#"{"id":"lan1"}"#).await?;
//
//     let ports = store.get_all_by_prefix(&["/port/"]).await?;
//     assert_eq!(ports.len(), 1);
//     Ok(())
// }
// ```

use async_trait::async_trait;
use std::collections::BTreeMap;

/// Trait for configuration store implementations
///
/// Keys are plain strings; values are opaque to the store (the object model
/// serializes to JSON before calling in).
///
/// # Thread Safety
///
/// All methods must be safe to call concurrently from multiple tasks. The
/// store does not serialize read-modify-write sequences on one key; callers
/// that need that go through [`crate::KeyedLock`].
///
/// # Trust Level: Trusted (Core Component)
///
/// ## Allowed Capabilities
/// - ✅ Perform I/O for persistent storage
/// - ✅ Cache values in memory (with explicit flush)
/// - ✅ Implement locking for internal consistency
///
/// ## Forbidden Capabilities
/// - ❌ Interpret values (owned by the object model)
/// - ❌ Run host commands (owned by `CommandExecutor`)
/// - ❌ Spawn background tasks without a clear lifecycle
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Get the value for a key
    ///
    /// # Returns
    ///
    /// - `Ok(Some(value))`: Key present
    /// - `Ok(None)`: Key absent
    /// - `Err(Error)`: Storage error
    async fn get(&self, key: &str) -> Result<Option<String>, crate::Error>;

    /// Get a value together with an explicit existence flag
    ///
    /// Absent keys yield `("", false)`. Convenience for callers that branch on
    /// presence and want an empty value otherwise.
    async fn get_with_flag(&self, key: &str) -> Result<(String, bool), crate::Error> {
        Ok(match self.get(key).await? {
            Some(value) => (value, true),
            None => (String::new(), false),
        })
    }

    /// Create or overwrite a key
    async fn set(&self, key: &str, value: &str) -> Result<(), crate::Error>;

    /// Delete a key (absent keys are not an error)
    async fn delete(&self, key: &str) -> Result<(), crate::Error>;

    /// Return every key/value whose key starts with one of the prefixes
    ///
    /// # Returns
    ///
    /// A map ordered by key, so iteration order is stable across calls.
    async fn get_all_by_prefix(
        &self,
        prefixes: &[&str],
    ) -> Result<BTreeMap<String, String>, crate::Error>;

    /// Persist any pending changes
    async fn flush(&self) -> Result<(), crate::Error>;
}

/// Helper trait for constructing config stores from configuration
///
/// Unlike the other factories this one is async: opening a persistent
/// store reads (and possibly recovers) it from disk.
#[async_trait]
pub trait ConfigStoreFactory: Send + Sync {
    /// Create a ConfigStore instance from configuration
    async fn create(&self, config: &serde_json::Value) -> Result<Box<dyn ConfigStore>, crate::Error>;
}
