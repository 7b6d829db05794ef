// # File Config Store
//
// File-based implementation of ConfigStore with crash recovery.
//
// ## Purpose
//
// Keeps the last applied configuration across reboots so the recovery pass
// can replay it before the controller is reachable.
//
// ## Crash Recovery
//
// - Atomic writes: write-then-rename
// - Automatic backup: the previous file is kept as `.backup`
// - Recovery: a corrupt main file falls back to the backup
//
// ## File Format
//
// ```json
// {
//   "version": "1.0",
//   "entries": {
//     "/port/lan1": "{\"id\":\"lan1\",...}",
//     "/bgp": "{\"localAs\":65001,...}"
//   }
// }
// ```

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};

use crate::Error;
use crate::traits::config_store::{ConfigStore, ConfigStoreFactory};

/// Store file format version
const STORE_FILE_VERSION: &str = "1.0";

/// File-based config store with crash recovery
///
/// Every mutation is written through immediately; `flush` only matters
/// when a previous write failed and left the store dirty.
#[derive(Debug)]
pub struct FileConfigStore {
    path: PathBuf,
    state: Arc<RwLock<FileState>>,
    /// Serializes writers so two renames never race on the temp file
    write_lock: Mutex<()>,
}

#[derive(Debug)]
struct FileState {
    entries: BTreeMap<String, String>,
    dirty: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
struct StoreFileFormat {
    version: String,
    entries: BTreeMap<String, String>,
}

impl FileConfigStore {
    /// Create or load a file store
    ///
    /// This will:
    /// 1. Create parent directories if needed
    /// 2. Load the existing file
    /// 3. Fall back to the backup if the file is corrupt
    /// 4. Start empty if both are unusable
    pub async fn new<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            fs::create_dir_all(parent).await.map_err(|e| {
                Error::config(format!(
                    "Failed to create store directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }

        let entries = Self::load_with_recovery(&path).await?;

        Ok(Self {
            path,
            state: Arc::new(RwLock::new(FileState {
                entries,
                dirty: false,
            })),
            write_lock: Mutex::new(()),
        })
    }

    /// Load entries, falling back to the backup on corruption
    async fn load_with_recovery(path: &Path) -> Result<BTreeMap<String, String>, Error> {
        match Self::load(path).await {
            Ok(entries) => {
                tracing::debug!("Loaded config store: {} entries", entries.len());
                Ok(entries)
            }
            Err(Error::Json(e)) => {
                tracing::warn!(
                    "Config store {} is corrupted: {}. Attempting recovery from backup.",
                    path.display(),
                    e
                );

                let backup = Self::backup_path(path);
                if !backup.exists() {
                    tracing::warn!("No backup file found. Starting with an empty store.");
                    return Ok(BTreeMap::new());
                }

                match Self::load(&backup).await {
                    Ok(entries) => {
                        tracing::info!("Recovered config store from backup: {} entries", entries.len());
                        if let Err(restore_err) = fs::copy(&backup, path).await {
                            tracing::error!("Failed to restore store file from backup: {}", restore_err);
                        }
                        Ok(entries)
                    }
                    Err(backup_err) => {
                        tracing::error!(
                            "Backup also unusable: {}. Starting with an empty store.",
                            backup_err
                        );
                        Ok(BTreeMap::new())
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn load(path: &Path) -> Result<BTreeMap<String, String>, Error> {
        if !path.exists() {
            tracing::debug!("Config store file does not exist: {}", path.display());
            return Ok(BTreeMap::new());
        }

        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::store(format!("Failed to read store file {}: {}", path.display(), e))
        })?;

        let file: StoreFileFormat = serde_json::from_str(&content)?;
        if file.version != STORE_FILE_VERSION {
            tracing::warn!(
                "Config store version mismatch: expected {}, got {}. Loading anyway.",
                STORE_FILE_VERSION,
                file.version
            );
        }
        Ok(file.entries)
    }

    /// Write the current entries atomically
    async fn write_state(&self) -> Result<(), Error> {
        let _writer = self.write_lock.lock().await;

        let json = {
            let guard = self.state.read().await;
            serde_json::to_string_pretty(&StoreFileFormat {
                version: STORE_FILE_VERSION.to_string(),
                entries: guard.entries.clone(),
            })?
        };

        let temp_path = self.temp_path();
        {
            let mut file = fs::File::create(&temp_path).await.map_err(|e| {
                Error::store(format!("Failed to create temp file {}: {}", temp_path.display(), e))
            })?;
            file.write_all(json.as_bytes()).await.map_err(|e| {
                Error::store(format!("Failed to write temp file {}: {}", temp_path.display(), e))
            })?;
            file.flush().await.map_err(|e| {
                Error::store(format!("Failed to flush temp file {}: {}", temp_path.display(), e))
            })?;
        }

        if self.path.exists()
            && let Err(e) = fs::copy(&self.path, Self::backup_path(&self.path)).await
        {
            tracing::warn!("Failed to create store backup: {}", e);
        }

        fs::rename(&temp_path, &self.path).await.map_err(|e| {
            Error::store(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        self.state.write().await.dirty = false;
        tracing::trace!("Config store written: {}", self.path.display());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.path.clone();
        temp.set_extension("tmp");
        temp
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn get(&self, key: &str) -> Result<Option<String>, Error> {
        Ok(self.state.read().await.entries.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<(), Error> {
        {
            let mut guard = self.state.write().await;
            guard.entries.insert(key.to_string(), value.to_string());
            guard.dirty = true;
        }
        self.write_state().await
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        {
            let mut guard = self.state.write().await;
            if guard.entries.remove(key).is_none() {
                return Ok(());
            }
            guard.dirty = true;
        }
        self.write_state().await
    }

    async fn get_all_by_prefix(&self, prefixes: &[&str]) -> Result<BTreeMap<String, String>, Error> {
        let guard = self.state.read().await;
        Ok(guard
            .entries
            .iter()
            .filter(|(k, _)| prefixes.iter().any(|p| k.starts_with(p)))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    async fn flush(&self) -> Result<(), Error> {
        let dirty = self.state.read().await.dirty;
        if dirty { self.write_state().await } else { Ok(()) }
    }
}

/// Factory for file stores
///
/// Accepts `{"path": "/var/lib/cpe/store.json"}`; the path is required.
pub struct FileConfigStoreFactory;

#[derive(serde::Deserialize)]
struct FileStoreSettings {
    #[serde(default)]
    path: PathBuf,
}

#[async_trait]
impl ConfigStoreFactory for FileConfigStoreFactory {
    async fn create(&self, config: &serde_json::Value) -> Result<Box<dyn ConfigStore>, Error> {
        let settings: FileStoreSettings = serde_json::from_value(config.clone())
            .map_err(|e| Error::config(format!("Invalid file store config: {}", e)))?;
        if settings.path.as_os_str().is_empty() {
            return Err(Error::config("File store path is required"));
        }
        Ok(Box::new(FileConfigStore::new(&settings.path).await?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn persists_across_instances() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = FileConfigStore::new(&path).await.unwrap();
        store.set("/port/lan1", r#"{"id":"lan1"}"#).await.unwrap();
        assert!(path.exists());

        let reopened = FileConfigStore::new(&path).await.unwrap();
        assert_eq!(
            reopened.get("/port/lan1").await.unwrap().as_deref(),
            Some(r#"{"id":"lan1"}"#)
        );
    }

    #[tokio::test]
    async fn corrupt_file_recovers_previous_state_from_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = FileConfigStore::new(&path).await.unwrap();
        store.set("/bgp", "first").await.unwrap();
        store.set("/bgp", "second").await.unwrap();

        let backup = FileConfigStore::backup_path(&path);
        assert!(backup.exists(), "Backup file should exist after second write");

        fs::write(&path, b"not json").await.unwrap();

        let recovered = FileConfigStore::new(&path).await.unwrap();
        assert_eq!(
            recovered.get("/bgp").await.unwrap().as_deref(),
            Some("first"),
            "Backup should hold the state before the last write"
        );
    }

    #[tokio::test]
    async fn delete_of_missing_key_does_not_rewrite() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");

        let store = FileConfigStore::new(&path).await.unwrap();
        store.delete("/port/none").await.unwrap();
        assert!(!path.exists(), "No write expected for a no-op delete");
    }

    #[tokio::test]
    async fn concurrent_writers_leave_consistent_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("store.json");
        let store = Arc::new(FileConfigStore::new(&path).await.unwrap());

        let mut tasks = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store.set(&format!("/subnet/s{}", i), "{}").await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let reopened = FileConfigStore::new(&path).await.unwrap();
        let all = reopened.get_all_by_prefix(&["/subnet/"]).await.unwrap();
        assert_eq!(all.len(), 16);
    }

    #[tokio::test]
    async fn test_factory_creation() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/store.json");
        let factory = FileConfigStoreFactory;

        let store = factory
            .create(&serde_json::json!({"path": path}))
            .await
            .unwrap();
        store.set("/bgp", "{}").await.unwrap();
        assert!(path.exists());

        assert!(factory.create(&serde_json::json!({})).await.is_err());
        assert!(factory.create(&serde_json::json!({"path": 7})).await.is_err());
    }
}
