//! Test doubles for the Control API contract tests

#![allow(dead_code)]

use async_trait::async_trait;
use cpe_core::config::{AgentConfig, HostPaths};
use cpe_core::port_map::PortMap;
use cpe_core::traits::{CommandExecutor, ConfigRenderer, ConfigStore};
use cpe_core::{AgentHealth, MemoryConfigStore, ReconcileContext, Reconciler, Result};
use cpe_api::ApiState;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Records commands and succeeds with empty output
#[derive(Default)]
pub struct RecordingExecutor {
    commands: Mutex<Vec<String>>,
}

impl RecordingExecutor {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }
}

#[async_trait]
impl CommandExecutor for RecordingExecutor {
    async fn run(&self, command: &str) -> Result<String> {
        self.commands.lock().unwrap().push(command.to_string());
        Ok(String::new())
    }
}

/// Flat in-memory file map
#[derive(Default)]
pub struct MemoryFiles {
    files: Mutex<BTreeMap<PathBuf, String>>,
}

#[async_trait]
impl ConfigRenderer for MemoryFiles {
    async fn write(&self, path: &Path, contents: &str) -> Result<()> {
        self.files.lock().unwrap().insert(path.to_path_buf(), contents.to_string());
        Ok(())
    }

    async fn append(&self, path: &Path, contents: &str) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .entry(path.to_path_buf())
            .or_default()
            .push_str(contents);
        Ok(())
    }

    async fn read(&self, path: &Path) -> Result<Option<String>> {
        Ok(self.files.lock().unwrap().get(path).cloned())
    }

    async fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    async fn touch(&self, path: &Path) -> Result<()> {
        self.files.lock().unwrap().entry(path.to_path_buf()).or_default();
        Ok(())
    }

    async fn create_dir(&self, _path: &Path) -> Result<()> {
        Ok(())
    }

    async fn remove_dir(&self, path: &Path) -> Result<()> {
        self.files.lock().unwrap().retain(|p, _| !p.starts_with(path));
        Ok(())
    }

    async fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .keys()
            .filter(|p| p.parent() == Some(path))
            .filter_map(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
            .collect())
    }
}

pub struct TestApi {
    pub state: ApiState,
    pub store: Arc<MemoryConfigStore>,
    pub exec: Arc<RecordingExecutor>,
}

impl TestApi {
    pub fn new(sn: &str) -> Self {
        let mut config = AgentConfig::for_serial(sn);
        config.paths = HostPaths::rooted_at("/test");

        let store = Arc::new(MemoryConfigStore::new());
        let exec = Arc::new(RecordingExecutor::default());
        let ctx = ReconcileContext::new(
            &config,
            store.clone() as Arc<dyn ConfigStore>,
            exec.clone() as Arc<dyn CommandExecutor>,
            Arc::new(MemoryFiles::default()) as Arc<dyn ConfigRenderer>,
            Arc::new(PortMap::default()),
            Arc::new(AgentHealth::new()),
        );
        let (reconciler, _events) = Reconciler::new(ctx);

        Self {
            state: ApiState::new(Arc::new(reconciler)),
            store,
            exec,
        }
    }
}
