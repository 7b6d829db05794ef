//! Status signal files read by other processes on the box
//!
//! - `<monitor_dir>/<id>` exists iff the object is Normal
//! - `<monitor_dir>/<id>.changed` is touched on every transition
//! - the root status file exists iff every tracked port is Normal

use std::path::PathBuf;
use std::sync::Arc;

use tracing::warn;

use crate::config::HostPaths;
use crate::traits::ConfigRenderer;

#[derive(Clone)]
pub struct StatusFiles {
    files: Arc<dyn ConfigRenderer>,
    dir: PathBuf,
    root: PathBuf,
}

impl StatusFiles {
    pub fn new(files: Arc<dyn ConfigRenderer>, paths: &HostPaths) -> Self {
        Self {
            files,
            dir: paths.monitor_dir.clone(),
            root: paths.root_status.clone(),
        }
    }

    pub fn status_path(&self, id: &str) -> PathBuf {
        self.dir.join(id)
    }

    pub fn changed_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.changed", id))
    }

    pub async fn ensure_dir(&self) {
        if let Err(e) = self.files.create_dir(&self.dir).await {
            warn!(dir = %self.dir.display(), error = %e, "monitor directory not created");
        }
    }

    async fn set_present(&self, path: PathBuf, present: bool) {
        let exists = self.files.exists(&path).await;
        let result = match (present, exists) {
            (true, false) => self.files.touch(&path).await,
            (false, true) => self.files.remove(&path).await,
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "status file not updated");
        }
    }

    pub async fn write_status(&self, id: &str, normal: bool) {
        self.set_present(self.status_path(id), normal).await;
    }

    pub async fn mark_changed(&self, id: &str) {
        self.set_present(self.changed_path(id), true).await;
    }

    pub async fn write_root(&self, normal: bool) {
        self.set_present(self.root.clone(), normal).await;
    }
}
