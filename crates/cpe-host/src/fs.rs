//! Config renderer over the local filesystem
//!
//! Writes create missing parent directories. Removing something that is
//! already gone succeeds, so destroy paths can be replayed.

use async_trait::async_trait;
use cpe_core::traits::{ConfigRenderer, ConfigRendererFactory};
use cpe_core::{Error, Result};
use std::io::ErrorKind;
use std::path::Path;
use tokio::fs;
use tokio::io::AsyncWriteExt;

/// Host file access through `tokio::fs`
#[derive(Debug, Clone, Default)]
pub struct FsRenderer;

impl FsRenderer {
    pub fn new() -> Self {
        Self
    }
}

async fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::render(format!("{}: {}", parent.display(), e)))?;
        }
    }
    Ok(())
}

fn ignore_missing(result: std::io::Result<()>, path: &Path) -> Result<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::render(format!("{}: {}", path.display(), e))),
    }
}

#[async_trait]
impl ConfigRenderer for FsRenderer {
    async fn write(&self, path: &Path, contents: &str) -> Result<()> {
        ensure_parent(path).await?;
        tracing::debug!(path = %path.display(), bytes = contents.len(), "write");
        fs::write(path, contents)
            .await
            .map_err(|e| Error::render(format!("{}: {}", path.display(), e)))
    }

    async fn append(&self, path: &Path, contents: &str) -> Result<()> {
        ensure_parent(path).await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| Error::render(format!("{}: {}", path.display(), e)))?;
        file.write_all(contents.as_bytes())
            .await
            .map_err(|e| Error::render(format!("{}: {}", path.display(), e)))?;
        file.flush().await?;
        Ok(())
    }

    async fn read(&self, path: &Path) -> Result<Option<String>> {
        match fs::read_to_string(path).await {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::render(format!("{}: {}", path.display(), e))),
        }
    }

    async fn exists(&self, path: &Path) -> bool {
        fs::try_exists(path).await.unwrap_or(false)
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        tracing::debug!(path = %path.display(), "remove");
        ignore_missing(fs::remove_file(path).await, path)
    }

    async fn touch(&self, path: &Path) -> Result<()> {
        ensure_parent(path).await?;
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(|e| Error::render(format!("{}: {}", path.display(), e)))?;
        Ok(())
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .await
            .map_err(|e| Error::render(format!("{}: {}", path.display(), e)))
    }

    async fn remove_dir(&self, path: &Path) -> Result<()> {
        tracing::debug!(path = %path.display(), "remove dir");
        ignore_missing(fs::remove_dir_all(path).await, path)
    }

    async fn list_dir(&self, path: &Path) -> Result<Vec<String>> {
        let mut entries = match fs::read_dir(path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::render(format!("{}: {}", path.display(), e))),
        };

        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let is_file = entry.file_type().await.map(|t| t.is_file()).unwrap_or(false);
            if is_file {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }
}

/// Factory for filesystem renderers (configuration is ignored)
pub struct FsRendererFactory;

impl ConfigRendererFactory for FsRendererFactory {
    fn create(&self, _config: &serde_json::Value) -> Result<Box<dyn ConfigRenderer>> {
        Ok(Box::new(FsRenderer::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[tokio::test]
    async fn write_creates_parents_and_replaces() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("etc/smartdns/smartdns.conf");
        let fsr = FsRenderer::new();

        fsr.write(&path, "bind :53\n").await.unwrap();
        fsr.write(&path, "bind :5353\n").await.unwrap();

        assert_eq!(fsr.read(&path).await.unwrap().as_deref(), Some("bind :5353\n"));
    }

    #[tokio::test]
    async fn append_and_touch() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("vnet/rate.log");
        let fsr = FsRenderer::new();

        fsr.append(&log, "a\n").await.unwrap();
        fsr.append(&log, "b\n").await.unwrap();
        fsr.touch(&log).await.unwrap();

        assert_eq!(fsr.read(&log).await.unwrap().as_deref(), Some("a\nb\n"));
    }

    #[tokio::test]
    async fn removal_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let fsr = FsRenderer::new();
        let marker = dir.path().join("monitor/wan1");
        fsr.touch(&marker).await.unwrap();
        assert!(fsr.exists(&marker).await);

        fsr.remove(&marker).await.unwrap();
        fsr.remove(&marker).await.unwrap();
        assert!(!fsr.exists(&marker).await);
        assert!(fsr.read(&marker).await.unwrap().is_none());

        let conn_dir = dir.path().join("ssl/conn1");
        fsr.create_dir(&conn_dir).await.unwrap();
        fsr.write(&conn_dir.join("client.conf"), "remote x\n").await.unwrap();
        fsr.remove_dir(&conn_dir).await.unwrap();
        fsr.remove_dir(&conn_dir).await.unwrap();
        assert!(!fsr.exists(&conn_dir).await);
    }

    #[tokio::test]
    async fn list_dir_returns_sorted_file_names() {
        let dir = TempDir::new().unwrap();
        let fsr = FsRenderer::new();
        for name in ["wan1.changed", "conn1", "wan1"] {
            fsr.touch(&dir.path().join(name)).await.unwrap();
        }
        fsr.create_dir(&dir.path().join("nested")).await.unwrap();

        let names = fsr.list_dir(dir.path()).await.unwrap();
        assert_eq!(names, vec!["conn1", "wan1", "wan1.changed"]);
        assert!(fsr.list_dir(&dir.path().join("missing")).await.unwrap().is_empty());
    }

    #[test]
    fn test_factory_creation() {
        assert!(FsRendererFactory.create(&serde_json::Value::Null).is_ok());
    }
}
