// # Config Renderer Trait
//
// Defines the interface for host file access.
//
// ## Purpose
//
// Daemon configs (dhcpd.conf, smartdns.conf, keepalived.conf, OpenVPN
// profiles, swanctl connections, ifcfg scripts) are rendered to strings by
// the object model and written through this trait. The liveness side uses
// it for the per-object status files and the flow log files.
//
// Keeping file access behind a trait means the core never depends on the
// real filesystem layout and tests can inspect every write.

use async_trait::async_trait;
use std::path::Path;

/// Trait for host file access implementations
///
/// # Trust Level: Trusted (Host Adapter)
///
/// ## Allowed Capabilities
/// - ✅ Create, replace and delete files and directories
/// - ✅ Create parent directories on write
///
/// ## Forbidden Capabilities
/// - ❌ Decide file contents (owned by the object model)
/// - ❌ Run host commands
#[async_trait]
pub trait ConfigRenderer: Send + Sync {
    /// Replace a file's contents, creating parent directories as needed
    async fn write(&self, path: &Path, contents: &str) -> Result<(), crate::Error>;

    /// Append to a file, creating it as needed
    async fn append(&self, path: &Path, contents: &str) -> Result<(), crate::Error>;

    /// Read a file; `Ok(None)` when it does not exist
    async fn read(&self, path: &Path) -> Result<Option<String>, crate::Error>;

    /// Whether a file or directory exists
    async fn exists(&self, path: &Path) -> bool;

    /// Remove a file (absent files are not an error)
    async fn remove(&self, path: &Path) -> Result<(), crate::Error>;

    /// Create an empty file if absent, leaving existing contents alone
    async fn touch(&self, path: &Path) -> Result<(), crate::Error>;

    /// Create a directory and its parents
    async fn create_dir(&self, path: &Path) -> Result<(), crate::Error>;

    /// Remove a directory recursively (absent directories are not an error)
    async fn remove_dir(&self, path: &Path) -> Result<(), crate::Error>;

    /// List the file names (not paths) directly inside a directory
    async fn list_dir(&self, path: &Path) -> Result<Vec<String>, crate::Error>;
}

/// Helper trait for constructing renderers from configuration
pub trait ConfigRendererFactory: Send + Sync {
    /// Create a ConfigRenderer instance from configuration
    fn create(&self, config: &serde_json::Value) -> Result<Box<dyn ConfigRenderer>, crate::Error>;
}
