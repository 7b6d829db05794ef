// # Command Executor Trait
//
// Defines the interface for running host commands.
//
// ## Purpose
//
// Every live-system mutation (ip, iptables, ipset, tc, sysctl, vtysh,
// systemctl, swanctl) and every probe (ping, ifconfig) is a shell string
// handed to this trait. Keeping it behind a trait lets the reconciler and
// the samplers be tested by recording the exact command sequence.
//
// ## Contract
//
// - Synchronous from the caller's point of view: one call, one result
// - Stdout is returned on exit status 0
// - Non-zero exit (or spawn failure) is `Error::Command` carrying stderr
// - No streaming and no partial output

use async_trait::async_trait;

/// Trait for command executor implementations
///
/// # Trust Level: Trusted (Host Adapter)
///
/// ## Allowed Capabilities
/// - ✅ Spawn a shell per call and wait for it
/// - ✅ Log the command line at debug level
///
/// ## Forbidden Capabilities
/// - ❌ Retry failed commands (callers decide)
/// - ❌ Rewrite or reorder commands
/// - ❌ Keep processes running after `run` returns
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run a shell command and capture its stdout
    ///
    /// # Parameters
    ///
    /// - `command`: A complete shell command line (pipes allowed)
    ///
    /// # Returns
    ///
    /// - `Ok(String)`: Stdout of a successful run
    /// - `Err(Error::Command)`: Non-zero exit or spawn failure
    async fn run(&self, command: &str) -> Result<String, crate::Error>;
}

/// Helper trait for constructing executors from configuration
pub trait CommandExecutorFactory: Send + Sync {
    /// Create a CommandExecutor instance from configuration
    fn create(&self, config: &serde_json::Value)
    -> Result<Box<dyn CommandExecutor>, crate::Error>;
}
