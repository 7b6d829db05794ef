//! Command executor over `sh -c`
//!
//! Commands are full shell lines (the core pipes `ifconfig` into `grep` and
//! `awk`), so each one is handed to a fresh shell. A run that outlives the
//! timeout is killed and reported as a failed command.

use async_trait::async_trait;
use cpe_core::traits::{CommandExecutor, CommandExecutorFactory};
use cpe_core::{Error, Result};
use serde::Deserialize;
use std::time::Duration;
use tokio::process::Command;

/// Default upper bound on a single command (a `systemctl restart frr` is the slowest)
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Runs host commands through the system shell
#[derive(Debug, Clone)]
pub struct ShellExecutor {
    shell: String,
    timeout: Duration,
}

impl ShellExecutor {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_COMMAND_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            shell: "sh".to_string(),
            timeout,
        }
    }

    /// Use a different shell binary
    pub fn with_shell(mut self, shell: impl Into<String>) -> Self {
        self.shell = shell.into();
        self
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

impl Default for ShellExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandExecutor for ShellExecutor {
    async fn run(&self, command: &str) -> Result<String> {
        tracing::debug!(command, "exec");

        let child = Command::new(&self.shell)
            .arg("-c")
            .arg(command)
            .kill_on_drop(true)
            .output();

        let output = match tokio::time::timeout(self.timeout, child).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                tracing::error!(command, error = %e, "failed to spawn shell");
                return Err(Error::command(command, e.to_string()));
            }
            Err(_) => {
                tracing::warn!(command, timeout_secs = self.timeout.as_secs(), "command timed out");
                return Err(Error::command(
                    command,
                    format!("timed out after {}s", self.timeout.as_secs()),
                ));
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if output.status.success() {
            return Ok(stdout);
        }

        // ping writes its summary to stdout even when it exits 1
        let mut stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if stderr.trim().is_empty() {
            stderr = stdout;
        }
        tracing::warn!(
            command,
            code = output.status.code().unwrap_or(-1),
            stderr = %stderr.trim(),
            "command failed"
        );
        Err(Error::command(command, stderr))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShellSettings {
    #[serde(default)]
    timeout_secs: Option<u64>,
    #[serde(default)]
    shell: Option<String>,
}

/// Factory for shell executors
///
/// Accepts `{"timeoutSecs": 30, "shell": "/bin/bash"}`; both keys are optional.
pub struct ShellExecutorFactory;

impl CommandExecutorFactory for ShellExecutorFactory {
    fn create(&self, config: &serde_json::Value) -> Result<Box<dyn CommandExecutor>> {
        let settings: ShellSettings = if config.is_null() {
            ShellSettings::default()
        } else {
            serde_json::from_value(config.clone())
                .map_err(|e| Error::config(format!("Invalid shell executor config: {}", e)))?
        };

        let timeout = match settings.timeout_secs {
            Some(0) => return Err(Error::config("Command timeout must be > 0")),
            Some(secs) => Duration::from_secs(secs),
            None => DEFAULT_COMMAND_TIMEOUT,
        };

        let mut executor = ShellExecutor::with_timeout(timeout);
        if let Some(shell) = settings.shell {
            executor = executor.with_shell(shell);
        }
        Ok(Box::new(executor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn stdout_is_returned() {
        let exec = ShellExecutor::new();
        let out = exec.run("echo hello | tr a-z A-Z").await.unwrap();
        assert_eq!(out, "HELLO\n");
    }

    #[tokio::test]
    async fn non_zero_exit_carries_stderr() {
        let exec = ShellExecutor::new();
        let err = exec.run("echo boom >&2; exit 3").await.unwrap_err();
        match err {
            Error::Command { command, stderr } => {
                assert!(command.contains("exit 3"));
                assert_eq!(stderr.trim(), "boom");
            }
            other => panic!("Expected Command error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn silent_failure_falls_back_to_stdout() {
        let exec = ShellExecutor::new();
        let err = exec.run("echo '1 packets transmitted, 0 received'; exit 1").await.unwrap_err();
        assert!(err.to_string().contains("0 received"));
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let exec = ShellExecutor::with_timeout(Duration::from_millis(100));
        let err = exec.run("sleep 5").await.unwrap_err();
        assert!(err.to_string().contains("timed out"), "got {}", err);
    }

    #[test]
    fn test_factory_creation() {
        let factory = ShellExecutorFactory;
        assert!(factory.create(&json!(null)).is_ok());
        assert!(factory.create(&json!({"timeoutSecs": 30})).is_ok());
        assert!(factory.create(&json!({"timeoutSecs": 0})).is_err());
        assert!(factory.create(&json!({"timeoutSecs": "soon"})).is_err());
    }
}
