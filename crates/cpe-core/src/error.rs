//! Error types for the CPE agent
//!
//! This module defines all error types used throughout the crate.

use thiserror::Error;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the CPE agent
#[derive(Error, Debug)]
pub enum Error {
    /// Config store errors
    #[error("Config store error: {0}")]
    Store(String),

    /// A host command exited non-zero or could not be spawned
    #[error("Command failed: `{command}`: {stderr}")]
    Command {
        /// The command line that was run
        command: String,
        /// Captured stderr (or spawn error text)
        stderr: String,
    },

    /// Upstream controller errors (transport, status, or body-level failure)
    #[error("Controller error: {0}")]
    Controller(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Object not found in the config store
    #[error("Not found: {0}")]
    NotFound(String),

    /// Object already present in the config store
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Request addressed to a different device
    #[error("Serial number mismatch: {0}")]
    SerialMismatch(String),

    /// Rendering or writing a daemon config file failed
    #[error("Render error: {0}")]
    Render(String),

    /// Conn type outside the supported set
    #[error("Unknown connection type: {0}")]
    UnknownConnType(u8),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a config store error
    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    /// Create a command error
    pub fn command(command: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            stderr: stderr.into(),
        }
    }

    /// Create a controller error
    pub fn controller(msg: impl Into<String>) -> Self {
        Self::Controller(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create an "already exists" error
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// Create a render error
    pub fn render(msg: impl Into<String>) -> Self {
        Self::Render(msg.into())
    }

    /// Whether the caller sent something unusable, as opposed to the host failing
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidInput(_)
                | Self::NotFound(_)
                | Self::AlreadyExists(_)
                | Self::SerialMismatch(_)
                | Self::Json(_)
        )
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_error_names_the_command() {
        let err = Error::command("ip link set eth9 up", "Cannot find device");
        let text = err.to_string();
        assert!(text.contains("ip link set eth9 up"));
        assert!(text.contains("Cannot find device"));
    }

    #[test]
    fn validation_classification() {
        assert!(Error::not_found("/port/lan1").is_validation());
        assert!(Error::already_exists("/port/lan1").is_validation());
        assert!(!Error::command("x", "y").is_validation());
        assert!(!Error::controller("timeout").is_validation());
    }
}
