//! Process-wide health and version state
//!
//! Shared between the heartbeat (which reports it), the supervisor (which
//! degrades it when a loop restarts) and the Site object (which records the
//! applied configuration version).

use serde::{Deserialize, Serialize};
use std::sync::RwLock;

/// Agent status as reported in the heartbeat
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HealthStatus {
    #[default]
    Normal,
    Warning,
}

/// Version value before anything has been applied or heard from the controller
pub const VERSION_UNSET: i64 = -1;

#[derive(Debug)]
struct HealthInner {
    status: HealthStatus,
    /// Version of the configuration document last applied locally
    config_version: i64,
    /// Version the controller says is current
    controller_version: i64,
}

/// Shared health record
#[derive(Debug)]
pub struct AgentHealth {
    inner: RwLock<HealthInner>,
}

impl Default for AgentHealth {
    fn default() -> Self {
        Self {
            inner: RwLock::new(HealthInner {
                status: HealthStatus::Normal,
                config_version: VERSION_UNSET,
                controller_version: VERSION_UNSET,
            }),
        }
    }
}

impl AgentHealth {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> HealthStatus {
        self.inner.read().map(|g| g.status).unwrap_or(HealthStatus::Warning)
    }

    pub fn set_status(&self, status: HealthStatus) {
        if let Ok(mut g) = self.inner.write() {
            g.status = status;
        }
    }

    /// Mark the agent degraded
    pub fn degrade(&self) {
        self.set_status(HealthStatus::Warning);
    }

    pub fn config_version(&self) -> i64 {
        self.inner
            .read()
            .map(|g| g.config_version)
            .unwrap_or(VERSION_UNSET)
    }

    pub fn set_config_version(&self, version: i64) {
        if let Ok(mut g) = self.inner.write() {
            g.config_version = version;
        }
    }

    pub fn controller_version(&self) -> i64 {
        self.inner
            .read()
            .map(|g| g.controller_version)
            .unwrap_or(VERSION_UNSET)
    }

    pub fn set_controller_version(&self, version: i64) {
        if let Ok(mut g) = self.inner.write() {
            g.controller_version = version;
        }
    }

    /// Whether the controller holds a different configuration than we applied
    pub fn versions_differ(&self) -> bool {
        self.inner
            .read()
            .map(|g| g.config_version != g.controller_version)
            .unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degrade_and_versions() {
        let health = AgentHealth::new();
        assert_eq!(health.status(), HealthStatus::Normal);
        assert!(!health.versions_differ());

        health.set_controller_version(7);
        assert!(health.versions_differ());
        health.set_config_version(7);
        assert!(!health.versions_differ());

        health.degrade();
        assert_eq!(health.status(), HealthStatus::Warning);
        assert_eq!(serde_json::to_string(&health.status()).unwrap(), "\"WARNING\"");
    }
}
