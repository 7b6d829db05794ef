//! Periodic heartbeat
//!
//! Each beat carries the agent version, its health status and the locally
//! applied config version. The controller answers with the version it holds,
//! which the config poller compares against.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::cpe_path;
use crate::config::AgentConfig;
use crate::health::{AgentHealth, HealthStatus};
use crate::traits::ControllerClient;
use crate::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRequest {
    pub version: String,
    pub status: HealthStatus,
    pub config_version: i64,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct HeartbeatReply {
    config_version: i64,
}

pub struct Heartbeat {
    client: Arc<dyn ControllerClient>,
    health: Arc<AgentHealth>,
    path: String,
    version: String,
    interval: Duration,
}

impl Heartbeat {
    pub fn new(config: &AgentConfig, client: Arc<dyn ControllerClient>, health: Arc<AgentHealth>) -> Self {
        Self {
            client,
            health,
            path: cpe_path(&config.identity.sn, "heartbeat"),
            version: config.uplink.agent_version.clone(),
            interval: Duration::from_secs(config.uplink.heartbeat_interval_secs.max(1)),
        }
    }

    /// First contact at startup, reporting version 0
    ///
    /// A rejection here means the controller does not know this serial.
    pub async fn announce(&self) -> Result<()> {
        let request = HeartbeatRequest {
            version: self.version.clone(),
            status: HealthStatus::Normal,
            config_version: 0,
        };
        self.client
            .put(&self.path, &serde_json::to_value(&request)?)
            .await
            .map_err(|e| Error::controller(format!("controller refused first heartbeat: {}", e)))?;
        info!(path = %self.path, "registered with controller");
        Ok(())
    }

    /// Send one heartbeat and record the controller's config version
    pub async fn beat(&self) -> Result<i64> {
        let request = HeartbeatRequest {
            version: self.version.clone(),
            status: self.health.status(),
            config_version: self.health.config_version(),
        };
        let data = self
            .client
            .put(&self.path, &serde_json::to_value(&request)?)
            .await?;
        let reply: HeartbeatReply = serde_json::from_value(data).unwrap_or_default();
        self.health.set_controller_version(reply.config_version);
        debug!(
            local = request.config_version,
            controller = reply.config_version,
            status = ?request.status,
            "heartbeat"
        );
        Ok(reply.config_version)
    }

    /// Beat until shutdown; a failed beat is logged and retried next tick
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.beat().await {
                        warn!(error = %e, "heartbeat failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("heartbeat stopping");
                    return Ok(());
                }
            }
        }
    }
}
