//! Configuration pull
//!
//! Polls on a short interval but only fetches when the controller's version
//! (learned by the heartbeat) differs from the applied one, or when the
//! forced-refresh counter wraps. Each poll also checks `frr.conf` for
//! duplicated policy default routes and degrades health if it finds them.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::cpe_path;
use crate::config::AgentConfig;
use crate::model::AllConf;
use crate::reconcile::Reconciler;
use crate::traits::ControllerClient;
use crate::Result;

/// Marker of a policy-table default route in `frr.conf`
const POLICY_TABLE_MARKER: &str = "table 100";

/// What one poll did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// A document was fetched and applied
    pub fetched: bool,
    /// Objects that failed to apply
    pub failures: usize,
}

pub struct ConfigPoller {
    client: Arc<dyn ControllerClient>,
    reconciler: Arc<Reconciler>,
    path: String,
    frr_conf: PathBuf,
    interval: Duration,
    forced_every: u32,
    count: u32,
}

impl ConfigPoller {
    pub fn new(config: &AgentConfig, client: Arc<dyn ControllerClient>, reconciler: Arc<Reconciler>) -> Self {
        Self {
            client,
            reconciler,
            path: cpe_path(&config.identity.sn, "dpConfig"),
            frr_conf: config.paths.frr_conf.clone(),
            interval: Duration::from_secs(config.uplink.config_poll_interval_secs.max(1)),
            forced_every: config.uplink.forced_poll_every.max(1),
            count: 0,
        }
    }

    /// Whether this poll should fetch
    fn due(&mut self) -> bool {
        self.count += 1;
        let health = &self.reconciler.context().health;
        if self.count >= self.forced_every || health.versions_differ() {
            self.count = 0;
            return true;
        }
        false
    }

    /// Run one poll
    pub async fn poll(&mut self) -> Result<PollOutcome> {
        if !self.due() {
            return Ok(PollOutcome::default());
        }
        self.fetch().await
    }

    /// Fetch and apply the controller's document regardless of versions
    ///
    /// The daemon calls this once at startup.
    pub async fn fetch(&self) -> Result<PollOutcome> {
        let data = self.client.get(&self.path).await?;
        let doc: AllConf = serde_json::from_value(data)?;
        info!(ts = doc.ts, "configuration document fetched");
        let failures = self.reconciler.apply_all(&doc).await;

        self.check_frr().await;
        Ok(PollOutcome {
            fetched: true,
            failures,
        })
    }

    async fn check_frr(&self) {
        let files = self.reconciler.context().files();
        let Ok(Some(conf)) = files.read(&self.frr_conf).await else {
            return;
        };
        let defaults = conf
            .lines()
            .filter(|l| l.contains(POLICY_TABLE_MARKER))
            .count();
        if defaults >= 2 {
            warn!(defaults, "duplicate policy default routes in frr.conf");
            self.reconciler.context().health.degrade();
        }
    }

    /// Poll until shutdown; a failed fetch is logged and retried next poll
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.poll().await {
                        Ok(outcome) if outcome.fetched => {
                            debug!(failures = outcome.failures, "config poll applied");
                        }
                        Ok(_) => {}
                        Err(e) => warn!(error = %e, "config poll failed"),
                    }
                }
                _ = shutdown.changed() => {
                    info!("config poll stopping");
                    return Ok(());
                }
            }
        }
    }
}
