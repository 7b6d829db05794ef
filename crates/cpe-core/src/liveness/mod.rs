//! Liveness sampler
//!
//! Every tick the sampler:
//! 1. Snapshots ports and tracked tunnels from the config store
//! 2. Merges the snapshot into its table, aging out vanished entries
//! 3. Probes every entry concurrently and waits for all results
//! 4. Folds the results through the debounce state machine
//! 5. Updates the status files and the root status file
//! 6. Pushes due transitions upstream
//! 7. Checkpoints the table to the store when something changed
//!
//! Ticks are strictly sequential. The table is owned by the sampler and
//! never shared.

pub mod probe;
pub mod reporter;
pub mod spec;
pub mod state;
pub mod status_files;

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, SamplerConfig};
use crate::error::Result;
use crate::model::STATUS_KEY;
use crate::traits::{CommandExecutor, ConfigRenderer, ConfigStore, ControllerClient};

pub use probe::ProbeResult;
pub use reporter::{ReportSummary, Reporter};
pub use spec::{CheckSpec, CheckType, ObjectKind, Observed, PingType};
pub use state::{CheckpointEntry, LiveStatus, LivenessTable, Tracked};
pub use status_files::StatusFiles;

/// What one tick did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub probed: usize,
    pub transitioned: Vec<String>,
    pub aged: Vec<String>,
    pub report: ReportSummary,
    pub checkpointed: bool,
}

pub struct LivenessSampler {
    store: Arc<dyn ConfigStore>,
    exec: Arc<dyn CommandExecutor>,
    files: StatusFiles,
    reporter: Reporter,
    table: LivenessTable,
    config: SamplerConfig,
}

impl LivenessSampler {
    pub fn new(
        config: &AgentConfig,
        store: Arc<dyn ConfigStore>,
        exec: Arc<dyn CommandExecutor>,
        files: Arc<dyn ConfigRenderer>,
        client: Arc<dyn ControllerClient>,
    ) -> Self {
        let sampler = config.sampler.clone();
        Self {
            store,
            exec,
            files: StatusFiles::new(files, &config.paths),
            reporter: Reporter::new(client, config.identity.sn.clone()),
            table: LivenessTable::new(sampler.down_threshold, sampler.hold_threshold),
            config: sampler,
        }
    }

    pub fn table(&self) -> &LivenessTable {
        &self.table
    }

    /// Seed the table from the last checkpoint, if any
    pub async fn restore(&mut self) -> Result<usize> {
        let Some(raw) = self.store.get(STATUS_KEY).await? else {
            return Ok(0);
        };
        let entries: Vec<CheckpointEntry> = serde_json::from_str(&raw)?;
        let restored = entries.len();
        self.table.restore(entries);
        info!(restored, "liveness checkpoint restored");
        Ok(restored)
    }

    /// Run one sampling tick
    pub async fn tick(&mut self) -> Result<TickSummary> {
        let snapshot = spec::snapshot(self.store.as_ref()).await?;
        let aged_entries = self.table.merge(&snapshot);
        for entry in &aged_entries {
            self.files.write_status(&entry.id, false).await;
        }

        let observed: Vec<Observed> = snapshot.into_values().collect();
        let probed = observed.len();
        let results =
            probe::probe_all(Arc::clone(&self.exec), observed, self.config.probe_timeout()).await;

        let transitioned = self.table.apply(&results);
        for result in &results {
            if let Some(entry) = self.table.get(&result.id) {
                self.files
                    .write_status(&entry.id, entry.status == LiveStatus::Normal)
                    .await;
            }
        }
        for id in &transitioned {
            self.files.mark_changed(id).await;
        }
        self.files.write_root(self.table.root_normal()).await;

        let report = self.reporter.report(&mut self.table).await?;

        let aged: Vec<String> = aged_entries.into_iter().map(|e| e.id).collect();
        let checkpointed = !aged.is_empty() || report.due > 0;
        if checkpointed {
            self.checkpoint().await?;
        }

        Ok(TickSummary {
            probed,
            transitioned,
            aged,
            report,
            checkpointed,
        })
    }

    async fn checkpoint(&self) -> Result<()> {
        let raw = serde_json::to_string(&self.table.checkpoint())?;
        self.store.set(STATUS_KEY, &raw).await?;
        debug!(entries = self.table.len(), "liveness checkpoint written");
        Ok(())
    }

    /// Tick until shutdown is signalled
    ///
    /// A tick error ends the loop with that error so the supervisor can
    /// restart it with fresh state.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.files.ensure_dir().await;
        if let Err(e) = self.restore().await {
            warn!(error = %e, "liveness checkpoint unreadable, starting empty");
        }

        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let summary = self.tick().await?;
                    debug!(
                        probed = summary.probed,
                        transitions = summary.transitioned.len(),
                        aged = summary.aged.len(),
                        "liveness tick"
                    );
                }
                _ = shutdown.changed() => {
                    info!("liveness sampler stopping");
                    return Ok(());
                }
            }
        }
    }
}
