//! Pushes liveness transitions to the controller
//!
//! The `changed` flag on each entry is the retry queue: it is cleared only
//! after a successful push, so a failed push is simply retried next tick.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::state::{LiveStatus, LivenessTable, Tracked};
use crate::Result;
use crate::traits::ControllerClient;

/// Body of a status push
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusPush {
    /// `UP` or `DOWN`
    pub status: &'static str,
    /// Transition time in nanoseconds
    pub ts: i64,
}

impl StatusPush {
    pub fn for_entry(entry: &Tracked) -> Self {
        Self {
            status: if entry.status == LiveStatus::Normal { "UP" } else { "DOWN" },
            ts: entry.changed_at.timestamp_nanos_opt().unwrap_or_default(),
        }
    }
}

/// What one reporting pass did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReportSummary {
    /// Entries that were due
    pub due: usize,
    /// Pushes the controller accepted
    pub pushed: usize,
    /// Pushes that failed and stay queued
    pub failed: usize,
}

pub struct Reporter {
    client: Arc<dyn ControllerClient>,
    sn: String,
}

impl Reporter {
    pub fn new(client: Arc<dyn ControllerClient>, sn: impl Into<String>) -> Self {
        Self {
            client,
            sn: sn.into(),
        }
    }

    pub fn port_status_path(&self, id: &str) -> String {
        format!("/api/cpeConfig/cpes/{}/logicPorts/{}/status", self.sn, id)
    }

    /// Push every due entry
    ///
    /// Ports go to the controller. Tunnels have no status endpoint, so their
    /// flag is cleared without a push.
    pub async fn report(&self, table: &mut LivenessTable) -> Result<ReportSummary> {
        let mut summary = ReportSummary::default();
        for entry in table.due_mut() {
            summary.due += 1;
            entry.hold_count = 0;

            if !entry.is_port() {
                debug!(id = %entry.id, "tunnel status kept local");
                entry.changed = false;
                continue;
            }

            let body = serde_json::to_value(StatusPush::for_entry(entry))?;
            match self.client.put(&self.port_status_path(&entry.id), &body).await {
                Ok(_) => {
                    info!(id = %entry.id, status = ?entry.status, "port status reported");
                    entry.changed = false;
                    summary.pushed += 1;
                }
                Err(e) => {
                    warn!(id = %entry.id, error = %e, "port status push failed, will retry");
                    summary.failed += 1;
                }
            }
        }
        if summary.due > 0 {
            table.end_smooth();
        }
        Ok(summary)
    }
}
