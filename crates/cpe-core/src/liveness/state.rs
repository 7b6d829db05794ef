//! Debounce and aging state for tracked objects
//!
//! ```text
//!            N consecutive misses
//!   Unknown ──────────────────────▶ Offline
//!      │                            ▲   │
//!      │ one reply                  │   │ one reply
//!      ▼                            │   ▼
//!   Normal ─────────────────────────┘ Normal
//!            N consecutive misses
//! ```
//!
//! Every probe bumps the hold counter; a transition resets it. Reaching the
//! hold threshold forces a re-report so a lost upstream event heals itself.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::probe::ProbeResult;
use super::spec::{CheckSpec, ObjectKind, Observed};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LiveStatus {
    #[default]
    Unknown,
    Normal,
    Offline,
}

/// Checkpoint record, one per tracked object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub namespace: String,
    pub id: String,
    /// Nanosecond timestamp of when tracking started, as a string
    pub tsms: String,
    pub status: LiveStatus,
}

/// One tracked object
#[derive(Debug, Clone, PartialEq)]
pub struct Tracked {
    pub id: String,
    pub namespace: String,
    pub tsms: String,
    pub status: LiveStatus,
    /// `None` for entries restored from a checkpoint and not yet refreshed
    pub spec: Option<CheckSpec>,
    pub down_count: u32,
    pub hold_count: u32,
    pub aging: bool,
    /// Transition not yet pushed upstream
    pub changed: bool,
    pub changed_at: DateTime<Utc>,
}

impl Tracked {
    fn new(obs: &Observed, now: DateTime<Utc>) -> Self {
        Self {
            id: obs.id.clone(),
            namespace: obs.namespace.clone(),
            tsms: now.timestamp_nanos_opt().unwrap_or_default().to_string(),
            status: LiveStatus::Unknown,
            spec: Some(obs.spec.clone()),
            down_count: 0,
            hold_count: 0,
            aging: false,
            changed: false,
            changed_at: now,
        }
    }

    fn restored(entry: CheckpointEntry, now: DateTime<Utc>) -> Self {
        Self {
            id: entry.id,
            namespace: entry.namespace,
            tsms: entry.tsms,
            status: entry.status,
            spec: None,
            down_count: 0,
            hold_count: 0,
            aging: false,
            changed: false,
            changed_at: now,
        }
    }

    pub fn is_port(&self) -> bool {
        self.spec.as_ref().is_some_and(|s| s.object == ObjectKind::Port)
    }

    /// Fold one probe in; returns true on a status transition
    pub fn apply(&mut self, probe: &ProbeResult, down_threshold: u32) -> bool {
        self.hold_count = self.hold_count.saturating_add(1);
        let next = if probe.reachable() {
            self.down_count = 0;
            (self.status != LiveStatus::Normal).then_some(LiveStatus::Normal)
        } else {
            self.down_count = self.down_count.saturating_add(1);
            (self.status != LiveStatus::Offline && self.down_count >= down_threshold)
                .then_some(LiveStatus::Offline)
        };
        let Some(status) = next else {
            return false;
        };
        info!(id = %self.id, from = ?self.status, to = ?status, "liveness transition");
        self.status = status;
        self.changed = true;
        self.changed_at = probe.started;
        self.hold_count = 0;
        true
    }

    pub fn checkpoint(&self) -> CheckpointEntry {
        CheckpointEntry {
            namespace: self.namespace.clone(),
            id: self.id.clone(),
            tsms: self.tsms.clone(),
            status: self.status,
        }
    }
}

/// All tracked objects, owned by one sampler
#[derive(Debug)]
pub struct LivenessTable {
    entries: BTreeMap<String, Tracked>,
    down_threshold: u32,
    hold_threshold: u32,
    /// Set until the first reporting pass after start
    smooth: bool,
}

impl LivenessTable {
    pub fn new(down_threshold: u32, hold_threshold: u32) -> Self {
        Self {
            entries: BTreeMap::new(),
            down_threshold,
            hold_threshold,
            smooth: true,
        }
    }

    /// Seed from a checkpoint written by a previous process
    pub fn restore(&mut self, entries: Vec<CheckpointEntry>) {
        let now = Utc::now();
        for entry in entries {
            self.entries
                .insert(entry.id.clone(), Tracked::restored(entry, now));
        }
    }

    /// Merge a fresh snapshot, returning the entries that aged out
    ///
    /// Entries missing from the snapshot are removed. Known entries take the
    /// fresh check spec. While the smooth flag is set, known entries with a
    /// settled status are marked changed so a restart re-announces them.
    pub fn merge(&mut self, snapshot: &BTreeMap<String, Observed>) -> Vec<Tracked> {
        let now = Utc::now();
        for entry in self.entries.values_mut() {
            entry.aging = true;
        }

        for (id, obs) in snapshot {
            match self.entries.get_mut(id) {
                Some(entry) => {
                    entry.spec = Some(obs.spec.clone());
                    entry.namespace = obs.namespace.clone();
                    entry.aging = false;
                    if self.smooth && entry.status != LiveStatus::Unknown {
                        entry.changed = true;
                    }
                }
                None => {
                    self.entries.insert(id.clone(), Tracked::new(obs, now));
                }
            }
        }

        let aged: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.aging)
            .map(|(id, _)| id.clone())
            .collect();
        aged.iter()
            .filter_map(|id| self.entries.remove(id))
            .inspect(|e| info!(id = %e.id, "liveness entry aged out"))
            .collect()
    }

    /// Fold a whole tick of probes in; returns ids that transitioned
    pub fn apply(&mut self, results: &[ProbeResult]) -> Vec<String> {
        let mut transitioned = Vec::new();
        for result in results {
            if let Some(entry) = self.entries.get_mut(&result.id) {
                if entry.apply(result, self.down_threshold) {
                    transitioned.push(result.id.clone());
                }
            }
        }
        transitioned
    }

    /// Normal iff every tracked port is Normal
    pub fn root_normal(&self) -> bool {
        self.entries
            .values()
            .filter(|e| e.is_port())
            .all(|e| e.status == LiveStatus::Normal)
    }

    /// Entries the reporter must push this tick
    pub fn due_mut(&mut self) -> impl Iterator<Item = &mut Tracked> {
        let hold = self.hold_threshold;
        self.entries
            .values_mut()
            .filter(move |e| e.changed || e.hold_count >= hold)
    }

    /// Drop the smooth-restart flag after the first reporting pass
    pub fn end_smooth(&mut self) {
        self.smooth = false;
    }

    pub fn checkpoint(&self) -> Vec<CheckpointEntry> {
        self.entries.values().map(Tracked::checkpoint).collect()
    }

    pub fn get(&self, id: &str) -> Option<&Tracked> {
        self.entries.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Tracked> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::liveness::spec::{CheckType, PingType};

    fn obs(id: &str) -> Observed {
        Observed {
            id: id.into(),
            namespace: "eth0".into(),
            spec: CheckSpec {
                check: CheckType::Port,
                ping: PingType::OutOfNamespace,
                object: ObjectKind::Port,
                target: "10.0.0.1".into(),
                source: "10.0.0.2".into(),
            },
        }
    }

    fn probe(id: &str, delay_ms: f64) -> ProbeResult {
        ProbeResult {
            id: id.into(),
            delay_ms,
            started: Utc::now(),
        }
    }

    fn snapshot(ids: &[&str]) -> BTreeMap<String, Observed> {
        ids.iter().map(|id| (id.to_string(), obs(id))).collect()
    }

    #[test]
    fn unknown_goes_normal_on_first_reply() {
        let mut table = LivenessTable::new(3, 3000);
        table.merge(&snapshot(&["wan1"]));
        assert_eq!(table.apply(&[probe("wan1", 4.0)]), vec!["wan1".to_string()]);
        let entry = table.get("wan1").unwrap();
        assert_eq!(entry.status, LiveStatus::Normal);
        assert!(entry.changed);
        assert_eq!(entry.hold_count, 0);
    }

    #[test]
    fn hold_count_grows_without_transitions() {
        let mut table = LivenessTable::new(3, 2);
        table.merge(&snapshot(&["wan1"]));
        table.apply(&[probe("wan1", 4.0)]);
        for e in table.due_mut() {
            e.changed = false;
        }
        table.apply(&[probe("wan1", 4.0)]);
        assert_eq!(table.due_mut().count(), 0);
        table.apply(&[probe("wan1", 4.0)]);
        assert_eq!(table.due_mut().count(), 1, "hold threshold forces a re-report");
    }

    #[test]
    fn root_ignores_tunnels() {
        let mut table = LivenessTable::new(1, 3000);
        let mut snap = snapshot(&["wan1"]);
        let mut tunnel = obs("conn1");
        tunnel.spec.object = ObjectKind::Conn;
        snap.insert("conn1".into(), tunnel);
        table.merge(&snap);
        table.apply(&[probe("wan1", 2.0), probe("conn1", 0.0)]);
        assert_eq!(table.get("conn1").unwrap().status, LiveStatus::Offline);
        assert!(table.root_normal());
    }

    #[test]
    fn restored_entries_are_re_announced_once() {
        let mut table = LivenessTable::new(3, 3000);
        table.restore(vec![CheckpointEntry {
            namespace: "eth0".into(),
            id: "wan1".into(),
            tsms: "1".into(),
            status: LiveStatus::Normal,
        }]);
        table.merge(&snapshot(&["wan1"]));
        assert!(table.get("wan1").unwrap().changed);
        for e in table.due_mut() {
            e.changed = false;
        }
        table.end_smooth();
        table.merge(&snapshot(&["wan1"]));
        assert!(!table.get("wan1").unwrap().changed);
    }

    #[test]
    fn checkpoint_statuses_are_uppercase() {
        let entry = CheckpointEntry {
            namespace: String::new(),
            id: "conn1".into(),
            tsms: "0".into(),
            status: LiveStatus::Offline,
        };
        let raw = serde_json::to_string(&entry).unwrap();
        assert!(raw.contains(r#""status":"OFFLINE""#));
    }
}
