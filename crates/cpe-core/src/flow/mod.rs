//! Flow sampler
//!
//! Once a minute, aligned to the wall clock, measures every port and tunnel
//! (status, loss, latency, traffic rates) and appends InfluxDB line protocol
//! records under the vnet log directory for the local collector to ship.

pub mod measure;

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::config::{AgentConfig, HostPaths};
use crate::error::Result;
use crate::model::{ConnConf, ConnType, HaConf, HaRole, Kind, PortConf, SiteConf};
use crate::net::cidr::strip_prefix;
use crate::traits::{CommandExecutor, ConfigRenderer, ConfigStore};
use measure::{Counters, LOSS_NOT_MEASURED, parse_ping_summary, rate_bps};

/// Rate reported for the first sample of an id
pub const UNKNOWN_RATE: f64 = -200.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowKind {
    Port,
    Connection,
}

impl FlowKind {
    fn tag(self) -> &'static str {
        match self {
            Self::Port => "port",
            Self::Connection => "connection",
        }
    }
}

/// What to measure for one object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowTarget {
    pub id: String,
    pub kind: FlowKind,
    /// Interface whose counters are read
    pub device: String,
    /// Health target; empty means not measured
    pub ping_target: String,
}

/// One measurement
#[derive(Debug, Clone, PartialEq)]
pub struct FlowSample {
    pub id: String,
    pub kind: FlowKind,
    pub up: bool,
    pub changed: bool,
    pub latency: f64,
    pub loss: f64,
    pub counters: Counters,
}

/// Per-id state carried between passes
#[derive(Debug, Clone, PartialEq)]
pub struct FlowEntry {
    pub sample: FlowSample,
    pub rx_rate: f64,
    pub tx_rate: f64,
}

/// Line protocol for one pass, split by destination file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FlowLines {
    pub rate: String,
    pub status: String,
    pub latency: String,
    pub loss: String,
}

fn port_target(port: &PortConf) -> FlowTarget {
    FlowTarget {
        id: port.id.clone(),
        kind: FlowKind::Port,
        device: port.phyif_name.clone(),
        ping_target: port.nexthop.clone(),
    }
}

fn conn_target(conn: &ConnConf) -> FlowTarget {
    let ping_target = match conn.kind() {
        Ok(ConnType::Ipsec) if conn.ipsec_info.health_check => conn.ipsec_info.remote_address.clone(),
        Ok(ConnType::Ssl) if conn.ssl_info.health_check => conn.ssl_info.remote_address.clone(),
        _ => String::new(),
    };
    FlowTarget {
        id: conn.id.clone(),
        kind: FlowKind::Connection,
        device: conn.id.clone(),
        ping_target,
    }
}

/// Render one pass; `dev` is the `<site>-master|-slave` tag
pub fn render_lines(entries: &BTreeMap<String, FlowEntry>, dev: &str, ts_nanos: i64) -> FlowLines {
    let mut lines = FlowLines::default();
    for entry in entries.values() {
        let s = &entry.sample;
        let kind = s.kind.tag();
        let _ = writeln!(
            lines.rate,
            "rate,uid={},type={},dev={} rate_rx={:.2},rate_tx={:.2} {}",
            s.id, kind, dev, entry.rx_rate, entry.tx_rate, ts_nanos
        );
        let _ = writeln!(
            lines.status,
            "status,uid={},type={},dev={} status={},changed={} {}",
            s.id, kind, dev, s.up as u8, s.changed as u8, ts_nanos
        );
        if s.loss != LOSS_NOT_MEASURED {
            let _ = writeln!(
                lines.latency,
                "latency,uid={},type={},dev={} latency={:.2} {}",
                s.id, kind, dev, s.latency, ts_nanos
            );
            let _ = writeln!(
                lines.loss,
                "loss,uid={},type={},dev={} loss={:.0} {}",
                s.id, kind, dev, s.loss, ts_nanos
            );
        }
    }
    lines
}

/// Start of the minute containing `now`
pub fn minute_floor(now: DateTime<Utc>) -> DateTime<Utc> {
    now.duration_trunc(TimeDelta::minutes(1)).unwrap_or(now)
}

pub struct FlowSampler {
    store: Arc<dyn ConfigStore>,
    exec: Arc<dyn CommandExecutor>,
    files: Arc<dyn ConfigRenderer>,
    paths: HostPaths,
    interval: Duration,
    entries: BTreeMap<String, FlowEntry>,
}

impl FlowSampler {
    pub fn new(
        config: &AgentConfig,
        store: Arc<dyn ConfigStore>,
        exec: Arc<dyn CommandExecutor>,
        files: Arc<dyn ConfigRenderer>,
    ) -> Self {
        Self {
            store,
            exec,
            files,
            paths: config.paths.clone(),
            interval: Duration::from_secs(config.flow.interval_secs.max(1)),
            entries: BTreeMap::new(),
        }
    }

    pub fn entries(&self) -> &BTreeMap<String, FlowEntry> {
        &self.entries
    }

    async fn targets(&self) -> Result<Vec<FlowTarget>> {
        let port_prefix = Kind::Port.prefix();
        let conn_prefix = Kind::Conn.prefix();
        let raw = self
            .store
            .get_all_by_prefix(&[port_prefix.as_str(), conn_prefix.as_str()])
            .await?;
        let mut targets = Vec::with_capacity(raw.len());
        for (key, value) in raw {
            let target = if key.starts_with(&port_prefix) {
                serde_json::from_str::<PortConf>(&value).map(|p| port_target(&p))
            } else {
                serde_json::from_str::<ConnConf>(&value).map(|c| conn_target(&c))
            };
            match target {
                Ok(t) => targets.push(t),
                Err(e) => warn!(key = %key, error = %e, "record skipped by flow sampler"),
            }
        }
        Ok(targets)
    }

    /// `<site>-slave` on an HA backup, `<site>-master` otherwise; empty without a site
    async fn site_role(&self) -> Result<String> {
        let site = match self.store.get(&Kind::Site.key("")).await? {
            Some(raw) => serde_json::from_str::<SiteConf>(&raw)?,
            None => return Ok(String::new()),
        };
        if site.id.is_empty() {
            return Ok(String::new());
        }
        let backup = match self.store.get(&Kind::Ha.key("")).await? {
            Some(raw) => serde_json::from_str::<HaConf>(&raw)
                .map(|ha| ha.enable && ha.role == HaRole::Backup)
                .unwrap_or(false),
            None => false,
        };
        Ok(format!("{}-{}", site.id, if backup { "slave" } else { "master" }))
    }

    /// Run one pass stamped with `now`
    pub async fn sample(&mut self, now: DateTime<Utc>) -> Result<FlowLines> {
        let targets = self.targets().await?;

        let mut set = JoinSet::new();
        for target in targets {
            let exec = Arc::clone(&self.exec);
            let files = Arc::clone(&self.files);
            let monitor_dir = self.paths.monitor_dir.clone();
            set.spawn(async move {
                measure_one(exec.as_ref(), files.as_ref(), &monitor_dir, &target).await
            });
        }
        let mut samples = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(sample) => samples.push(sample),
                Err(e) => warn!(error = %e, "flow measurement task aborted"),
            }
        }

        self.fold(samples);

        let role = self.site_role().await?;
        let lines = if role.is_empty() {
            FlowLines::default()
        } else {
            render_lines(
                &self.entries,
                &role,
                minute_floor(now).timestamp_nanos_opt().unwrap_or_default(),
            )
        };
        self.write_lines(&lines).await;
        self.clear_changed_markers().await;
        Ok(lines)
    }

    /// Merge samples into the carried state; ids not sampled age out
    pub fn fold(&mut self, samples: Vec<FlowSample>) {
        let secs = self.interval.as_secs();
        let mut next = BTreeMap::new();
        for sample in samples {
            let (rx_rate, tx_rate) = match self.entries.get(&sample.id) {
                Some(prev) => (
                    rate_bps(prev.sample.counters.rx_bytes, sample.counters.rx_bytes, secs),
                    rate_bps(prev.sample.counters.tx_bytes, sample.counters.tx_bytes, secs),
                ),
                None => (UNKNOWN_RATE, UNKNOWN_RATE),
            };
            next.insert(
                sample.id.clone(),
                FlowEntry {
                    sample,
                    rx_rate,
                    tx_rate,
                },
            );
        }
        for gone in self.entries.keys().filter(|id| !next.contains_key(*id)) {
            debug!(id = %gone, "flow entry aged out");
        }
        self.entries = next;
    }

    async fn write_lines(&self, lines: &FlowLines) {
        let dir = &self.paths.vnet_log_dir;
        for (file, body) in [
            ("rate.log", &lines.rate),
            ("status.log", &lines.status),
            ("latency.log", &lines.latency),
            ("loss.log", &lines.loss),
        ] {
            if body.is_empty() {
                continue;
            }
            if let Err(e) = self.files.append(&dir.join(file), body).await {
                warn!(file, error = %e, "flow log append failed");
            }
        }
    }

    async fn clear_changed_markers(&self) {
        let dir = &self.paths.monitor_dir;
        let names = match self.files.list_dir(dir).await {
            Ok(names) => names,
            Err(e) => {
                debug!(error = %e, "monitor directory unreadable");
                return;
            }
        };
        for name in names.iter().filter(|n| n.ends_with(".changed")) {
            if let Err(e) = self.files.remove(&dir.join(name)).await {
                warn!(file = %name, error = %e, "changed marker not removed");
            }
        }
    }

    /// Sample on every minute boundary until shutdown
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        if let Err(e) = self.files.create_dir(&self.paths.vnet_log_dir).await {
            warn!(error = %e, "vnet log directory not created");
        }

        let now = Utc::now();
        let next_minute = minute_floor(now) + TimeDelta::minutes(1);
        let wait = (next_minute - now).to_std().unwrap_or_default();
        let start = tokio::time::Instant::now() + wait;
        let mut ticker = tokio::time::interval_at(start, self.interval);
        info!(first_in_ms = wait.as_millis() as u64, "flow sampler started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let lines = self.sample(Utc::now()).await?;
                    debug!(bytes = lines.status.len(), "flow pass written");
                }
                _ = shutdown.changed() => {
                    info!("flow sampler stopping");
                    return Ok(());
                }
            }
        }
    }
}

async fn measure_one(
    exec: &dyn CommandExecutor,
    files: &dyn ConfigRenderer,
    monitor_dir: &std::path::Path,
    target: &FlowTarget,
) -> FlowSample {
    let up = files.exists(&monitor_dir.join(&target.id)).await;
    let changed = files
        .exists(&monitor_dir.join(format!("{}.changed", target.id)))
        .await;

    let (latency, loss) = if target.ping_target.is_empty() {
        (0.0, LOSS_NOT_MEASURED)
    } else {
        let cmd = format!("ping -i 0.1 -c 10 {} -W 2", strip_prefix(&target.ping_target));
        // ping exits non-zero on loss but still prints a usable summary
        let out = match exec.run(&cmd).await {
            Ok(out) => out,
            Err(crate::Error::Command { stderr, .. }) => stderr,
            Err(e) => {
                debug!(id = %target.id, error = %e, "flow ping failed");
                String::new()
            }
        };
        parse_ping_summary(&out).unwrap_or((0.0, 100.0))
    };

    let counters = match exec
        .run(&format!(
            "ifconfig {} | grep \"packets\" | awk '{{print $3 \" \" $5}}'",
            target.device
        ))
        .await
    {
        Ok(out) => Counters::parse(&out),
        Err(e) => {
            debug!(id = %target.id, error = %e, "interface counters unavailable");
            Counters::default()
        }
    };

    FlowSample {
        id: target.id.clone(),
        kind: target.kind,
        up,
        changed,
        latency,
        loss,
        counters,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample(id: &str, rx: u64, loss: f64) -> FlowSample {
        FlowSample {
            id: id.into(),
            kind: FlowKind::Port,
            up: true,
            changed: false,
            latency: 1.5,
            loss,
            counters: Counters {
                rx_bytes: rx,
                ..Default::default()
            },
        }
    }

    #[test]
    fn first_sample_has_unknown_rate() {
        let mut entries = BTreeMap::new();
        let prev = FlowEntry {
            sample: sample("wan1", 0, 0.0),
            rx_rate: UNKNOWN_RATE,
            tx_rate: UNKNOWN_RATE,
        };
        entries.insert("wan1".to_string(), prev);
        let lines = render_lines(&entries, "site1-master", 60_000_000_000);
        assert_eq!(
            lines.rate,
            "rate,uid=wan1,type=port,dev=site1-master rate_rx=-200.00,rate_tx=-200.00 60000000000\n"
        );
        assert!(lines.loss.contains("loss=0 "));
    }

    #[test]
    fn unmeasured_loss_skips_latency_lines() {
        let mut entries = BTreeMap::new();
        entries.insert(
            "lan1".to_string(),
            FlowEntry {
                sample: sample("lan1", 0, LOSS_NOT_MEASURED),
                rx_rate: 0.0,
                tx_rate: 0.0,
            },
        );
        let lines = render_lines(&entries, "s-master", 0);
        assert!(lines.latency.is_empty());
        assert!(lines.loss.is_empty());
        assert!(lines.status.contains("status=1,changed=0"));
    }

    #[test]
    fn minute_floor_drops_seconds() {
        let t = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 42).unwrap();
        assert_eq!(minute_floor(t), Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap());
    }
}
