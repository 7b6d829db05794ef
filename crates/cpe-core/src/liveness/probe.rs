//! One liveness probe per tracked object
//!
//! A probe never fails: anything that prevents a verdict (command error,
//! timeout, no reply) reports a delay of zero, which the state machine
//! counts as a miss.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tracing::debug;

use super::spec::{CheckType, Observed, PingType};
use crate::net::cidr::strip_prefix;
use crate::net::link;
use crate::traits::CommandExecutor;

/// Delay reported by flag and SA checks when the object is up
pub const SENTINEL_DELAY_MS: f64 = 65535.0;

#[derive(Debug, Clone, PartialEq)]
pub struct ProbeResult {
    pub id: String,
    /// Round trip in ms; zero means unreachable or undetermined
    pub delay_ms: f64,
    pub started: DateTime<Utc>,
}

impl ProbeResult {
    pub fn reachable(&self) -> bool {
        self.delay_ms != 0.0
    }
}

/// Build the ping command for a target, optionally inside a namespace
pub fn ping_command(obs: &Observed) -> String {
    let target = strip_prefix(&obs.spec.target);
    let source = strip_prefix(&obs.spec.source);
    let cmd = if source.is_empty() {
        format!("ping -c 1 -W 1 {}", target)
    } else {
        format!("ping -c 1 -W 1 -I {} {}", source, target)
    };
    match obs.spec.ping {
        PingType::InNamespace if !obs.namespace.is_empty() => link::in_netns(&obs.namespace, &cmd),
        _ => cmd,
    }
}

/// Round trip of the first `time=` field in ping output, at least 1 ms
pub fn parse_rtt(output: &str) -> Option<f64> {
    let start = output.find("time=")? + "time=".len();
    let value: String = output[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    value.parse::<f64>().ok().map(|ms| ms.max(1.0))
}

fn flags_up(output: &str, device: &str) -> bool {
    output.contains(device) && output.contains("RUNNING") && output.contains("UP")
}

fn sa_up(output: &str, name: &str) -> bool {
    output.contains(name) && output.contains("ESTABLISHED") && output.contains("INSTALLED")
}

async fn ping(exec: &dyn CommandExecutor, obs: &Observed) -> f64 {
    if obs.spec.target.is_empty() {
        return 0.0;
    }
    match exec.run(&ping_command(obs)).await {
        Ok(out) => parse_rtt(&out).unwrap_or(0.0),
        Err(e) => {
            debug!(id = %obs.id, error = %e, "ping failed");
            0.0
        }
    }
}

async fn live_state(exec: &dyn CommandExecutor, obs: &Observed) -> f64 {
    let up = match obs.spec.check {
        CheckType::Port => link::ifconfig_flags(exec, "", &obs.namespace)
            .await
            .is_ok_and(|out| flags_up(&out, &obs.namespace)),
        CheckType::Gre => link::ifconfig_flags(exec, &obs.namespace, &obs.id)
            .await
            .is_ok_and(|out| flags_up(&out, &obs.id)),
        CheckType::Ipsec => exec
            .run(&format!("swanctl --list-sa --ike {} --noblock", obs.id))
            .await
            .is_ok_and(|out| sa_up(&out, &obs.id)),
    };
    if up { SENTINEL_DELAY_MS } else { 0.0 }
}

/// Probe one object, bounded by `timeout`
pub async fn probe(exec: &dyn CommandExecutor, obs: &Observed, timeout: Duration) -> ProbeResult {
    let started = Utc::now();
    let check = async {
        if obs.spec.ping == PingType::NoPing {
            live_state(exec, obs).await
        } else {
            ping(exec, obs).await
        }
    };
    let delay_ms = match tokio::time::timeout(timeout, check).await {
        Ok(delay) => delay,
        Err(_) => {
            debug!(id = %obs.id, "probe timed out");
            0.0
        }
    };
    ProbeResult {
        id: obs.id.clone(),
        delay_ms,
        started,
    }
}

/// Probe every object concurrently and wait for all of them
pub async fn probe_all(
    exec: Arc<dyn CommandExecutor>,
    observed: Vec<Observed>,
    timeout: Duration,
) -> Vec<ProbeResult> {
    let mut set = JoinSet::new();
    for obs in observed {
        let exec = Arc::clone(&exec);
        set.spawn(async move { probe(exec.as_ref(), &obs, timeout).await });
    }
    let mut results = Vec::with_capacity(set.len());
    while let Some(joined) = set.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => debug!(error = %e, "probe task aborted"),
        }
    }
    results
}
