//! Architectural Contract Test: Liveness Sampling
//!
//! This test verifies that the sampler debounces failures, recovers
//! instantly, ages out removed objects and retries failed reports.
//!
//! Constraints verified:
//! - An object goes OFFLINE only after N consecutive missed probes
//! - A single reply brings an OFFLINE object back to NORMAL
//! - Status and root files track the debounced state
//! - An object removed from the store is dropped and its status file removed
//! - A failed status push stays queued and is retried on the next tick
//! - The table is checkpointed to the store when something was reported

mod common;

use common::Harness;
use cpe_core::LivenessSampler;
use cpe_core::liveness::{CheckpointEntry, LiveStatus};
use cpe_core::model::PortConf;
use cpe_core::traits::{ConfigStore, ControllerClient};
use std::sync::Arc;

const PING: &str = "ping -c 1 -W 1 -I 203.0.113.10 203.0.113.1";
const REPLY: &str = "64 bytes from 203.0.113.1: icmp_seq=1 ttl=64 time=2.31 ms\n";

async fn with_wan1(h: &Harness) {
    let wan1 = PortConf {
        id: "wan1".into(),
        ip_addr: "203.0.113.10/24".into(),
        nexthop: "203.0.113.1".into(),
        phyif_name: "eth0".into(),
        ..Default::default()
    };
    h.store
        .set("/port/wan1", &serde_json::to_string(&wan1).unwrap())
        .await
        .unwrap();
}

fn sampler(h: &Harness) -> LivenessSampler {
    let mut config = h.config.clone();
    config.sampler.down_threshold = 3;
    LivenessSampler::new(
        &config,
        h.store.clone(),
        h.exec.clone(),
        h.files.clone(),
        h.controller.clone() as Arc<dyn ControllerClient>,
    )
}

fn pushed_statuses(h: &Harness) -> Vec<String> {
    h.controller
        .puts_to("/logicPorts/wan1/status")
        .iter()
        .map(|body| body["status"].as_str().unwrap_or_default().to_string())
        .collect()
}

#[tokio::test]
async fn test_offline_requires_consecutive_misses() {
    let h = Harness::new();
    with_wan1(&h).await;
    let mut sampler = sampler(&h);

    h.exec.respond(PING, REPLY);
    let tick = sampler.tick().await.unwrap();
    assert_eq!(tick.transitioned, vec!["wan1".to_string()]);
    assert_eq!(sampler.table().get("wan1").unwrap().status, LiveStatus::Normal);

    h.exec.fail(PING, "100% packet loss");
    for miss in 1..3 {
        let tick = sampler.tick().await.unwrap();
        assert!(tick.transitioned.is_empty(), "Expected no transition after {} misses", miss);
        assert_eq!(sampler.table().get("wan1").unwrap().status, LiveStatus::Normal);
    }

    let tick = sampler.tick().await.unwrap();
    assert_eq!(tick.transitioned, vec!["wan1".to_string()]);
    assert_eq!(sampler.table().get("wan1").unwrap().status, LiveStatus::Offline);

    let statuses = pushed_statuses(&h);
    assert_eq!(statuses, vec!["UP".to_string(), "DOWN".to_string()], "Expected one push per transition, got {:?}", statuses);

    let paths = &h.config.paths;
    assert!(!h.files.has(paths.monitor_dir.join("wan1")));
    assert!(h.files.has(paths.monitor_dir.join("wan1.changed")));
    assert!(!h.files.has(&paths.root_status));
}

#[tokio::test]
async fn test_single_reply_recovers() {
    let h = Harness::new();
    with_wan1(&h).await;
    let mut sampler = sampler(&h);

    h.exec.fail(PING, "unreachable");
    for _ in 0..3 {
        sampler.tick().await.unwrap();
    }
    assert_eq!(sampler.table().get("wan1").unwrap().status, LiveStatus::Offline);

    h.exec.respond(PING, REPLY);
    let tick = sampler.tick().await.unwrap();
    assert_eq!(tick.transitioned, vec!["wan1".to_string()]);
    assert_eq!(sampler.table().get("wan1").unwrap().status, LiveStatus::Normal);

    let paths = &h.config.paths;
    assert!(h.files.has(paths.monitor_dir.join("wan1")));
    assert!(h.files.has(&paths.root_status));
}

#[tokio::test]
async fn test_removed_object_ages_out() {
    let h = Harness::new();
    with_wan1(&h).await;
    let mut sampler = sampler(&h);

    h.exec.respond(PING, REPLY);
    sampler.tick().await.unwrap();
    assert!(h.files.has(h.config.paths.monitor_dir.join("wan1")));

    h.store.delete("/port/wan1").await.unwrap();
    let tick = sampler.tick().await.unwrap();

    assert_eq!(tick.aged, vec!["wan1".to_string()]);
    assert!(sampler.table().get("wan1").is_none());
    assert!(!h.files.has(h.config.paths.monitor_dir.join("wan1")));
    assert!(tick.checkpointed, "Expected a checkpoint after an entry aged out");

    let raw = h.store.get("/status").await.unwrap().unwrap();
    let checkpoint: Vec<CheckpointEntry> = serde_json::from_str(&raw).unwrap();
    assert!(checkpoint.is_empty());
}

#[tokio::test]
async fn test_failed_report_is_retried() {
    let h = Harness::new();
    with_wan1(&h).await;
    let mut sampler = sampler(&h);

    h.exec.respond(PING, REPLY);
    h.controller.fail_next_puts(1);
    let first = sampler.tick().await.unwrap();
    assert_eq!(first.report.failed, 1);
    assert!(sampler.table().get("wan1").unwrap().changed);

    let second = sampler.tick().await.unwrap();
    assert!(second.transitioned.is_empty());
    assert_eq!(second.report.pushed, 1, "Expected the queued push to be retried, got {:?}", second.report);
    assert!(!sampler.table().get("wan1").unwrap().changed);

    let statuses = pushed_statuses(&h);
    assert_eq!(statuses, vec!["UP".to_string(), "UP".to_string()]);

    let raw = h.store.get("/status").await.unwrap().unwrap();
    let checkpoint: Vec<CheckpointEntry> = serde_json::from_str(&raw).unwrap();
    assert_eq!(checkpoint.len(), 1);
    assert_eq!(checkpoint[0].status, LiveStatus::Normal);
}
