//! Architectural Contract Test: Controller Uplink
//!
//! This test verifies how the agent keeps the controller and itself in sync.
//!
//! Constraints verified:
//! - The heartbeat reports local state and records the controller's version
//! - The config poll fetches only when versions differ (or on the forced count)
//! - Duplicate policy default routes in frr.conf degrade health
//! - A WAN address picked up by the host is stored and reported once
//! - A failed WAN report is retried until it succeeds

mod common;

use common::Harness;
use cpe_core::health::HealthStatus;
use cpe_core::model::PortConf;
use cpe_core::traits::{ConfigStore, ControllerClient};
use cpe_core::uplink::HaStatus;
use cpe_core::{ConfigPoller, Heartbeat, Reconciler, WanWatcher};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;

fn client(h: &Harness) -> Arc<dyn ControllerClient> {
    h.controller.clone()
}

#[tokio::test]
async fn test_heartbeat_records_controller_version() {
    let h = Harness::new();
    h.controller.set_put_reply(json!({"configVersion": 7}));
    let heartbeat = Heartbeat::new(&h.config, client(&h), h.health.clone());

    let version = heartbeat.beat().await.unwrap();

    assert_eq!(version, 7);
    assert_eq!(h.health.controller_version(), 7);
    let bodies = h.controller.puts_to("/api/cpeConfig/cpes/SN0001/heartbeat");
    assert_eq!(bodies.len(), 1, "Expected one heartbeat, got {}", bodies.len());
    assert_eq!(bodies[0]["status"], "NORMAL");
    assert_eq!(bodies[0]["configVersion"], -1);
}

#[tokio::test]
async fn test_config_poll_fetches_on_version_change() {
    let h = Harness::new();
    let (reconciler, _events) = Reconciler::new(h.ctx.clone());
    let mut poller = ConfigPoller::new(&h.config, client(&h), Arc::new(reconciler));

    let idle = poller.poll().await.unwrap();
    assert!(!idle.fetched, "Expected no fetch while versions agree");
    assert!(h.controller.gets().is_empty());

    h.controller.set_get_reply(json!({
        "ts": 1,
        "siteConfig": {"id": "site1", "coreList": ["10.255.0.1/32"], "configVersion": 5}
    }));
    h.health.set_controller_version(5);
    let fetched = poller.poll().await.unwrap();

    assert!(fetched.fetched);
    assert_eq!(fetched.failures, 0);
    assert_eq!(h.controller.gets(), vec!["/api/cpeConfig/cpes/SN0001/dpConfig".to_string()]);
    assert_eq!(h.health.config_version(), 5);
    assert_eq!(h.files.get(&h.config.paths.core_list).as_deref(), Some("10.255.0.1\n"));

    let settled = poller.poll().await.unwrap();
    assert!(!settled.fetched, "Expected no fetch once the version is applied");
}

#[tokio::test]
async fn test_duplicate_policy_routes_degrade_health() {
    let h = Harness::new();
    h.files.put(
        &h.config.paths.frr_conf,
        "ip route 0.0.0.0/0 10.0.0.1 table 100\nip route 0.0.0.0/0 10.0.0.2 table 100\n",
    );
    h.controller.set_get_reply(json!({}));
    h.health.set_controller_version(3);
    let (reconciler, _events) = Reconciler::new(h.ctx.clone());
    let mut poller = ConfigPoller::new(&h.config, client(&h), Arc::new(reconciler));

    poller.poll().await.unwrap();

    assert_eq!(h.health.status(), HealthStatus::Warning);
}

#[tokio::test]
async fn test_wan_change_is_stored_and_reported() {
    let h = Harness::new();
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
    h.files
        .put(h.config.paths.ifcfg_dir.join("ifcfg-eth0"), "DEVICE=eth0\nBOOTPROTO=dhcp\n");
    h.exec.respond("ip -4 addr show dev eth0", "198.51.100.7/24\n");
    h.exec.respond("ip route show default dev eth0", "198.51.100.1\n");
    h.controller.fail_next_puts(1);

    let (reconciler, _events) = Reconciler::new(h.ctx.clone());
    let mut watcher = WanWatcher::new(&h.config, Arc::new(reconciler), client(&h));

    let ha = watcher.tick().await.unwrap();
    assert_eq!(ha, HaStatus::Inactive);
    assert_eq!(watcher.ha_reported(), HaStatus::Unknown);

    let stored: PortConf =
        serde_json::from_str(&h.store.get("/port/wan1").await.unwrap().unwrap()).unwrap();
    assert_eq!(stored.ip_addr, "198.51.100.7/24");
    assert_eq!(stored.nexthop, "198.51.100.1");

    // First report failed; the next tick retries it
    watcher.tick().await.unwrap();
    watcher.tick().await.unwrap();

    let reports = h.controller.puts_to("/logicPorts/wan");
    assert_eq!(reports.len(), 2, "Expected one failed and one retried report, got {:?}", reports);
    assert_eq!(
        reports[1],
        json!({"name": "wan1", "ipAddr": "198.51.100.7/24", "gateway": "198.51.100.1", "ipSource": "DHCP"})
    );
}
