//! Architectural Contract Test: Flow Sampling
//!
//! This test verifies the per-minute measurement records.
//!
//! Constraints verified:
//! - No records are written before a site identity exists
//! - The first sample of an object reports an unknown rate
//! - Later samples report the byte delta as bits per second
//! - Objects without a health target skip latency and loss records
//! - Transition markers are cleared after every pass

mod common;

use chrono::{TimeZone, Utc};
use common::Harness;
use cpe_core::FlowSampler;
use cpe_core::model::{PortConf, SiteConf};
use cpe_core::traits::ConfigStore;

async fn seed(h: &Harness, with_site: bool) {
    let wan1 = PortConf {
        id: "wan1".into(),
        ip_addr: "203.0.113.10/24".into(),
        nexthop: "203.0.113.1".into(),
        phyif_name: "eth0".into(),
        ..Default::default()
    };
    let lan1 = PortConf {
        id: "lan1".into(),
        ip_addr: "192.168.1.1/24".into(),
        phyif_name: "eth1".into(),
        ..Default::default()
    };
    for port in [wan1, lan1] {
        h.store
            .set(&format!("/port/{}", port.id), &serde_json::to_string(&port).unwrap())
            .await
            .unwrap();
    }
    if with_site {
        let site = SiteConf {
            id: "site1".into(),
            ..Default::default()
        };
        h.store.set("/site", &serde_json::to_string(&site).unwrap()).await.unwrap();
    }
}

fn sampler(h: &Harness) -> FlowSampler {
    FlowSampler::new(&h.config, h.store.clone(), h.exec.clone(), h.files.clone())
}

#[tokio::test]
async fn test_no_site_means_no_records() {
    let h = Harness::new();
    seed(&h, false).await;
    let mut sampler = sampler(&h);

    let lines = sampler.sample(Utc::now()).await.unwrap();

    assert!(lines.rate.is_empty() && lines.status.is_empty());
    assert!(!h.files.has(h.config.paths.vnet_log_dir.join("rate.log")));
    assert_eq!(sampler.entries().len(), 2, "Expected state to be kept even without a site");
}

#[tokio::test]
async fn test_rates_and_records() {
    let h = Harness::new();
    seed(&h, true).await;
    let monitor = &h.config.paths.monitor_dir;
    h.files.put(monitor.join("wan1"), "");
    h.files.put(monitor.join("wan1.changed"), "");
    h.exec.respond(
        "ping -i 0.1 -c 10 203.0.113.1 -W 2",
        "10 packets transmitted, 10 received, 0% packet loss, time 900ms\nrtt min/avg/max/mdev = 1.000/2.500/4.000/0.500 ms\n",
    );
    h.exec.respond("ifconfig eth0", "100 6000\n200 12000\n");
    let mut sampler = sampler(&h);

    let minute = Utc.with_ymd_and_hms(2024, 5, 1, 10, 30, 0).unwrap();
    let lines = sampler.sample(minute + chrono::TimeDelta::seconds(2)).await.unwrap();
    let ts = minute.timestamp_nanos_opt().unwrap();

    assert!(lines.rate.contains(&format!(
        "rate,uid=wan1,type=port,dev=site1-master rate_rx=-200.00,rate_tx=-200.00 {}",
        ts
    )));
    assert!(lines.status.contains("status,uid=wan1,type=port,dev=site1-master status=1,changed=1"));
    assert!(lines.status.contains("status,uid=lan1,type=port,dev=site1-master status=0,changed=0"));
    assert!(lines.latency.contains("latency,uid=wan1,type=port,dev=site1-master latency=2.50"));
    assert!(!lines.latency.contains("uid=lan1"), "Expected no latency for a port without gateway");
    assert!(!h.files.has(monitor.join("wan1.changed")));
    assert!(h.files.has(monitor.join("wan1")));

    h.exec.respond("ifconfig eth0", "160 6600\n260 18000\n");
    let lines = sampler.sample(minute + chrono::TimeDelta::seconds(62)).await.unwrap();
    assert!(lines.rate.contains("uid=wan1,type=port,dev=site1-master rate_rx=80.00,rate_tx=800.00"));

    let log = h.files.get(h.config.paths.vnet_log_dir.join("status.log")).unwrap();
    assert_eq!(log.lines().count(), 4, "Expected two passes of two ports appended");
}
