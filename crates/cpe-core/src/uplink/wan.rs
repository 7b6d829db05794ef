//! WAN address and HA watcher
//!
//! WAN ports on DHCP change address and gateway behind the agent's back.
//! Every tick the watcher reads what the host has, stores it on the port
//! (moving dependents with a new gateway) and tells the controller. A sync
//! or report that fails stays flagged and is retried on the next tick.
//!
//! The same tick derives the HA state of WAN1 from the VIP and keeps the
//! local SNAT-to-VIP rule in place while this box is active.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use super::cpe_path;
use crate::Result;
use crate::config::{AgentConfig, HostPaths};
use crate::model::{general, ha};
use crate::net::cidr::strip_prefix;
use crate::net::firewall::{self, NatRule};
use crate::net::link;
use crate::reconcile::Reconciler;
use crate::traits::{ConfigRenderer, ControllerClient};

/// HA state of WAN1 as reported upstream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HaStatus {
    #[serde(rename = "ACTIVE")]
    Active,
    #[serde(rename = "INACTIVE")]
    Inactive,
    /// HA disabled; never reported
    #[default]
    #[serde(rename = "UNKNOW")]
    Unknown,
}

/// What the host says about one WAN
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WanObservation {
    pub phyif: String,
    pub ip_addr: String,
    pub nexthop: String,
    /// `DHCP` or `STATIC`
    pub ip_source: String,
}

/// Body of the WAN address report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WanReport {
    pub name: String,
    pub ip_addr: String,
    pub gateway: String,
    pub ip_source: String,
}

#[derive(Debug, Clone)]
struct WanState {
    seen: WanObservation,
    /// Store and dependents not yet updated
    unsynced: bool,
    /// Controller not yet told
    unreported: bool,
}

#[derive(Serialize)]
struct HaReport {
    status: HaStatus,
}

/// Normalise a boot protocol value to `DHCP` or `STATIC`
fn normalise_proto(raw: &str) -> String {
    let value = raw.trim().trim_matches('"');
    if value.eq_ignore_ascii_case("dhcp") {
        "DHCP".to_string()
    } else {
        "STATIC".to_string()
    }
}

/// `BOOTPROTO=` from an ifcfg file
pub fn proto_from_ifcfg(contents: &str) -> Option<String> {
    contents
        .lines()
        .find_map(|l| l.trim().strip_prefix("BOOTPROTO="))
        .map(normalise_proto)
}

/// Method of the `iface <phyif> inet <method>` stanza in a Debian interfaces file
pub fn proto_from_interfaces(contents: &str, phyif: &str) -> Option<String> {
    contents.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        match fields.as_slice() {
            ["iface", name, _, method, ..] if *name == phyif => Some(normalise_proto(method)),
            _ => None,
        }
    })
}

async fn boot_proto(files: &dyn ConfigRenderer, paths: &HostPaths, phyif: &str) -> Option<String> {
    if files.exists(&paths.debian_version).await {
        let contents = files.read(&paths.debian_interfaces).await.ok()??;
        return proto_from_interfaces(&contents, phyif);
    }
    let ifcfg = paths.ifcfg_dir.join(format!("ifcfg-{}", phyif));
    let contents = files.read(&ifcfg).await.ok()??;
    proto_from_ifcfg(&contents)
}

/// Whether `ip addr show` output says the link is up and holds `vip`
pub fn holds_vip(ip_addr_output: &str, vip: &str) -> bool {
    ip_addr_output.contains("LOWER_UP") && ip_addr_output.contains(strip_prefix(vip))
}

pub struct WanWatcher {
    reconciler: Arc<Reconciler>,
    client: Arc<dyn ControllerClient>,
    sn: String,
    interval: Duration,
    wans: BTreeMap<String, WanState>,
    ha_reported: HaStatus,
}

impl WanWatcher {
    pub fn new(config: &AgentConfig, reconciler: Arc<Reconciler>, client: Arc<dyn ControllerClient>) -> Self {
        Self {
            reconciler,
            client,
            sn: config.identity.sn.clone(),
            interval: Duration::from_secs(config.wan.interval_secs.max(1)),
            wans: BTreeMap::new(),
            ha_reported: HaStatus::Unknown,
        }
    }

    pub fn ha_reported(&self) -> HaStatus {
        self.ha_reported
    }

    /// Read boot protocol, address and gateway of one WAN from the host
    pub async fn observe(&self, name: &str) -> Option<WanObservation> {
        let ctx = self.reconciler.context();
        let phyif = match ctx.resolve_phyif(name).await {
            Ok(phyif) => phyif,
            Err(e) => {
                debug!(wan = %name, error = %e, "wan interface unresolved");
                return None;
            }
        };
        let Some(ip_source) = boot_proto(ctx.files(), &ctx.paths, &phyif).await else {
            debug!(wan = %name, phyif = %phyif, "boot protocol unknown");
            return None;
        };
        let ip_addr = link::current_address(ctx.exec(), &phyif).await?;
        let nexthop = link::default_gateway(ctx.exec(), &phyif).await?;
        Some(WanObservation {
            phyif,
            ip_addr,
            nexthop,
            ip_source,
        })
    }

    fn record(&mut self, name: &str, seen: WanObservation) {
        match self.wans.get_mut(name) {
            Some(state) => {
                if state.seen.ip_addr != seen.ip_addr
                    || state.seen.nexthop != seen.nexthop
                    || state.seen.ip_source != seen.ip_source
                {
                    info!(wan = %name, ip = %seen.ip_addr, gateway = %seen.nexthop, "wan address changed");
                    state.seen = seen;
                    state.unsynced = true;
                    state.unreported = true;
                }
            }
            None => {
                self.wans.insert(
                    name.to_string(),
                    WanState {
                        seen,
                        unsynced: true,
                        unreported: true,
                    },
                );
            }
        }
    }

    async fn sync_and_report(&mut self) {
        let path = cpe_path(&self.sn, "logicPorts/wan");
        for (name, state) in self.wans.iter_mut() {
            if state.unsynced {
                match self
                    .reconciler
                    .update_wan(name, &state.seen.ip_addr, &state.seen.nexthop)
                    .await
                {
                    Ok(_) => state.unsynced = false,
                    Err(e) => warn!(wan = %name, error = %e, "wan port not updated"),
                }
            }

            if state.unreported {
                let report = WanReport {
                    name: name.clone(),
                    ip_addr: state.seen.ip_addr.clone(),
                    gateway: state.seen.nexthop.clone(),
                    ip_source: state.seen.ip_source.clone(),
                };
                let body = match serde_json::to_value(&report) {
                    Ok(body) => body,
                    Err(e) => {
                        warn!(wan = %name, error = %e, "wan report not encoded");
                        continue;
                    }
                };
                match self.client.put(&path, &body).await {
                    Ok(_) => {
                        info!(wan = %name, ip = %report.ip_addr, "wan address reported");
                        state.unreported = false;
                    }
                    Err(e) => warn!(wan = %name, error = %e, "wan report failed, will retry"),
                }
            }
        }
    }

    /// Derive, report and act on the HA state of WAN1
    async fn check_ha(&mut self) -> Result<HaStatus> {
        let ctx = self.reconciler.context();
        let info = ha::wan_info(ctx).await?;

        let mut status = HaStatus::Inactive;
        if info.enable {
            match ctx.exec().run(&format!("ip addr show dev {}", info.phyif)).await {
                Ok(out) if holds_vip(&out, &info.vip) => status = HaStatus::Active,
                Ok(_) => {}
                Err(e) => warn!(phyif = %info.phyif, error = %e, "vip check failed"),
            }
        }

        if !info.enable {
            self.ha_reported = HaStatus::Unknown;
        } else if status != self.ha_reported {
            let body = serde_json::to_value(HaReport { status })?;
            match self.client.put(&cpe_path(&self.sn, "haStatus"), &body).await {
                Ok(_) => {
                    info!(status = ?status, "ha status reported");
                    self.ha_reported = status;
                }
                Err(e) => warn!(error = %e, "ha status report failed, will retry"),
            }
        }

        let want_nat = status == HaStatus::Active && general::local_nat_ha(ctx).await;
        self.sync_local_nat(want_nat, &info.phyif, strip_prefix(&info.vip))
            .await?;
        Ok(status)
    }

    /// Keep the SNAT-to-VIP rule and its marker file in line with `want`
    async fn sync_local_nat(&self, want: bool, phyif: &str, vip: &str) -> Result<()> {
        let ctx = self.reconciler.context();
        let exec = ctx.exec();
        let marker = &ctx.paths.ha_local_nat;

        // marker holds "<vip>/<phyif>"
        let current = match ctx.files().read(marker).await? {
            Some(raw) => raw
                .trim()
                .split_once('/')
                .map(|(v, p)| (v.to_string(), p.to_string())),
            None => None,
        };

        match (want, current) {
            (true, Some((cur_vip, cur_phyif))) => {
                if cur_vip != vip || cur_phyif != phyif {
                    let old = NatRule::SnatToSource {
                        device: &cur_phyif,
                        source: &cur_vip,
                    };
                    firewall::remove_nat(exec, &old).await?;
                    firewall::ensure_nat(exec, &NatRule::SnatToSource { device: phyif, source: vip })
                        .await?;
                    ctx.files().write(marker, &format!("{}/{}", vip, phyif)).await?;
                    info!(vip, phyif, "ha local nat moved");
                }
            }
            (true, None) => {
                firewall::ensure_nat(exec, &NatRule::SnatToSource { device: phyif, source: vip })
                    .await?;
                ctx.files().write(marker, &format!("{}/{}", vip, phyif)).await?;
                info!(vip, phyif, "ha local nat installed");
            }
            (false, Some((cur_vip, cur_phyif))) => {
                let old = NatRule::SnatToSource {
                    device: &cur_phyif,
                    source: &cur_vip,
                };
                firewall::remove_nat(exec, &old).await?;
                ctx.files().remove(marker).await?;
                info!(vip = %cur_vip, phyif = %cur_phyif, "ha local nat removed");
            }
            (false, None) => {}
        }
        Ok(())
    }

    /// Run one watch pass
    pub async fn tick(&mut self) -> Result<HaStatus> {
        let names: Vec<String> = self
            .reconciler
            .context()
            .port_map
            .wan_names()
            .map(str::to_string)
            .collect();
        for name in names {
            if let Some(seen) = self.observe(&name).await {
                self.record(&name, seen);
            }
        }
        self.sync_and_report().await;
        self.check_ha().await
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.tick().await {
                        warn!(error = %e, "wan watch pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("wan watcher stopping");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_protocol_from_either_layout() {
        assert_eq!(
            proto_from_ifcfg("DEVICE=eth0\nBOOTPROTO=\"dhcp\"\nONBOOT=yes\n").as_deref(),
            Some("DHCP")
        );
        assert_eq!(proto_from_ifcfg("BOOTPROTO=none\n").as_deref(), Some("STATIC"));
        assert_eq!(proto_from_ifcfg("DEVICE=eth0\n"), None);

        let interfaces = "auto eth0\niface eth0 inet dhcp\niface eth1 inet static\n";
        assert_eq!(proto_from_interfaces(interfaces, "eth0").as_deref(), Some("DHCP"));
        assert_eq!(proto_from_interfaces(interfaces, "eth1").as_deref(), Some("STATIC"));
        assert_eq!(proto_from_interfaces(interfaces, "eth2"), None);
    }

    #[test]
    fn vip_needs_carrier_and_address() {
        let up = "2: eth0: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500\n    inet 10.0.0.100/32 scope global eth0\n";
        assert!(holds_vip(up, "10.0.0.100/32"));
        assert!(!holds_vip(up, "10.0.0.101"));
        let down = "2: eth0: <NO-CARRIER,BROADCAST,UP> mtu 1500\n    inet 10.0.0.100/32\n";
        assert!(!holds_vip(down, "10.0.0.100"));
    }

    #[test]
    fn ha_status_wire_names() {
        assert_eq!(serde_json::to_string(&HaStatus::Active).unwrap(), "\"ACTIVE\"");
        assert_eq!(serde_json::to_string(&HaStatus::Unknown).unwrap(), "\"UNKNOW\"");
    }
}
