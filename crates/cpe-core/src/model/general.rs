//! Box-wide switches: local NAT and the China-route split
//!
//! With China-route on, destinations in the `chinaroute` set are marked 100
//! and leave through table 100, whose default route points at the selected
//! device (WAN1 unless configured otherwise). Everything else follows the
//! main table, usually into the SD-WAN.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::{Action, Kind, ManagedObject, ModifyOutcome, PortConf, ReconcileContext};
use crate::Result;
use crate::net::cidr::{strip_prefix, with_host_prefix};
use crate::net::firewall::{self, NatRule};
use crate::net::{arrcmp, link, vtysh};

const CHINA_SET: &str = "chinaroute";
const CHINA_SET_MAXELEM: u32 = 1_000_000;
/// Mark, table and rule preference of the China-route policy
const CHINA_POLICY: u32 = 100;
const DEFAULT_ROUTE: &str = "0.0.0.0/0";
const WAN1: &str = "wan1";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeneralConf {
    /// Masquerade traffic leaving WAN1
    pub local_nat: bool,
    /// SNAT WAN1 traffic to the HA VIP while this node is active
    pub local_nat_ha: bool,
    pub sdwan_nat: bool,
    pub sdwan_static_relate: bool,
    pub china_route: bool,
    /// Egress for China routes; empty means WAN1
    pub china_rt_device: String,
    /// `/32` statics carved out of the China set
    pub china_rt_ext_static: Vec<String>,
}

fn uses_wan1(device: &str) -> bool {
    device.is_empty() || device == WAN1
}

async fn wan1(ctx: &ReconcileContext) -> Result<Option<PortConf>> {
    ctx.load::<PortConf>(WAN1).await
}

async fn set_local_nat(ctx: &ReconcileContext, present: bool) -> Result<()> {
    match wan1(ctx).await? {
        Some(port) if !port.phyif_name.is_empty() => {
            let rule = NatRule::Masquerade {
                device: &port.phyif_name,
            };
            firewall::set_nat(ctx.exec(), &rule, present).await
        }
        _ => {
            warn!("local NAT needs a resolved wan1 port");
            Ok(())
        }
    }
}

impl GeneralConf {
    /// Gateway the China-route table points at
    async fn china_nexthop(&self, ctx: &ReconcileContext) -> Result<String> {
        if uses_wan1(&self.china_rt_device) {
            Ok(wan1(ctx).await?.map(|p| p.nexthop).unwrap_or_default())
        } else {
            Ok(self.china_rt_device.clone())
        }
    }

    /// Fill the China set, excluding WAN1, the exclusion list and `/32` statics
    async fn load_china_set(&mut self, ctx: &ReconcileContext, action: Action) -> Result<()> {
        let exec = ctx.exec();
        let paths = &ctx.paths;

        if ctx.files().exists(&paths.china_route_list).await {
            firewall::ipset_restore_from(exec, CHINA_SET, &paths.china_route_list, false).await?;
        } else {
            debug!(path = %paths.china_route_list.display(), "no China route list");
        }

        if let Some(port) = wan1(ctx).await? {
            if !port.ip_addr.is_empty() {
                let member = with_host_prefix(strip_prefix(&port.ip_addr));
                firewall::ipset_add(exec, CHINA_SET, &member, true).await?;
            }
        }

        if ctx.files().exists(&paths.china_route_exclude).await {
            firewall::ipset_restore_from(exec, CHINA_SET, &paths.china_route_exclude, true).await?;
        }

        if action == Action::Add {
            self.china_rt_ext_static = ctx.static_ext_members().await?;
        }
        for member in &self.china_rt_ext_static {
            firewall::ipset_add(exec, CHINA_SET, member, true).await?;
        }
        Ok(())
    }

    async fn create_china_policy(
        &mut self,
        ctx: &ReconcileContext,
        action: Action,
        nexthop: &str,
    ) -> Result<()> {
        let exec = ctx.exec();
        firewall::ipset_create(exec, CHINA_SET, "hash:net", CHINA_SET_MAXELEM, None).await?;
        self.load_china_set(ctx, action).await?;
        link::set_fwmark_rule(exec, CHINA_POLICY, CHINA_POLICY, CHINA_POLICY, true).await;
        if action == Action::Add {
            vtysh::table_route(exec, false, DEFAULT_ROUTE, nexthop, CHINA_POLICY).await?;
        }
        firewall::set_dst_mark(exec, CHINA_SET, CHINA_POLICY, true, true).await?;
        info!(nexthop, "China-route policy installed");
        Ok(())
    }

    async fn destroy_china_policy(&self, ctx: &ReconcileContext, nexthop: &str) -> Result<()> {
        let exec = ctx.exec();
        firewall::set_dst_mark(exec, CHINA_SET, CHINA_POLICY, false, true).await?;
        link::set_fwmark_rule(exec, CHINA_POLICY, CHINA_POLICY, CHINA_POLICY, false).await;
        if let Err(e) = vtysh::table_route(exec, true, DEFAULT_ROUTE, nexthop, CHINA_POLICY).await {
            warn!(error = %e, "China-route default route not removed");
        }
        firewall::ipset_destroy(exec, CHINA_SET).await;
        info!("China-route policy removed");
        Ok(())
    }

    async fn apply(&mut self, ctx: &ReconcileContext, action: Action) -> Result<()> {
        if self.local_nat {
            set_local_nat(ctx, true).await?;
        }
        if self.china_route {
            let nexthop = self.china_nexthop(ctx).await?;
            if nexthop.is_empty() {
                debug!("no China-route nexthop yet");
            } else {
                self.create_china_policy(ctx, action, &nexthop).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ManagedObject for GeneralConf {
    const KIND: Kind = Kind::General;

    fn id(&self) -> &str {
        ""
    }

    async fn create(&mut self, ctx: &ReconcileContext, action: Action) -> Result<()> {
        self.apply(ctx, action).await
    }

    async fn modify(&mut self, ctx: &ReconcileContext, new: &Self) -> ModifyOutcome {
        let mut changed = false;

        if self.local_nat != new.local_nat {
            if let Err(e) = set_local_nat(ctx, new.local_nat).await {
                return ModifyOutcome::failed(e);
            }
            self.local_nat = new.local_nat;
            changed = true;
        }

        if self.local_nat_ha != new.local_nat_ha
            || self.sdwan_nat != new.sdwan_nat
            || self.sdwan_static_relate != new.sdwan_static_relate
        {
            self.local_nat_ha = new.local_nat_ha;
            self.sdwan_nat = new.sdwan_nat;
            self.sdwan_static_relate = new.sdwan_static_relate;
            changed = true;
        }

        if self.china_route != new.china_route {
            let result = if self.china_route {
                match self.china_nexthop(ctx).await {
                    Ok(nh) if !nh.is_empty() => self.destroy_china_policy(ctx, &nh).await,
                    Ok(_) => Ok(()),
                    Err(e) => Err(e),
                }
            } else {
                let mut next = new.clone();
                let result = match next.china_nexthop(ctx).await {
                    Ok(nh) if !nh.is_empty() => next.create_china_policy(ctx, Action::Add, &nh).await,
                    Ok(_) => Ok(()),
                    Err(e) => Err(e),
                };
                self.china_rt_ext_static = next.china_rt_ext_static;
                result
            };
            self.china_route = new.china_route;
            self.china_rt_device = new.china_rt_device.clone();
            if !self.china_route {
                self.china_rt_ext_static.clear();
            }
            return ModifyOutcome::new(true, result);
        }

        if !self.china_route {
            if self.china_rt_device != new.china_rt_device {
                self.china_rt_device = new.china_rt_device.clone();
                changed = true;
            }
            return ModifyOutcome::new(changed, Ok(()));
        }

        if self.china_rt_device != new.china_rt_device {
            let target = GeneralConf {
                china_rt_device: new.china_rt_device.clone(),
                ..GeneralConf::default()
            };
            let old_nh = match self.china_nexthop(ctx).await {
                Ok(nh) => nh,
                Err(e) => return ModifyOutcome::new(changed, Err(e)),
            };
            let new_nh = match target.china_nexthop(ctx).await {
                Ok(nh) => nh,
                Err(e) => return ModifyOutcome::new(changed, Err(e)),
            };
            let exec = ctx.exec();
            let moved = match (old_nh.is_empty(), new_nh.is_empty()) {
                (false, false) => {
                    vtysh::table_route_replace(exec, DEFAULT_ROUTE, &old_nh, &new_nh, CHINA_POLICY)
                        .await
                }
                (false, true) => vtysh::table_route(exec, true, DEFAULT_ROUTE, &old_nh, CHINA_POLICY).await,
                (true, false) => vtysh::table_route(exec, false, DEFAULT_ROUTE, &new_nh, CHINA_POLICY).await,
                (true, true) => Ok(()),
            };
            self.china_rt_device = new.china_rt_device.clone();
            if let Err(e) = moved {
                return ModifyOutcome::new(true, Err(e));
            }
            changed = true;
        }

        // The carve-outs track the stored statics, not the payload
        let current = match ctx.static_ext_members().await {
            Ok(members) => members,
            Err(e) => return ModifyOutcome::new(changed, Err(e)),
        };
        let (added, removed) = arrcmp(&self.china_rt_ext_static, &current);
        if !added.is_empty() || !removed.is_empty() {
            for member in &removed {
                if let Err(e) = firewall::ipset_del(ctx.exec(), CHINA_SET, member).await {
                    warn!(member = %member, error = %e, "China set carve-out not removed");
                }
            }
            for member in &added {
                if let Err(e) = firewall::ipset_add(ctx.exec(), CHINA_SET, member, true).await {
                    warn!(member = %member, error = %e, "China set carve-out not added");
                }
            }
            self.china_rt_ext_static = current;
            changed = true;
        }

        ModifyOutcome::new(changed, Ok(()))
    }

    async fn destroy(&self, ctx: &ReconcileContext) -> Result<()> {
        if self.local_nat {
            set_local_nat(ctx, false).await?;
        }
        if self.china_route {
            let nexthop = self.china_nexthop(ctx).await?;
            self.destroy_china_policy(ctx, &nexthop).await?;
        }
        Ok(())
    }
}

/// Re-apply persisted switches after reboot
pub async fn recover(ctx: &ReconcileContext) -> Result<()> {
    let Some(mut general) = ctx.load::<GeneralConf>("").await? else {
        return Ok(());
    };
    general.apply(ctx, Action::Recover).await
}

/// Follow a WAN1 gateway or address change
///
/// `port` is WAN1 as it was before the change.
pub async fn update_china_route(
    ctx: &ReconcileContext,
    port: &PortConf,
    new_nexthop: &str,
    new_ip: &str,
) -> Result<()> {
    let mut general = match ctx.load::<GeneralConf>("").await {
        Ok(Some(general)) => general,
        Ok(None) => return Ok(()),
        Err(e) => {
            warn!(error = %e, "stored general config unreadable");
            return Ok(());
        }
    };
    if !general.china_route || !uses_wan1(&general.china_rt_device) {
        return Ok(());
    }

    if port.nexthop.is_empty() {
        if let Err(e) = general
            .create_china_policy(ctx, Action::Add, new_nexthop)
            .await
        {
            warn!(error = %e, "China-route policy not installed");
        }
        return ctx.save(&general).await;
    }

    if let Err(e) = vtysh::table_route_replace(
        ctx.exec(),
        DEFAULT_ROUTE,
        &port.nexthop,
        new_nexthop,
        CHINA_POLICY,
    )
    .await
    {
        warn!(error = %e, "China-route default route not moved");
    }

    if port.ip_addr != new_ip {
        let exec = ctx.exec();
        if !port.ip_addr.is_empty() {
            let old = with_host_prefix(strip_prefix(&port.ip_addr));
            firewall::ipset_del(exec, CHINA_SET, &old).await?;
        }
        if !new_ip.is_empty() {
            let new = with_host_prefix(strip_prefix(new_ip));
            firewall::ipset_add(exec, CHINA_SET, &new, true).await?;
        }
    }
    Ok(())
}

/// Whether WAN1 should SNAT to the HA VIP while active
pub async fn local_nat_ha(ctx: &ReconcileContext) -> bool {
    match ctx.load::<GeneralConf>("").await {
        Ok(Some(general)) => general.local_nat_ha,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_defaults_to_wan1() {
        assert!(uses_wan1(""));
        assert!(uses_wan1("wan1"));
        assert!(!uses_wan1("conn3"));
    }

    #[test]
    fn wire_names_are_camel_case() {
        let conf: GeneralConf = serde_json::from_str(
            r#"{"localNat": true, "chinaRoute": true, "chinaRtDevice": "conn2", "chinaRtExtStatic": ["1.2.3.4/32"]}"#,
        )
        .unwrap();
        assert!(conf.local_nat);
        assert_eq!(conf.china_rt_device, "conn2");
        assert_eq!(conf.china_rt_ext_static, vec!["1.2.3.4/32".to_string()]);
    }
}
