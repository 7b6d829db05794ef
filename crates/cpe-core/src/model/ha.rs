//! VRRP high availability through keepalived
//!
//! Each HA port carries a VIP. Traffic from the box itself to the listed
//! networks (gateway, controller, console) and to the peer is SNATed to the
//! port's own address so replies reach this node rather than whichever node
//! currently owns the VIP.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Action, Kind, ManagedObject, ModifyOutcome, ReconcileContext};
use crate::Result;
use crate::net::cidr::strip_prefix;
use crate::net::firewall::{self, NatRule};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum HaRole {
    Master,
    #[default]
    Backup,
}

impl From<u8> for HaRole {
    fn from(code: u8) -> Self {
        if code == 1 { Self::Master } else { Self::Backup }
    }
}

impl From<HaRole> for u8 {
    fn from(role: HaRole) -> Self {
        match role {
            HaRole::Master => 1,
            HaRole::Backup => 2,
        }
    }
}

impl HaRole {
    fn state(self) -> &'static str {
        match self {
            Self::Master => "MASTER",
            Self::Backup => "BACKUP",
        }
    }

    fn priority(self) -> u8 {
        match self {
            Self::Master => 100,
            Self::Backup => 90,
        }
    }

    fn lifetime(self) -> &'static str {
        match self {
            Self::Master => "LVS_MASTER",
            Self::Backup => "LVS_BACKUP",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HaPortVip {
    /// Logical port id, e.g. `wan1`
    pub id: String,
    /// Virtual address, without prefix
    #[serde(rename = "ipAddr")]
    pub vip: String,
    pub peer: String,
    pub networks: Vec<String>,
    pub phyif_name: String,
    /// This node's own address on the port
    pub address: String,
}

/// One SNAT-to-own-address rule
type SnatRule = (String, String, String);

impl HaPortVip {
    fn snat_rules(&self, into: &mut BTreeSet<SnatRule>) {
        if self.address.is_empty() || self.phyif_name.is_empty() {
            return;
        }
        for target in self.networks.iter().chain(std::iter::once(&self.peer)) {
            if !target.is_empty() {
                into.insert((self.phyif_name.clone(), target.clone(), self.address.clone()));
            }
        }
    }

    fn server_fields_differ(&self, other: &HaPortVip) -> bool {
        self.vip != other.vip
            || self.address != other.address
            || self.peer != other.peer
            || self.phyif_name != other.phyif_name
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HaConf {
    pub enable: bool,
    pub role: HaRole,
    pub port_vip: Vec<HaPortVip>,
}

async fn set_snat(ctx: &ReconcileContext, rules: &BTreeSet<SnatRule>, present: bool) -> Result<()> {
    for (device, network, source) in rules {
        let rule = NatRule::SnatByNetwork {
            device,
            network,
            source,
        };
        firewall::set_nat(ctx.exec(), &rule, present).await?;
    }
    Ok(())
}

impl HaConf {
    /// keepalived.conf for the current role and ports
    pub fn render(&self) -> String {
        let mut out = format!(
            "global_defs {{\n    ikelifetime={}\n}}\n\
             vrrp_script checkhaproxy {{\n    script \"/etc/keepalived/chk_haproxy.sh\"\n    interval 1\n    weight -20\n}}\n",
            self.role.lifetime()
        );
        for port in &self.port_vip {
            out.push_str(&format!(
                "vrrp_instance VI_{phyif} {{\n    \
                 state {state}\n    \
                 interface {phyif}\n    \
                 virtual_router_id 1\n    \
                 priority {priority}\n    \
                 advert_int 1\n    \
                 authentication {{\n        auth_type PASS\n        auth_pass 123\n    }}\n    \
                 unicast_src_ip {address}\n    \
                 unicast_peer {{\n        {peer}\n    }}\n    \
                 virtual_ipaddress {{\n        {vip}\n    }}\n    \
                 track_script {{\n        checkhaproxy\n    }}\n\
                 }}\n",
                phyif = port.phyif_name,
                state = self.role.state(),
                priority = self.role.priority(),
                address = port.address,
                peer = port.peer,
                vip = port.vip,
            ));
        }
        out
    }

    fn snat_rules(&self) -> BTreeSet<SnatRule> {
        let mut rules = BTreeSet::new();
        for port in &self.port_vip {
            port.snat_rules(&mut rules);
        }
        rules
    }

    /// Copy interface name and own address from the stored ports
    async fn fill_from_ports(&mut self, ctx: &ReconcileContext) -> Result<()> {
        for vip in &mut self.port_vip {
            let port = ctx.port(&vip.id).await?;
            vip.address = strip_prefix(&port.ip_addr).to_string();
            vip.phyif_name = port.phyif_name;
        }
        Ok(())
    }

    async fn write_and_restart(&self, ctx: &ReconcileContext) -> Result<()> {
        ctx.files()
            .write(&ctx.paths.keepalived_conf, &self.render())
            .await?;
        ctx.exec().run("systemctl restart keepalived").await?;
        Ok(())
    }

    fn server_differs(&self, new: &HaConf) -> bool {
        if self.role != new.role || self.port_vip.len() != new.port_vip.len() {
            return true;
        }
        new.port_vip.iter().any(|n| {
            self.port_vip
                .iter()
                .find(|o| o.id == n.id)
                .is_none_or(|o| o.server_fields_differ(n))
        })
    }
}

#[async_trait]
impl ManagedObject for HaConf {
    const KIND: Kind = Kind::Ha;

    fn id(&self) -> &str {
        ""
    }

    async fn create(&mut self, ctx: &ReconcileContext, _action: Action) -> Result<()> {
        if !self.enable {
            return Ok(());
        }
        self.fill_from_ports(ctx).await?;
        set_snat(ctx, &self.snat_rules(), true).await?;
        self.write_and_restart(ctx).await?;
        info!(role = ?self.role, ports = self.port_vip.len(), "ha configured");
        Ok(())
    }

    async fn modify(&mut self, ctx: &ReconcileContext, new: &Self) -> ModifyOutcome {
        if self.enable != new.enable {
            if new.enable {
                let mut next = new.clone();
                let result = next.create(ctx, Action::Add).await;
                *self = next;
                return ModifyOutcome::new(true, result);
            }
            let result = self.destroy(ctx).await;
            *self = new.clone();
            return ModifyOutcome::new(true, result);
        }
        if !new.enable {
            return ModifyOutcome::unchanged();
        }

        let mut next = new.clone();
        if let Err(e) = next.fill_from_ports(ctx).await {
            return ModifyOutcome::failed(e);
        }

        let server_changed = self.server_differs(&next);
        let before = self.snat_rules();
        let after = next.snat_rules();
        if !server_changed && before == after {
            return ModifyOutcome::unchanged();
        }

        let stale: BTreeSet<SnatRule> = before.difference(&after).cloned().collect();
        let fresh: BTreeSet<SnatRule> = after.difference(&before).cloned().collect();
        if let Err(e) = set_snat(ctx, &stale, false).await {
            return ModifyOutcome::failed(e);
        }
        if let Err(e) = set_snat(ctx, &fresh, true).await {
            return ModifyOutcome::failed(e);
        }

        if server_changed {
            if let Err(e) = next.write_and_restart(ctx).await {
                return ModifyOutcome::failed(e);
            }
            info!(role = ?next.role, "keepalived reconfigured");
        }
        *self = next;
        ModifyOutcome::changed()
    }

    async fn destroy(&self, ctx: &ReconcileContext) -> Result<()> {
        ctx.exec().run("systemctl stop keepalived").await?;
        ctx.files().remove(&ctx.paths.keepalived_conf).await?;
        set_snat(ctx, &self.snat_rules(), false).await?;
        info!("ha removed");
        Ok(())
    }
}

/// Re-apply persisted HA state after reboot
pub async fn recover(ctx: &ReconcileContext) -> Result<()> {
    let Some(ha) = ctx.load::<HaConf>("").await? else {
        return Ok(());
    };
    if !ha.enable {
        return Ok(());
    }
    set_snat(ctx, &ha.snat_rules(), true).await?;
    ctx.exec().run("systemctl restart keepalived").await?;
    Ok(())
}

/// HA view of WAN1
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HaWanInfo {
    pub enable: bool,
    pub phyif: String,
    pub vip: String,
}

/// Whether HA covers WAN1, with its interface and VIP
pub async fn wan_info(ctx: &ReconcileContext) -> Result<HaWanInfo> {
    let Some(ha) = ctx.load::<HaConf>("").await? else {
        return Ok(HaWanInfo::default());
    };
    Ok(ha
        .port_vip
        .iter()
        .find(|p| p.id == "wan1")
        .map(|p| HaWanInfo {
            enable: ha.enable,
            phyif: p.phyif_name.clone(),
            vip: p.vip.clone(),
        })
        .unwrap_or_default())
}
