//! Physical port
//!
//! WAN ports are owned by the host (DHCP or provisioning): the agent only
//! brings them up and records the address and gateway it finds. LAN ports
//! are fully managed: address, ifcfg script, and the nexthop that subnets
//! and statics route through.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Action, Kind, ManagedObject, ModifyOutcome, ReconcileContext, fanout, is_wan};
use crate::Result;
use crate::net::cidr::{prefix_len, prefix_to_mask, strip_prefix};
use crate::net::link;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PortConf {
    pub id: String,
    /// Address with prefix length
    pub ip_addr: String,
    pub nexthop: String,
    pub phyif_name: String,
    /// Address without prefix (ifcfg `IPADDR`)
    pub address: String,
    /// Dotted netmask (ifcfg `NETMASK`)
    pub netmask: String,
    /// `Bridge` or `Ethernet`
    #[serde(rename = "type")]
    pub if_type: String,
}

/// ifcfg fields derived from an address and the backing interface
fn derive_ifcfg(ip_addr: &str, phyif: &str) -> (String, String, String) {
    let (address, netmask) = if ip_addr.is_empty() {
        (String::new(), String::new())
    } else {
        let mask = prefix_len(ip_addr)
            .map(|len| prefix_to_mask(len).to_string())
            .unwrap_or_default();
        (strip_prefix(ip_addr).to_string(), mask)
    };
    let if_type = if phyif.to_ascii_lowercase().contains("br") {
        "Bridge"
    } else {
        "Ethernet"
    };
    (address, netmask, if_type.to_string())
}

impl PortConf {
    pub fn is_wan(&self) -> bool {
        is_wan(&self.id)
    }

    fn apply_derived(&mut self) {
        let (address, netmask, if_type) = derive_ifcfg(&self.ip_addr, &self.phyif_name);
        self.address = address;
        self.netmask = netmask;
        self.if_type = if_type;
    }

    /// Contents of `ifcfg-<phyif>`
    pub fn render_ifcfg(&self) -> String {
        let mut out = format!(
            "TYPE={}\nBOOTPROTO=static\nNAME={}\nDEVICE={}\nONBOOT=yes\n",
            self.if_type, self.phyif_name, self.phyif_name
        );
        if !self.address.is_empty() {
            out.push_str(&format!("IPADDR={}\n", self.address));
        }
        if !self.netmask.is_empty() {
            out.push_str(&format!("NETMASK={}\n", self.netmask));
        }
        out
    }

    async fn write_ifcfg(&self, ctx: &ReconcileContext) -> Result<()> {
        let path = ctx
            .paths
            .ifcfg_dir
            .join(format!("ifcfg-{}", self.phyif_name));
        ctx.files().write(&path, &self.render_ifcfg()).await?;
        info!(port = %self.id, path = %path.display(), "ifcfg rendered");
        Ok(())
    }
}

#[async_trait]
impl ManagedObject for PortConf {
    const KIND: Kind = Kind::Port;

    fn id(&self) -> &str {
        &self.id
    }

    async fn create(&mut self, ctx: &ReconcileContext, action: Action) -> Result<()> {
        let phyif = ctx.resolve_phyif(&self.id).await?;
        self.phyif_name = phyif.clone();

        link::link_up(ctx.exec(), &phyif).await?;
        link::disable_rp_filter(ctx.exec(), &phyif).await?;

        if self.is_wan() {
            // A replay keeps the stored address; the WAN watcher refreshes it.
            if action == Action::Add {
                self.ip_addr = link::current_address(ctx.exec(), &phyif)
                    .await
                    .unwrap_or_default();
                self.nexthop = link::default_gateway(ctx.exec(), &phyif)
                    .await
                    .unwrap_or_default();
                info!(port = %self.id, ip = %self.ip_addr, nexthop = %self.nexthop, "WAN discovered");
            }
            return Ok(());
        }

        if action == Action::Add {
            self.apply_derived();
            self.write_ifcfg(ctx).await?;
        }

        link::flush_addresses(ctx.exec(), &phyif).await?;
        if !self.ip_addr.is_empty() {
            link::set_address(ctx.exec(), &phyif, &self.ip_addr, true).await;
        }
        Ok(())
    }

    async fn modify(&mut self, ctx: &ReconcileContext, new: &Self) -> ModifyOutcome {
        if self.is_wan() {
            return ModifyOutcome::unchanged();
        }

        let before = self.clone();
        let mut changed = false;

        if self.ip_addr != new.ip_addr {
            if !self.ip_addr.is_empty() {
                link::set_address(ctx.exec(), &self.phyif_name, &self.ip_addr, false).await;
            }
            if !new.ip_addr.is_empty() {
                link::set_address(ctx.exec(), &self.phyif_name, &new.ip_addr, true).await;
            }
            self.ip_addr = new.ip_addr.clone();
            changed = true;
        }

        if self.nexthop != new.nexthop {
            if let Err(e) = fanout::update_nexthop(ctx, &before, &new.nexthop, &new.ip_addr).await {
                warn!(port = %self.id, error = %e, "nexthop fan-out incomplete");
            }
            self.nexthop = new.nexthop.clone();
            changed = true;
        }

        let (address, netmask, if_type) = derive_ifcfg(&new.ip_addr, &self.phyif_name);
        if self.address != address || self.netmask != netmask || self.if_type != if_type {
            self.address = address;
            self.netmask = netmask;
            self.if_type = if_type;
            if let Err(e) = self.write_ifcfg(ctx).await {
                return ModifyOutcome::new(changed, Err(e));
            }
            changed = true;
        }

        ModifyOutcome::new(changed, Ok(()))
    }

    async fn destroy(&self, ctx: &ReconcileContext) -> Result<()> {
        if self.is_wan() || self.phyif_name.is_empty() {
            return Ok(());
        }

        link::flush_addresses(ctx.exec(), &self.phyif_name).await?;

        let mut bare = self.clone();
        bare.address.clear();
        bare.netmask.clear();
        bare.write_ifcfg(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn ifcfg_fields_from_address() {
        let (address, netmask, if_type) = derive_ifcfg("192.168.10.1/24", "br-lan");
        assert_eq!(address, "192.168.10.1");
        assert_eq!(netmask, "255.255.255.0");
        assert_eq!(if_type, "Bridge");

        let (address, netmask, if_type) = derive_ifcfg("", "eth1");
        assert!(address.is_empty() && netmask.is_empty());
        assert_eq!(if_type, "Ethernet");
    }

    #[test]
    fn ifcfg_omits_empty_address_lines() {
        let port = PortConf {
            id: "lan1".into(),
            phyif_name: "eth1".into(),
            if_type: "Ethernet".into(),
            ..Default::default()
        };
        assert_eq!(
            port.render_ifcfg(),
            "TYPE=Ethernet\nBOOTPROTO=static\nNAME=eth1\nDEVICE=eth1\nONBOOT=yes\n"
        );
    }

    #[test]
    fn type_field_round_trips_as_type() {
        let port: PortConf =
            serde_json::from_str(r#"{"id":"lan1","ipAddr":"10.0.0.1/24","type":"Bridge"}"#).unwrap();
        assert_eq!(port.if_type, "Bridge");
        let json = serde_json::to_value(&port).unwrap();
        assert_eq!(json["type"], "Bridge");
        assert_eq!(json["phyifName"], "");
    }
}
