//! ISC dhcpd serving the LAN port networks

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Action, Kind, ManagedObject, ModifyOutcome, ReconcileContext};
use crate::net::cidr::{self, split_cidr};
use crate::{Error, Result};

const HEADER: &str = "# Dhcpd configure\ndefault-lease-time 600;\nmax-lease-time 7200;\n";

/// One served network, keyed by the LAN port id
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DhcpPortNet {
    pub id: String,
    /// Gateway address with prefix, e.g. `192.168.1.1/24`
    pub ip_addr: String,
    pub range_start: String,
    pub range_end: String,
    #[serde(rename = "primaryDNS")]
    pub primary_dns: String,
    #[serde(rename = "secondaryDNS")]
    pub secondary_dns: String,
    pub lease_time: u32,

    // Derived from ip_addr
    pub subnet: String,
    pub netmask: String,
    pub routers: String,
    pub broadcast: String,
    pub lease_time_max: u32,
}

impl DhcpPortNet {
    /// Fill subnet, netmask, router and broadcast from `ip_addr`
    pub fn derive(&mut self) -> Result<()> {
        if !self.ip_addr.contains('/') {
            return Err(Error::invalid_input(format!(
                "dhcp network {} needs a prefix length: {}",
                self.id, self.ip_addr
            )));
        }
        let (ip, mask) = split_cidr(&self.ip_addr).ok_or_else(|| {
            Error::invalid_input(format!("dhcp network {}: bad address {}", self.id, self.ip_addr))
        })?;
        self.routers = ip.to_string();
        self.netmask = mask.to_string();
        self.subnet = cidr::network(ip, mask).to_string();
        self.broadcast = cidr::broadcast(ip, mask).to_string();
        if self.lease_time_max < self.lease_time {
            self.lease_time_max = self.lease_time;
        }
        Ok(())
    }

    fn render(&self, out: &mut String) {
        out.push_str(&format!("subnet {} netmask {} {{\n", self.subnet, self.netmask));
        out.push_str(&format!("    range {} {};\n", self.range_start, self.range_end));
        if self.secondary_dns.is_empty() {
            out.push_str(&format!("    option domain-name-servers {};\n", self.primary_dns));
        } else {
            out.push_str(&format!(
                "    option domain-name-servers {},{};\n",
                self.primary_dns, self.secondary_dns
            ));
        }
        out.push_str("    option domain-name \"local\";\n");
        out.push_str(&format!("    option subnet-mask {};\n", self.netmask));
        out.push_str(&format!("    option routers {};\n", self.routers));
        out.push_str(&format!("    option broadcast-address {};\n", self.broadcast));
        if self.lease_time != 0 {
            out.push_str(&format!("    default-lease-time {};\n", self.lease_time));
        }
        if self.lease_time_max != 0 {
            out.push_str(&format!("    max-lease-time {};\n", self.lease_time_max));
        }
        out.push_str("}\n");
    }

    /// Fields the controller sets; derived ones follow from these
    fn same_input(&self, other: &DhcpPortNet) -> bool {
        self.ip_addr == other.ip_addr
            && self.range_start == other.range_start
            && self.range_end == other.range_end
            && self.primary_dns == other.primary_dns
            && self.secondary_dns == other.secondary_dns
            && self.lease_time == other.lease_time
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DhcpConf {
    pub enable: bool,
    pub port_net: Vec<DhcpPortNet>,
}

impl DhcpConf {
    /// dhcpd.conf for the current networks
    pub fn render(&self) -> String {
        let mut out = String::from(HEADER);
        for net in &self.port_net {
            net.render(&mut out);
        }
        out
    }

    fn derive_all(&mut self) -> Result<()> {
        self.port_net.iter_mut().try_for_each(DhcpPortNet::derive)
    }

    fn networks_differ(&self, new: &DhcpConf) -> bool {
        if self.port_net.len() != new.port_net.len() {
            return true;
        }
        new.port_net.iter().any(|n| {
            !self
                .port_net
                .iter()
                .find(|o| o.id == n.id)
                .is_some_and(|o| o.same_input(n))
        })
    }

    async fn write_and_restart(&self, ctx: &ReconcileContext) -> Result<()> {
        ctx.files()
            .write(&ctx.paths.dhcpd_conf, &self.render())
            .await?;
        ctx.exec().run("systemctl restart dhcpd").await?;
        Ok(())
    }
}

#[async_trait]
impl ManagedObject for DhcpConf {
    const KIND: Kind = Kind::Dhcp;

    fn id(&self) -> &str {
        ""
    }

    async fn create(&mut self, ctx: &ReconcileContext, _action: Action) -> Result<()> {
        if !self.enable {
            return Ok(());
        }
        self.derive_all()?;
        self.write_and_restart(ctx).await?;
        info!(networks = self.port_net.len(), "dhcp server configured");
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
        if !new.enable || !self.networks_differ(new) {
            return ModifyOutcome::unchanged();
        }

        let mut next = new.clone();
        if let Err(e) = next.derive_all() {
            return ModifyOutcome::failed(e);
        }
        if let Err(e) = next.write_and_restart(ctx).await {
            return ModifyOutcome::failed(e);
        }
        *self = next;
        info!(networks = self.port_net.len(), "dhcp server reconfigured");
        ModifyOutcome::changed()
    }

    async fn destroy(&self, ctx: &ReconcileContext) -> Result<()> {
        ctx.exec().run("systemctl stop dhcpd").await?;
        ctx.files().write(&ctx.paths.dhcpd_conf, HEADER).await?;
        info!("dhcp server stopped");
        Ok(())
    }
}

/// Bring dhcpd in line with the persisted config after reboot
pub async fn recover(ctx: &ReconcileContext) -> Result<()> {
    let enabled = ctx
        .load::<DhcpConf>("")
        .await?
        .is_some_and(|dhcp| dhcp.enable);
    if !enabled {
        if let Err(e) = ctx.exec().run("systemctl stop dhcpd").await {
            warn!(error = %e, "dhcpd stop failed");
        }
        return Ok(());
    }
    ctx.exec().run("systemctl restart dhcpd").await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn renders_derived_network_block() {
        let mut conf = DhcpConf {
            enable: true,
            port_net: vec![DhcpPortNet {
                id: "lan1".into(),
                ip_addr: "192.168.10.1/24".into(),
                range_start: "192.168.10.100".into(),
                range_end: "192.168.10.200".into(),
                primary_dns: "192.168.10.1".into(),
                lease_time: 3600,
                ..Default::default()
            }],
        };
        conf.derive_all().unwrap();
        assert_eq!(
            conf.render(),
            "# Dhcpd configure\n\
             default-lease-time 600;\n\
             max-lease-time 7200;\n\
             subnet 192.168.10.0 netmask 255.255.255.0 {\n    \
             range 192.168.10.100 192.168.10.200;\n    \
             option domain-name-servers 192.168.10.1;\n    \
             option domain-name \"local\";\n    \
             option subnet-mask 255.255.255.0;\n    \
             option routers 192.168.10.1;\n    \
             option broadcast-address 192.168.10.255;\n    \
             default-lease-time 3600;\n    \
             max-lease-time 3600;\n\
             }\n"
        );
    }

    #[test]
    fn bare_address_is_rejected() {
        let mut net = DhcpPortNet {
            id: "lan1".into(),
            ip_addr: "192.168.10.1".into(),
            ..Default::default()
        };
        assert!(net.derive().unwrap_err().is_validation());
    }

    #[test]
    fn derived_fields_do_not_count_as_changes() {
        let net = DhcpPortNet {
            id: "lan1".into(),
            ip_addr: "10.0.0.1/24".into(),
            ..Default::default()
        };
        let mut stored = DhcpConf {
            enable: true,
            port_net: vec![net.clone()],
        };
        stored.derive_all().unwrap();
        let incoming = DhcpConf {
            enable: true,
            port_net: vec![net],
        };
        assert!(!stored.networks_differ(&incoming));
    }
}
