//! IPsec tunnel managed through strongSwan's `swanctl`
//!
//! Each tunnel gets its own `<name>.conf` under the swanctl conf.d directory
//! and a route-based XFRM interface named after the tunnel, so routes and
//! NAT target the tunnel the same way they do for SSL tunnels.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::conn::set_tunnel_nat;
use super::ssl::apply_no_nat_diff;
use super::{Action, ModifyOutcome, ReconcileContext};
use crate::net::{arrcmp, link};
use crate::{Error, Result};

const ANY_SOURCE: &str = "0.0.0.0/0";
const DEFAULT_LIFETIME: &str = "3600";

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IpsecConf {
    pub name: String,
    /// Local outer address; `0.0.0.0/0` lets the kernel pick
    pub tunnel_src: String,
    pub tunnel_dst: String,
    /// Inner address of the XFRM interface
    pub local_address: String,
    pub remote_address: String,
    pub health_check: bool,
    pub nat: bool,
    pub no_nat_cidr: Vec<String>,
    pub bandwidth: u32,
    /// IKE rekey interval in seconds
    pub life_time: String,
    pub psk: String,
    pub local_id: String,
    pub remote_id: String,
    /// XFRM interface id; derived from the name when zero
    pub if_id: u32,
}

impl fmt::Debug for IpsecConf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IpsecConf")
            .field("name", &self.name)
            .field("tunnel_src", &self.tunnel_src)
            .field("tunnel_dst", &self.tunnel_dst)
            .field("local_address", &self.local_address)
            .field("psk", &"[REDACTED]")
            .field("if_id", &self.if_id)
            .field("nat", &self.nat)
            .finish()
    }
}

/// Stable non-zero interface id for a tunnel name (FNV-1a folded to 16 bits)
pub fn derive_if_id(name: &str) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for byte in name.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    (hash ^ (hash >> 16)) % 0xfffe + 1
}

impl IpsecConf {
    fn conf_path(&self, ctx: &ReconcileContext) -> PathBuf {
        ctx.paths.swanctl_dir.join(format!("{}.conf", self.name))
    }

    fn local_addrs(&self) -> &str {
        if self.tunnel_src.is_empty() || self.tunnel_src == ANY_SOURCE {
            "%any"
        } else {
            self.tunnel_src.as_str()
        }
    }

    fn rekey(&self) -> &str {
        if self.life_time.is_empty() {
            DEFAULT_LIFETIME
        } else {
            self.life_time.as_str()
        }
    }

    /// swanctl connection and secret definitions for this tunnel
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("connections {\n");
        out.push_str(&format!("    {} {{\n", self.name));
        out.push_str("        version = 2\n");
        out.push_str(&format!("        local_addrs = {}\n", self.local_addrs()));
        out.push_str(&format!("        remote_addrs = {}\n", self.tunnel_dst));
        out.push_str(&format!("        rekey_time = {}s\n", self.rekey()));
        out.push_str(&format!("        if_id_in = {}\n", self.if_id));
        out.push_str(&format!("        if_id_out = {}\n", self.if_id));
        out.push_str("        local {\n            auth = psk\n");
        if !self.local_id.is_empty() {
            out.push_str(&format!("            id = {}\n", self.local_id));
        }
        out.push_str("        }\n");
        out.push_str("        remote {\n            auth = psk\n");
        if !self.remote_id.is_empty() {
            out.push_str(&format!("            id = {}\n", self.remote_id));
        }
        out.push_str("        }\n");
        out.push_str("        children {\n");
        out.push_str(&format!("            {} {{\n", self.name));
        out.push_str("                local_ts = 0.0.0.0/0\n");
        out.push_str("                remote_ts = 0.0.0.0/0\n");
        out.push_str("                start_action = start\n");
        out.push_str("                dpd_action = restart\n");
        out.push_str("            }\n");
        out.push_str("        }\n");
        out.push_str("    }\n");
        out.push_str("}\n");
        out.push_str("secrets {\n");
        out.push_str(&format!("    ike-{} {{\n", self.name));
        if !self.remote_id.is_empty() {
            out.push_str(&format!("        id = {}\n", self.remote_id));
        }
        out.push_str(&format!("        secret = \"{}\"\n", self.psk.replace('"', "\\\"")));
        out.push_str("    }\n");
        out.push_str("}\n");
        out
    }

    async fn reload(&self, ctx: &ReconcileContext) -> Result<()> {
        ctx.exec().run("swanctl --load-all").await?;
        Ok(())
    }

    async fn ensure_interface(&self, ctx: &ReconcileContext) -> Result<()> {
        let exec = ctx.exec();
        if !link::device_exists(exec, &self.name).await {
            exec.run(&format!(
                "ip link add {} type xfrm if_id {}",
                self.name, self.if_id
            ))
            .await?;
        }
        link::link_up(exec, &self.name).await?;
        if !self.local_address.is_empty() {
            link::set_address(exec, &self.name, &self.local_address, true).await;
        }
        link::set_ingress_limit(exec, &self.name, self.bandwidth).await
    }

    pub async fn create(&mut self, ctx: &ReconcileContext, action: Action) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::invalid_input("ipsec tunnel without a name"));
        }
        if self.if_id == 0 {
            self.if_id = derive_if_id(&self.name);
        }

        if action == Action::Add {
            ctx.files().create_dir(&ctx.paths.swanctl_dir).await?;
            ctx.files().write(&self.conf_path(ctx), &self.render()).await?;
        }

        self.ensure_interface(ctx).await?;
        self.reload(ctx).await?;

        if self.nat {
            set_tunnel_nat(ctx, &self.name, &self.no_nat_cidr, true).await?;
        }
        info!(tunnel = %self.name, peer = %self.tunnel_dst, if_id = self.if_id, "ipsec tunnel up");
        Ok(())
    }

    /// Any change to the IKE definition re-renders and reloads the tunnel
    pub async fn modify(&mut self, ctx: &ReconcileContext, new: &IpsecConf) -> ModifyOutcome {
        let mut changed = false;

        let mut next = new.clone();
        next.name = self.name.clone();
        next.if_id = self.if_id;
        // NAT and bandwidth are applied incrementally below
        next.nat = self.nat;
        next.no_nat_cidr = self.no_nat_cidr.clone();
        next.bandwidth = self.bandwidth;

        if next.render() != self.render() || next.local_address != self.local_address {
            if self.local_address != next.local_address && !self.local_address.is_empty() {
                link::set_address(ctx.exec(), &self.name, &self.local_address, false).await;
            }
            *self = next;
            if let Err(e) = ctx.files().write(&self.conf_path(ctx), &self.render()).await {
                return ModifyOutcome::new(true, Err(e));
            }
            if !self.local_address.is_empty() {
                link::set_address(ctx.exec(), &self.name, &self.local_address, true).await;
            }
            if let Err(e) = ctx
                .exec()
                .run(&format!("swanctl --terminate --ike {}", self.name))
                .await
            {
                warn!(tunnel = %self.name, error = %e, "terminate before reload failed");
            }
            if let Err(e) = self.reload(ctx).await {
                return ModifyOutcome::new(true, Err(e));
            }
            info!(tunnel = %self.name, "ipsec tunnel reloaded");
            changed = true;
        } else if self.remote_address != new.remote_address || self.health_check != new.health_check {
            self.remote_address = new.remote_address.clone();
            self.health_check = new.health_check;
            changed = true;
        }

        if self.bandwidth != new.bandwidth {
            self.bandwidth = new.bandwidth;
            changed = true;
            if let Err(e) = link::set_ingress_limit(ctx.exec(), &self.name, self.bandwidth).await {
                return ModifyOutcome::new(true, Err(e));
            }
        }

        if self.nat != new.nat {
            let result = if self.nat {
                set_tunnel_nat(ctx, &self.name, &self.no_nat_cidr, false).await
            } else {
                set_tunnel_nat(ctx, &self.name, &new.no_nat_cidr, true).await
            };
            if let Err(e) = result {
                return ModifyOutcome::new(changed, Err(e));
            }
            self.nat = new.nat;
            self.no_nat_cidr = new.no_nat_cidr.clone();
            changed = true;
        } else if self.no_nat_cidr != new.no_nat_cidr {
            if self.nat {
                let (added, removed) = arrcmp(&self.no_nat_cidr, &new.no_nat_cidr);
                if let Err(e) = apply_no_nat_diff(ctx, &self.name, &added, &removed).await {
                    return ModifyOutcome::new(changed, Err(e));
                }
            }
            self.no_nat_cidr = new.no_nat_cidr.clone();
            changed = true;
        }

        ModifyOutcome::new(changed, Ok(()))
    }

    pub async fn destroy(&self, ctx: &ReconcileContext) -> Result<()> {
        if self.name.is_empty() {
            return Ok(());
        }
        if self.nat {
            set_tunnel_nat(ctx, &self.name, &self.no_nat_cidr, false).await?;
        }
        if let Err(e) = ctx
            .exec()
            .run(&format!("swanctl --terminate --ike {}", self.name))
            .await
        {
            warn!(tunnel = %self.name, error = %e, "terminate failed");
        }
        ctx.files().remove(&self.conf_path(ctx)).await?;
        self.reload(ctx).await?;
        if link::device_exists(ctx.exec(), &self.name).await {
            ctx.exec()
                .run(&format!("ip link del {}", self.name))
                .await?;
        }
        info!(tunnel = %self.name, "ipsec tunnel removed");
        Ok(())
    }
}
