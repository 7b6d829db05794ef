//! OpenVPN client tunnel
//!
//! Each tunnel runs as the `sslclient@<name>_default` systemd unit, reading
//! its profile from `/home/sslclient/<name>/`. The tunnel device carries the
//! tunnel name, so routes and NAT rules can target it directly.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::conn::set_tunnel_nat;
use super::{Action, ModifyOutcome, ReconcileContext};
use crate::net::{arrcmp, firewall, link};
use crate::{Error, Result};

const PROFILE: &str = "default";

#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SslConf {
    pub name: String,
    /// Ingress limit in Mbit/s; 0 means unlimited
    pub bandwidth: u32,
    /// Server address
    pub tunnel_dst: String,
    pub local_address: String,
    pub remote_address: String,
    pub health_check: bool,
    pub nat: bool,
    pub no_nat_cidr: Vec<String>,
    /// Server port
    pub port: u16,
    /// Server protocol as configured (`udp`, `tcp-client`, ...)
    pub protocol: String,
    pub username: String,
    pub passwd: String,
    /// CA certificate (PEM) the server is verified against
    pub ca_cert: String,
    /// Normalized protocol written to the profile
    pub proto: String,
}

impl fmt::Debug for SslConf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SslConf")
            .field("name", &self.name)
            .field("bandwidth", &self.bandwidth)
            .field("tunnel_dst", &self.tunnel_dst)
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .field("username", &self.username)
            .field("passwd", &"[REDACTED]")
            .field("nat", &self.nat)
            .field("no_nat_cidr", &self.no_nat_cidr)
            .finish()
    }
}

fn normalize_proto(protocol: &str) -> &'static str {
    if protocol.to_ascii_lowercase().contains("udp") {
        "udp"
    } else {
        "tcp"
    }
}

impl SslConf {
    fn unit(&self) -> String {
        format!("sslclient@{}_{}", self.name, PROFILE)
    }

    fn work_dir(&self, ctx: &ReconcileContext) -> PathBuf {
        ctx.paths.ssl_client_dir.join(&self.name)
    }

    fn env_file(&self, ctx: &ReconcileContext) -> PathBuf {
        ctx.paths
            .ssl_client_dir
            .join(format!("{}_{}.env", self.name, PROFILE))
    }

    /// Client profile contents
    pub fn render_profile(&self) -> String {
        format!(
            "client\n\
             resolv-retry infinite\n\
             verb 3\n\
             remote {} {}\n\
             proto {}\n\
             dev {}\n\
             dev-type tun\n\
             auth-nocache\n\
             nobind\n\
             persist-key\n\
             persist-tun\n\
             cipher AES-128-CBC\n\
             tun-mtu 1392\n\
             tls-exit\n\
             auth-user-pass passwd.txt\n\
             ca ca.crt\n",
            self.tunnel_dst, self.port, self.proto, self.name
        )
    }

    async fn write_profile(&self, ctx: &ReconcileContext) -> Result<()> {
        let path = self
            .work_dir(ctx)
            .join(format!("{}_{}.ovpn", self.name, PROFILE));
        ctx.files().write(&path, &self.render_profile()).await
    }

    async fn write_credentials(&self, ctx: &ReconcileContext) -> Result<()> {
        let path = self.work_dir(ctx).join("passwd.txt");
        ctx.files()
            .write(&path, &format!("{}\n{}\n", self.username, self.passwd))
            .await
    }

    async fn write_ca(&self, ctx: &ReconcileContext) -> Result<()> {
        if self.ca_cert.trim().is_empty() {
            warn!(tunnel = %self.name, "no CA certificate configured");
        }
        let path = self.work_dir(ctx).join("ca.crt");
        ctx.files().write(&path, &self.ca_cert).await
    }

    /// Enable and restart the unit, wait for the device, re-apply the limit
    async fn restart(&self, ctx: &ReconcileContext) -> Result<()> {
        let unit = self.unit();
        ctx.exec()
            .run(&format!("systemctl enable {}", unit))
            .await?;
        ctx.exec()
            .run(&format!("systemctl restart {}", unit))
            .await?;

        let mut up = false;
        for _ in 0..ctx.settings.tunnel_wait_secs.max(1) {
            if link::device_exists(ctx.exec(), &self.name).await {
                up = true;
                break;
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        if !up {
            warn!(tunnel = %self.name, "tunnel device did not appear");
        }

        link::set_ingress_limit(ctx.exec(), &self.name, self.bandwidth).await
    }

    pub async fn create(&mut self, ctx: &ReconcileContext, action: Action) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::invalid_input("ssl tunnel without a name"));
        }

        if action == Action::Add {
            let dir = self.work_dir(ctx);
            ctx.files().remove_dir(&dir).await?;
            ctx.files().create_dir(&dir).await?;
            ctx.files().create_dir(&ctx.paths.ssl_log_dir).await?;
            ctx.files()
                .write(&self.env_file(ctx), &format!("nsId={}", self.name))
                .await?;
            self.write_ca(ctx).await?;
            self.proto = normalize_proto(&self.protocol).to_string();
            self.write_profile(ctx).await?;
            self.write_credentials(ctx).await?;
        }

        self.restart(ctx).await?;

        if self.nat {
            set_tunnel_nat(ctx, &self.name, &self.no_nat_cidr, true).await?;
        }
        info!(tunnel = %self.name, server = %self.tunnel_dst, "ssl tunnel up");
        Ok(())
    }

    pub async fn modify(&mut self, ctx: &ReconcileContext, new: &SslConf) -> ModifyOutcome {
        let mut changed = false;
        let mut server_changed = false;

        if self.tunnel_dst != new.tunnel_dst || self.port != new.port {
            self.tunnel_dst = new.tunnel_dst.clone();
            self.port = new.port;
            changed = true;
            server_changed = true;
        }
        if self.protocol != new.protocol {
            self.protocol = new.protocol.clone();
            self.proto = normalize_proto(&new.protocol).to_string();
            changed = true;
            server_changed = true;
        }

        if self.bandwidth != new.bandwidth {
            self.bandwidth = new.bandwidth;
            changed = true;
            if let Err(e) = link::set_ingress_limit(ctx.exec(), &self.name, self.bandwidth).await {
                return ModifyOutcome::new(true, Err(e));
            }
        }

        if self.username != new.username || self.passwd != new.passwd {
            self.username = new.username.clone();
            self.passwd = new.passwd.clone();
            if let Err(e) = self.write_credentials(ctx).await {
                return ModifyOutcome::new(changed, Err(e));
            }
            changed = true;
            server_changed = true;
        }

        if self.ca_cert != new.ca_cert {
            self.ca_cert = new.ca_cert.clone();
            if let Err(e) = self.write_ca(ctx).await {
                return ModifyOutcome::new(changed, Err(e));
            }
            changed = true;
            server_changed = true;
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
        } else if self.nat {
            let (added, removed) = arrcmp(&self.no_nat_cidr, &new.no_nat_cidr);
            if !added.is_empty() || !removed.is_empty() {
                if let Err(e) = apply_no_nat_diff(ctx, &self.name, &added, &removed).await {
                    return ModifyOutcome::new(changed, Err(e));
                }
                self.no_nat_cidr = new.no_nat_cidr.clone();
                changed = true;
            }
        } else if self.no_nat_cidr != new.no_nat_cidr {
            self.no_nat_cidr = new.no_nat_cidr.clone();
            changed = true;
        }

        if self.local_address != new.local_address
            || self.remote_address != new.remote_address
            || self.health_check != new.health_check
        {
            self.local_address = new.local_address.clone();
            self.remote_address = new.remote_address.clone();
            self.health_check = new.health_check;
            changed = true;
        }

        if server_changed {
            if let Err(e) = self.write_profile(ctx).await {
                return ModifyOutcome::new(true, Err(e));
            }
            if let Err(e) = self.restart(ctx).await {
                return ModifyOutcome::new(true, Err(e));
            }
            info!(tunnel = %self.name, "ssl tunnel restarted");
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

        let unit = self.unit();
        ctx.exec().run(&format!("systemctl stop {}", unit)).await?;
        ctx.exec()
            .run(&format!("systemctl disable {}", unit))
            .await?;

        ctx.files().remove_dir(&self.work_dir(ctx)).await?;
        ctx.files().remove_dir(&ctx.paths.ssl_log_dir).await?;
        ctx.files().remove(&self.env_file(ctx)).await?;
        info!(tunnel = %self.name, "ssl tunnel removed");
        Ok(())
    }
}

pub(crate) async fn apply_no_nat_diff(
    ctx: &ReconcileContext,
    device: &str,
    added: &[String],
    removed: &[String],
) -> Result<()> {
    for cidr in removed {
        firewall::remove_nat(ctx.exec(), &firewall::NatRule::NoSnat { device, cidr }).await?;
    }
    for cidr in added {
        firewall::ensure_nat(ctx.exec(), &firewall::NatRule::NoSnat { device, cidr }).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn profile_uses_normalized_proto() {
        let ssl = SslConf {
            name: "conn7".into(),
            tunnel_dst: "203.0.113.9".into(),
            port: 1194,
            proto: normalize_proto("UDP4").into(),
            ..Default::default()
        };
        let profile = ssl.render_profile();
        assert!(profile.contains("remote 203.0.113.9 1194\n"));
        assert!(profile.contains("proto udp\n"));
        assert!(profile.contains("dev conn7\n"));
        assert!(profile.ends_with("ca ca.crt\n"));
        assert_eq!(normalize_proto("tcp-client"), "tcp");
    }

    #[test]
    fn debug_hides_password() {
        let ssl = SslConf {
            passwd: "hunter2".into(),
            ..Default::default()
        };
        assert!(!format!("{:?}", ssl).contains("hunter2"));
    }
}
