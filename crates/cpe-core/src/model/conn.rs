//! Connection (tunnel) objects
//!
//! A Conn is the controller's view of an overlay link. Ipsec and Ssl conns
//! own a tunnel sub-object that does the host work; Eport, Gre and Nat conns
//! are recorded so statics and checks can route through them.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Action, IpsecConf, Kind, ManagedObject, ModifyOutcome, ReconcileContext, SslConf};
use crate::net::firewall::{self, NatRule};
use crate::{Error, Result};

const ANY_SOURCE: &str = "0.0.0.0/0";

/// Transport of a Conn, as carried in the numeric `type` field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnType {
    Eport,
    Gre,
    Ipsec,
    Nat,
    Ssl,
}

impl ConnType {
    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0 => Ok(Self::Eport),
            1 => Ok(Self::Gre),
            2 => Ok(Self::Ipsec),
            3 => Ok(Self::Nat),
            5 => Ok(Self::Ssl),
            other => Err(Error::UnknownConnType(other)),
        }
    }

    pub fn code(self) -> u8 {
        match self {
            Self::Eport => 0,
            Self::Gre => 1,
            Self::Ipsec => 2,
            Self::Nat => 3,
            Self::Ssl => 5,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnConf {
    pub id: String,
    pub port_id: String,
    /// Raw transport code; unknown codes are rejected at create time
    #[serde(rename = "type")]
    pub conn_type: u8,
    pub bandwidth: u32,
    pub tunnel_src: String,
    pub tunnel_dst: String,
    pub local_address: String,
    pub remote_address: String,
    pub health_check: bool,
    pub nat: bool,
    pub no_nat_cidr: Vec<String>,
    pub ipsec_info: IpsecConf,
    pub ssl_info: SslConf,
    pub conn_name: String,
}

impl ConnConf {
    pub fn kind(&self) -> Result<ConnType> {
        ConnType::from_code(self.conn_type)
    }

    /// Conn-level fields the tunnel sub-objects inherit
    fn fill_ipsec(&self, ipsec: &mut IpsecConf) {
        ipsec.tunnel_src = if self.tunnel_src.is_empty() {
            ANY_SOURCE.to_string()
        } else {
            self.tunnel_src.clone()
        };
        ipsec.bandwidth = 0;
        ipsec.life_time = "3600".to_string();
        ipsec.tunnel_dst = self.tunnel_dst.clone();
        ipsec.local_address = self.local_address.clone();
        ipsec.remote_address = self.remote_address.clone();
        ipsec.health_check = self.health_check;
        ipsec.nat = self.nat;
        ipsec.no_nat_cidr = self.no_nat_cidr.clone();
    }

    fn fill_ssl(&self, ssl: &mut SslConf) {
        ssl.bandwidth = self.bandwidth;
        ssl.tunnel_dst = self.tunnel_dst.clone();
        ssl.local_address = self.local_address.clone();
        ssl.remote_address = self.remote_address.clone();
        ssl.health_check = self.health_check;
        ssl.nat = self.nat;
        ssl.no_nat_cidr = self.no_nat_cidr.clone();
    }

    /// Conn-level fields only, with the sub-objects blanked
    fn outer(&self) -> ConnConf {
        ConnConf {
            ipsec_info: IpsecConf::default(),
            ssl_info: SslConf::default(),
            conn_name: String::new(),
            ..self.clone()
        }
    }

    async fn recreate(&mut self, ctx: &ReconcileContext, new: &Self) -> ModifyOutcome {
        info!(conn = %self.id, from = self.conn_type, to = new.conn_type, "conn type changed, recreating");
        if let Err(e) = self.destroy(ctx).await {
            return ModifyOutcome::failed(e);
        }
        let mut next = new.clone();
        let result = next.create(ctx, Action::Add).await;
        // The old tunnel is gone either way; the record must follow
        *self = next;
        ModifyOutcome::new(true, result)
    }
}

#[async_trait]
impl ManagedObject for ConnConf {
    const KIND: Kind = Kind::Conn;

    fn id(&self) -> &str {
        &self.id
    }

    async fn create(&mut self, ctx: &ReconcileContext, action: Action) -> Result<()> {
        let kind = self.kind()?;
        self.conn_name = self.id.clone();

        match kind {
            ConnType::Eport | ConnType::Gre | ConnType::Nat => {}
            ConnType::Ipsec => {
                let mut ipsec = std::mem::take(&mut self.ipsec_info);
                ipsec.name = self.conn_name.clone();
                if action == Action::Add {
                    self.fill_ipsec(&mut ipsec);
                }
                let result = ipsec.create(ctx, action).await;
                self.ipsec_info = ipsec;
                result?;
            }
            ConnType::Ssl => {
                let mut ssl = std::mem::take(&mut self.ssl_info);
                ssl.name = self.conn_name.clone();
                if action == Action::Add {
                    self.fill_ssl(&mut ssl);
                }
                let result = ssl.create(ctx, action).await;
                self.ssl_info = ssl;
                result?;
            }
        }
        Ok(())
    }

    async fn modify(&mut self, ctx: &ReconcileContext, new: &Self) -> ModifyOutcome {
        if self.conn_type != new.conn_type {
            return self.recreate(ctx, new).await;
        }
        let kind = match self.kind() {
            Ok(kind) => kind,
            Err(e) => return ModifyOutcome::failed(e),
        };

        let mut outcome = match kind {
            ConnType::Eport | ConnType::Gre | ConnType::Nat => ModifyOutcome::unchanged(),
            ConnType::Ipsec => {
                let mut target = new.ipsec_info.clone();
                new.fill_ipsec(&mut target);
                target.name = self.ipsec_info.name.clone();
                self.ipsec_info.modify(ctx, &target).await
            }
            ConnType::Ssl => {
                let mut target = new.ssl_info.clone();
                new.fill_ssl(&mut target);
                target.name = self.ssl_info.name.clone();
                self.ssl_info.modify(ctx, &target).await
            }
        };

        if self.outer() != new.outer() {
            let ipsec = std::mem::take(&mut self.ipsec_info);
            let ssl = std::mem::take(&mut self.ssl_info);
            let name = std::mem::take(&mut self.conn_name);
            *self = ConnConf {
                ipsec_info: ipsec,
                ssl_info: ssl,
                conn_name: name,
                ..new.outer()
            };
            outcome.changed = true;
        }
        outcome
    }

    async fn destroy(&self, ctx: &ReconcileContext) -> Result<()> {
        match self.kind() {
            Ok(ConnType::Ipsec) => self.ipsec_info.destroy(ctx).await,
            Ok(ConnType::Ssl) => self.ssl_info.destroy(ctx).await,
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(conn = %self.id, error = %e, "nothing to undo for unknown conn type");
                Ok(())
            }
        }
    }
}

/// MASQUERADE on a tunnel plus one SNAT exemption per CIDR
pub(crate) async fn set_tunnel_nat(
    ctx: &ReconcileContext,
    device: &str,
    no_nat: &[String],
    present: bool,
) -> Result<()> {
    let exec = ctx.exec();
    firewall::set_nat(exec, &NatRule::Masquerade { device }, present).await?;
    for cidr in no_nat {
        firewall::set_nat(exec, &NatRule::NoSnat { device, cidr }, present).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_codes_round_trip_and_reject_unknown() {
        for kind in [
            ConnType::Eport,
            ConnType::Gre,
            ConnType::Ipsec,
            ConnType::Nat,
            ConnType::Ssl,
        ] {
            assert_eq!(ConnType::from_code(kind.code()).unwrap(), kind);
        }
        assert!(matches!(
            ConnType::from_code(4),
            Err(Error::UnknownConnType(4))
        ));
    }

    #[test]
    fn ipsec_inherits_conn_fields() {
        let conn = ConnConf {
            id: "conn1".into(),
            conn_type: 2,
            bandwidth: 50,
            tunnel_dst: "198.51.100.1".into(),
            nat: true,
            no_nat_cidr: vec!["10.0.0.0/8".into()],
            ..Default::default()
        };
        let mut ipsec = IpsecConf::default();
        conn.fill_ipsec(&mut ipsec);
        assert_eq!(ipsec.tunnel_src, ANY_SOURCE);
        assert_eq!(ipsec.bandwidth, 0);
        assert_eq!(ipsec.life_time, "3600");
        assert!(ipsec.nat);
        assert_eq!(ipsec.no_nat_cidr, vec!["10.0.0.0/8".to_string()]);
    }

    #[test]
    fn unknown_type_still_deserializes() {
        let conn: ConnConf = serde_json::from_str(r#"{"id": "c9", "type": 9}"#).unwrap();
        assert_eq!(conn.conn_type, 9);
        assert!(conn.kind().is_err());
    }
}
