//! What to probe for each port and tunnel

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::Result;
use crate::model::{ConnConf, ConnType, Kind, PortConf};
use crate::traits::ConfigStore;

/// Live-state check used when no ping target is configured
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckType {
    /// strongSwan SA state
    Ipsec,
    /// Tunnel device flags
    Gre,
    /// Physical interface flags
    Port,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PingType {
    NoPing,
    /// Ping from inside the namespace named by the entry
    InNamespace,
    OutOfNamespace,
}

/// Which kind of object an entry tracks; only ports feed the root status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ObjectKind {
    Port,
    Conn,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSpec {
    pub check: CheckType,
    pub ping: PingType,
    pub object: ObjectKind,
    pub target: String,
    pub source: String,
}

/// One object the sampler should track this tick
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Observed {
    pub id: String,
    /// Interface or network namespace the probe runs against
    pub namespace: String,
    pub spec: CheckSpec,
}

fn ping_if(enabled: bool) -> PingType {
    if enabled {
        PingType::OutOfNamespace
    } else {
        PingType::NoPing
    }
}

impl Observed {
    pub fn from_port(port: &PortConf) -> Self {
        Self {
            id: port.id.clone(),
            namespace: port.phyif_name.clone(),
            spec: CheckSpec {
                check: CheckType::Port,
                ping: ping_if(!port.nexthop.is_empty()),
                object: ObjectKind::Port,
                target: port.nexthop.clone(),
                source: port.ip_addr.clone(),
            },
        }
    }

    /// Only Ipsec and Ssl tunnels are tracked
    pub fn from_conn(conn: &ConnConf) -> Option<Self> {
        let (check, info_health, remote, local) = match conn.kind().ok()? {
            ConnType::Ipsec => (
                CheckType::Ipsec,
                conn.ipsec_info.health_check,
                &conn.ipsec_info.remote_address,
                &conn.ipsec_info.local_address,
            ),
            ConnType::Ssl => (
                CheckType::Gre,
                conn.ssl_info.health_check,
                &conn.ssl_info.remote_address,
                &conn.ssl_info.local_address,
            ),
            _ => return None,
        };
        Some(Self {
            id: conn.id.clone(),
            namespace: String::new(),
            spec: CheckSpec {
                check,
                ping: ping_if(info_health),
                object: ObjectKind::Conn,
                target: remote.clone(),
                source: local.clone(),
            },
        })
    }
}

/// Read every port and tracked tunnel from the store, keyed by id
pub async fn snapshot(store: &dyn ConfigStore) -> Result<BTreeMap<String, Observed>> {
    let port_prefix = Kind::Port.prefix();
    let conn_prefix = Kind::Conn.prefix();
    let entries = store
        .get_all_by_prefix(&[port_prefix.as_str(), conn_prefix.as_str()])
        .await?;

    let mut observed = BTreeMap::new();
    for (key, raw) in entries {
        let parsed = if key.starts_with(&port_prefix) {
            serde_json::from_str::<PortConf>(&raw).map(|p| Some(Observed::from_port(&p)))
        } else {
            serde_json::from_str::<ConnConf>(&raw).map(|c| Observed::from_conn(&c))
        };
        match parsed {
            Ok(Some(obs)) => {
                observed.insert(obs.id.clone(), obs);
            }
            Ok(None) => {}
            Err(e) => warn!(key = %key, error = %e, "record skipped by sampler"),
        }
    }
    Ok(observed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_without_gateway_checks_flags() {
        let port = PortConf {
            id: "lan1".into(),
            phyif_name: "eth1".into(),
            ip_addr: "192.168.1.1/24".into(),
            ..Default::default()
        };
        let obs = Observed::from_port(&port);
        assert_eq!(obs.namespace, "eth1");
        assert_eq!(obs.spec.ping, PingType::NoPing);
        assert_eq!(obs.spec.check, CheckType::Port);
    }

    #[test]
    fn ssl_conn_pings_when_health_check_is_on() {
        let mut conn = ConnConf {
            id: "conn1".into(),
            conn_type: ConnType::Ssl.code(),
            ..Default::default()
        };
        conn.ssl_info.health_check = true;
        conn.ssl_info.remote_address = "10.8.0.1/30".into();
        conn.ssl_info.local_address = "10.8.0.2/30".into();
        let obs = Observed::from_conn(&conn).unwrap();
        assert_eq!(obs.spec.check, CheckType::Gre);
        assert_eq!(obs.spec.ping, PingType::OutOfNamespace);
        assert_eq!(obs.spec.target, "10.8.0.1/30");
    }

    #[test]
    fn gre_and_nat_conns_are_not_tracked() {
        let conn = ConnConf {
            id: "conn2".into(),
            conn_type: ConnType::Nat.code(),
            ..Default::default()
        };
        assert!(Observed::from_conn(&conn).is_none());
    }
}
