// # Object Model
//
// Typed configuration records for every managed object kind.
//
// ## Purpose
//
// Each kind knows how to turn itself into live-system state and back:
// - `create` programs the host assuming nothing exists yet for this id
// - `modify` compares the stored record with an incoming one and emits only
//   the commands for fields that differ
// - `destroy` undoes whatever `create` did, tolerating half-created objects
//
// Derived fields (`phyifName`, `nexthop`, `devAddr`, ...) are filled in by
// `create`/`modify` and persisted with the record so later diffs and
// dependent objects can use them without touching the host.
//
// ## Kinds
//
// - Collections (one store key per id): Port, Subnet, Static, Check, Conn
// - Singletons (one bare key): Bgp, Dns, Dhcp, Ha, General, Site

pub mod bgp;
pub mod check;
pub mod conn;
pub mod context;
pub mod dhcp;
pub mod dns;
pub mod fanout;
pub mod general;
pub mod ha;
pub mod ipsec;
pub mod port;
pub mod site;
pub mod ssl;
pub mod static_route;
pub mod subnet;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;

pub use bgp::{BgpConf, BgpNeighbor};
pub use check::CheckConf;
pub use conn::{ConnConf, ConnType};
pub use context::ReconcileContext;
pub use dhcp::{DhcpConf, DhcpPortNet};
pub use dns::{AccRule, DnsConf};
pub use general::GeneralConf;
pub use ha::{HaConf, HaPortVip, HaRole};
pub use ipsec::IpsecConf;
pub use port::PortConf;
pub use site::SiteConf;
pub use ssl::SslConf;
pub use static_route::StaticConf;
pub use subnet::SubnetConf;

use crate::Result;

/// Store key of the liveness checkpoint
pub const STATUS_KEY: &str = "/status";

/// Object kind tag
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Kind {
    Port,
    Subnet,
    Static,
    Check,
    Conn,
    Bgp,
    Dns,
    Dhcp,
    Ha,
    General,
    Site,
}

impl Kind {
    pub const ALL: [Kind; 11] = [
        Kind::Port,
        Kind::Subnet,
        Kind::Static,
        Kind::Check,
        Kind::Conn,
        Kind::Bgp,
        Kind::Dns,
        Kind::Dhcp,
        Kind::Ha,
        Kind::General,
        Kind::Site,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Kind::Port => "port",
            Kind::Subnet => "subnet",
            Kind::Static => "static",
            Kind::Check => "check",
            Kind::Conn => "conn",
            Kind::Bgp => "bgp",
            Kind::Dns => "dns",
            Kind::Dhcp => "dhcp",
            Kind::Ha => "ha",
            Kind::General => "general",
            Kind::Site => "site",
        }
    }

    /// Singletons live under one bare key instead of a prefix per id
    pub fn is_singleton(self) -> bool {
        !matches!(
            self,
            Kind::Port | Kind::Subnet | Kind::Static | Kind::Check | Kind::Conn
        )
    }

    /// Store prefix: `/port/` for collections, `/bgp` for singletons
    pub fn prefix(self) -> String {
        if self.is_singleton() {
            format!("/{}", self.as_str())
        } else {
            format!("/{}/", self.as_str())
        }
    }

    /// Store key for one object; `id` is ignored for singletons
    pub fn key(self, id: &str) -> String {
        if self.is_singleton() {
            self.prefix()
        } else {
            format!("{}{}", self.prefix(), id)
        }
    }

    /// Parse an API path segment
    pub fn parse(segment: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == segment)
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why `create` is being called
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// First application of a new object
    Add,
    /// Replay of a persisted object after reboot; derived fields are trusted
    Recover,
}

/// Result of a `modify` call
///
/// `changed` is reported independently of `result`: a modify may have
/// applied part of its delta (and must persist it) before failing.
#[derive(Debug)]
pub struct ModifyOutcome {
    pub changed: bool,
    pub result: Result<()>,
}

impl ModifyOutcome {
    /// Nothing differed; no commands were issued
    pub fn unchanged() -> Self {
        Self {
            changed: false,
            result: Ok(()),
        }
    }

    pub fn changed() -> Self {
        Self {
            changed: true,
            result: Ok(()),
        }
    }

    /// Failed before anything worth persisting was applied
    pub fn failed(err: crate::Error) -> Self {
        Self {
            changed: false,
            result: Err(err),
        }
    }

    pub fn new(changed: bool, result: Result<()>) -> Self {
        Self { changed, result }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

/// Uniform lifecycle of a managed object
///
/// # Contract
///
/// - `create` is idempotent under replay with the same data
/// - `modify(x, x)` returns unchanged and issues no commands
/// - after a changed `modify`, `self` is the record to persist
/// - `destroy` treats missing derived fields as nothing to undo
#[async_trait]
pub trait ManagedObject: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: Kind;

    /// Caller-assigned id; empty for singletons
    fn id(&self) -> &str;

    fn key(&self) -> String {
        Self::KIND.key(self.id())
    }

    async fn create(&mut self, ctx: &ReconcileContext, action: Action) -> Result<()>;

    async fn modify(&mut self, ctx: &ReconcileContext, new: &Self) -> ModifyOutcome;

    async fn destroy(&self, ctx: &ReconcileContext) -> Result<()>;
}

/// Full configuration document
///
/// Pushed to `configAll` or pulled from the controller's `dpConfig`.
/// Singletons absent from the document are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllConf {
    #[serde(default)]
    pub ts: i64,
    #[serde(default)]
    pub site_config: Option<SiteConf>,
    #[serde(default)]
    pub port_config: Vec<PortConf>,
    #[serde(default)]
    pub subnet_config: Vec<SubnetConf>,
    #[serde(default)]
    pub conn_config: Vec<ConnConf>,
    #[serde(default)]
    pub static_config: Vec<StaticConf>,
    #[serde(default)]
    pub check_config: Vec<CheckConf>,
    #[serde(default)]
    pub bgp_config: Option<BgpConf>,
    #[serde(default)]
    pub dns_config: Option<DnsConf>,
    #[serde(default)]
    pub dhcp_config: Option<DhcpConf>,
    #[serde(default)]
    pub ha_config: Option<HaConf>,
    #[serde(default)]
    pub general_config: Option<GeneralConf>,
}

/// Case-insensitive substring test used for the `wan`/`lan` naming rules
pub(crate) fn id_contains(id: &str, needle: &str) -> bool {
    id.to_ascii_lowercase().contains(needle)
}

/// Whether an id names a WAN port
pub fn is_wan(id: &str) -> bool {
    id_contains(id, "wan")
}

/// Whether an id names a WAN or LAN port (and so carries routes)
pub fn is_port_scoped(id: &str) -> bool {
    id_contains(id, "wan") || id_contains(id, "lan")
}
