//! Shared context handed to every object operation
//!
//! Bundles the collaborators and the cross-object lookups kinds need: the
//! nexthop of a port or tunnel, the subnet networks BGP announces, and the
//! `/32` statics the China-route set excludes.

use std::sync::Arc;

use tracing::warn;

use super::{ConnConf, Kind, ManagedObject, PortConf, StaticConf, SubnetConf, is_port_scoped};
use crate::config::{AgentConfig, HostPaths, ReconcileConfig};
use crate::health::AgentHealth;
use crate::keyed_lock::KeyedLock;
use crate::net::cidr::{dedup, prefix_len};
use crate::port_map::PortMap;
use crate::traits::{CommandExecutor, ConfigRenderer, ConfigStore};
use crate::{Error, Result};

#[derive(Clone)]
pub struct ReconcileContext {
    pub store: Arc<dyn ConfigStore>,
    pub exec: Arc<dyn CommandExecutor>,
    pub files: Arc<dyn ConfigRenderer>,
    pub port_map: Arc<PortMap>,
    pub paths: Arc<HostPaths>,
    pub settings: ReconcileConfig,
    pub health: Arc<AgentHealth>,
    pub sn: String,
    /// One mutex per store key, shared by every clone of the context
    locks: Arc<KeyedLock>,
}

impl ReconcileContext {
    pub fn new(
        config: &AgentConfig,
        store: Arc<dyn ConfigStore>,
        exec: Arc<dyn CommandExecutor>,
        files: Arc<dyn ConfigRenderer>,
        port_map: Arc<PortMap>,
        health: Arc<AgentHealth>,
    ) -> Self {
        Self {
            store,
            exec,
            files,
            port_map,
            paths: Arc::new(config.paths.clone()),
            settings: config.reconcile.clone(),
            health,
            sn: config.identity.sn.clone(),
            locks: Arc::new(KeyedLock::new()),
        }
    }

    /// Per-key locks guarding load-modify-save sequences on the store
    pub fn locks(&self) -> &KeyedLock {
        &self.locks
    }

    pub fn exec(&self) -> &dyn CommandExecutor {
        self.exec.as_ref()
    }

    pub fn files(&self) -> &dyn ConfigRenderer {
        self.files.as_ref()
    }

    /// Load one stored object; singletons ignore `id`
    pub async fn load<T: ManagedObject>(&self, id: &str) -> Result<Option<T>> {
        let key = T::KIND.key(id);
        match self.store.get(&key).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    /// Load every stored object of a collection kind
    ///
    /// Records that fail to parse are skipped with a warning so one corrupt
    /// key cannot hide the rest of the collection.
    pub async fn load_all<T: ManagedObject>(&self) -> Result<Vec<T>> {
        let prefix = T::KIND.prefix();
        let entries = self.store.get_all_by_prefix(&[prefix.as_str()]).await?;
        let mut objects = Vec::with_capacity(entries.len());
        for (key, raw) in entries {
            match serde_json::from_str::<T>(&raw) {
                Ok(obj) => objects.push(obj),
                Err(e) => warn!(key = %key, error = %e, "skipping unreadable record"),
            }
        }
        Ok(objects)
    }

    pub async fn save<T: ManagedObject>(&self, obj: &T) -> Result<()> {
        let raw = serde_json::to_string(obj)?;
        self.store.set(&obj.key(), &raw).await
    }

    pub async fn forget(&self, key: &str) -> Result<()> {
        self.store.delete(key).await
    }

    /// Kernel interface backing a logical port
    pub async fn resolve_phyif(&self, port_id: &str) -> Result<String> {
        self.port_map
            .resolve_phyif(
                self.exec(),
                self.files(),
                &self.paths.sys_class_net,
                port_id,
            )
            .await
    }

    /// Stored port by id
    pub async fn port(&self, id: &str) -> Result<PortConf> {
        self.load::<PortConf>(id)
            .await?
            .ok_or_else(|| Error::not_found(Kind::Port.key(id)))
    }

    /// Nexthop and source address for traffic leaving through `device`
    ///
    /// A port yields its gateway and address. A tunnel yields its own id
    /// (the tunnel interface is the route target) and its local address.
    /// Unknown devices yield empty strings, meaning "program no route".
    pub async fn nexthop_for(&self, device: &str) -> Result<(String, String)> {
        let device = device.to_ascii_lowercase();
        if let Some(port) = self.load::<PortConf>(&device).await? {
            return Ok((port.nexthop, port.ip_addr));
        }
        if let Some(conn) = self.load::<ConnConf>(&device).await? {
            return Ok((conn.id, conn.local_address));
        }
        Ok((String::new(), String::new()))
    }

    /// Networks announced over BGP
    ///
    /// Non-port subnets (SD-WAN zones) win when any exist; otherwise the
    /// WAN/LAN subnets are announced.
    pub async fn subnet_networks(&self) -> Result<Vec<String>> {
        let subnets = self.load_all::<SubnetConf>().await?;
        let (ported, zones): (Vec<_>, Vec<_>) =
            subnets.into_iter().partition(|s| is_port_scoped(&s.id));
        let pick = if zones.iter().any(|s| !s.cidrs.is_empty()) {
            zones
        } else {
            ported
        };
        Ok(dedup(pick.into_iter().flat_map(|s| s.cidrs).collect()))
    }

    /// Host routes carved out of the China-route set
    pub async fn static_ext_members(&self) -> Result<Vec<String>> {
        let statics = self.load_all::<StaticConf>().await?;
        Ok(statics
            .into_iter()
            .filter(|s| s.network.contains('/') && prefix_len(&s.network) == Some(32))
            .map(|s| s.network)
            .collect())
    }
}
