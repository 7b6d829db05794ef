//! Reconciler: converges the host onto a configuration document
//!
//! The Reconciler is responsible for:
//! - Diffing a full document against the store, kind by kind
//! - Serialising single-object API calls per store key
//! - Persisting every object whose create succeeded or whose modify changed it
//! - Replaying persisted state after a reboot
//!
//! ## Phase Order
//!
//! ```text
//!  upsert   Port → Subnet → Conn → Static → Check
//!  remove   Check → Static → Conn → Subnet        (absent from document)
//!  upsert   Bgp → Dns → Dhcp → Ha → General → Site
//!  remove   Port                                   (absent from document)
//! ```
//!
//! Ports come first because every other kind derives its nexthop from them,
//! and go last on removal so dependents never route through a vanished
//! gateway. Singletons read the already reconciled ports and subnets.
//!
//! ## Failure Isolation
//!
//! A failing object is logged and skipped; its stored record is left as it
//! was, so the next full pass retries it.

mod dispatch;

use std::collections::HashSet;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::model::{
    Action, AllConf, ConnConf, Kind, ManagedObject, PortConf, ReconcileContext, dhcp, dns, fanout,
    general, ha,
};
use crate::net::firewall;

pub use dispatch::ObjectRequest;

/// Capacity of the event channel handed out by [`Reconciler::new`]
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// MSS applied to forwarded SYNs so tunnelled traffic fits the overlay MTU
const TUNNEL_MSS: u16 = 1300;

/// Events emitted by the Reconciler
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileEvent {
    /// Object created and persisted
    Created { key: String },

    /// Object modified and persisted
    Modified { key: String },

    /// Object destroyed and its record removed
    Destroyed { key: String },

    /// An operation failed; the stored record is unchanged
    Failed { key: String, error: String },

    /// A full document pass finished
    PassCompleted { failures: usize },
}

/// Applies documents and single-object calls against the host
pub struct Reconciler {
    ctx: ReconcileContext,
    event_tx: mpsc::Sender<ReconcileEvent>,
}

impl Reconciler {
    /// Create a reconciler and the receiver of its events
    ///
    /// Dropping the receiver is fine; events are then discarded.
    pub fn new(ctx: ReconcileContext) -> (Self, mpsc::Receiver<ReconcileEvent>) {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let reconciler = Self {
            ctx,
            event_tx: tx,
        };
        (reconciler, rx)
    }

    pub fn context(&self) -> &ReconcileContext {
        &self.ctx
    }

    /// Apply a full configuration document
    ///
    /// Returns the number of objects that failed. Failures never stop the pass.
    pub async fn apply_all(&self, doc: &AllConf) -> usize {
        info!(
            ports = doc.port_config.len(),
            subnets = doc.subnet_config.len(),
            conns = doc.conn_config.len(),
            statics = doc.static_config.len(),
            checks = doc.check_config.len(),
            "applying configuration document"
        );

        let mut failures = 0;

        failures += self.upsert_all(&doc.port_config).await;
        failures += self.upsert_all(&doc.subnet_config).await;
        failures += self.upsert_all(&doc.conn_config).await;
        failures += self.upsert_all(&doc.static_config).await;
        failures += self.upsert_all(&doc.check_config).await;

        failures += self.remove_absent(&doc.check_config).await;
        failures += self.remove_absent(&doc.static_config).await;
        failures += self.remove_absent(&doc.conn_config).await;
        failures += self.remove_absent(&doc.subnet_config).await;

        failures += self.upsert_singleton(doc.bgp_config.as_ref()).await;
        failures += self.upsert_singleton(doc.dns_config.as_ref()).await;
        failures += self.upsert_singleton(doc.dhcp_config.as_ref()).await;
        failures += self.upsert_singleton(doc.ha_config.as_ref()).await;
        failures += self.upsert_singleton(doc.general_config.as_ref()).await;
        failures += self.upsert_singleton(doc.site_config.as_ref()).await;

        failures += self.remove_absent(&doc.port_config).await;

        if failures == 0 {
            info!("configuration document applied");
        } else {
            warn!(failures, "configuration document applied with failures");
        }
        self.emit_event(ReconcileEvent::PassCompleted { failures });
        failures
    }

    async fn upsert_all<T: ManagedObject>(&self, incoming: &[T]) -> usize {
        let mut failures = 0;
        for obj in incoming {
            let key = obj.key();
            let _guard = self.ctx.locks().lock(&key).await;
            if let Err(e) = self.upsert_locked(obj).await {
                error!(key = %key, error = %e, "object not reconciled");
                self.emit_event(ReconcileEvent::Failed {
                    key,
                    error: e.to_string(),
                });
                failures += 1;
            }
        }
        failures
    }

    async fn upsert_singleton<T: ManagedObject>(&self, incoming: Option<&T>) -> usize {
        match incoming {
            Some(obj) => self.upsert_all(std::slice::from_ref(obj)).await,
            None => {
                debug!(kind = %T::KIND, "singleton absent from document, left untouched");
                0
            }
        }
    }

    /// Create when absent, modify when present; caller holds the key lock
    async fn upsert_locked<T: ManagedObject>(&self, incoming: &T) -> Result<()> {
        match self.ctx.load::<T>(incoming.id()).await? {
            None => self.create_locked(incoming).await,
            Some(current) => self.modify_locked(current, incoming).await,
        }
    }

    async fn create_locked<T: ManagedObject>(&self, incoming: &T) -> Result<()> {
        let mut obj = incoming.clone();
        obj.create(&self.ctx, Action::Add).await?;
        self.ctx.save(&obj).await?;
        info!(key = %obj.key(), "object created");
        self.emit_event(ReconcileEvent::Created { key: obj.key() });
        Ok(())
    }

    async fn modify_locked<T: ManagedObject>(&self, mut current: T, incoming: &T) -> Result<()> {
        let outcome = current.modify(&self.ctx, incoming).await;
        if outcome.changed {
            self.ctx.save(&current).await?;
            info!(key = %current.key(), "object modified");
            self.emit_event(ReconcileEvent::Modified {
                key: current.key(),
            });
        } else {
            debug!(key = %current.key(), "object unchanged");
        }
        outcome.result
    }

    /// Destroy stored objects of `T`'s kind missing from `incoming`
    async fn remove_absent<T: ManagedObject>(&self, incoming: &[T]) -> usize {
        let keep: HashSet<String> = incoming.iter().map(|o| o.key()).collect();
        let stored = match self.ctx.load_all::<T>().await {
            Ok(stored) => stored,
            Err(e) => {
                error!(kind = %T::KIND, error = %e, "stored objects unreadable");
                return 1;
            }
        };

        let mut failures = 0;
        for obj in stored.iter().filter(|o| !keep.contains(&o.key())) {
            let key = obj.key();
            let _guard = self.ctx.locks().lock(&key).await;
            if let Err(e) = self.destroy_locked(obj).await {
                error!(key = %key, error = %e, "object not removed");
                self.emit_event(ReconcileEvent::Failed {
                    key,
                    error: e.to_string(),
                });
                failures += 1;
            }
        }
        failures
    }

    async fn destroy_locked<T: ManagedObject>(&self, obj: &T) -> Result<()> {
        obj.destroy(&self.ctx).await?;
        let key = obj.key();
        self.ctx.forget(&key).await?;
        info!(key = %key, "object destroyed");
        self.emit_event(ReconcileEvent::Destroyed { key });
        Ok(())
    }

    /// Create one collection object; fails if the id is taken
    pub async fn create<T: ManagedObject>(&self, obj: &T) -> Result<()> {
        let key = obj.key();
        let _guard = self.ctx.locks().lock(&key).await;
        if self.ctx.load::<T>(obj.id()).await?.is_some() {
            return Err(Error::already_exists(key));
        }
        self.create_locked(obj).await
    }

    /// Modify one collection object; fails if the id is unknown
    pub async fn modify<T: ManagedObject>(&self, obj: &T) -> Result<()> {
        let key = obj.key();
        let _guard = self.ctx.locks().lock(&key).await;
        let current = self
            .ctx
            .load::<T>(obj.id())
            .await?
            .ok_or_else(|| Error::not_found(key.clone()))?;
        self.modify_locked(current, obj).await
    }

    /// Destroy one collection object by id
    pub async fn delete<T: ManagedObject>(&self, id: &str) -> Result<()> {
        let key = T::KIND.key(id);
        let _guard = self.ctx.locks().lock(&key).await;
        let current = self
            .ctx
            .load::<T>(id)
            .await?
            .ok_or_else(|| Error::not_found(key.clone()))?;
        self.destroy_locked(&current).await
    }

    /// Create or modify a singleton
    pub async fn put<T: ManagedObject>(&self, obj: &T) -> Result<()> {
        let key = obj.key();
        let _guard = self.ctx.locks().lock(&key).await;
        self.upsert_locked(obj).await
    }

    /// Record an address or gateway the host picked up on a WAN port
    ///
    /// Dependents follow a gateway move before the port lock is released.
    /// Returns whether the stored port changed.
    pub async fn update_wan(&self, id: &str, ip_addr: &str, nexthop: &str) -> Result<bool> {
        let key = Kind::Port.key(id);
        let _guard = self.ctx.locks().lock(&key).await;
        let before = self
            .ctx
            .load::<PortConf>(id)
            .await?
            .ok_or_else(|| Error::not_found(key.clone()))?;
        if before.ip_addr == ip_addr && before.nexthop == nexthop {
            return Ok(false);
        }

        let mut after = before.clone();
        after.ip_addr = ip_addr.to_string();
        after.nexthop = nexthop.to_string();
        self.ctx.save(&after).await?;
        info!(port = %id, ip = %ip_addr, nexthop = %nexthop, "wan address updated");
        self.emit_event(ReconcileEvent::Modified { key });

        if before.nexthop != nexthop {
            fanout::update_nexthop(&self.ctx, &before, nexthop, ip_addr).await?;
        }
        Ok(true)
    }

    /// Replay persisted state onto a freshly booted host
    ///
    /// Ports and tunnels are re-created with [`Action::Recover`], which
    /// trusts their stored derived fields. Singletons restore their daemons.
    /// Per-object failures are logged and skipped.
    pub async fn recover(&self) -> Result<()> {
        let exec = self.ctx.exec();
        for cmd in [
            "sysctl -w net.ipv4.ip_forward=1",
            "sysctl -w net.ipv4.conf.all.rp_filter=0",
        ] {
            if let Err(e) = exec.run(cmd).await {
                warn!(cmd, error = %e, "sysctl failed");
            }
        }
        if let Err(e) = firewall::ensure_mss_clamp(exec, TUNNEL_MSS).await {
            warn!(error = %e, "MSS clamp not installed");
        }

        if self.ctx.sn.is_empty() {
            return Err(Error::config("serial number not set, recovery aborted"));
        }

        self.recover_kind::<PortConf>().await?;
        self.recover_kind::<ConnConf>().await?;

        if let Err(e) = dns::recover(&self.ctx).await {
            error!(error = %e, "dns recovery failed");
        }
        if let Err(e) = dhcp::recover(&self.ctx).await {
            error!(error = %e, "dhcp recovery failed");
        }
        if let Err(e) = ha::recover(&self.ctx).await {
            error!(error = %e, "ha recovery failed");
        }
        if let Err(e) = general::recover(&self.ctx).await {
            error!(error = %e, "general recovery failed");
        }
        if self.ctx.files().exists(&self.ctx.paths.ha_local_nat).await {
            self.ctx.files().remove(&self.ctx.paths.ha_local_nat).await?;
        }

        exec.run("systemctl restart frr").await?;
        info!("configuration recovered");
        Ok(())
    }

    async fn recover_kind<T: ManagedObject>(&self) -> Result<()> {
        for mut obj in self.ctx.load_all::<T>().await? {
            match obj.create(&self.ctx, Action::Recover).await {
                Ok(()) => info!(key = %obj.key(), "object recovered"),
                Err(e) => error!(key = %obj.key(), error = %e, "object not recovered"),
            }
        }
        Ok(())
    }

    fn emit_event(&self, event: ReconcileEvent) {
        if let Err(TrySendError::Full(_)) = self.event_tx.try_send(event) {
            warn!("Reconcile event channel full, dropping event");
        }
    }
}
