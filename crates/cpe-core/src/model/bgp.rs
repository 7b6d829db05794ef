//! BGP router configured through vtysh
//!
//! Announced networks are not part of the controller payload: they are
//! derived from the stored subnets every time the router is created or
//! modified.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Action, Kind, ManagedObject, ModifyOutcome, ReconcileContext};
use crate::Result;
use crate::net::arrcmp;
use crate::net::vtysh::VtyshScript;

/// Prefix limit applied to every neighbor on creation
const MAX_RECEIVED_PREFIXES: u32 = 1000;
const DEFAULT_MULTIHOP: u32 = 255;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BgpNeighbor {
    pub id: String,
    pub peer_address: String,
    pub peer_as: u64,
    #[serde(rename = "ebgpMutihop")]
    pub ebgp_multihop: u32,
    pub keep_alive: u32,
    pub hold_time: u32,
    #[serde(rename = "maxPerfix")]
    pub max_prefix: u32,
    pub password: String,
}

impl BgpNeighbor {
    /// Session lines for a neighbor that does not exist yet
    fn push_session(&self, script: &mut VtyshScript) {
        let peer = &self.peer_address;
        script.push(format!("neighbor {} remote-as {}", peer, self.peer_as));
        script.push(format!(
            "neighbor {} maximum-prefix {}",
            peer, MAX_RECEIVED_PREFIXES
        ));
        let hops = if self.ebgp_multihop == 0 {
            DEFAULT_MULTIHOP
        } else {
            self.ebgp_multihop
        };
        script.push(format!("neighbor {} ebgp-multihop {}", peer, hops));
        if !self.password.is_empty() {
            script.push(format!("neighbor {} password {}", peer, self.password));
        }
        if self.keep_alive != 0 && self.hold_time != 0 {
            script.push(format!(
                "neighbor {} timers {} {}",
                peer, self.keep_alive, self.hold_time
            ));
        }
    }

    /// Lines moving a neighbor with the same address from `self` to `new`
    fn push_delta(&self, new: &BgpNeighbor, script: &mut VtyshScript) {
        let peer = &new.peer_address;
        if self.peer_as != new.peer_as {
            script.push(format!("neighbor {} remote-as {}", peer, new.peer_as));
        }
        if self.ebgp_multihop != new.ebgp_multihop {
            script.push(format!(
                "neighbor {} ebgp-multihop {}",
                peer, new.ebgp_multihop
            ));
        }
        if self.password != new.password {
            if !self.password.is_empty() {
                script.toggle(true, format!("neighbor {} password {}", peer, self.password));
            }
            if !new.password.is_empty() {
                script.push(format!("neighbor {} password {}", peer, new.password));
            }
        }
        if self.keep_alive != new.keep_alive || self.hold_time != new.hold_time {
            script.push(format!(
                "neighbor {} timers {} {}",
                peer, new.keep_alive, new.hold_time
            ));
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BgpConf {
    /// 0 disables BGP
    pub local_as: u64,
    pub router_id: String,
    pub neigh_config: Vec<BgpNeighbor>,
    #[serde(alias = "Networks")]
    pub networks: Vec<String>,
}

impl BgpConf {
    fn router(&self) -> VtyshScript {
        VtyshScript::configure()
            .line(format!("router bgp {}", self.local_as))
            .line("no bgp ebgp-requires-policy")
            .line("no bgp suppress-duplicates")
            .line("no bgp network import-check")
    }

    /// Full router block for a fresh instance
    pub fn create_script(&self) -> VtyshScript {
        let mut script = self.router();
        if !self.router_id.is_empty() {
            script.push(format!("bgp router-id {}", self.router_id));
        }
        for neigh in &self.neigh_config {
            neigh.push_session(&mut script);
        }

        script.push("address-family ipv4 unicast");
        for neigh in &self.neigh_config {
            if neigh.max_prefix != 0 {
                script.push(format!(
                    "neighbor {} maximum-prefix {}",
                    neigh.peer_address, neigh.max_prefix
                ));
            }
        }
        for network in &self.networks {
            script.push(format!("network {}", network));
        }
        script
    }

    /// Delta script from `self` to `new`; both must share the local AS
    pub fn modify_script(&self, new: &BgpConf) -> VtyshScript {
        let mut script = self.router();

        if self.router_id != new.router_id {
            if !self.router_id.is_empty() {
                script.toggle(true, format!("bgp router-id {}", self.router_id));
            }
            if !new.router_id.is_empty() {
                script.push(format!("bgp router-id {}", new.router_id));
            }
        }

        for old in &self.neigh_config {
            match new.neigh_config.iter().find(|n| n.id == old.id) {
                Some(next) if next.peer_address != old.peer_address => {
                    script.toggle(
                        true,
                        format!("neighbor {} remote-as {}", old.peer_address, old.peer_as),
                    );
                    next.push_session(&mut script);
                }
                Some(next) => old.push_delta(next, &mut script),
                None => script.toggle(
                    true,
                    format!("neighbor {} remote-as {}", old.peer_address, old.peer_as),
                ),
            }
        }
        for next in &new.neigh_config {
            if !self.neigh_config.iter().any(|o| o.id == next.id) {
                next.push_session(&mut script);
            }
        }

        script.push("address-family ipv4 unicast");
        for next in &new.neigh_config {
            let before = self
                .neigh_config
                .iter()
                .find(|o| o.id == next.id)
                .map(|o| o.max_prefix);
            if next.max_prefix != 0 && before != Some(next.max_prefix) {
                script.push(format!(
                    "neighbor {} maximum-prefix {}",
                    next.peer_address, next.max_prefix
                ));
            }
        }
        let (added, removed) = arrcmp(&self.networks, &new.networks);
        for network in &removed {
            script.toggle(true, format!("network {}", network));
        }
        for network in &added {
            script.push(format!("network {}", network));
        }
        script
    }

    fn neighbors_differ(&self, new: &BgpConf) -> bool {
        if self.neigh_config.len() != new.neigh_config.len() {
            return true;
        }
        self.neigh_config
            .iter()
            .any(|old| new.neigh_config.iter().find(|n| n.id == old.id) != Some(old))
    }
}

#[async_trait]
impl ManagedObject for BgpConf {
    const KIND: Kind = Kind::Bgp;

    fn id(&self) -> &str {
        ""
    }

    async fn create(&mut self, ctx: &ReconcileContext, _action: Action) -> Result<()> {
        if self.local_as == 0 {
            return Ok(());
        }
        self.networks = ctx.subnet_networks().await?;
        self.create_script().run(ctx.exec()).await?;
        info!(local_as = self.local_as, neighbors = self.neigh_config.len(), networks = self.networks.len(), "bgp router configured");
        Ok(())
    }

    async fn modify(&mut self, ctx: &ReconcileContext, new: &Self) -> ModifyOutcome {
        if self.local_as != new.local_as {
            info!(from = self.local_as, to = new.local_as, "bgp local AS changed, rebuilding");
            if let Err(e) = self.destroy(ctx).await {
                return ModifyOutcome::failed(e);
            }
            let mut next = new.clone();
            let result = next.create(ctx, Action::Add).await;
            *self = next;
            return ModifyOutcome::new(true, result);
        }

        let networks = match ctx.subnet_networks().await {
            Ok(networks) => networks,
            Err(e) => return ModifyOutcome::failed(e),
        };
        let mut target = new.clone();
        target.networks = networks;

        let (added, removed) = arrcmp(&self.networks, &target.networks);
        let changed = !added.is_empty()
            || !removed.is_empty()
            || self.router_id != target.router_id
            || self.neighbors_differ(&target);
        if !changed {
            return ModifyOutcome::unchanged();
        }

        if self.local_as != 0 {
            if let Err(e) = self.modify_script(&target).run(ctx.exec()).await {
                return ModifyOutcome::failed(e);
            }
        }
        *self = target;
        ModifyOutcome::changed()
    }

    async fn destroy(&self, ctx: &ReconcileContext) -> Result<()> {
        if self.local_as == 0 {
            return Ok(());
        }
        VtyshScript::configure()
            .line(format!("no router bgp {}", self.local_as))
            .run(ctx.exec())
            .await?;
        info!(local_as = self.local_as, "bgp router removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn neighbor(id: &str, peer: &str) -> BgpNeighbor {
        BgpNeighbor {
            id: id.into(),
            peer_address: peer.into(),
            peer_as: 65001,
            ..Default::default()
        }
    }

    #[test]
    fn create_script_defaults_multihop_and_announces_networks() {
        let conf = BgpConf {
            local_as: 65539,
            router_id: "1.1.1.1".into(),
            neigh_config: vec![neighbor("n1", "10.0.0.2")],
            networks: vec!["192.168.1.0/24".into()],
        };
        let cmd = conf.create_script().render();
        assert!(cmd.contains(r#"-c "router bgp 65539""#));
        assert!(cmd.contains(r#"-c "bgp router-id 1.1.1.1""#));
        assert!(cmd.contains(r#"-c "neighbor 10.0.0.2 ebgp-multihop 255""#));
        assert!(cmd.contains(r#"-c "neighbor 10.0.0.2 maximum-prefix 1000""#));
        assert!(cmd.contains(r#"-c "network 192.168.1.0/24""#));
        assert!(cmd.ends_with(r#"-c "do write""#));
    }

    #[test]
    fn modify_script_emits_only_deltas() {
        let cur = BgpConf {
            local_as: 65539,
            neigh_config: vec![neighbor("n1", "10.0.0.2"), neighbor("n2", "10.0.0.3")],
            networks: vec!["192.168.1.0/24".into()],
            ..Default::default()
        };
        let mut new = cur.clone();
        new.neigh_config.remove(1);
        new.neigh_config[0].password = "s3cret".into();
        new.networks = vec!["192.168.2.0/24".into()];

        let cmd = cur.modify_script(&new).render();
        assert!(cmd.contains(r#"-c "no neighbor 10.0.0.3 remote-as 65001""#));
        assert!(cmd.contains(r#"-c "neighbor 10.0.0.2 password s3cret""#));
        assert!(!cmd.contains(r#"-c "neighbor 10.0.0.2 remote-as"#));
        assert!(cmd.contains(r#"-c "no network 192.168.1.0/24""#));
        assert!(cmd.contains(r#"-c "network 192.168.2.0/24""#));
    }

    #[test]
    fn neighbor_password_cannot_break_out_of_the_shell_quotes() {
        let mut neigh = neighbor("n1", "10.0.0.2");
        neigh.password = "x\"; reboot; echo $(id)`id`".into();
        let conf = BgpConf {
            local_as: 65001,
            neigh_config: vec![neigh],
            ..Default::default()
        };
        let cmd = conf.create_script().render();
        assert!(cmd.contains(r#"-c "neighbor 10.0.0.2 password x\"; reboot; echo \$(id)\`id\`""#));
    }

    #[test]
    fn neighbor_comparison_is_by_id() {
        let cur = BgpConf {
            local_as: 1,
            neigh_config: vec![neighbor("n1", "10.0.0.2"), neighbor("n2", "10.0.0.3")],
            ..Default::default()
        };
        let mut reordered = cur.clone();
        reordered.neigh_config.reverse();
        assert!(!cur.neighbors_differ(&reordered));
    }
}
