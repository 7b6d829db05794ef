//! Subnet: a set of CIDRs routed through a port's gateway
//!
//! Only subnets whose id names a WAN or LAN port carry routes. Other
//! subnets (SD-WAN zones) are recorded for BGP announcement only.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Action, Kind, ManagedObject, ModifyOutcome, ReconcileContext, is_port_scoped};
use crate::Result;
use crate::net::{arrcmp, vtysh};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubnetConf {
    pub id: String,
    pub cidrs: Vec<String>,
    pub dev_addr: String,
    pub nexthop: String,
}

#[async_trait]
impl ManagedObject for SubnetConf {
    const KIND: Kind = Kind::Subnet;

    fn id(&self) -> &str {
        &self.id
    }

    async fn create(&mut self, ctx: &ReconcileContext, _action: Action) -> Result<()> {
        if !is_port_scoped(&self.id) {
            return Ok(());
        }

        let (nexthop, dev_addr) = ctx.nexthop_for(&self.id).await?;
        if nexthop.is_empty() {
            debug!(subnet = %self.id, "no nexthop, routes deferred");
            return Ok(());
        }

        vtysh::route_batch(
            ctx.exec(),
            false,
            &self.cidrs,
            &nexthop,
            ctx.settings.route_batch,
        )
        .await?;
        info!(subnet = %self.id, count = self.cidrs.len(), nexthop = %nexthop, "subnet routes added");

        self.nexthop = nexthop;
        self.dev_addr = dev_addr;
        Ok(())
    }

    async fn modify(&mut self, ctx: &ReconcileContext, new: &Self) -> ModifyOutcome {
        let (added, removed) = arrcmp(&self.cidrs, &new.cidrs);
        if added.is_empty() && removed.is_empty() {
            return ModifyOutcome::unchanged();
        }

        if !is_port_scoped(&self.id) || self.nexthop.is_empty() {
            self.cidrs = new.cidrs.clone();
            return ModifyOutcome::changed();
        }

        // Add before delete so covered traffic never loses its route
        let batch = ctx.settings.route_batch;
        if !added.is_empty() {
            if let Err(e) = vtysh::route_batch(ctx.exec(), false, &added, &self.nexthop, batch).await {
                return ModifyOutcome::failed(e);
            }
        }
        if !removed.is_empty() {
            if let Err(e) = vtysh::route_batch(ctx.exec(), true, &removed, &self.nexthop, batch).await {
                return ModifyOutcome::failed(e);
            }
        }

        info!(subnet = %self.id, added = added.len(), removed = removed.len(), "subnet routes updated");
        self.cidrs = new.cidrs.clone();
        ModifyOutcome::changed()
    }

    async fn destroy(&self, ctx: &ReconcileContext) -> Result<()> {
        if !is_port_scoped(&self.id) || self.nexthop.is_empty() {
            return Ok(());
        }
        vtysh::route_batch(
            ctx.exec(),
            true,
            &self.cidrs,
            &self.nexthop,
            ctx.settings.route_batch,
        )
        .await
    }
}
