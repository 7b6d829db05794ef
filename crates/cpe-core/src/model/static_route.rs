//! Static route through a port or tunnel

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{Action, Kind, ManagedObject, ModifyOutcome, ReconcileContext};
use crate::Result;
use crate::net::vtysh;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StaticConf {
    pub id: String,
    /// Destination with prefix length
    pub network: String,
    /// Port or Conn id the route leaves through
    pub device: String,
    pub dev_addr: String,
    pub nexthop: String,
}

#[async_trait]
impl ManagedObject for StaticConf {
    const KIND: Kind = Kind::Static;

    fn id(&self) -> &str {
        &self.id
    }

    async fn create(&mut self, ctx: &ReconcileContext, _action: Action) -> Result<()> {
        let (nexthop, dev_addr) = ctx.nexthop_for(&self.device).await?;
        if nexthop.is_empty() {
            return Ok(());
        }

        vtysh::route(ctx.exec(), false, &self.network, &nexthop).await?;
        self.nexthop = nexthop;
        self.dev_addr = dev_addr;
        Ok(())
    }

    /// Only a device change moves the route
    async fn modify(&mut self, ctx: &ReconcileContext, new: &Self) -> ModifyOutcome {
        if self.device == new.device {
            return ModifyOutcome::unchanged();
        }

        let (nexthop, dev_addr) = match ctx.nexthop_for(&new.device).await {
            Ok(found) => found,
            Err(e) => return ModifyOutcome::failed(e),
        };

        let applied = match (self.nexthop.is_empty(), nexthop.is_empty()) {
            (true, true) => Ok(()),
            (false, true) => vtysh::route(ctx.exec(), true, &self.network, &self.nexthop).await,
            (true, false) => vtysh::route(ctx.exec(), false, &self.network, &nexthop).await,
            (false, false) => {
                vtysh::route_replace(ctx.exec(), &self.network, &self.nexthop, &nexthop).await
            }
        };
        if let Err(e) = applied {
            return ModifyOutcome::failed(e);
        }

        info!(static_route = %self.id, from = %self.device, to = %new.device, "static route moved");
        self.device = new.device.clone();
        self.nexthop = nexthop;
        self.dev_addr = dev_addr;
        ModifyOutcome::changed()
    }

    async fn destroy(&self, ctx: &ReconcileContext) -> Result<()> {
        if self.nexthop.is_empty() {
            return Ok(());
        }
        vtysh::route(ctx.exec(), true, &self.network, &self.nexthop).await
    }
}
