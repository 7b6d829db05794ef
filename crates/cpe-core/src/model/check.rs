//! Network check target
//!
//! A check only records which egress it probes through; it programs nothing.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::{Action, Kind, ManagedObject, ModifyOutcome, ReconcileContext};
use crate::Result;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckConf {
    pub id: String,
    pub target: String,
    pub device: String,
    pub dev_addr: String,
    pub nexthop: String,
}

#[async_trait]
impl ManagedObject for CheckConf {
    const KIND: Kind = Kind::Check;

    fn id(&self) -> &str {
        &self.id
    }

    async fn create(&mut self, ctx: &ReconcileContext, _action: Action) -> Result<()> {
        let (nexthop, dev_addr) = ctx.nexthop_for(&self.device).await?;
        self.nexthop = nexthop;
        self.dev_addr = dev_addr;
        Ok(())
    }

    async fn modify(&mut self, _ctx: &ReconcileContext, _new: &Self) -> ModifyOutcome {
        ModifyOutcome::unchanged()
    }

    async fn destroy(&self, _ctx: &ReconcileContext) -> Result<()> {
        Ok(())
    }
}
