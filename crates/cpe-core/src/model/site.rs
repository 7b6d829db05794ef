//! Site identity: applied configuration version and controller core list

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Action, Kind, ManagedObject, ModifyOutcome, ReconcileContext};
use crate::net::arrcmp;
use crate::net::cidr::{is_ipv4, strip_prefix};
use crate::{Error, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SiteConf {
    pub id: String,
    /// Controller addresses, optionally with a prefix length
    pub core_list: Vec<String>,
    pub config_version: i64,
}

impl SiteConf {
    /// Version the heartbeat reports; a site without id has applied nothing
    fn effective_version(&self) -> i64 {
        if self.id.is_empty() { 0 } else { self.config_version }
    }

    /// One address per line, prefixes stripped; rejects non-IPv4 entries
    pub fn render_core_list(&self) -> Result<String> {
        let mut out = String::new();
        for entry in &self.core_list {
            let addr = strip_prefix(entry);
            if !is_ipv4(addr) {
                return Err(Error::invalid_input(format!("core address not IPv4: {}", entry)));
            }
            out.push_str(addr);
            out.push('\n');
        }
        Ok(out)
    }

    async fn write_core_list(&self, ctx: &ReconcileContext) {
        let rendered = match self.render_core_list() {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(error = %e, "core list not updated");
                return;
            }
        };
        if let Err(e) = ctx.files().write(&ctx.paths.core_list, &rendered).await {
            warn!(error = %e, "core list write failed");
        }
    }
}

#[async_trait]
impl ManagedObject for SiteConf {
    const KIND: Kind = Kind::Site;

    fn id(&self) -> &str {
        &self.id
    }

    async fn create(&mut self, ctx: &ReconcileContext, _action: Action) -> Result<()> {
        ctx.health.set_config_version(self.effective_version());
        self.write_core_list(ctx).await;
        info!(site = %self.id, version = self.config_version, "site recorded");
        Ok(())
    }

    async fn modify(&mut self, ctx: &ReconcileContext, new: &Self) -> ModifyOutcome {
        let mut changed = self.id != new.id || self.config_version != new.config_version;
        ctx.health.set_config_version(new.effective_version());

        let (added, removed) = arrcmp(&self.core_list, &new.core_list);
        if !added.is_empty() || !removed.is_empty() {
            new.write_core_list(ctx).await;
            changed = true;
        }

        if changed {
            *self = new.clone();
        }
        ModifyOutcome::new(changed, Ok(()))
    }

    async fn destroy(&self, _ctx: &ReconcileContext) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_list_strips_prefixes() {
        let site = SiteConf {
            id: "s1".into(),
            core_list: vec!["10.0.0.1/32".into(), "10.0.0.2".into()],
            config_version: 7,
        };
        assert_eq!(site.render_core_list().unwrap(), "10.0.0.1\n10.0.0.2\n");
        assert_eq!(site.effective_version(), 7);
    }

    #[test]
    fn ipv6_core_is_rejected() {
        let site = SiteConf {
            core_list: vec!["fd00::1".into()],
            ..Default::default()
        };
        assert!(site.render_core_list().unwrap_err().is_validation());
        assert_eq!(site.effective_version(), 0);
    }
}
