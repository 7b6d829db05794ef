//! smartdns resolver and domain-based egress policy
//!
//! Resolved addresses of matching domains land in timed ipsets. Packets to
//! those sets are marked and policy-routed:
//!
//! | set            | mark/table/pref | egress                  |
//! |----------------|-----------------|-------------------------|
//! | `dnsRuleLocal` | 102             | WAN1 gateway            |
//! | `dnsRuleSdwan` | 101             | the configured SD-WAN conn |
//! | `accRule_<id>` | 101             | SD-WAN, SNAT to natAddress |

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Action, Kind, ManagedObject, ModifyOutcome, PortConf, ReconcileContext};
use crate::Result;
use crate::net::firewall::{self, NatRule};
use crate::net::{arrcmp, link, vtysh};

const SET_TYPE: &str = "hash:net";
const SET_MAXELEM: u32 = 1_000_000;
const SET_TIMEOUT_SECS: u32 = 7200;
const LOOPBACK: &str = "lo";
const DEFAULT_ROUTE: &str = "0.0.0.0/0";
const FALLBACK_RESOLV: &str =
    "; generated by cpe.service\nnameserver 223.5.5.5\nnameserver 114.114.114.114\n";

/// Mark, table and rule preference share one number per policy
#[derive(Debug, Clone, Copy)]
struct DomainPolicy {
    set: &'static str,
    id: u32,
}

const LOCAL_POLICY: DomainPolicy = DomainPolicy {
    set: "dnsRuleLocal",
    id: 102,
};

const SDWAN_POLICY: DomainPolicy = DomainPolicy {
    set: "dnsRuleSdwan",
    id: 101,
};

impl DomainPolicy {
    async fn create(&self, ctx: &ReconcileContext, action: Action, nexthop: &str) -> Result<()> {
        let exec = ctx.exec();
        link::set_fwmark_rule(exec, self.id, self.id, self.id, true).await;
        if action == Action::Add {
            vtysh::table_route(exec, false, DEFAULT_ROUTE, nexthop, self.id).await?;
        }
        firewall::set_dst_mark(exec, self.set, self.id, true, false).await
    }

    async fn destroy(&self, ctx: &ReconcileContext, nexthop: &str) -> Result<()> {
        let exec = ctx.exec();
        firewall::set_dst_mark(exec, self.set, self.id, false, false).await?;
        link::set_fwmark_rule(exec, self.id, self.id, self.id, false).await;
        vtysh::table_route(exec, true, DEFAULT_ROUTE, nexthop, self.id).await
    }
}

/// Domains accelerated through the SD-WAN
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AccRule {
    pub id: String,
    pub domains: Vec<String>,
    #[serde(rename = "primaryDNS")]
    pub primary_dns: String,
    #[serde(rename = "secondaryDNS")]
    pub secondary_dns: String,
    pub networks: Vec<String>,
    pub nat_address: String,
    /// Egress interface the SNAT applies to
    pub device: String,
}

impl AccRule {
    fn set_name(&self) -> String {
        format!("accRule_{}", self.id)
    }

    fn rule_file(&self, ctx: &ReconcileContext) -> PathBuf {
        ctx.paths
            .smartdns_rule_dir
            .join(format!("domainaccRule_{}.conf", self.id))
    }

    /// smartdns `server=`/`ipset=` lines for every domain
    pub fn render(&self) -> String {
        let set = self.set_name();
        let mut out = String::new();
        for domain in &self.domains {
            if !self.secondary_dns.is_empty() {
                out.push_str(&format!("server=/{}/{}\n", domain, self.secondary_dns));
            }
            if !self.primary_dns.is_empty() {
                out.push_str(&format!("server=/{}/{}\n", domain, self.primary_dns));
            }
            out.push_str(&format!("ipset=/{}/{}\n", domain, set));
        }
        out
    }

    /// Same rule up to member order
    fn same_as(&self, other: &AccRule) -> bool {
        let (domains_added, domains_removed) = arrcmp(&self.domains, &other.domains);
        let (nets_added, nets_removed) = arrcmp(&self.networks, &other.networks);
        self.device == other.device
            && self.primary_dns == other.primary_dns
            && self.secondary_dns == other.secondary_dns
            && self.nat_address == other.nat_address
            && domains_added.is_empty()
            && domains_removed.is_empty()
            && nets_added.is_empty()
            && nets_removed.is_empty()
    }

    async fn create(&self, ctx: &ReconcileContext, action: Action) -> Result<()> {
        let exec = ctx.exec();
        let set = self.set_name();
        firewall::ipset_create(exec, &set, SET_TYPE, SET_MAXELEM, Some(SET_TIMEOUT_SECS)).await?;

        let members = self
            .networks
            .iter()
            .chain([&self.primary_dns, &self.secondary_dns])
            .filter(|m| !m.is_empty());
        for member in members {
            if let Err(e) = firewall::ipset_add_permanent(exec, &set, member, false).await {
                warn!(set = %set, member = %member, error = %e, "ipset member not added");
            }
        }
        if !self.nat_address.is_empty() {
            if let Err(e) = firewall::ipset_add_permanent(exec, &set, &self.nat_address, true).await {
                warn!(set = %set, error = %e, "nat address exclusion not added");
            }
        }

        let rule_file = self.rule_file(ctx);
        if action == Action::Add || !ctx.files().exists(&rule_file).await {
            ctx.files().write(&rule_file, &self.render()).await?;
        }

        firewall::set_dst_mark(exec, &set, SDWAN_POLICY.id, true, false).await?;

        if !self.nat_address.is_empty() {
            link::set_address(exec, LOOPBACK, &self.nat_address, true).await;
            firewall::ensure_nat(
                exec,
                &NatRule::SnatByDstSet {
                    device: &self.device,
                    set: &set,
                    source: &self.nat_address,
                },
            )
            .await?;
        }
        Ok(())
    }

    async fn destroy(&self, ctx: &ReconcileContext) -> Result<()> {
        let exec = ctx.exec();
        let set = self.set_name();
        ctx.files().remove(&self.rule_file(ctx)).await?;
        firewall::set_dst_mark(exec, &set, SDWAN_POLICY.id, false, false).await?;
        if !self.nat_address.is_empty() {
            firewall::remove_nat(
                exec,
                &NatRule::SnatByDstSet {
                    device: &self.device,
                    set: &set,
                    source: &self.nat_address,
                },
            )
            .await?;
            link::set_address(exec, LOOPBACK, &self.nat_address, false).await;
        }
        firewall::ipset_destroy(exec, &set).await;
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DnsConf {
    pub enable: bool,
    /// DNAT every LAN DNS query to the listen address
    pub full_mode: bool,
    pub listen_address: String,
    #[serde(rename = "primaryDNS")]
    pub primary_dns: String,
    #[serde(rename = "secondaryDNS")]
    pub secondary_dns: String,
    /// Conn whose tunnel carries SD-WAN domains
    pub sdwan_conn: String,
    pub acc_rules: Vec<AccRule>,
}

/// smartdns main configuration
pub fn render_server_conf(listen_address: &str, rule_dir: &str, upstream_file: &str) -> String {
    format!(
        "log-queries\n\
         log-facility=/var/log/smartdns.log\n\
         conf-dir={}\n\
         resolv-file={}\n\
         listen-address={},127.0.0.1\n\
         no-poll\n\
         no-hosts\n\
         cache-size=10000\n\
         neg-ttl=600\n\
         port=53\n\
         strict-order\n",
        rule_dir, upstream_file, listen_address
    )
}

/// resolv.conf style file listing `servers`
pub fn render_resolv(servers: &[&str]) -> String {
    let mut out = String::from("; generated by smartdns.service\n");
    for server in servers.iter().filter(|s| !s.is_empty()) {
        out.push_str(&format!("nameserver {}\n", server));
    }
    out
}

async fn wan1_nexthop(ctx: &ReconcileContext) -> Result<String> {
    Ok(ctx
        .load::<PortConf>("wan1")
        .await?
        .map(|p| p.nexthop)
        .unwrap_or_default())
}

async fn restart_service(ctx: &ReconcileContext) -> Result<()> {
    ctx.exec().run("systemctl enable smartdns").await?;
    ctx.exec().run("systemctl restart smartdns").await?;
    Ok(())
}

impl DnsConf {
    async fn write_server_conf(&self, ctx: &ReconcileContext) -> Result<()> {
        let conf = render_server_conf(
            &self.listen_address,
            &ctx.paths.smartdns_rule_dir.display().to_string(),
            &ctx.paths.resolv_dnsmasq.display().to_string(),
        );
        ctx.files().write(&ctx.paths.smartdns_conf, &conf).await
    }

    async fn write_upstreams(&self, ctx: &ReconcileContext) -> Result<()> {
        let content = render_resolv(&[&self.primary_dns, &self.secondary_dns]);
        ctx.files().write(&ctx.paths.resolv_dnsmasq, &content).await
    }

    async fn write_local_resolv(&self, ctx: &ReconcileContext) -> Result<()> {
        let content = render_resolv(&[&self.listen_address]);
        ctx.files().write(&ctx.paths.resolv_conf, &content).await
    }

    async fn set_full_mode(&self, ctx: &ReconcileContext, present: bool) -> Result<()> {
        firewall::set_nat(
            ctx.exec(),
            &NatRule::DnsDnat {
                destination: &self.listen_address,
            },
            present,
        )
        .await
    }

    /// Shared body of create and recover
    async fn bring_up(&self, ctx: &ReconcileContext, action: Action) -> Result<()> {
        let exec = ctx.exec();
        for policy in [LOCAL_POLICY, SDWAN_POLICY] {
            firewall::ipset_create(exec, policy.set, SET_TYPE, SET_MAXELEM, Some(SET_TIMEOUT_SECS))
                .await?;
        }

        let nexthop = wan1_nexthop(ctx).await?;
        if !nexthop.is_empty() {
            LOCAL_POLICY.create(ctx, action, &nexthop).await?;
        }
        if !self.sdwan_conn.is_empty() {
            SDWAN_POLICY.create(ctx, action, &self.sdwan_conn).await?;
        }

        for rule in &self.acc_rules {
            rule.create(ctx, action).await?;
        }

        link::link_up(exec, LOOPBACK).await?;
        if !self.listen_address.is_empty() {
            link::set_address(exec, LOOPBACK, &self.listen_address, true).await;
        }
        if self.full_mode {
            self.set_full_mode(ctx, true).await?;
        }

        self.write_upstreams(ctx).await?;
        self.write_local_resolv(ctx).await?;
        restart_service(ctx).await
    }

    async fn replace_acc_rules(&self, ctx: &ReconcileContext, new: &[AccRule]) -> Result<()> {
        for rule in &self.acc_rules {
            rule.destroy(ctx).await?;
        }
        for rule in new {
            rule.create(ctx, Action::Add).await?;
        }
        Ok(())
    }

    fn acc_rules_differ(&self, new: &[AccRule]) -> bool {
        if self.acc_rules.len() != new.len() {
            return true;
        }
        self.acc_rules.iter().any(|old| {
            !new
                .iter()
                .find(|n| n.id == old.id)
                .is_some_and(|n| n.same_as(old))
        })
    }
}

#[async_trait]
impl ManagedObject for DnsConf {
    const KIND: Kind = Kind::Dns;

    fn id(&self) -> &str {
        ""
    }

    async fn create(&mut self, ctx: &ReconcileContext, _action: Action) -> Result<()> {
        if !self.enable {
            return Ok(());
        }
        ctx.files().create_dir(&ctx.paths.smartdns_rule_dir).await?;
        self.write_server_conf(ctx).await?;
        self.bring_up(ctx, Action::Add).await?;
        info!(listen = %self.listen_address, rules = self.acc_rules.len(), "dns service configured");
        Ok(())
    }

    async fn modify(&mut self, ctx: &ReconcileContext, new: &Self) -> ModifyOutcome {
        if self.enable != new.enable {
            if new.enable {
                let mut next = new.clone();
                let result = next.create(ctx, Action::Add).await;
                *self = next;
                return ModifyOutcome::new(true, result);
            }
            let result = self.destroy(ctx).await;
            *self = new.clone();
            return ModifyOutcome::new(true, result);
        }
        if !new.enable {
            return ModifyOutcome::unchanged();
        }

        let mut changed = false;
        let mut server_changed = false;

        if self.listen_address != new.listen_address || self.full_mode != new.full_mode {
            if self.full_mode {
                if let Err(e) = self.set_full_mode(ctx, false).await {
                    return ModifyOutcome::failed(e);
                }
            }
            if self.listen_address != new.listen_address {
                if !self.listen_address.is_empty() {
                    link::set_address(ctx.exec(), LOOPBACK, &self.listen_address, false).await;
                }
                if !new.listen_address.is_empty() {
                    link::set_address(ctx.exec(), LOOPBACK, &new.listen_address, true).await;
                }
                self.listen_address = new.listen_address.clone();
                if let Err(e) = self.write_local_resolv(ctx).await {
                    return ModifyOutcome::new(true, Err(e));
                }
            }
            self.full_mode = new.full_mode;
            if self.full_mode {
                if let Err(e) = self.set_full_mode(ctx, true).await {
                    return ModifyOutcome::new(true, Err(e));
                }
            }
            changed = true;
            server_changed = true;
        }

        if self.primary_dns != new.primary_dns || self.secondary_dns != new.secondary_dns {
            self.primary_dns = new.primary_dns.clone();
            self.secondary_dns = new.secondary_dns.clone();
            changed = true;
            server_changed = true;
        }

        if self.sdwan_conn != new.sdwan_conn {
            let applied = match (self.sdwan_conn.is_empty(), new.sdwan_conn.is_empty()) {
                (false, false) => {
                    if let Err(e) = vtysh::table_route_replace(
                        ctx.exec(),
                        DEFAULT_ROUTE,
                        &self.sdwan_conn,
                        &new.sdwan_conn,
                        SDWAN_POLICY.id,
                    )
                    .await
                    {
                        warn!(error = %e, "sdwan dns route move failed");
                    }
                    Ok(())
                }
                (false, true) => SDWAN_POLICY.destroy(ctx, &self.sdwan_conn).await,
                (true, false) => SDWAN_POLICY.create(ctx, Action::Add, &new.sdwan_conn).await,
                (true, true) => Ok(()),
            };
            if let Err(e) = applied {
                return ModifyOutcome::new(changed, Err(e));
            }
            self.sdwan_conn = new.sdwan_conn.clone();
            changed = true;
        }

        if self.acc_rules_differ(&new.acc_rules) {
            if let Err(e) = self.replace_acc_rules(ctx, &new.acc_rules).await {
                return ModifyOutcome::new(changed, Err(e));
            }
            self.acc_rules = new.acc_rules.clone();
            changed = true;
            server_changed = true;
        }

        if server_changed {
            let result = async {
                self.write_server_conf(ctx).await?;
                self.write_upstreams(ctx).await?;
                restart_service(ctx).await
            }
            .await;
            if let Err(e) = result {
                return ModifyOutcome::new(true, Err(e));
            }
            info!("dns service reloaded");
        }

        ModifyOutcome::new(changed, Ok(()))
    }

    async fn destroy(&self, ctx: &ReconcileContext) -> Result<()> {
        if !self.enable {
            return Ok(());
        }
        let exec = ctx.exec();
        exec.run("systemctl stop smartdns").await?;
        exec.run("systemctl disable smartdns").await?;

        for rule in &self.acc_rules {
            rule.destroy(ctx).await?;
        }

        let nexthop = wan1_nexthop(ctx).await?;
        if !nexthop.is_empty() {
            LOCAL_POLICY.destroy(ctx, &nexthop).await?;
        }
        if !self.sdwan_conn.is_empty() {
            SDWAN_POLICY.destroy(ctx, &self.sdwan_conn).await?;
        }
        for policy in [LOCAL_POLICY, SDWAN_POLICY] {
            firewall::ipset_destroy(exec, policy.set).await;
        }

        if self.full_mode {
            self.set_full_mode(ctx, false).await?;
        }
        if !self.listen_address.is_empty() {
            link::set_address(exec, LOOPBACK, &self.listen_address, false).await;
        }

        if let Err(e) = ctx.files().remove(&ctx.paths.resolv_dnsmasq).await {
            warn!(error = %e, "upstream resolver file not removed");
        }
        ctx.files()
            .write(&ctx.paths.resolv_conf, FALLBACK_RESOLV)
            .await?;
        info!("dns service removed");
        Ok(())
    }
}

/// Re-apply a persisted DNS config after reboot
pub async fn recover(ctx: &ReconcileContext) -> Result<()> {
    let Some(dns) = ctx.load::<DnsConf>("").await? else {
        return Ok(());
    };
    if !dns.enable {
        return Ok(());
    }
    dns.bring_up(ctx, Action::Recover).await
}

/// Point the host resolver back at the local listener
pub async fn update_resolv(ctx: &ReconcileContext) -> Result<()> {
    match ctx.load::<DnsConf>("").await {
        Ok(Some(dns)) if dns.enable => dns.write_local_resolv(ctx).await,
        Ok(_) => Ok(()),
        Err(e) => {
            warn!(error = %e, "stored dns config unreadable");
            Ok(())
        }
    }
}

/// Move the local domain policy route to WAN1's new gateway
///
/// `port` is WAN1 as it was before the change.
pub async fn update_domain_rule(
    ctx: &ReconcileContext,
    port: &PortConf,
    new_nexthop: &str,
) -> Result<()> {
    let dns = match ctx.load::<DnsConf>("").await {
        Ok(Some(dns)) if dns.enable => dns,
        Ok(_) => return Ok(()),
        Err(e) => {
            warn!(error = %e, "stored dns config unreadable");
            return Ok(());
        }
    };

    let applied = if port.nexthop.is_empty() {
        LOCAL_POLICY.create(ctx, Action::Add, new_nexthop).await
    } else {
        vtysh::table_route_replace(
            ctx.exec(),
            DEFAULT_ROUTE,
            &port.nexthop,
            new_nexthop,
            LOCAL_POLICY.id,
        )
        .await
    };
    if let Err(e) = applied {
        warn!(listen = %dns.listen_address, error = %e, "local domain policy not moved");
    }
    Ok(())
}
