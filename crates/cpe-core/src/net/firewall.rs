//! iptables and ipset primitives
//!
//! Every rule change is guarded by an `iptables -C` probe so that replaying
//! a create or destroy never stacks a duplicate rule or fails on a missing
//! one. ipset changes rely on `-exist` for the same property.

use tracing::{debug, info, warn};

use crate::Result;
use crate::traits::CommandExecutor;

/// A NAT table rule managed by the agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NatRule<'a> {
    /// Masquerade everything leaving `device`
    Masquerade { device: &'a str },
    /// Exempt a source CIDR from SNAT on `device`
    NoSnat { device: &'a str, cidr: &'a str },
    /// SNAT everything leaving `device` to `source`
    SnatToSource { device: &'a str, source: &'a str },
    /// SNAT traffic to members of ipset `set`
    SnatByDstSet {
        device: &'a str,
        set: &'a str,
        source: &'a str,
    },
    /// SNAT traffic to `network`
    SnatByNetwork {
        device: &'a str,
        network: &'a str,
        source: &'a str,
    },
    /// Redirect LAN DNS queries to `destination:53`
    DnsDnat { destination: &'a str },
}

impl NatRule<'_> {
    fn chain(&self) -> &'static str {
        match self {
            Self::DnsDnat { .. } => "PREROUTING",
            _ => "POSTROUTING",
        }
    }

    /// Exemptions and targeted SNAT must win over a blanket rule, so they go first
    fn insert_flag(&self) -> &'static str {
        match self {
            Self::NoSnat { .. } | Self::SnatByDstSet { .. } | Self::SnatByNetwork { .. } => "-I",
            _ => "-A",
        }
    }

    fn matcher(&self) -> String {
        match self {
            Self::Masquerade { device } => format!("-o {} -j MASQUERADE", device),
            Self::NoSnat { device, cidr } => format!("-o {} -s {} -j ACCEPT", device, cidr),
            Self::SnatToSource { device, source } => {
                format!("-o {} -j SNAT --to-source {}", device, source)
            }
            Self::SnatByDstSet {
                device,
                set,
                source,
            } => format!(
                "-o {} -m set --match-set {} dst -j SNAT --to-source {}",
                device, set, source
            ),
            Self::SnatByNetwork {
                device,
                network,
                source,
            } => format!("-o {} -d {} -j SNAT --to-source {}", device, network, source),
            Self::DnsDnat { destination } => format!(
                "-p udp --dport 53 -j DNAT --to-destination {}:53",
                destination
            ),
        }
    }

    fn command(&self, flag: &str) -> String {
        format!("iptables -w -t nat {} {} {}", flag, self.chain(), self.matcher())
    }
}

async fn rule_exists(exec: &dyn CommandExecutor, check: &str) -> bool {
    exec.run(check).await.is_ok()
}

/// Install a NAT rule unless it is already present
pub async fn ensure_nat(exec: &dyn CommandExecutor, rule: &NatRule<'_>) -> Result<()> {
    if rule_exists(exec, &rule.command("-C")).await {
        debug!(rule = ?rule, "NAT rule already present");
        return Ok(());
    }
    let cmd = rule.command(rule.insert_flag());
    exec.run(&cmd).await?;
    info!(cmd = %cmd, "NAT rule added");
    Ok(())
}

/// Remove a NAT rule if it is present
pub async fn remove_nat(exec: &dyn CommandExecutor, rule: &NatRule<'_>) -> Result<()> {
    if !rule_exists(exec, &rule.command("-C")).await {
        debug!(rule = ?rule, "NAT rule already absent");
        return Ok(());
    }
    let cmd = rule.command("-D");
    exec.run(&cmd).await?;
    info!(cmd = %cmd, "NAT rule removed");
    Ok(())
}

/// Add or remove depending on `present`
pub async fn set_nat(exec: &dyn CommandExecutor, rule: &NatRule<'_>, present: bool) -> Result<()> {
    if present {
        ensure_nat(exec, rule).await
    } else {
        remove_nat(exec, rule).await
    }
}

fn mark_rule(flag: &str, chain: &str, set: &str, mark: u32) -> String {
    format!(
        "iptables -w {} {} -t mangle -m set --match-set {} dst -j MARK --set-mark {}",
        flag, chain, set, mark
    )
}

/// Mark packets destined to ipset `set` with `mark` in PREROUTING and OUTPUT
///
/// The China-route set is appended so per-rule acceleration marks, which are
/// inserted, take precedence over it.
pub async fn set_dst_mark(
    exec: &dyn CommandExecutor,
    set: &str,
    mark: u32,
    present: bool,
    append: bool,
) -> Result<()> {
    let exists = rule_exists(exec, &mark_rule("-C", "PREROUTING", set, mark)).await;
    if exists == present {
        return Ok(());
    }
    let flag = match (present, append) {
        (false, _) => "-D",
        (true, true) => "-A",
        (true, false) => "-I",
    };
    for chain in ["PREROUTING", "OUTPUT"] {
        let cmd = mark_rule(flag, chain, set, mark);
        exec.run(&cmd).await?;
        info!(cmd = %cmd, "mark rule applied");
    }
    Ok(())
}

/// Clamp TCP MSS on forwarded SYNs
pub async fn ensure_mss_clamp(exec: &dyn CommandExecutor, mss: u16) -> Result<()> {
    let rule = format!("FORWARD -p tcp --tcp-flags SYN,RST SYN -j TCPMSS --set-mss {}", mss);
    if rule_exists(exec, &format!("iptables -w -C {}", rule)).await {
        return Ok(());
    }
    exec.run(&format!("iptables -w -A {}", rule)).await?;
    Ok(())
}

/// Create an ipset if it does not exist
pub async fn ipset_create(
    exec: &dyn CommandExecutor,
    set: &str,
    kind: &str,
    maxelem: u32,
    timeout: Option<u32>,
) -> Result<()> {
    let cmd = match timeout {
        Some(t) => format!(
            "ipset create {} {} maxelem {} timeout {} -exist",
            set, kind, maxelem, t
        ),
        None => format!("ipset create {} {} maxelem {} -exist", set, kind, maxelem),
    };
    exec.run(&cmd).await?;
    Ok(())
}

/// Destroy an ipset; failures (in use, absent) are logged and swallowed
pub async fn ipset_destroy(exec: &dyn CommandExecutor, set: &str) {
    if let Err(e) = exec.run(&format!("ipset destroy {}", set)).await {
        warn!(set, error = %e, "ipset destroy failed");
    }
}

/// Add a member; `nomatch` carves it out of a covering net entry
pub async fn ipset_add(
    exec: &dyn CommandExecutor,
    set: &str,
    entry: &str,
    nomatch: bool,
) -> Result<()> {
    let cmd = if nomatch {
        format!("ipset add {} {} nomatch -exist", set, entry)
    } else {
        format!("ipset add {} {} -exist", set, entry)
    };
    exec.run(&cmd).await?;
    Ok(())
}

/// Add a member that never expires from a set created with a timeout
pub async fn ipset_add_permanent(
    exec: &dyn CommandExecutor,
    set: &str,
    entry: &str,
    nomatch: bool,
) -> Result<()> {
    let flag = if nomatch { " nomatch" } else { "" };
    exec.run(&format!("ipset add {} {} timeout 0{} -exist", set, entry, flag))
        .await?;
    Ok(())
}

pub async fn ipset_del(exec: &dyn CommandExecutor, set: &str, entry: &str) -> Result<()> {
    exec.run(&format!("ipset del {} {} -exist", set, entry))
        .await?;
    Ok(())
}

/// Load members from a file in one restore call
pub async fn ipset_restore_from(
    exec: &dyn CommandExecutor,
    set: &str,
    list: &std::path::Path,
    nomatch: bool,
) -> Result<()> {
    let suffix = if nomatch { " nomatch" } else { "" };
    let cmd = format!(
        "sed -e '/^\\s*$/d' -e 's/^/add {} /' -e 's/$/{} -exist/' {} | ipset restore -exist",
        set,
        suffix,
        list.display()
    );
    exec.run(&cmd).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Records commands; `-C` probes succeed only for rules listed in `present`
    struct Recorder {
        present: Vec<String>,
        log: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandExecutor for Recorder {
        async fn run(&self, command: &str) -> Result<String> {
            self.log.lock().unwrap().push(command.to_string());
            if command.contains(" -C ") && !self.present.iter().any(|p| command == p) {
                return Err(crate::Error::command(command, "Bad rule"));
            }
            Ok(String::new())
        }
    }

    fn recorder(present: &[&str]) -> Recorder {
        Recorder {
            present: present.iter().map(|s| s.to_string()).collect(),
            log: Mutex::new(Vec::new()),
        }
    }

    #[tokio::test]
    async fn ensure_skips_existing_rule() {
        let exec = recorder(&["iptables -w -t nat -C POSTROUTING -o tun0 -j MASQUERADE"]);
        ensure_nat(&exec, &NatRule::Masquerade { device: "tun0" })
            .await
            .unwrap();
        let log = exec.log.lock().unwrap();
        assert_eq!(log.len(), 1, "Expected only the -C probe, got {:?}", *log);
    }

    #[tokio::test]
    async fn ensure_inserts_exemptions_first() {
        let exec = recorder(&[]);
        ensure_nat(
            &exec,
            &NatRule::NoSnat {
                device: "tun0",
                cidr: "10.0.0.0/8",
            },
        )
        .await
        .unwrap();
        let log = exec.log.lock().unwrap();
        assert_eq!(
            log.last().unwrap(),
            "iptables -w -t nat -I POSTROUTING -o tun0 -s 10.0.0.0/8 -j ACCEPT"
        );
    }

    #[tokio::test]
    async fn remove_of_absent_rule_is_quiet() {
        let exec = recorder(&[]);
        remove_nat(&exec, &NatRule::DnsDnat { destination: "192.168.1.1" })
            .await
            .unwrap();
        assert_eq!(exec.log.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn mark_rule_touches_both_chains() {
        let exec = recorder(&[]);
        set_dst_mark(&exec, "chinaroute", 100, true, true).await.unwrap();
        let log = exec.log.lock().unwrap();
        assert_eq!(log.len(), 3);
        assert!(log[1].starts_with("iptables -w -A PREROUTING"));
        assert!(log[2].starts_with("iptables -w -A OUTPUT"));
    }
}
