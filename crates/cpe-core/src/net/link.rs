//! Interface, address, policy rule and traffic control primitives

use tracing::{info, warn};

use super::cidr::with_host_prefix;
use crate::Result;
use crate::traits::CommandExecutor;

/// Scope a command to a network namespace
///
/// The namespace switch lives in the child process only; the agent's own
/// threads never change namespace.
pub fn in_netns(namespace: &str, command: &str) -> String {
    if namespace.is_empty() {
        command.to_string()
    } else {
        format!("ip netns exec {} {}", namespace, command)
    }
}

pub async fn link_up(exec: &dyn CommandExecutor, device: &str) -> Result<()> {
    exec.run(&format!("ip link set {} up", device)).await?;
    Ok(())
}

/// Disable reverse-path filtering on one interface
pub async fn disable_rp_filter(exec: &dyn CommandExecutor, device: &str) -> Result<()> {
    exec.run(&format!("sysctl -w net.ipv4.conf.{}.rp_filter=0", device))
        .await?;
    Ok(())
}

/// Add or delete an interface address; a bare address is treated as /32
///
/// Failures are logged and swallowed: the address may already be present
/// (add) or already gone (delete).
pub async fn set_address(exec: &dyn CommandExecutor, device: &str, addr: &str, present: bool) {
    let op = if present { "add" } else { "del" };
    let cmd = format!("ip addr {} {} dev {}", op, with_host_prefix(addr), device);
    match exec.run(&cmd).await {
        Ok(_) => info!(cmd = %cmd, "address updated"),
        Err(e) => warn!(cmd = %cmd, error = %e, "address update failed"),
    }
}

pub async fn flush_addresses(exec: &dyn CommandExecutor, device: &str) -> Result<()> {
    exec.run(&format!("ip addr flush dev {}", device)).await?;
    Ok(())
}

/// Policy rule sending `fwmark` to `table`; errors are ignored
pub async fn set_fwmark_rule(
    exec: &dyn CommandExecutor,
    fwmark: u32,
    table: u32,
    pref: u32,
    present: bool,
) {
    let op = if present { "add" } else { "del" };
    let cmd = format!("ip rule {} fwmark {} table {} pref {}", op, fwmark, table, pref);
    if let Err(e) = exec.run(&cmd).await {
        warn!(cmd = %cmd, error = %e, "ip rule update failed");
    }
}

/// Police ingress traffic on `device` to `mbit`; 0 removes the limit
pub async fn set_ingress_limit(exec: &dyn CommandExecutor, device: &str, mbit: u32) -> Result<()> {
    // Absent qdisc is the normal case on first apply
    let _ = exec.run(&format!("tc qdisc del dev {} ingress", device)).await;
    if mbit == 0 {
        return Ok(());
    }
    exec.run(&format!("tc qdisc add dev {} ingress handle ffff:", device))
        .await?;
    exec.run(&format!(
        "tc filter add dev {} parent ffff: protocol all prio 1 basic police rate {}Mbit burst {}Mbit mtu 65535 drop",
        device, mbit, mbit
    ))
    .await?;
    info!(device, mbit, "ingress limit applied");
    Ok(())
}

/// Shape egress traffic on `device` to `mbit`; 0 removes the limit
pub async fn set_egress_limit(exec: &dyn CommandExecutor, device: &str, mbit: u32) -> Result<()> {
    let _ = exec.run(&format!("tc qdisc del dev {} root", device)).await;
    if mbit == 0 {
        return Ok(());
    }
    exec.run(&format!(
        "tc qdisc add dev {} root tbf rate {}Mbit latency 50ms burst {}Mbit",
        device, mbit, mbit
    ))
    .await?;
    Ok(())
}

/// Whether an interface is present, judged by `ip link show`
pub async fn device_exists(exec: &dyn CommandExecutor, device: &str) -> bool {
    exec.run(&format!("ip link show {}", device)).await.is_ok()
}

/// `flags` line of `ifconfig <device>`, optionally inside a namespace
pub async fn ifconfig_flags(exec: &dyn CommandExecutor, namespace: &str, device: &str) -> Result<String> {
    let cmd = in_netns(namespace, &format!("ifconfig {} | grep \"flags\"", device));
    exec.run(&cmd).await
}

/// First IPv4 address/prefix configured on `device`, if any
pub async fn current_address(exec: &dyn CommandExecutor, device: &str) -> Option<String> {
    let out = exec
        .run(&format!(
            "ip -4 addr show dev {} | grep inet | awk '{{print $2}}' | head -n 1",
            device
        ))
        .await
        .ok()?;
    let addr = out.trim();
    (!addr.is_empty()).then(|| addr.to_string())
}

/// Default gateway through `device` in the main table, if any
pub async fn default_gateway(exec: &dyn CommandExecutor, device: &str) -> Option<String> {
    let out = exec
        .run(&format!(
            "ip route show default dev {} | awk '{{print $3}}' | head -n 1",
            device
        ))
        .await
        .ok()?;
    let gw = out.trim();
    (!gw.is_empty()).then(|| gw.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn netns_scoping() {
        assert_eq!(in_netns("", "ping -c 1 1.1.1.1"), "ping -c 1 1.1.1.1");
        assert_eq!(
            in_netns("vrf1", "ping -c 1 1.1.1.1"),
            "ip netns exec vrf1 ping -c 1 1.1.1.1"
        );
    }
}
