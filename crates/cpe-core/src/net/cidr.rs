//! Address and prefix helpers

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

/// Set difference between two lists: `(added, removed)` going from `old` to `new`
///
/// Both outputs are sorted and free of duplicates. Order of the inputs does
/// not matter.
pub fn arrcmp(old: &[String], new: &[String]) -> (Vec<String>, Vec<String>) {
    let old: BTreeSet<&String> = old.iter().collect();
    let new: BTreeSet<&String> = new.iter().collect();
    let added = new.difference(&old).map(|s| (*s).clone()).collect();
    let removed = old.difference(&new).map(|s| (*s).clone()).collect();
    (added, removed)
}

/// Sort and de-duplicate
pub fn dedup(mut items: Vec<String>) -> Vec<String> {
    items.sort();
    items.dedup();
    items
}

/// Drop a `/prefix` suffix if present
pub fn strip_prefix(addr: &str) -> &str {
    addr.split('/').next().unwrap_or(addr)
}

/// Prefix length of a CIDR string; a bare address counts as /32
pub fn prefix_len(cidr: &str) -> Option<u8> {
    match cidr.split_once('/') {
        Some((_, len)) => len.parse::<u8>().ok().filter(|l| *l <= 32),
        None => Some(32),
    }
}

/// Dotted netmask for a prefix length
pub fn prefix_to_mask(len: u8) -> Ipv4Addr {
    let len = len.min(32) as u32;
    let bits = if len == 0 { 0 } else { u32::MAX << (32 - len) };
    Ipv4Addr::from(bits)
}

/// Broadcast address of `ip` under `mask`
pub fn broadcast(ip: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) | !u32::from(mask))
}

/// Network address of `ip` under `mask`
pub fn network(ip: Ipv4Addr, mask: Ipv4Addr) -> Ipv4Addr {
    Ipv4Addr::from(u32::from(ip) & u32::from(mask))
}

/// Split `a.b.c.d/len` into address and netmask
pub fn split_cidr(cidr: &str) -> Option<(Ipv4Addr, Ipv4Addr)> {
    let ip: Ipv4Addr = strip_prefix(cidr).parse().ok()?;
    let len = prefix_len(cidr)?;
    Some((ip, prefix_to_mask(len)))
}

/// Append `/32` to a bare address
pub fn with_host_prefix(addr: &str) -> String {
    if addr.contains('/') {
        addr.to_string()
    } else {
        format!("{}/32", addr)
    }
}

pub fn is_ipv4(addr: &str) -> bool {
    strip_prefix(addr).parse::<Ipv4Addr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn v(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn arrcmp_reports_both_sides() {
        let (added, removed) = arrcmp(
            &v(&["10.1.0.0/24", "10.2.0.0/24"]),
            &v(&["10.2.0.0/24", "10.3.0.0/24"]),
        );
        assert_eq!(added, v(&["10.3.0.0/24"]));
        assert_eq!(removed, v(&["10.1.0.0/24"]));

        let (added, removed) = arrcmp(&v(&["a", "b"]), &v(&["b", "a", "a"]));
        assert!(added.is_empty() && removed.is_empty());
    }

    #[test]
    fn masks_and_broadcast() {
        assert_eq!(prefix_to_mask(24), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(prefix_to_mask(0), Ipv4Addr::new(0, 0, 0, 0));
        assert_eq!(prefix_to_mask(32), Ipv4Addr::new(255, 255, 255, 255));

        let (ip, mask) = split_cidr("192.168.10.1/23").unwrap();
        assert_eq!(mask, Ipv4Addr::new(255, 255, 254, 0));
        assert_eq!(broadcast(ip, mask), Ipv4Addr::new(192, 168, 11, 255));
        assert_eq!(network(ip, mask), Ipv4Addr::new(192, 168, 10, 0));
    }

    #[test]
    fn prefix_helpers() {
        assert_eq!(strip_prefix("1.2.3.4/24"), "1.2.3.4");
        assert_eq!(strip_prefix("1.2.3.4"), "1.2.3.4");
        assert_eq!(prefix_len("1.2.3.4"), Some(32));
        assert_eq!(prefix_len("1.2.3.4/40"), None);
        assert_eq!(with_host_prefix("1.2.3.4"), "1.2.3.4/32");
        assert!(is_ipv4("8.8.8.8"));
        assert!(!is_ipv4("2001:db8::1"));
        assert_eq!(dedup(v(&["b", "a", "b"])), v(&["a", "b"]));
    }
}
