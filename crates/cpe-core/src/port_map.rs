//! Logical port to physical interface map
//!
//! The provisioning image writes `porttrans.json`, naming each logical port
//! (`wan1`, `lan1`, ...) and the device that backs it. A device is either an
//! interface name or a MAC address.
//!
//! ```json
//! {"wans": [{"name": "wan1", "device": "eth0"}],
//!  "lans": [{"name": "lan1", "device": "52:54:00:12:34:56"}]}
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::traits::{CommandExecutor, ConfigRenderer};
use crate::{Error, Result};

/// One logical port entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortEntry {
    pub name: String,
    pub device: String,
}

/// The full port map
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMap {
    #[serde(default)]
    pub wans: Vec<PortEntry>,
    #[serde(default)]
    pub lans: Vec<PortEntry>,
}

impl PortMap {
    pub fn from_json(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }

    /// Device symbol for a logical port, WANs searched first, case-insensitive
    pub fn device_for(&self, port_id: &str) -> Option<&str> {
        self.wans
            .iter()
            .chain(self.lans.iter())
            .find(|e| e.name.eq_ignore_ascii_case(port_id))
            .map(|e| e.device.as_str())
    }

    /// Whether `port_id` names any mapped port
    pub fn contains(&self, port_id: &str) -> bool {
        self.device_for(port_id).is_some()
    }

    pub fn wan_names(&self) -> impl Iterator<Item = &str> {
        self.wans.iter().map(|e| e.name.as_str())
    }

    /// Resolve a logical port id to the kernel interface name
    pub async fn resolve_phyif(
        &self,
        exec: &dyn CommandExecutor,
        files: &dyn ConfigRenderer,
        sys_class_net: &Path,
        port_id: &str,
    ) -> Result<String> {
        let symbol = self
            .device_for(port_id)
            .ok_or_else(|| Error::not_found(format!("port {} is not in the port map", port_id)))?;
        resolve_symbol(exec, files, sys_class_net, symbol).await
    }
}

/// Resolve a device symbol (interface name or MAC) to an interface name
///
/// A MAC is matched against `ip addr` output, skipping `@` children so a
/// VLAN sharing the parent's MAC is never picked.
pub async fn resolve_symbol(
    exec: &dyn CommandExecutor,
    files: &dyn ConfigRenderer,
    sys_class_net: &Path,
    symbol: &str,
) -> Result<String> {
    if symbol.contains(':') {
        let cmd = format!(
            "ip addr | grep {} -B 1 | grep BROADCAST | awk '{{print $2}}' | awk -F ':' '{{print $1}}' | grep -v '@'",
            symbol
        );
        let out = exec.run(&cmd).await?;
        let name = out.lines().next().unwrap_or("").trim().to_string();
        if name.is_empty() {
            return Err(Error::not_found(format!("no interface carries MAC {}", symbol)));
        }
        Ok(name)
    } else {
        let address = sys_class_net.join(symbol).join("address");
        if !files.exists(&address).await {
            return Err(Error::not_found(format!("interface {} does not exist", symbol)));
        }
        Ok(symbol.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> PortMap {
        PortMap::from_json(
            r#"{"wans":[{"name":"WAN1","device":"eth0"}],
                "lans":[{"name":"lan1","device":"52:54:00:12:34:56"},{"name":"wan1","device":"shadowed"}]}"#,
        )
        .unwrap()
    }

    #[test]
    fn lookup_is_case_insensitive_and_prefers_wans() {
        let map = sample();
        assert_eq!(map.device_for("wan1"), Some("eth0"));
        assert_eq!(map.device_for("LAN1"), Some("52:54:00:12:34:56"));
        assert_eq!(map.device_for("lan9"), None);
        assert_eq!(map.wan_names().collect::<Vec<_>>(), vec!["WAN1"]);
    }

    #[test]
    fn missing_sections_default_empty() {
        let map = PortMap::from_json("{}").unwrap();
        assert!(map.wans.is_empty());
        assert!(!map.contains("wan1"));
    }
}
