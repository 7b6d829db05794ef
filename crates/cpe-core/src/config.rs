//! Configuration types for the CPE agent
//!
//! This module defines all configuration structures used throughout the crate.
//! The daemon fills them from environment variables and the boot files under
//! `/mnt/agent/`; tests usually start from [`AgentConfig::for_serial`].

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main agent configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Device identity and controller endpoint
    pub identity: Identity,

    /// Host file locations
    #[serde(default)]
    pub paths: HostPaths,

    /// Liveness sampler settings
    #[serde(default)]
    pub sampler: SamplerConfig,

    /// Flow sampler settings
    #[serde(default)]
    pub flow: FlowConfig,

    /// Heartbeat and config poll settings
    #[serde(default)]
    pub uplink: UplinkConfig,

    /// WAN watcher settings
    #[serde(default)]
    pub wan: WanConfig,

    /// Reconciler settings
    #[serde(default)]
    pub reconcile: ReconcileConfig,
}

impl AgentConfig {
    /// Create a configuration with defaults for the given serial number
    pub fn for_serial(sn: impl Into<String>) -> Self {
        Self {
            identity: Identity {
                sn: sn.into(),
                controller: ControllerEndpoint::default(),
            },
            paths: HostPaths::default(),
            sampler: SamplerConfig::default(),
            flow: FlowConfig::default(),
            uplink: UplinkConfig::default(),
            wan: WanConfig::default(),
            reconcile: ReconcileConfig::default(),
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.identity.sn.trim().is_empty() {
            return Err(crate::Error::config("Serial number cannot be empty"));
        }

        self.identity.controller.validate()?;
        self.sampler.validate()?;
        self.reconcile.validate()?;

        if self.flow.interval_secs == 0 {
            return Err(crate::Error::config("Flow sampler interval must be > 0"));
        }
        if self.uplink.heartbeat_interval_secs == 0 || self.uplink.config_poll_interval_secs == 0 {
            return Err(crate::Error::config("Uplink intervals must be > 0"));
        }
        if self.wan.interval_secs == 0 {
            return Err(crate::Error::config("WAN watch interval must be > 0"));
        }

        Ok(())
    }
}

/// Device identity
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    /// Serial number; every control call is checked against it
    pub sn: String,

    /// Upstream controller endpoint
    #[serde(default)]
    pub controller: ControllerEndpoint,
}

/// Boot identity file as written by the provisioning image
///
/// ```json
/// {"Sn": "CPE0001", "CoreAddress": "10.0.0.1", "CoreProto": "https", "CorePort": 0}
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BootInfo {
    pub sn: String,
    #[serde(default)]
    pub core_address: String,
    #[serde(default)]
    pub core_proto: String,
    #[serde(default)]
    pub core_port: u16,
}

impl From<BootInfo> for Identity {
    fn from(info: BootInfo) -> Self {
        Self {
            sn: info.sn,
            controller: ControllerEndpoint {
                address: info.core_address,
                port: info.core_port,
                proto: ControllerProto::parse(&info.core_proto),
            },
        }
    }
}

/// Controller transport scheme
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControllerProto {
    #[default]
    Https,
    Http,
}

impl ControllerProto {
    /// Anything other than "http" is treated as https
    pub fn parse(value: &str) -> Self {
        if value.eq_ignore_ascii_case("http") {
            Self::Http
        } else {
            Self::Https
        }
    }
}

/// Upstream controller endpoint
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerEndpoint {
    /// Host or IP of the controller
    #[serde(default)]
    pub address: String,

    /// Port; 0 means "scheme default" (see [`ControllerEndpoint::url`])
    #[serde(default)]
    pub port: u16,

    /// Scheme
    #[serde(default)]
    pub proto: ControllerProto,
}

impl ControllerEndpoint {
    /// Build the absolute URL for an API path
    ///
    /// For https a zero port is left out of the URL. Plain http with a zero
    /// port goes to 443, which is what deployed controllers listen on.
    pub fn url(&self, path: &str) -> String {
        match self.proto {
            ControllerProto::Https if self.port == 0 => format!("https://{}{}", self.address, path),
            ControllerProto::Https => format!("https://{}:{}{}", self.address, self.port, path),
            ControllerProto::Http => {
                let port = if self.port == 0 { 443 } else { self.port };
                format!("http://{}:{}{}", self.address, port, path)
            }
        }
    }

    /// Validate the endpoint
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.address.contains('/') || self.address.contains(' ') {
            return Err(crate::Error::config(format!(
                "Controller address must be a bare host, got '{}'",
                self.address
            )));
        }
        Ok(())
    }
}

/// Host file locations
///
/// Every file the agent reads or writes on the host is named here so tests
/// can point the whole tree at a scratch directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HostPaths {
    pub monitor_dir: PathBuf,
    pub root_status: PathBuf,
    pub vnet_log_dir: PathBuf,
    pub frr_conf: PathBuf,
    pub ifcfg_dir: PathBuf,
    pub debian_version: PathBuf,
    pub debian_interfaces: PathBuf,
    pub ssl_client_dir: PathBuf,
    pub ssl_log_dir: PathBuf,
    pub swanctl_dir: PathBuf,
    pub smartdns_conf: PathBuf,
    pub smartdns_rule_dir: PathBuf,
    pub resolv_dnsmasq: PathBuf,
    pub resolv_conf: PathBuf,
    pub dhcpd_conf: PathBuf,
    pub keepalived_conf: PathBuf,
    pub china_route_list: PathBuf,
    pub china_route_exclude: PathBuf,
    pub core_list: PathBuf,
    pub ha_local_nat: PathBuf,
    pub sys_class_net: PathBuf,
}

impl Default for HostPaths {
    fn default() -> Self {
        Self {
            monitor_dir: PathBuf::from("/var/run/monitor"),
            root_status: PathBuf::from("/root/active"),
            vnet_log_dir: PathBuf::from("/var/log/vnet"),
            frr_conf: PathBuf::from("/etc/frr/frr.conf"),
            ifcfg_dir: PathBuf::from("/etc/sysconfig/network-scripts"),
            debian_version: PathBuf::from("/etc/debian_version"),
            debian_interfaces: PathBuf::from("/etc/network/interfaces"),
            ssl_client_dir: PathBuf::from("/home/sslclient"),
            ssl_log_dir: PathBuf::from("/var/log/sslclient"),
            swanctl_dir: PathBuf::from("/etc/swanctl/conf.d"),
            smartdns_conf: PathBuf::from("/home/smartdns/smartdns.conf"),
            smartdns_rule_dir: PathBuf::from("/home/smartdns/smartdns.d"),
            resolv_dnsmasq: PathBuf::from("/etc/resolv.dnsmasq.conf"),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
            dhcpd_conf: PathBuf::from("/etc/dhcp/dhcpd.conf"),
            keepalived_conf: PathBuf::from("/etc/keepalived/keepalived.conf"),
            china_route_list: PathBuf::from("/home/chinaRoute.conf"),
            china_route_exclude: PathBuf::from("/home/chinaRouteExc.conf"),
            core_list: PathBuf::from("/mnt/agent/coreList.conf"),
            ha_local_nat: PathBuf::from("/var/run/haLocalNat"),
            sys_class_net: PathBuf::from("/sys/class/net"),
        }
    }
}

impl HostPaths {
    /// Re-root every path under `base` (used by tests)
    pub fn rooted_at(base: impl Into<PathBuf>) -> Self {
        let base = base.into();
        let rebase = |p: PathBuf| base.join(p.strip_prefix("/").unwrap_or(&p));
        let d = Self::default();
        Self {
            monitor_dir: rebase(d.monitor_dir),
            root_status: rebase(d.root_status),
            vnet_log_dir: rebase(d.vnet_log_dir),
            frr_conf: rebase(d.frr_conf),
            ifcfg_dir: rebase(d.ifcfg_dir),
            debian_version: rebase(d.debian_version),
            debian_interfaces: rebase(d.debian_interfaces),
            ssl_client_dir: rebase(d.ssl_client_dir),
            ssl_log_dir: rebase(d.ssl_log_dir),
            swanctl_dir: rebase(d.swanctl_dir),
            smartdns_conf: rebase(d.smartdns_conf),
            smartdns_rule_dir: rebase(d.smartdns_rule_dir),
            resolv_dnsmasq: rebase(d.resolv_dnsmasq),
            resolv_conf: rebase(d.resolv_conf),
            dhcpd_conf: rebase(d.dhcpd_conf),
            keepalived_conf: rebase(d.keepalived_conf),
            china_route_list: rebase(d.china_route_list),
            china_route_exclude: rebase(d.china_route_exclude),
            core_list: rebase(d.core_list),
            ha_local_nat: rebase(d.ha_local_nat),
            sys_class_net: rebase(d.sys_class_net),
        }
    }
}

/// Liveness sampler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SamplerConfig {
    /// Tick interval in milliseconds
    #[serde(default = "default_sampler_interval_ms")]
    pub interval_ms: u64,

    /// Per-probe deadline in milliseconds
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,

    /// Consecutive failed probes before an object goes OFFLINE
    #[serde(default = "default_down_threshold")]
    pub down_threshold: u32,

    /// Ticks without a transition before the status is re-reported anyway
    #[serde(default = "default_hold_threshold")]
    pub hold_threshold: u32,
}

fn default_sampler_interval_ms() -> u64 {
    2000
}

fn default_probe_timeout_ms() -> u64 {
    1000
}

fn default_down_threshold() -> u32 {
    3
}

fn default_hold_threshold() -> u32 {
    3000
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_sampler_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
            down_threshold: default_down_threshold(),
            hold_threshold: default_hold_threshold(),
        }
    }
}

impl SamplerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Validate the sampler configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.interval_ms == 0 {
            return Err(crate::Error::config("Sampler interval must be > 0"));
        }
        if self.probe_timeout_ms == 0 || self.probe_timeout_ms > self.interval_ms * 10 {
            return Err(crate::Error::config(format!(
                "Probe timeout must be between 1 and {} ms",
                self.interval_ms * 10
            )));
        }
        if self.down_threshold == 0 {
            return Err(crate::Error::config("Down threshold must be >= 1"));
        }
        if self.hold_threshold == 0 {
            return Err(crate::Error::config("Hold threshold must be >= 1"));
        }
        Ok(())
    }
}

/// Flow sampler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Sampling period in seconds; rates are computed over this window
    #[serde(default = "default_flow_interval_secs")]
    pub interval_secs: u64,
}

fn default_flow_interval_secs() -> u64 {
    60
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_flow_interval_secs(),
        }
    }
}

/// Heartbeat and config poll configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UplinkConfig {
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    #[serde(default = "default_config_poll_interval_secs")]
    pub config_poll_interval_secs: u64,

    /// Pull the full document every N polls even when versions agree
    #[serde(default = "default_forced_poll_every")]
    pub forced_poll_every: u32,

    /// Agent version reported in the heartbeat
    #[serde(default = "default_agent_version")]
    pub agent_version: String,
}

fn default_heartbeat_interval_secs() -> u64 {
    10
}

fn default_config_poll_interval_secs() -> u64 {
    15
}

fn default_forced_poll_every() -> u32 {
    480
}

fn default_agent_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

impl Default for UplinkConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            config_poll_interval_secs: default_config_poll_interval_secs(),
            forced_poll_every: default_forced_poll_every(),
            agent_version: default_agent_version(),
        }
    }
}

/// WAN watcher configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WanConfig {
    #[serde(default = "default_wan_interval_secs")]
    pub interval_secs: u64,
}

fn default_wan_interval_secs() -> u64 {
    10
}

impl Default for WanConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_wan_interval_secs(),
        }
    }
}

/// Reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileConfig {
    /// Maximum prefixes per add/delete routing CLI invocation
    #[serde(default = "default_route_batch")]
    pub route_batch: usize,

    /// Maximum prefixes per replace invocation (two lines per prefix)
    #[serde(default = "default_replace_batch")]
    pub replace_batch: usize,

    /// Seconds to wait for an OpenVPN tunnel device after restart
    #[serde(default = "default_tunnel_wait_secs")]
    pub tunnel_wait_secs: u64,
}

fn default_route_batch() -> usize {
    100
}

fn default_replace_batch() -> usize {
    50
}

fn default_tunnel_wait_secs() -> u64 {
    10
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            route_batch: default_route_batch(),
            replace_batch: default_replace_batch(),
            tunnel_wait_secs: default_tunnel_wait_secs(),
        }
    }
}

impl ReconcileConfig {
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.route_batch == 0 || self.replace_batch == 0 {
            return Err(crate::Error::config("Route batch sizes must be > 0"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = AgentConfig::for_serial("CPE0001");
        assert!(config.validate().is_ok());
        assert_eq!(config.sampler.down_threshold, 3);
        assert_eq!(config.reconcile.route_batch, 100);
        assert_eq!(config.reconcile.replace_batch, 50);
    }

    #[test]
    fn empty_serial_rejected() {
        let config = AgentConfig::for_serial("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn controller_url_port_rules() {
        let mut ep = ControllerEndpoint {
            address: "10.0.0.1".to_string(),
            port: 0,
            proto: ControllerProto::Https,
        };
        assert_eq!(ep.url("/api/x"), "https://10.0.0.1/api/x");

        ep.port = 8443;
        assert_eq!(ep.url("/api/x"), "https://10.0.0.1:8443/api/x");

        ep.proto = ControllerProto::Http;
        ep.port = 0;
        assert_eq!(ep.url("/api/x"), "http://10.0.0.1:443/api/x");
    }

    #[test]
    fn boot_info_maps_to_identity() {
        let raw = r#"{"Sn":"CPE0001","CoreAddress":"core.local","CoreProto":"http","CorePort":8080}"#;
        let info: BootInfo = serde_json::from_str(raw).unwrap();
        let identity = Identity::from(info);
        assert_eq!(identity.sn, "CPE0001");
        assert_eq!(identity.controller.proto, ControllerProto::Http);
        assert_eq!(identity.controller.url("/a"), "http://core.local:8080/a");
    }

    #[test]
    fn rooted_paths_stay_under_base() {
        let paths = HostPaths::rooted_at("/tmp/x");
        assert_eq!(paths.monitor_dir, PathBuf::from("/tmp/x/var/run/monitor"));
        assert_eq!(paths.root_status, PathBuf::from("/tmp/x/root/active"));
    }

    #[test]
    fn sampler_timeout_bounds() {
        let mut sampler = SamplerConfig::default();
        sampler.probe_timeout_ms = 0;
        assert!(sampler.validate().is_err());
        sampler.probe_timeout_ms = 1000;
        sampler.down_threshold = 0;
        assert!(sampler.validate().is_err());
    }
}
