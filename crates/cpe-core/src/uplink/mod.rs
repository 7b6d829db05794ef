//! Controller-facing background loops
//!
//! - [`Heartbeat`] announces the agent and learns the controller's config version
//! - [`ConfigPoller`] pulls the full document when that version moves
//! - [`WanWatcher`] follows DHCP-assigned WAN addresses and the HA VIP

pub mod config_poll;
pub mod heartbeat;
pub mod wan;

pub use config_poll::{ConfigPoller, PollOutcome};
pub use heartbeat::{Heartbeat, HeartbeatRequest};
pub use wan::{HaStatus, WanObservation, WanReport, WanWatcher};

/// Controller path under this agent's resource
pub(crate) fn cpe_path(sn: &str, suffix: &str) -> String {
    format!("/api/cpeConfig/cpes/{}/{}", sn, suffix)
}
