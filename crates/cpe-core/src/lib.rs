// # cpe-core
//
// Core library for the CPE edge agent.
//
// ## Architecture Overview
//
// The agent converges a declarative network configuration onto a Linux host
// and watches the health of what it programmed:
// - **ConfigStore**: Trait for the key/value store holding the last applied configuration
// - **CommandExecutor**: Trait for running host commands (ip, iptables, ipset, vtysh, ...)
// - **ControllerClient**: Trait for talking to the upstream controller
// - **ConfigRenderer**: Trait for host file access (daemon configs, status files)
// - **Reconciler**: Applies full documents and single-object calls in dependency order
// - **LivenessSampler**: Probes ports and tunnels, debounces flaps, reports transitions
// - **FlowSampler**: Writes per-minute rate, loss and latency records for the collector
// - **Uplink loops**: Heartbeat, config poll and the WAN/HA watcher, each run under `supervise`
//
// ## Design Principles
//
// 1. **Separation of Concerns**: Core logic never touches the host directly, only through traits
// 2. **Idempotency**: Every object operation can be replayed after a crash
// 3. **Minimal Deltas**: Modify emits only the commands for fields that changed
// 4. **Isolation**: One failing object never blocks the rest of a reconciliation pass
// 5. **Library-First**: The daemon is a thin wiring layer over this crate

pub mod config;
pub mod error;
pub mod flow;
pub mod health;
pub mod keyed_lock;
pub mod liveness;
pub mod model;
pub mod net;
pub mod port_map;
pub mod reconcile;
pub mod store;
pub mod supervisor;
pub mod traits;
pub mod uplink;

// Re-export core types for convenience
pub use config::AgentConfig;
pub use error::{Error, Result};
pub use flow::FlowSampler;
pub use health::{AgentHealth, HealthStatus};
pub use keyed_lock::KeyedLock;
pub use liveness::LivenessSampler;
pub use model::{Action, AllConf, ManagedObject, ModifyOutcome, ReconcileContext};
pub use port_map::PortMap;
pub use reconcile::Reconciler;
pub use store::{FileConfigStore, MemoryConfigStore};
pub use supervisor::supervise;
pub use traits::{CommandExecutor, ConfigRenderer, ConfigStore, ControllerClient};
pub use uplink::{ConfigPoller, Heartbeat, WanWatcher};
