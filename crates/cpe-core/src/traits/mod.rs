//! Collaborator traits for the CPE agent
//!
//! This module defines the abstract interfaces between the core and the host.
//!
//! - [`ConfigStore`]: Last applied configuration, one JSON value per key
//! - [`CommandExecutor`]: Run a host command and capture its stdout
//! - [`ControllerClient`]: Request/response calls to the upstream controller
//! - [`ConfigRenderer`]: Host file access for rendered configs and status files

pub mod command_executor;
pub mod config_renderer;
pub mod config_store;
pub mod controller_client;

pub use command_executor::{CommandExecutor, CommandExecutorFactory};
pub use config_renderer::{ConfigRenderer, ConfigRendererFactory};
pub use config_store::{ConfigStore, ConfigStoreFactory};
pub use controller_client::{ControllerClient, ControllerClientFactory, ControllerReply};
