//! Net primitives
//!
//! Thin, idempotent wrappers that turn one intent into host commands run
//! through a [`CommandExecutor`](crate::traits::CommandExecutor). Object
//! kinds compose these; nothing here reads the config store.

pub mod cidr;
pub mod firewall;
pub mod link;
pub mod vtysh;

pub use cidr::{arrcmp, dedup};
pub use firewall::NatRule;
pub use vtysh::VtyshScript;
