// # Config Store Implementations
//
// This module provides implementations of the ConfigStore trait for
// different persistence strategies.

pub mod file;
pub mod memory;

pub use file::{FileConfigStore, FileConfigStoreFactory};
pub use memory::{MemoryConfigStore, MemoryConfigStoreFactory};
