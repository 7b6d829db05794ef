// # Host Adapters
//
// This crate connects the CPE core to the Linux host it runs on.
//
// ## Purpose
//
// - [`ShellExecutor`]: runs every command the core issues through `sh -c`
// - [`FsRenderer`]: reads and writes rendered daemon configs, status files
//   and flow logs on the local filesystem
//
// Both are thin. All decisions about what to run or write stay in
// `cpe-core`; these adapters only carry them out and report failures.

pub mod fs;
pub mod shell;

pub use fs::{FsRenderer, FsRendererFactory};
pub use shell::{ShellExecutor, ShellExecutorFactory};
