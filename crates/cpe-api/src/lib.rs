// # Control API
//
// HTTP surface through which an operator or the controller pushes
// configuration straight to the device.
//
// ## Purpose
//
// - Per-kind create, modify and delete for the collection kinds
// - PUT for the singleton kinds
// - `configAll` for a full configuration document
//
// Every call is checked against the device serial number, handed to the
// shared [`cpe_core::Reconciler`], and answered with a `{success, code, msg}`
// envelope. The API holds no state of its own.

pub mod dto;
pub mod handlers;
pub mod server;

pub use dto::ApiResponse;
pub use server::{ApiState, router, serve};
