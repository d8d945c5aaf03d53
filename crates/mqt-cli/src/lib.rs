//! mqtunnel: Entry points and TCP endpoints for the tunnel engine
//!
//! Provides the `start_tunnel` / `connect_tunnel` boundary functions and the
//! `mqtunnel` binary that exposes them on the command line.

pub mod endpoint;
pub mod entry;

pub use entry::{connect_tunnel, start_tunnel, STATUS_FAILURE, STATUS_OK};
