//! gRPC surface of the agent host
//!
//! This module provides:
//! - `proto` - wire messages and the generated `AgentHost` service stubs
//! - `service` - the `AgentHost` implementation over registry and dispatcher
//! - `server` - transport loop with graceful stop
//! - `client` - typed client used by `agenthost-ctl` and the tests

pub mod client;
pub mod proto;
pub mod server;
pub mod service;
pub mod shutdown;

pub use client::{ClientError, HostClient};
pub use server::{serve, serve_listener};
pub use service::HostService;
pub use shutdown::Shutdown;
