//! agenthost - a network-addressable host for stateful agent objects
//!
//! Remote clients create objects by class name, call functions on them
//! synchronously or asynchronously, fetch async results through placeholders,
//! clone and delete objects, push model configuration and stream files from a
//! confined download root, all over one gRPC service.
//!
//! # Modules
//!
//! - `object` - hosted-object collaborator traits, factory and the registry
//! - `dispatch` - invocation dispatcher, worker pool and result placeholders
//! - `grpc` - the `AgentHost` service, server loop and typed client
//! - `files` - chunked file streaming under a download root
//! - `config` - startup configuration and the model configuration store
//! - `codec` - opaque payloads and the JSON payload codec
//! - `usage` - process resource usage for `ServerInfo`
//! - `metrics` - Prometheus metrics for observability
//! - `tracing` - logging and optional OpenTelemetry export
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use agenthost::{config::ServerConfig, grpc::{serve, HostService}, object::builtin};
//!
//! let config = ServerConfig::default();
//! let service = HostService::from_config(&config, Arc::new(builtin::factory()))?;
//! serve(service, config.listen_addr).await?;
//! ```

pub mod codec;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod files;
pub mod grpc;
pub mod metrics;
pub mod object;
pub mod tracing;
pub mod usage;

// Re-export commonly used types at crate root for convenience
pub use codec::{JsonCodec, Payload, PayloadCodec};
pub use config::{CallPolicy, ConfigStore, ServerConfig};
pub use dispatch::{Argument, Dispatcher, TaskState};
pub use error::{Error, Result};
pub use grpc::{HostClient, HostService};
pub use object::{CallOutcome, HostedObject, ObjectFactory, ObjectRegistry};
