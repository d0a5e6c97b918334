//! agenthost server binary
//!
//! Loads an optional JSON config file, applies CLI/env overrides, then serves
//! the `AgentHost` gRPC API until `Stop`, SIGINT or SIGTERM.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use agenthost::config::{CallPolicy, ServerConfig};
use agenthost::grpc::{serve, HostService};
use agenthost::object::builtin;
use agenthost::tracing::{init_tracing, shutdown_tracing};

#[derive(Debug, Parser)]
#[command(name = "agenthost", version, about = "Host stateful agent objects behind a gRPC API")]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(long, env = "AGENTHOST_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "AGENTHOST_LISTEN")]
    listen: Option<SocketAddr>,

    /// Maximum live objects (0 = unbounded)
    #[arg(long, env = "AGENTHOST_MAX_OBJECTS")]
    max_objects: Option<usize>,

    /// Overlapping calls on one object: serialize, reject or concurrent
    #[arg(long, env = "AGENTHOST_CALL_POLICY")]
    call_policy: Option<CallPolicy>,

    /// Async calls executing at once
    #[arg(long, env = "AGENTHOST_MAX_WORKERS")]
    max_workers: Option<usize>,

    /// Async calls allowed to wait for a worker
    #[arg(long, env = "AGENTHOST_MAX_QUEUED")]
    max_queued: Option<usize>,

    /// Directory served by DownloadFile (downloads disabled when unset)
    #[arg(long, env = "AGENTHOST_DOWNLOAD_ROOT")]
    download_root: Option<PathBuf>,

    /// Seconds to wait for connections and calls on shutdown
    #[arg(long, env = "AGENTHOST_SHUTDOWN_GRACE")]
    shutdown_grace: Option<u64>,

    /// OTLP collector endpoint for trace export
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

impl Args {
    fn into_config(self) -> agenthost::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)?,
            None => ServerConfig::default(),
        };
        if let Some(addr) = self.listen {
            config.listen_addr = addr;
        }
        if let Some(n) = self.max_objects {
            config.max_objects = n;
        }
        if let Some(policy) = self.call_policy {
            config.call_policy = policy;
        }
        if let Some(n) = self.max_workers {
            config.max_workers = n;
        }
        if let Some(n) = self.max_queued {
            config.max_queued = n;
        }
        if let Some(root) = self.download_root {
            config.download_root = Some(root);
        }
        if let Some(secs) = self.shutdown_grace {
            config.shutdown_grace = Duration::from_secs(secs);
        }
        if self.otlp_endpoint.is_some() {
            config.otlp_endpoint = self.otlp_endpoint;
        }
        config.validate()?;
        Ok(config)
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, listening for ctrl-c only");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let config = Args::parse().into_config()?;

    init_tracing("agenthost", config.otlp_endpoint.as_deref())?;
    agenthost::metrics::init();

    let service = HostService::from_config(&config, Arc::new(builtin::factory()))?;
    info!(
        server_id = service.server_id(),
        policy = ?config.call_policy,
        workers = config.max_workers,
        "agent host starting"
    );

    let shutdown = service.shutdown().clone();
    tokio::spawn(async move {
        wait_for_signal().await;
        if shutdown.trigger() {
            info!("signal received, shutting down");
        }
    });

    serve(service, config.listen_addr).await?;
    shutdown_tracing();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_command_builds() {
        Args::command().debug_assert();
    }

    #[test]
    fn test_flags_override_defaults() {
        let args = Args::try_parse_from([
            "agenthost",
            "--listen",
            "0.0.0.0:9000",
            "--call-policy",
            "reject",
            "--max-workers",
            "3",
        ])
        .unwrap();
        let config = args.into_config().unwrap();
        assert_eq!(config.listen_addr.port(), 9000);
        assert_eq!(config.call_policy, CallPolicy::Reject);
        assert_eq!(config.max_workers, 3);
        assert_eq!(config.max_queued, ServerConfig::default().max_queued);
    }

    #[test]
    fn test_unknown_policy_rejected() {
        assert!(Args::try_parse_from(["agenthost", "--call-policy", "yolo"]).is_err());
    }
}
