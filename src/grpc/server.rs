//! Server loop: tonic transport, graceful stop and the result sweeper.
//!
//! ```text
//! Stop RPC / SIGTERM ──► Shutdown ──► tonic stops accepting, drains connections
//!                              │
//!                              └──► grace timer ──► remaining connections dropped
//! afterwards: dispatcher closed, in-flight calls drained (same grace)
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::Server;
use tracing::{info, warn};

use super::proto::agent_host_server::AgentHostServer;
use super::service::HostService;
use super::shutdown::Shutdown;
use crate::dispatch::{Dispatcher, PlaceholderTable};

/// Serve on `addr` until shutdown is requested.
pub async fn serve(service: HostService, addr: SocketAddr) -> Result<(), tonic::transport::Error> {
    let (shutdown, dispatcher, settings) =
        (service.shutdown().clone(), Arc::clone(service.dispatcher()), service.settings().clone());
    info!(%addr, server_id = service.server_id(), "agent host listening");

    let signal = {
        let shutdown = shutdown.clone();
        async move { shutdown.wait().await }
    };
    let server = Server::builder()
        .add_service(AgentHostServer::new(service))
        .serve_with_shutdown(addr, signal);

    run(server, shutdown, dispatcher, settings.sweep_interval, settings.shutdown_grace).await
}

/// Serve on an already bound listener. Used when the port is picked by the OS.
pub async fn serve_listener(
    service: HostService,
    listener: TcpListener,
) -> Result<(), tonic::transport::Error> {
    let (shutdown, dispatcher, settings) =
        (service.shutdown().clone(), Arc::clone(service.dispatcher()), service.settings().clone());
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, server_id = service.server_id(), "agent host listening");
    }

    let signal = {
        let shutdown = shutdown.clone();
        async move { shutdown.wait().await }
    };
    let server = Server::builder()
        .add_service(AgentHostServer::new(service))
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), signal);

    run(server, shutdown, dispatcher, settings.sweep_interval, settings.shutdown_grace).await
}

async fn run<F>(
    server: F,
    shutdown: Shutdown,
    dispatcher: Arc<Dispatcher>,
    sweep_interval: Duration,
    grace: Duration,
) -> Result<(), tonic::transport::Error>
where
    F: Future<Output = Result<(), tonic::transport::Error>>,
{
    let sweeper =
        PlaceholderTable::start_sweeper(Arc::clone(dispatcher.results()), sweep_interval);

    let grace_expired = async {
        shutdown.wait().await;
        tokio::time::sleep(grace).await;
    };
    let result = tokio::select! {
        result = server => result,
        _ = grace_expired => {
            warn!(?grace, "shutdown grace elapsed, dropping open connections");
            Ok(())
        }
    };

    // Transport errors end the loop too; make sure no new work slips in
    shutdown.trigger();
    dispatcher.close();
    if !dispatcher.drain(grace).await {
        warn!("in-flight calls still running at exit");
    }
    sweeper.abort();
    info!("agent host stopped");
    result
}
