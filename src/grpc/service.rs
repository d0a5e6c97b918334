//! Service Facade - the `AgentHost` gRPC surface
//!
//! Thin translation layer: decode the request, call the registry, dispatcher
//! or file source, encode the reply. Every handler is timed and counted; host
//! errors become `tonic::Status` through `From<Error>`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::proto::agent_host_server::AgentHost;
use super::proto::{
    call_request, call_response, CallMode, CallRequest, CallResponse, CreateObjectRequest,
    DeleteAllResponse, DownloadRequest, Empty, FetchRequest, FetchResponse, FileChunk,
    ListObjectsResponse, MemoryResponse, ObjectIdRequest, ObjectIdResponse, ServerInfoResponse,
    SetConfigRequest, SetConfigResponse, StatusResponse,
};
use super::shutdown::Shutdown;
use crate::codec::Payload;
use crate::config::{ConfigStore, ServerConfig};
use crate::dispatch::{Argument, Dispatcher, PlaceholderTable};
use crate::error::{Error, Result};
use crate::files::FileStreamSource;
use crate::metrics::{self, GRPC_REQUEST_DURATION, REQUESTS_IN_FLIGHT, REQUESTS_TOTAL};
use crate::object::{ObjectFactory, ObjectRegistry};
use crate::usage::{hostname, ProcessUsage, UsageSource};

/// Counts one request and records its duration when dropped.
struct RequestTimer {
    operation: &'static str,
    start: Instant,
}

impl RequestTimer {
    fn start(operation: &'static str) -> Self {
        REQUESTS_TOTAL.with_label_values(&[operation]).inc();
        REQUESTS_IN_FLIGHT.inc();
        Self { operation, start: Instant::now() }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        REQUESTS_IN_FLIGHT.dec();
        GRPC_REQUEST_DURATION
            .with_label_values(&[self.operation])
            .observe(self.start.elapsed().as_secs_f64());
    }
}

/// The host: registry, dispatcher, configuration and file source behind one
/// gRPC service.
pub struct HostService {
    server_id: String,
    started: Instant,
    port: u16,
    config: Arc<ConfigStore>,
    dispatcher: Arc<Dispatcher>,
    files: FileStreamSource,
    usage: Arc<dyn UsageSource>,
    shutdown: Shutdown,
    settings: ServerConfig,
}

impl HostService {
    /// Build every component from `settings`.
    pub fn from_config(settings: &ServerConfig, factory: Arc<dyn ObjectFactory>) -> Result<Self> {
        settings.validate()?;

        let config = Arc::new(ConfigStore::new());
        let registry = ObjectRegistry::new(factory, Arc::clone(&config))
            .with_policy(settings.call_policy)
            .with_max_objects(settings.max_objects)
            .with_default_class(settings.default_class.clone());
        let results =
            Arc::new(PlaceholderTable::new(settings.result_capacity, settings.result_ttl));
        let dispatcher = Arc::new(Dispatcher::new(Arc::new(registry), results, settings));

        let files = match &settings.download_root {
            Some(root) => FileStreamSource::new(root, settings.download_chunk_size)?,
            None => FileStreamSource::disabled(),
        };

        Ok(Self {
            server_id: Uuid::now_v7().to_string(),
            started: Instant::now(),
            port: settings.listen_addr.port(),
            config,
            dispatcher,
            files,
            usage: Arc::new(ProcessUsage::new()),
            shutdown: Shutdown::new(),
            settings: settings.clone(),
        })
    }

    pub fn with_usage(mut self, usage: Arc<dyn UsageSource>) -> Self {
        self.usage = usage;
        self
    }

    /// Port reported by `ServerInfo`, when it differs from the configured one.
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn server_id(&self) -> &str {
        &self.server_id
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn shutdown(&self) -> &Shutdown {
        &self.shutdown
    }

    pub fn settings(&self) -> &ServerConfig {
        &self.settings
    }

    fn registry(&self) -> &Arc<ObjectRegistry> {
        self.dispatcher.registry()
    }

    fn ensure_running(&self) -> std::result::Result<(), Status> {
        if self.shutdown.is_triggered() {
            return Err(Error::ShuttingDown.into());
        }
        Ok(())
    }
}

impl std::fmt::Debug for HostService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostService")
            .field("server_id", &self.server_id)
            .field("port", &self.port)
            .field("dispatcher", &self.dispatcher)
            .finish()
    }
}

fn argument_from_wire(argument: Option<call_request::Argument>) -> Argument {
    match argument {
        Some(call_request::Argument::Inline(bytes)) => Argument::Inline(Payload::new(bytes)),
        Some(call_request::Argument::TaskId(task_id)) => Argument::Placeholder(task_id),
        None => Argument::default(),
    }
}

#[tonic::async_trait]
impl AgentHost for HostService {
    type DownloadFileStream = ReceiverStream<std::result::Result<FileChunk, Status>>;

    async fn is_alive(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<StatusResponse>, Status> {
        let _timer = RequestTimer::start("is_alive");
        self.ensure_running()?;
        Ok(Response::new(StatusResponse { ok: true, message: String::new() }))
    }

    async fn stop(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<StatusResponse>, Status> {
        let _timer = RequestTimer::start("stop");
        let message = if self.shutdown.trigger() {
            info!(server_id = %self.server_id, "stop requested");
            self.dispatcher.close();
            "stopping"
        } else {
            "already stopping"
        };
        Ok(Response::new(StatusResponse { ok: true, message: message.to_string() }))
    }

    async fn create_object(
        &self,
        request: Request<CreateObjectRequest>,
    ) -> std::result::Result<Response<ObjectIdResponse>, Status> {
        let _timer = RequestTimer::start("create_object");
        self.ensure_running()?;
        let req = request.into_inner();

        let object_id = self
            .registry()
            .create(&req.object_id, &req.class_name, &Payload::new(req.init_args))
            .await?;
        Ok(Response::new(ObjectIdResponse { object_id }))
    }

    async fn delete_object(
        &self,
        request: Request<ObjectIdRequest>,
    ) -> std::result::Result<Response<StatusResponse>, Status> {
        let _timer = RequestTimer::start("delete_object");
        self.ensure_running()?;
        self.registry().delete(&request.into_inner().object_id)?;
        Ok(Response::new(StatusResponse { ok: true, message: String::new() }))
    }

    async fn delete_all_objects(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<DeleteAllResponse>, Status> {
        let _timer = RequestTimer::start("delete_all_objects");
        self.ensure_running()?;
        let deleted = self.registry().delete_all() as u64;
        Ok(Response::new(DeleteAllResponse { deleted }))
    }

    async fn clone_object(
        &self,
        request: Request<ObjectIdRequest>,
    ) -> std::result::Result<Response<ObjectIdResponse>, Status> {
        let _timer = RequestTimer::start("clone_object");
        self.ensure_running()?;
        let object_id = self.registry().clone_object(&request.into_inner().object_id).await?;
        Ok(Response::new(ObjectIdResponse { object_id }))
    }

    async fn list_objects(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<ListObjectsResponse>, Status> {
        let _timer = RequestTimer::start("list_objects");
        self.ensure_running()?;
        let objects = self.registry().list_summaries().into_iter().map(Into::into).collect();
        Ok(Response::new(ListObjectsResponse { objects }))
    }

    async fn server_info(
        &self,
        _request: Request<Empty>,
    ) -> std::result::Result<Response<ServerInfoResponse>, Status> {
        let _timer = RequestTimer::start("server_info");
        self.ensure_running()?;

        let usage = self.usage.snapshot();
        let results = self.dispatcher.results().stats();
        let calls = self.dispatcher.stats();
        Ok(Response::new(ServerInfoResponse {
            server_id: self.server_id.clone(),
            pid: std::process::id(),
            host: hostname(),
            port: u32::from(self.port),
            uptime_ms: self.started.elapsed().as_millis() as u64,
            cpu_percent: usage.cpu_percent,
            memory_bytes: usage.memory_bytes,
            object_count: self.registry().len() as u64,
            pending_tasks: results.pending as u64,
            stored_results: results.resolved as u64,
            in_flight_calls: calls.in_flight as u64,
            queued_calls: calls.queued as u64,
            config_version: self.config.snapshot().version,
            metrics: metrics::render(),
        }))
    }

    async fn set_config(
        &self,
        request: Request<SetConfigRequest>,
    ) -> std::result::Result<Response<SetConfigResponse>, Status> {
        let _timer = RequestTimer::start("set_config");
        self.ensure_running()?;
        let req = request.into_inner();
        let version = self.config.apply(req.config, req.merge)?;
        info!(version, merge = req.merge, "configuration updated");
        Ok(Response::new(SetConfigResponse { version }))
    }

    async fn get_memory(
        &self,
        request: Request<ObjectIdRequest>,
    ) -> std::result::Result<Response<MemoryResponse>, Status> {
        let _timer = RequestTimer::start("get_memory");
        self.ensure_running()?;
        let object_id = request.into_inner().object_id;
        let memory = self.registry().memory(&object_id).await?;
        Ok(Response::new(MemoryResponse { object_id, memory: memory.into() }))
    }

    async fn call_function(
        &self,
        request: Request<CallRequest>,
    ) -> std::result::Result<Response<CallResponse>, Status> {
        let _timer = RequestTimer::start("call_function");
        self.ensure_running()?;
        let req = request.into_inner();
        let mode = req.mode();
        let argument = argument_from_wire(req.argument);
        debug!(object_id = %req.object_id, function = %req.function, ?mode, "call");

        let outcome = match mode {
            CallMode::Sync => {
                let outcome =
                    self.dispatcher.call_sync(&req.object_id, &req.function, argument).await?;
                call_response::Outcome::Inline(outcome.into())
            }
            CallMode::Async => {
                let task_id =
                    self.dispatcher.call_async(&req.object_id, &req.function, argument).await?;
                call_response::Outcome::TaskId(task_id)
            }
        };
        Ok(Response::new(CallResponse { outcome: Some(outcome) }))
    }

    async fn fetch_result(
        &self,
        request: Request<FetchRequest>,
    ) -> std::result::Result<Response<FetchResponse>, Status> {
        let _timer = RequestTimer::start("fetch_result");
        self.ensure_running()?;
        let req = request.into_inner();
        let state =
            self.dispatcher.fetch_result(req.task_id, Duration::from_millis(req.wait_ms)).await?;
        Ok(Response::new(FetchResponse::from_state(req.task_id, state)))
    }

    async fn download_file(
        &self,
        request: Request<DownloadRequest>,
    ) -> std::result::Result<Response<Self::DownloadFileStream>, Status> {
        let timer = RequestTimer::start("download_file");
        self.ensure_running()?;
        let path = request.into_inner().path;
        let mut chunks = self.files.open(&path).await?;

        let (tx, rx) = tokio::sync::mpsc::channel(16);
        tokio::spawn(async move {
            let _timer = timer;
            while let Some(item) = chunks.next().await {
                let message = match item {
                    Ok(chunk) => Ok(FileChunk { data: chunk.data, offset: chunk.offset }),
                    Err(e) => {
                        warn!(path = %path, error = %e, "download failed mid-stream");
                        Err(Status::data_loss(e.to_string()))
                    }
                };
                let failed = message.is_err();
                if tx.send(message).await.is_err() {
                    debug!(path = %path, "download receiver dropped");
                    break;
                }
                if failed {
                    break;
                }
            }
        });

        Ok(Response::new(ReceiverStream::new(rx)))
    }
}
