//! Typed client for the `AgentHost` service.
//!
//! Wraps the generated tonic client with plain Rust arguments and results,
//! the way callers (the `agenthost-ctl` binary, tests) want to use it.

use std::time::Duration;

use bytes::Bytes;
use tokio_stream::StreamExt;
use tonic::transport::{Channel, Endpoint};

use super::proto::agent_host_client::AgentHostClient;
use super::proto::{
    call_request, call_response, CallMode, CallRequest, CallResult, CreateObjectRequest,
    DownloadRequest, Empty, FetchRequest, FetchResponse, FileChunk, ObjectIdRequest,
    ObjectSummary, ServerInfoResponse, SetConfigRequest,
};
use crate::dispatch::Argument;

/// Error type for client operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("rpc failed: {0}")]
    Status(#[from] tonic::Status),
    #[error("unexpected response: {0}")]
    Protocol(String),
}

pub type ClientResult<T> = std::result::Result<T, ClientError>;

/// Client for one agent host.
#[derive(Debug, Clone)]
pub struct HostClient {
    client: AgentHostClient<Channel>,
}

impl HostClient {
    /// Connect to `addr` (`host:port`, or a full `http://` URI).
    pub async fn connect(addr: &str) -> ClientResult<Self> {
        let uri =
            if addr.contains("://") { addr.to_string() } else { format!("http://{}", addr) };
        let channel = Endpoint::from_shared(uri)?.connect().await?;
        Ok(Self { client: AgentHostClient::new(channel) })
    }

    /// Connect with retry logic for a host that may still be starting
    ///
    /// # Arguments
    /// * `addr` - host address
    /// * `max_retries` - maximum number of connection attempts
    /// * `retry_delay` - delay between attempts
    pub async fn connect_with_retry(
        addr: &str,
        max_retries: u32,
        retry_delay: Duration,
    ) -> ClientResult<Self> {
        let mut last_error = None;
        for attempt in 0..max_retries {
            match Self::connect(addr).await {
                Ok(client) => return Ok(client),
                Err(e) => {
                    tracing::debug!(attempt, error = %e, "connect attempt failed");
                    last_error = Some(e);
                    if attempt + 1 < max_retries {
                        tokio::time::sleep(retry_delay).await;
                    }
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ClientError::Protocol("no connection attempts".into())))
    }

    pub async fn is_alive(&mut self) -> ClientResult<bool> {
        Ok(self.client.is_alive(Empty {}).await?.into_inner().ok)
    }

    pub async fn stop(&mut self) -> ClientResult<()> {
        self.client.stop(Empty {}).await?;
        Ok(())
    }

    /// Create an object. Empty `object_id` lets the server choose one.
    pub async fn create_object(
        &mut self,
        object_id: &str,
        class_name: &str,
        init_args: impl Into<Bytes>,
    ) -> ClientResult<String> {
        let request = CreateObjectRequest {
            object_id: object_id.to_string(),
            class_name: class_name.to_string(),
            init_args: init_args.into(),
        };
        Ok(self.client.create_object(request).await?.into_inner().object_id)
    }

    pub async fn delete_object(&mut self, object_id: &str) -> ClientResult<()> {
        self.client.delete_object(ObjectIdRequest { object_id: object_id.to_string() }).await?;
        Ok(())
    }

    pub async fn delete_all_objects(&mut self) -> ClientResult<u64> {
        Ok(self.client.delete_all_objects(Empty {}).await?.into_inner().deleted)
    }

    pub async fn clone_object(&mut self, object_id: &str) -> ClientResult<String> {
        let request = ObjectIdRequest { object_id: object_id.to_string() };
        Ok(self.client.clone_object(request).await?.into_inner().object_id)
    }

    pub async fn list_objects(&mut self) -> ClientResult<Vec<ObjectSummary>> {
        Ok(self.client.list_objects(Empty {}).await?.into_inner().objects)
    }

    pub async fn server_info(&mut self) -> ClientResult<ServerInfoResponse> {
        Ok(self.client.server_info(Empty {}).await?.into_inner())
    }

    /// Prometheus text of the host's metrics registry.
    pub async fn metrics(&mut self) -> ClientResult<String> {
        Ok(self.server_info().await?.metrics)
    }

    /// Replace (or merge into) the model configuration. Returns the new version.
    pub async fn set_config(&mut self, config: impl Into<Bytes>, merge: bool) -> ClientResult<u64> {
        let request = SetConfigRequest { config: config.into(), merge };
        Ok(self.client.set_config(request).await?.into_inner().version)
    }

    pub async fn get_memory(&mut self, object_id: &str) -> ClientResult<Bytes> {
        let request = ObjectIdRequest { object_id: object_id.to_string() };
        Ok(self.client.get_memory(request).await?.into_inner().memory)
    }

    /// Call a function and wait for its result.
    pub async fn call(
        &mut self,
        object_id: &str,
        function: &str,
        argument: Argument,
    ) -> ClientResult<CallResult> {
        match self.call_with_mode(object_id, function, argument, CallMode::Sync).await? {
            call_response::Outcome::Inline(result) => Ok(result),
            call_response::Outcome::TaskId(id) => {
                Err(ClientError::Protocol(format!("sync call answered with task id {}", id)))
            }
        }
    }

    /// Start a function call in the background. Returns its task id.
    pub async fn call_async(
        &mut self,
        object_id: &str,
        function: &str,
        argument: Argument,
    ) -> ClientResult<u64> {
        match self.call_with_mode(object_id, function, argument, CallMode::Async).await? {
            call_response::Outcome::TaskId(id) => Ok(id),
            call_response::Outcome::Inline(_) => {
                Err(ClientError::Protocol("async call answered inline".into()))
            }
        }
    }

    async fn call_with_mode(
        &mut self,
        object_id: &str,
        function: &str,
        argument: Argument,
        mode: CallMode,
    ) -> ClientResult<call_response::Outcome> {
        let argument = match argument {
            Argument::Inline(payload) => call_request::Argument::Inline(payload.into()),
            Argument::Placeholder(task_id) => call_request::Argument::TaskId(task_id),
        };
        let request = CallRequest {
            object_id: object_id.to_string(),
            function: function.to_string(),
            argument: Some(argument),
            mode: mode as i32,
        };
        self.client
            .call_function(request)
            .await?
            .into_inner()
            .outcome
            .ok_or_else(|| ClientError::Protocol("call response without outcome".into()))
    }

    /// Fetch an async call's state, waiting up to `wait` for it to finish.
    pub async fn fetch_result(
        &mut self,
        task_id: u64,
        wait: Duration,
    ) -> ClientResult<FetchResponse> {
        let request = FetchRequest { task_id, wait_ms: wait.as_millis() as u64 };
        Ok(self.client.fetch_result(request).await?.into_inner())
    }

    /// Download a file, calling `on_chunk` for each chunk as it arrives.
    /// Returns the total number of bytes received.
    pub async fn download_streaming<F>(&mut self, path: &str, mut on_chunk: F) -> ClientResult<u64>
    where
        F: FnMut(&FileChunk),
    {
        let request = DownloadRequest { path: path.to_string() };
        let mut stream = self.client.download_file(request).await?.into_inner();

        let mut total = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            if chunk.offset != total {
                return Err(ClientError::Protocol(format!(
                    "chunk at offset {} after {} bytes",
                    chunk.offset, total
                )));
            }
            total += chunk.data.len() as u64;
            on_chunk(&chunk);
        }
        Ok(total)
    }

    /// Download a whole file into memory.
    pub async fn download(&mut self, path: &str) -> ClientResult<Vec<u8>> {
        let mut data = Vec::new();
        self.download_streaming(path, |chunk| data.extend_from_slice(&chunk.data)).await?;
        Ok(data)
    }
}
