//! Wire messages for the `agenthost.AgentHost` service.
//!
//! Written by hand with prost derives; `build.rs` generates the service
//! traits and client against these paths.

use bytes::Bytes;

use crate::codec::Payload;
use crate::dispatch::TaskState;
use crate::object::{CallOutcome, ObjectSummary as Summary};

include!(concat!(env!("OUT_DIR"), "/agenthost.AgentHost.rs"));

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusResponse {
    #[prost(bool, tag = "1")]
    pub ok: bool,
    #[prost(string, tag = "2")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CreateObjectRequest {
    /// Empty asks the server to generate an id
    #[prost(string, tag = "1")]
    pub object_id: String,
    /// Empty selects the server's default class
    #[prost(string, tag = "2")]
    pub class_name: String,
    #[prost(bytes = "bytes", tag = "3")]
    pub init_args: Bytes,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ObjectIdRequest {
    #[prost(string, tag = "1")]
    pub object_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ObjectIdResponse {
    #[prost(string, tag = "1")]
    pub object_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeleteAllResponse {
    #[prost(uint64, tag = "1")]
    pub deleted: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ObjectSummary {
    #[prost(string, tag = "1")]
    pub object_id: String,
    #[prost(string, tag = "2")]
    pub class_name: String,
    #[prost(string, tag = "3")]
    pub status: String,
    #[prost(uint64, tag = "4")]
    pub age_ms: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ListObjectsResponse {
    #[prost(message, repeated, tag = "1")]
    pub objects: Vec<ObjectSummary>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ServerInfoResponse {
    #[prost(string, tag = "1")]
    pub server_id: String,
    #[prost(uint32, tag = "2")]
    pub pid: u32,
    #[prost(string, tag = "3")]
    pub host: String,
    #[prost(uint32, tag = "4")]
    pub port: u32,
    #[prost(uint64, tag = "5")]
    pub uptime_ms: u64,
    #[prost(double, tag = "6")]
    pub cpu_percent: f64,
    #[prost(uint64, tag = "7")]
    pub memory_bytes: u64,
    #[prost(uint64, tag = "8")]
    pub object_count: u64,
    #[prost(uint64, tag = "9")]
    pub pending_tasks: u64,
    #[prost(uint64, tag = "10")]
    pub stored_results: u64,
    #[prost(uint64, tag = "11")]
    pub in_flight_calls: u64,
    #[prost(uint64, tag = "12")]
    pub queued_calls: u64,
    #[prost(uint64, tag = "13")]
    pub config_version: u64,
    /// Process metrics in the prometheus text format
    #[prost(string, tag = "14")]
    pub metrics: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetConfigRequest {
    /// JSON document
    #[prost(bytes = "bytes", tag = "1")]
    pub config: Bytes,
    /// Merge into the current configuration instead of replacing it
    #[prost(bool, tag = "2")]
    pub merge: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct SetConfigResponse {
    #[prost(uint64, tag = "1")]
    pub version: u64,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MemoryResponse {
    #[prost(string, tag = "1")]
    pub object_id: String,
    #[prost(bytes = "bytes", tag = "2")]
    pub memory: Bytes,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum CallMode {
    Sync = 0,
    Async = 1,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CallRequest {
    #[prost(string, tag = "1")]
    pub object_id: String,
    #[prost(string, tag = "2")]
    pub function: String,
    #[prost(oneof = "call_request::Argument", tags = "3, 4")]
    pub argument: Option<call_request::Argument>,
    #[prost(enumeration = "CallMode", tag = "5")]
    pub mode: i32,
}

pub mod call_request {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Argument {
        #[prost(bytes = "bytes", tag = "3")]
        Inline(::bytes::Bytes),
        /// Use the result of an earlier async call
        #[prost(uint64, tag = "4")]
        TaskId(u64),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CallResult {
    #[prost(bool, tag = "1")]
    pub ok: bool,
    #[prost(bytes = "bytes", tag = "2")]
    pub result: Bytes,
    #[prost(string, tag = "3")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CallResponse {
    #[prost(oneof = "call_response::Outcome", tags = "1, 2")]
    pub outcome: Option<call_response::Outcome>,
}

pub mod call_response {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Outcome {
        /// Sync mode
        #[prost(message, tag = "1")]
        Inline(super::CallResult),
        /// Async mode
        #[prost(uint64, tag = "2")]
        TaskId(u64),
    }
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FetchRequest {
    #[prost(uint64, tag = "1")]
    pub task_id: u64,
    /// 0 = return immediately
    #[prost(uint64, tag = "2")]
    pub wait_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum TaskStatus {
    Pending = 0,
    Ready = 1,
    Failed = 2,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FetchResponse {
    #[prost(uint64, tag = "1")]
    pub task_id: u64,
    #[prost(enumeration = "TaskStatus", tag = "2")]
    pub status: i32,
    #[prost(bool, tag = "3")]
    pub ok: bool,
    #[prost(bytes = "bytes", tag = "4")]
    pub result: Bytes,
    #[prost(string, tag = "5")]
    pub message: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DownloadRequest {
    /// Path relative to the server's download root
    #[prost(string, tag = "1")]
    pub path: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct FileChunk {
    #[prost(bytes = "bytes", tag = "1")]
    pub data: Bytes,
    #[prost(uint64, tag = "2")]
    pub offset: u64,
}

impl From<CallOutcome> for CallResult {
    fn from(outcome: CallOutcome) -> Self {
        Self { ok: outcome.ok, result: outcome.result.into(), message: outcome.message }
    }
}

impl From<CallResult> for CallOutcome {
    fn from(result: CallResult) -> Self {
        Self { ok: result.ok, result: Payload::new(result.result), message: result.message }
    }
}

impl From<Summary> for ObjectSummary {
    fn from(summary: Summary) -> Self {
        Self {
            object_id: summary.id,
            class_name: summary.class_name,
            status: summary.status,
            age_ms: summary.age.as_millis() as u64,
        }
    }
}

impl FetchResponse {
    pub fn from_state(task_id: u64, state: TaskState) -> Self {
        let mut response = Self { task_id, ..Self::default() };
        match state {
            TaskState::Pending => response.set_status(TaskStatus::Pending),
            TaskState::Ready(outcome) => {
                response.set_status(TaskStatus::Ready);
                response.ok = outcome.ok;
                response.result = outcome.result.into();
                response.message = outcome.message;
            }
            TaskState::Failed(message) => {
                response.set_status(TaskStatus::Failed);
                response.message = message;
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_call_request_oneof_survives_the_wire() {
        let request = CallRequest {
            object_id: "a".into(),
            function: "echo".into(),
            argument: Some(call_request::Argument::TaskId(7)),
            mode: CallMode::Async as i32,
        };
        let decoded = CallRequest::decode(request.encode_to_vec().as_slice()).unwrap();
        assert_eq!(decoded.mode(), CallMode::Async);
        assert_eq!(decoded.argument, Some(call_request::Argument::TaskId(7)));
    }

    #[test]
    fn test_fetch_response_from_states() {
        let pending = FetchResponse::from_state(1, TaskState::Pending);
        assert_eq!(pending.status(), TaskStatus::Pending);

        let ready = FetchResponse::from_state(2, TaskState::Ready(CallOutcome::success("v")));
        assert_eq!(ready.status(), TaskStatus::Ready);
        assert!(ready.ok);
        assert_eq!(ready.result, Bytes::from_static(b"v"));

        let failed = FetchResponse::from_state(3, TaskState::Failed("gone".into()));
        assert_eq!(failed.status(), TaskStatus::Failed);
        assert!(!failed.ok);
        assert_eq!(failed.message, "gone");
    }
}
