//! Error taxonomy shared by the registry, dispatcher and gRPC facade.
//!
//! Functional failures raised by a hosted object are not errors here: they are
//! carried as [`CallOutcome`](crate::object::CallOutcome) with `ok == false`.
//! Transport failures live on the client side (see `grpc::client::ClientError`).

use thiserror::Error;
use tonic::Status;

use crate::metrics::ERRORS_TOTAL;

/// Result alias used throughout the host.
pub type Result<T> = std::result::Result<T, Error>;

/// What a `NotFound` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Missing {
    Object,
    Task,
    File,
    Class,
}

impl std::fmt::Display for Missing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Missing::Object => write!(f, "object"),
            Missing::Task => write!(f, "task"),
            Missing::File => write!(f, "file"),
            Missing::Class => write!(f, "class"),
        }
    }
}

/// Errors surfaced by host operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Unknown object id, task id, file identifier or class name.
    #[error("{kind} `{id}` not found")]
    NotFound { kind: Missing, id: String },

    /// An object with this id is already live.
    #[error("object `{0}` already exists")]
    AlreadyExists(String),

    /// The object existed at dispatch time but was removed before the call finished.
    #[error("object `{0}` was deleted while the call was in flight")]
    ObjectGone(String),

    /// Worker pool, call gate or placeholder table saturated.
    #[error("server busy: {0}")]
    Backpressure(String),

    /// A placeholder-valued argument did not reach a terminal state in time.
    #[error("dependency task {0} has not resolved")]
    UnresolvedDependency(u64),

    /// The registry already holds `max_objects` records.
    #[error("object capacity of {0} reached")]
    CapacityExceeded(usize),

    /// The construction collaborator refused the init arguments.
    #[error("failed to construct object: {0}")]
    ConstructionFailed(String),

    /// A configuration blob or server config could not be applied.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// The server is stopping and accepts no new work.
    #[error("server is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn object_not_found(id: impl Into<String>) -> Self {
        Error::NotFound { kind: Missing::Object, id: id.into() }
    }

    pub fn task_not_found(task_id: u64) -> Self {
        Error::NotFound { kind: Missing::Task, id: task_id.to_string() }
    }

    pub fn file_not_found(path: impl Into<String>) -> Self {
        Error::NotFound { kind: Missing::File, id: path.into() }
    }

    /// Short label used for the `errors_total` metric.
    pub fn kind(&self) -> &'static str {
        match self {
            Error::NotFound { .. } => "not_found",
            Error::AlreadyExists(_) => "already_exists",
            Error::ObjectGone(_) => "object_gone",
            Error::Backpressure(_) => "backpressure",
            Error::UnresolvedDependency(_) => "unresolved_dependency",
            Error::CapacityExceeded(_) => "capacity_exceeded",
            Error::ConstructionFailed(_) => "construction_failed",
            Error::InvalidConfig(_) => "invalid_config",
            Error::ShuttingDown => "shutting_down",
            Error::Io(_) => "io",
        }
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        ERRORS_TOTAL.with_label_values(&[err.kind()]).inc();
        let message = err.to_string();
        match err {
            Error::NotFound { .. } => Status::not_found(message),
            Error::AlreadyExists(_) => Status::already_exists(message),
            Error::ObjectGone(_) => Status::aborted(message),
            Error::Backpressure(_) | Error::CapacityExceeded(_) => {
                Status::resource_exhausted(message)
            }
            Error::UnresolvedDependency(_) => Status::failed_precondition(message),
            Error::ConstructionFailed(_) | Error::InvalidConfig(_) => {
                Status::invalid_argument(message)
            }
            Error::ShuttingDown => Status::unavailable(message),
            Error::Io(_) => Status::internal(message),
        }
    }
}
