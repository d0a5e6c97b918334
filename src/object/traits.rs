//! Collaborator interfaces consumed by the host.
//!
//! The host never knows what a hosted object does. It only routes calls to
//! [`HostedObject::invoke`] and builds objects through an [`ObjectFactory`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::codec::Payload;
use crate::config::ConfigSnapshot;
use crate::error::Result;

/// Outcome of one function call on a hosted object.
///
/// `ok == false` is a functional failure reported by the object itself; it is
/// returned to the caller as a normal response, never as a transport error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallOutcome {
    pub ok: bool,
    pub result: Payload,
    pub message: String,
}

impl CallOutcome {
    pub fn success(result: impl Into<Payload>) -> Self {
        Self { ok: true, result: result.into(), message: String::new() }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self { ok: false, result: Payload::empty(), message: message.into() }
    }
}

/// A stateful object hosted by the server.
///
/// Implementations must tolerate `&self` access from several tasks when the
/// host runs with the `concurrent` call policy. Under the default policy the
/// host admits one call per object at a time.
#[async_trait]
pub trait HostedObject: Send + Sync + 'static {
    /// Name of the class this object was built from.
    fn class_name(&self) -> &str;

    /// Run `function` with `args`. Unknown functions should yield
    /// `CallOutcome::failure("no such function")`.
    async fn invoke(&self, function: &str, args: Payload) -> CallOutcome;

    /// Snapshot of the object's conversational/state memory.
    async fn memory(&self) -> Payload;

    /// Deep copy with independent state, used by `CloneObject`.
    async fn fork(&self) -> std::result::Result<Arc<dyn HostedObject>, String>;
}

/// Builds hosted objects from raw init arguments.
///
/// Refusals should be reported as
/// [`Error::ConstructionFailed`](crate::error::Error::ConstructionFailed),
/// unknown classes as a class `NotFound`.
#[async_trait]
pub trait ObjectFactory: Send + Sync + 'static {
    async fn construct(
        &self,
        class_name: &str,
        init_args: &Payload,
        config: &ConfigSnapshot,
    ) -> Result<Arc<dyn HostedObject>>;
}
