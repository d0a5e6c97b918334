//! Hosted objects and the registry that owns them
//!
//! - `traits` - collaborator interfaces (`HostedObject`, `ObjectFactory`)
//! - `factory` - registration-table factory
//! - `registry` - the concurrent `id -> object` map
//! - `builtin` - the `echo` demo class

pub mod builtin;
pub mod factory;
pub mod registry;
pub mod traits;

pub use factory::FactoryTable;
pub use registry::{CallPermit, ObjectHandle, ObjectRegistry, ObjectSummary};
pub use traits::{CallOutcome, HostedObject, ObjectFactory};
