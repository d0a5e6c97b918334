//! Call dispatch: the invocation dispatcher and its result placeholders

pub mod dispatcher;
pub mod placeholder;

pub use dispatcher::{Argument, Dispatcher, DispatcherStats};
pub use placeholder::{PlaceholderStats, PlaceholderTable, TaskState};
