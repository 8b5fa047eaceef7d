//! Scheduling: submission, lifecycle resolution, and the dispatch loop.

pub mod engine;
pub mod lifecycle;
pub mod queue;

pub use engine::{DispatchError, Dispatcher, DispatcherHandle};
pub use lifecycle::{ChainStatus, Lifecycle, LifecycleError};
pub use queue::{JobQueue, QueueError};
