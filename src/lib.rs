//! Persistent job queue with dependency-aware scheduling.
//!
//! Jobs are durable records that move through a strict lifecycle state
//! machine. Producers register jobs with dependencies through [`JobQueue`];
//! one or more [`Dispatcher`] instances poll the shared [`JobStore`], claim
//! eligible jobs atomically, and execute them through an [`Executor`].
//! Failures never mutate a job in place: retries are fresh records chained
//! through their predecessor, delayed by a [`RetryScheduler`] policy.

pub mod config;
pub mod core;
pub mod execution;
pub mod scheduler;
pub mod stats;
pub mod storage;

pub use config::{ConfigError, EngineConfig, JobManifest, Manifest};
pub use core::job::Job;
pub use core::retry::{ExponentialRetryScheduler, FixedRetryScheduler, RetryScheduler};
pub use core::state::JobState;
pub use core::types::JobId;
pub use execution::{ExecutionResult, Executor, ProcessExecutor};
pub use scheduler::{
    ChainStatus, DispatchError, Dispatcher, DispatcherHandle, JobQueue, Lifecycle, QueueError,
};
pub use stats::{build_series, StatSeries, StatsCollector, TimeAxis};
pub use storage::{InMemoryStore, JobFilter, JobPage, JobStore, StatSample, StorageError};
