//! Storage abstraction for persisting jobs and statistics samples.
//!
//! All coordination between dispatcher instances happens through this trait:
//! there is no in-process shared scheduling state, so the conditional
//! operations ([`JobStore::transition`], [`JobStore::try_claim`]) must be
//! atomic in every backend.

mod memory;

pub use memory::InMemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::job::Job;
use crate::core::state::JobState;
use crate::core::types::JobId;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested record was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// One timestamped resource-usage sample for a running job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatSample {
    /// The job the sample belongs to.
    pub job_id: JobId,
    /// Name of the measured characteristic (e.g. `memory`).
    pub characteristic: String,
    /// When the sample was taken.
    pub recorded_at: DateTime<Utc>,
    /// Raw measured value.
    pub value: f64,
}

impl StatSample {
    /// Create a sample stamped with the current time.
    pub fn new(job_id: JobId, characteristic: impl Into<String>, value: f64) -> Self {
        Self {
            job_id,
            characteristic: characteristic.into(),
            recorded_at: Utc::now(),
            value,
        }
    }
}

/// Filter for the human-facing job listing. Matches root jobs only.
#[derive(Debug, Clone)]
pub struct JobFilter {
    /// Substring match against the command.
    pub command: Option<String>,
    /// Exact state match.
    pub state: Option<JobState>,
    /// Identifiers to exclude (e.g. jobs already shown in an error panel).
    pub exclude: Vec<JobId>,
    /// 1-based page number.
    pub page: usize,
    /// Page size.
    pub per_page: usize,
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            command: None,
            state: None,
            exclude: Vec::new(),
            page: 1,
            per_page: 50,
        }
    }
}

impl JobFilter {
    /// Filter by command substring.
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Filter by state.
    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    /// Exclude specific job identifiers.
    pub fn with_exclude(mut self, exclude: Vec<JobId>) -> Self {
        self.exclude = exclude;
        self
    }

    /// Select a page (1-based).
    pub fn with_page(mut self, page: usize) -> Self {
        self.page = page.max(1);
        self
    }

    /// Set the page size.
    pub fn with_per_page(mut self, per_page: usize) -> Self {
        self.per_page = per_page.max(1);
        self
    }
}

/// One page of a job listing, newest first.
#[derive(Debug, Clone)]
pub struct JobPage {
    /// Jobs on this page.
    pub jobs: Vec<Job>,
    /// The page number that was fetched.
    pub page: usize,
    /// Whether more pages exist after this one.
    pub has_more: bool,
}

/// Durable store operations required by the engine.
#[async_trait]
pub trait JobStore: Send + Sync {
    // Job records

    /// Persist a new job record. Fails on duplicate identifiers.
    async fn create_job(&self, job: Job) -> Result<(), StorageError>;

    /// Fetch a job by id.
    async fn get_job(&self, id: &JobId) -> Result<Job, StorageError>;

    /// Atomically move a job from `from` to `to`.
    ///
    /// Returns `Ok(false)` without side effects when the job is no longer in
    /// `from` (a lost race, not an error). Terminal targets stamp
    /// `finished_at`.
    async fn transition(
        &self,
        id: &JobId,
        from: JobState,
        to: JobState,
    ) -> Result<bool, StorageError>;

    /// Atomically claim a `Ready` job for execution.
    ///
    /// On success the job is `Running`, carries `token`, and has `started_at`
    /// stamped. Returns `Ok(false)` when another dispatcher won the race.
    async fn try_claim(&self, id: &JobId, token: uuid::Uuid) -> Result<bool, StorageError>;

    /// Record captured executor output for a job.
    async fn store_output(
        &self,
        id: &JobId,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<(), StorageError>;

    // Scheduling queries

    /// All jobs currently waiting on dependencies.
    async fn find_pending(&self) -> Result<Vec<Job>, StorageError>;

    /// `Ready` jobs whose eligible instant has passed, ordered by
    /// `(eligible_at, id)`, at most `limit` rows.
    async fn find_dispatchable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StorageError>;

    /// Jobs that list `id` as a dependency.
    async fn incoming_dependents(&self, id: &JobId) -> Result<Vec<JobId>, StorageError>;

    /// Retry jobs created for `id`, ordered by creation.
    async fn retry_jobs(&self, id: &JobId) -> Result<Vec<Job>, StorageError>;

    /// Paginated listing of root jobs, newest first.
    async fn query_jobs(&self, filter: &JobFilter) -> Result<JobPage, StorageError>;

    // Statistics

    /// Append a statistics sample.
    async fn record_stat(&self, sample: StatSample) -> Result<(), StorageError>;

    /// All samples for a job, ordered by recording time.
    async fn stats_for_job(&self, id: &JobId) -> Result<Vec<StatSample>, StorageError>;
}
