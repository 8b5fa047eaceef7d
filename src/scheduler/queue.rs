//! Job submission and query surface.
//!
//! [`JobQueue`] is the front door for producers: it validates dependency
//! references, rejects cycles at submission time, and exposes the read and
//! manual-retry operations that operators use. Everything goes through the
//! store, so any number of producers and dispatchers can share one queue.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;

use crate::core::job::Job;
use crate::core::state::JobState;
use crate::core::types::JobId;
use crate::storage::{JobFilter, JobPage, JobStore, StorageError};

/// Errors surfaced by queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// A declared dependency does not exist in the store.
    #[error("unknown dependency: {0}")]
    UnknownDependency(JobId),

    /// Registering the job would close a dependency cycle.
    #[error("dependency cycle through job {0}")]
    DependencyCycle(JobId),

    /// Manual retry requested for a job that is not in a failed terminal
    /// state.
    #[error("cannot retry a job in state {0}")]
    RetryNotAllowed(JobState),

    /// The referenced job does not exist.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// Underlying storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Producer-facing handle over a job store.
pub struct JobQueue<S: JobStore> {
    store: Arc<S>,
}

impl<S: JobStore> Clone for JobQueue<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: JobStore> JobQueue<S> {
    /// Create a queue over the given store.
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Access the underlying store.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Register a job and return its identifier.
    ///
    /// Every declared dependency must already exist; an unknown reference
    /// rejects the submission rather than leaving a job that can never
    /// become eligible. Cycles through existing jobs are rejected the same
    /// way. On success the job is persisted in the `Pending` state.
    pub async fn submit(&self, mut job: Job) -> Result<JobId, QueueError> {
        for dep in &job.dependencies {
            match self.store.get_job(dep).await {
                Ok(_) => {}
                Err(StorageError::NotFound(_)) => {
                    return Err(QueueError::UnknownDependency(*dep));
                }
                Err(e) => return Err(e.into()),
            }
        }
        self.check_for_cycle(&job).await?;

        job.state = JobState::Pending;
        let id = job.id;
        self.store.create_job(job).await?;
        tracing::debug!(job_id = %id, "Job registered");
        Ok(id)
    }

    /// Walk the dependency graph from the new job's dependencies; reaching
    /// the new job's own id means registering it would close a cycle.
    async fn check_for_cycle(&self, job: &Job) -> Result<(), QueueError> {
        let mut queue: VecDeque<JobId> = job.dependencies.iter().copied().collect();
        let mut visited: HashSet<JobId> = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if id == job.id {
                return Err(QueueError::DependencyCycle(job.id));
            }
            if !visited.insert(id) {
                continue;
            }
            match self.store.get_job(&id).await {
                Ok(dep) => queue.extend(dep.dependencies.iter().copied()),
                // Already validated; a record vanishing mid-walk cannot
                // introduce a cycle.
                Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Fetch a job by id.
    pub async fn get(&self, id: &JobId) -> Result<Job, QueueError> {
        match self.store.get_job(id).await {
            Ok(job) => Ok(job),
            Err(StorageError::NotFound(_)) => Err(QueueError::JobNotFound(*id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Paginated listing of root jobs, newest first.
    pub async fn query(&self, filter: &JobFilter) -> Result<JobPage, QueueError> {
        Ok(self.store.query_jobs(filter).await?)
    }

    /// Retry jobs created for `id`, oldest first.
    pub async fn retry_jobs(&self, id: &JobId) -> Result<Vec<Job>, QueueError> {
        Ok(self.store.retry_jobs(id).await?)
    }

    /// Jobs that declare `id` as a dependency.
    pub async fn incoming_dependents(&self, id: &JobId) -> Result<Vec<JobId>, QueueError> {
        Ok(self.store.incoming_dependents(id).await?)
    }

    /// The fixed set of job states, for filter interfaces.
    pub fn states() -> &'static [JobState] {
        JobState::all()
    }

    /// Manually enqueue a retry for a job that failed, was terminated, or
    /// became incomplete. The retry bypasses the backoff delay and is
    /// eligible immediately. Returns the new job's identifier.
    pub async fn retry_now(&self, id: &JobId) -> Result<JobId, QueueError> {
        let job = self.get(id).await?;
        match job.state {
            JobState::Failed | JobState::Terminated | JobState::Incomplete => {}
            other => return Err(QueueError::RetryNotAllowed(other)),
        }

        let retry = Job::retry_of(&job, chrono::Utc::now());
        let retry_id = retry.id;
        self.store.create_job(retry).await?;
        tracing::info!(job_id = %id, retry_id = %retry_id, "Manual retry enqueued");
        Ok(retry_id)
    }
}
