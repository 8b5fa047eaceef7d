//! Lifecycle resolution: completion, failure, retry chains, and the
//! dependency cascade.
//!
//! All state changes here go through the store's conditional transition, so a
//! lost race is silently absorbed instead of corrupting a record another
//! dispatcher already resolved.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use thiserror::Error;

use chrono::Utc;

use crate::core::job::Job;
use crate::core::retry::RetryScheduler;
use crate::core::state::JobState;
use crate::core::types::JobId;
use crate::storage::{JobStore, StorageError};

/// Errors surfaced by lifecycle operations.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Underlying storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// How a retry chain has resolved, viewed from a dependent job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainStatus {
    /// Some job in the chain finished successfully.
    Succeeded,
    /// The chain is exhausted: its deepest job was terminated, became
    /// incomplete, or failed with no retry budget left.
    FailedFinally,
    /// The chain may still produce a successful attempt.
    InFlight,
}

/// Drives jobs through the lifecycle state machine.
pub struct Lifecycle<S: JobStore> {
    store: Arc<S>,
    retry: Arc<dyn RetryScheduler>,
}

impl<S: JobStore> Lifecycle<S> {
    /// Create a lifecycle over the store with the given retry policy.
    pub fn new(store: Arc<S>, retry: Arc<dyn RetryScheduler>) -> Self {
        Self { store, retry }
    }

    /// Resolve a running job as successful.
    pub async fn complete(
        &self,
        job: &Job,
        output: Option<String>,
    ) -> Result<(), LifecycleError> {
        let won = self
            .store
            .transition(&job.id, JobState::Running, JobState::Finished)
            .await?;
        if !won {
            tracing::debug!(job_id = %job.id, "Completion lost to a concurrent transition");
            return Ok(());
        }
        self.store.store_output(&job.id, output, None).await?;
        tracing::info!(job_id = %job.id, command = %job.command, "Job finished");
        Ok(())
    }

    /// Resolve a running job as failed.
    ///
    /// If the chain still has retry budget, a fresh retry record is created
    /// with an eligible instant pushed out by the retry policy, and its id is
    /// returned. Otherwise the chain is exhausted and every job waiting on it
    /// cascades to `Incomplete`.
    pub async fn fail(
        &self,
        job: &Job,
        error: Option<String>,
    ) -> Result<Option<JobId>, LifecycleError> {
        let won = self
            .store
            .transition(&job.id, JobState::Running, JobState::Failed)
            .await?;
        if !won {
            tracing::debug!(job_id = %job.id, "Failure lost to a concurrent transition");
            return Ok(None);
        }
        self.store.store_output(&job.id, None, error).await?;

        let prior_retries = self.chain_depth(job).await?;
        if prior_retries < job.max_retries {
            let delay = self.retry.schedule_next_retry(prior_retries);
            let eligible_at = chrono::Duration::from_std(delay)
                .ok()
                .and_then(|delta| Utc::now().checked_add_signed(delta))
                .unwrap_or(chrono::DateTime::<Utc>::MAX_UTC);
            let retry = Job::retry_of(job, eligible_at);
            let retry_id = retry.id;
            self.store.create_job(retry).await?;
            tracing::info!(
                job_id = %job.id,
                retry_id = %retry_id,
                delay_secs = delay.as_secs(),
                "Job failed, retry scheduled"
            );
            Ok(Some(retry_id))
        } else {
            tracing::warn!(
                job_id = %job.id,
                command = %job.command,
                retries = prior_retries,
                "Job failed with retry budget exhausted"
            );
            let chain = self.chain_ids(job).await?;
            self.cascade_incomplete(&chain).await?;
            Ok(None)
        }
    }

    /// Cancel a job from any non-terminal state.
    ///
    /// Returns `true` when this call performed the cancellation. A lost
    /// conditional update means the state moved under us (for example a
    /// dispatcher claimed the job mid-cancel), so the cancellation is retried
    /// against the fresh state until it wins or the job is genuinely
    /// terminal. A terminated chain never retries, so dependents cascade to
    /// `Incomplete`.
    pub async fn terminate(&self, id: &JobId) -> Result<bool, LifecycleError> {
        loop {
            let job = self.store.get_job(id).await?;
            if job.state.is_terminal() {
                return Ok(false);
            }
            let won = self
                .store
                .transition(id, job.state, JobState::Terminated)
                .await?;
            if won {
                tracing::info!(job_id = %id, from = %job.state, "Job terminated");
                let chain = self.chain_ids(&job).await?;
                self.cascade_incomplete(&chain).await?;
                return Ok(true);
            }
        }
    }

    /// Number of predecessors in the job's retry chain (0 for a root job).
    pub async fn chain_depth(&self, job: &Job) -> Result<u32, LifecycleError> {
        let mut depth = 0u32;
        let mut current = job.original_job_id;
        while let Some(id) = current {
            depth += 1;
            current = match self.store.get_job(&id).await {
                Ok(predecessor) => predecessor.original_job_id,
                Err(StorageError::NotFound(_)) => None,
                Err(e) => return Err(e.into()),
            };
        }
        Ok(depth)
    }

    /// All identifiers in the job's chain, from the root down to `job`.
    pub async fn chain_ids(&self, job: &Job) -> Result<Vec<JobId>, LifecycleError> {
        let mut ids = vec![job.id];
        let mut current = job.original_job_id;
        while let Some(id) = current {
            ids.push(id);
            current = match self.store.get_job(&id).await {
                Ok(predecessor) => predecessor.original_job_id,
                Err(StorageError::NotFound(_)) => None,
                Err(e) => return Err(e.into()),
            };
        }
        ids.reverse();
        Ok(ids)
    }

    /// Resolve the status of the retry chain rooted at (or containing) `job`.
    ///
    /// The chain is walked downward through retry records. Success anywhere in
    /// the chain satisfies dependents. Exhaustion is judged against the retry
    /// budget rather than the presence of a retry record, so a failure
    /// observed before its retry record lands still reads as in flight.
    pub async fn chain_resolution(&self, job: &Job) -> Result<ChainStatus, LifecycleError> {
        let mut current = job.clone();
        let mut depth = self.chain_depth(&current).await?;
        loop {
            if current.state.is_success() {
                return Ok(ChainStatus::Succeeded);
            }
            let retries = self.store.retry_jobs(&current.id).await?;
            match retries.into_iter().last() {
                Some(next) => {
                    current = next;
                    depth += 1;
                }
                None => break,
            }
        }

        match current.state {
            JobState::Terminated | JobState::Incomplete => Ok(ChainStatus::FailedFinally),
            JobState::Failed if depth >= current.max_retries => Ok(ChainStatus::FailedFinally),
            _ => Ok(ChainStatus::InFlight),
        }
    }

    /// Promote pending jobs whose dependencies have all succeeded, and fail
    /// those with a dependency that can never succeed.
    ///
    /// A dependency record that cannot be loaded keeps its dependents pending
    /// rather than releasing them.
    pub async fn promote_pending(&self) -> Result<(), LifecycleError> {
        for job in self.store.find_pending().await? {
            let mut all_succeeded = true;
            let mut failed_finally = false;
            for dep in &job.dependencies {
                let dep_job = match self.store.get_job(dep).await {
                    Ok(dep_job) => dep_job,
                    Err(StorageError::NotFound(_)) => {
                        tracing::warn!(job_id = %job.id, dependency = %dep, "Dependency record missing, job stays pending");
                        all_succeeded = false;
                        break;
                    }
                    Err(e) => return Err(e.into()),
                };
                match self.chain_resolution(&dep_job).await? {
                    ChainStatus::Succeeded => {}
                    ChainStatus::FailedFinally => {
                        failed_finally = true;
                        break;
                    }
                    ChainStatus::InFlight => {
                        all_succeeded = false;
                        break;
                    }
                }
            }

            if failed_finally {
                if self
                    .store
                    .transition(&job.id, JobState::Pending, JobState::Incomplete)
                    .await?
                {
                    tracing::info!(job_id = %job.id, "Job incomplete, dependency failed finally");
                    self.cascade_incomplete(&[job.id]).await?;
                }
            } else if all_succeeded {
                if self
                    .store
                    .transition(&job.id, JobState::Pending, JobState::Ready)
                    .await?
                {
                    tracing::debug!(job_id = %job.id, "Job ready for dispatch");
                }
            }
        }
        Ok(())
    }

    /// Propagate `Incomplete` through the dependency graph from the given
    /// seed jobs. Only waiting jobs transition; running and terminal
    /// dependents are left alone.
    pub async fn cascade_incomplete(&self, seeds: &[JobId]) -> Result<(), LifecycleError> {
        let mut queue: VecDeque<JobId> = VecDeque::new();
        let mut visited: HashSet<JobId> = HashSet::new();
        for seed in seeds {
            for dependent in self.store.incoming_dependents(seed).await? {
                if visited.insert(dependent) {
                    queue.push_back(dependent);
                }
            }
        }

        while let Some(id) = queue.pop_front() {
            let mut transitioned = self
                .store
                .transition(&id, JobState::Pending, JobState::Incomplete)
                .await?;
            if !transitioned {
                transitioned = self
                    .store
                    .transition(&id, JobState::Ready, JobState::Incomplete)
                    .await?;
            }
            if transitioned {
                tracing::info!(job_id = %id, "Job incomplete, cascaded from failed dependency");
                for dependent in self.store.incoming_dependents(&id).await? {
                    if visited.insert(dependent) {
                        queue.push_back(dependent);
                    }
                }
            }
        }
        Ok(())
    }
}
