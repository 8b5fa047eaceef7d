//! In-memory storage implementation.
//!
//! Thread-safe backend for testing and single-process deployments. The
//! conditional updates (`transition`, `try_claim`) take the write lock for
//! their whole read-check-write section, giving the same atomicity a
//! conditional `UPDATE` provides in a relational backend.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

use super::{JobFilter, JobPage, JobStore, StatSample, StorageError};
use crate::core::job::Job;
use crate::core::state::JobState;
use crate::core::types::JobId;

/// In-memory job store. Data is not persisted across restarts.
pub struct InMemoryStore {
    jobs: RwLock<HashMap<JobId, Job>>,
    stats: RwLock<Vec<StatSample>>,
}

impl InMemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            stats: RwLock::new(Vec::new()),
        }
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn create_job(&self, job: Job) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        if jobs.contains_key(&job.id) {
            return Err(StorageError::DuplicateKey(format!("job: {}", job.id)));
        }
        jobs.insert(job.id, job);
        Ok(())
    }

    async fn get_job(&self, id: &JobId) -> Result<Job, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        jobs.get(id)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))
    }

    async fn transition(
        &self,
        id: &JobId,
        from: JobState,
        to: JobState,
    ) -> Result<bool, StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;

        if job.state != from || !from.can_transition_to(to) {
            return Ok(false);
        }

        if to.is_terminal() {
            job.mark_terminal(to);
        } else {
            job.state = to;
        }
        Ok(true)
    }

    async fn try_claim(&self, id: &JobId, token: Uuid) -> Result<bool, StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;

        if job.state != JobState::Ready || job.claim_token.is_some() {
            return Ok(false);
        }

        job.mark_claimed(token);
        Ok(true)
    }

    async fn store_output(
        &self,
        id: &JobId,
        output: Option<String>,
        error: Option<String>,
    ) -> Result<(), StorageError> {
        let mut jobs = self.jobs.write().map_err(|_| StorageError::LockPoisoned)?;
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| StorageError::NotFound(format!("job: {}", id)))?;

        if output.is_some() {
            job.output = output;
        }
        if error.is_some() {
            job.error = error;
        }
        Ok(())
    }

    async fn find_pending(&self) -> Result<Vec<Job>, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.state == JobState::Pending)
            .cloned()
            .collect();
        result.sort_by_key(|j| (j.created_at, j.id));
        Ok(result)
    }

    async fn find_dispatchable(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Job>, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.state == JobState::Ready && j.eligible_at <= now)
            .cloned()
            .collect();
        result.sort_by_key(|j| (j.eligible_at, j.id));
        result.truncate(limit);
        Ok(result)
    }

    async fn incoming_dependents(&self, id: &JobId) -> Result<Vec<JobId>, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.dependencies.contains(id))
            .map(|j| j.id)
            .collect();
        result.sort();
        Ok(result)
    }

    async fn retry_jobs(&self, id: &JobId) -> Result<Vec<Job>, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = jobs
            .values()
            .filter(|j| j.original_job_id.as_ref() == Some(id))
            .cloned()
            .collect();
        result.sort_by_key(|j| (j.created_at, j.id));
        Ok(result)
    }

    async fn query_jobs(&self, filter: &JobFilter) -> Result<JobPage, StorageError> {
        let jobs = self.jobs.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut matches: Vec<_> = jobs
            .values()
            .filter(|j| j.is_root())
            .filter(|j| {
                filter
                    .command
                    .as_ref()
                    .map_or(true, |needle| j.command.contains(needle.as_str()))
            })
            .filter(|j| filter.state.map_or(true, |state| j.state == state))
            .filter(|j| !filter.exclude.contains(&j.id))
            .cloned()
            .collect();

        // Newest first, identifiers as the stable tie-break.
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let offset = (filter.page - 1).saturating_mul(filter.per_page);
        let mut page: Vec<_> = matches
            .into_iter()
            .skip(offset)
            .take(filter.per_page + 1)
            .collect();
        let has_more = page.len() > filter.per_page;
        page.truncate(filter.per_page);

        Ok(JobPage {
            jobs: page,
            page: filter.page,
            has_more,
        })
    }

    async fn record_stat(&self, sample: StatSample) -> Result<(), StorageError> {
        let mut stats = self.stats.write().map_err(|_| StorageError::LockPoisoned)?;
        stats.push(sample);
        Ok(())
    }

    async fn stats_for_job(&self, id: &JobId) -> Result<Vec<StatSample>, StorageError> {
        let stats = self.stats.read().map_err(|_| StorageError::LockPoisoned)?;
        let mut result: Vec<_> = stats.iter().filter(|s| &s.job_id == id).cloned().collect();
        result.sort_by(|a, b| a.recorded_at.cmp(&b.recorded_at));
        Ok(result)
    }
}
