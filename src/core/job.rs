//! The durable job record.
//!
//! A [`Job`] describes one unit of work: the command to execute, its
//! dependencies on other jobs, the retry budget, and the execution metadata
//! accumulated over its lifetime. Retrying a failed job never mutates it;
//! instead [`Job::retry_of`] produces a fresh record that points back at its
//! predecessor through `original_job_id`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::Duration;
use uuid::Uuid;

use super::state::JobState;
use super::types::JobId;

/// A durable job record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Unique identifier, immutable.
    pub id: JobId,
    /// Opaque command identifying what to execute.
    pub command: String,
    /// Ordered command arguments.
    pub args: Vec<String>,
    /// Current lifecycle state.
    pub state: JobState,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When a dispatcher claimed the job. Set at most once.
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state. Set at most once.
    pub finished_at: Option<DateTime<Utc>>,
    /// The job this one retries; `None` for root jobs. Points at the
    /// immediate predecessor in the retry chain, never changes once set.
    pub original_job_id: Option<JobId>,
    /// Jobs that must reach the successful terminal state before this one
    /// becomes eligible.
    pub dependencies: BTreeSet<JobId>,
    /// Opaque external entity references; unused by scheduling.
    pub related_entities: BTreeSet<String>,
    /// Earliest instant a dispatcher may select this job.
    pub eligible_at: DateTime<Utc>,
    /// Maximum number of retry jobs the chain may accumulate.
    pub max_retries: u32,
    /// Per-job execution time budget; falls back to the engine default.
    #[serde(default, with = "serde_opt_duration")]
    pub max_runtime: Option<Duration>,
    /// Captured executor output, set at completion.
    pub output: Option<String>,
    /// Captured executor error, set at completion.
    pub error: Option<String>,
    /// Token recorded by the dispatcher that won the claim.
    pub claim_token: Option<Uuid>,
}

impl Job {
    /// Create a new root job in the `New` state.
    pub fn new(command: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            command: command.into(),
            args: Vec::new(),
            state: JobState::New,
            created_at: now,
            started_at: None,
            finished_at: None,
            original_job_id: None,
            dependencies: BTreeSet::new(),
            related_entities: BTreeSet::new(),
            eligible_at: now,
            max_retries: 0,
            max_runtime: None,
            output: None,
            error: None,
            claim_token: None,
        }
    }

    /// Set the command arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Add a dependency on another job.
    pub fn with_dependency(mut self, id: JobId) -> Self {
        self.dependencies.insert(id);
        self
    }

    /// Add multiple dependencies.
    pub fn with_dependencies<I: IntoIterator<Item = JobId>>(mut self, ids: I) -> Self {
        self.dependencies.extend(ids);
        self
    }

    /// Attach an opaque related-entity reference.
    pub fn with_related_entity(mut self, entity: impl Into<String>) -> Self {
        self.related_entities.insert(entity.into());
        self
    }

    /// Set the retry budget for this job's chain.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set a per-job execution time budget.
    pub fn with_max_runtime(mut self, max_runtime: Duration) -> Self {
        self.max_runtime = Some(max_runtime);
        self
    }

    /// Override the earliest dispatch instant.
    pub fn with_eligible_at(mut self, eligible_at: DateTime<Utc>) -> Self {
        self.eligible_at = eligible_at;
        self
    }

    /// Create the retry record for a failed, terminated, or incomplete job.
    ///
    /// The retry is a logical clone: command, arguments, dependencies,
    /// related entities, and budgets are copied; identity, timestamps, and
    /// execution metadata are fresh. `original_job_id` points at `failed`
    /// itself, so chains link each retry to its immediate predecessor.
    pub fn retry_of(failed: &Job, eligible_at: DateTime<Utc>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            command: failed.command.clone(),
            args: failed.args.clone(),
            // Dependencies were already satisfied for the predecessor to run,
            // so registration can skip straight to Pending.
            state: JobState::Pending,
            created_at: now,
            started_at: None,
            finished_at: None,
            original_job_id: Some(failed.id),
            dependencies: failed.dependencies.clone(),
            related_entities: failed.related_entities.clone(),
            eligible_at,
            max_retries: failed.max_retries,
            max_runtime: failed.max_runtime,
            output: None,
            error: None,
            claim_token: None,
        }
    }

    /// Whether this job is a retry of another.
    pub fn is_retry(&self) -> bool {
        self.original_job_id.is_some()
    }

    /// Whether this job is a root (surfaced in top-level listings).
    pub fn is_root(&self) -> bool {
        self.original_job_id.is_none()
    }

    /// Record the claim: state, token, and start timestamp.
    ///
    /// Called by the store inside its atomic claim operation, and by the
    /// dispatcher to mirror a won claim on its local snapshot.
    pub(crate) fn mark_claimed(&mut self, token: Uuid) {
        self.state = JobState::Running;
        self.claim_token = Some(token);
        if self.started_at.is_none() {
            self.started_at = Some(Utc::now());
        }
    }

    /// Record a terminal state, stamping `finished_at` once.
    pub(crate) fn mark_terminal(&mut self, state: JobState) {
        debug_assert!(state.is_terminal());
        self.state = state;
        if self.finished_at.is_none() {
            self.finished_at = Some(Utc::now());
        }
    }
}

/// Serde helper for optional durations, stored as whole seconds.
mod serde_opt_duration {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_secs()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = Option::<u64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::from_secs))
    }
}
