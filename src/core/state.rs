//! Job lifecycle states and the legal transitions between them.
//!
//! A job moves monotonically through the state machine; terminal states are
//! absorbing. A failed job is never reset: retrying always creates a fresh
//! job record, so no transition ever leaves a terminal state.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// State of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Created, dependencies not yet registered.
    New,
    /// Dependencies registered, waiting for them to resolve.
    Pending,
    /// All dependencies satisfied, waiting for the eligible instant.
    Ready,
    /// Claimed by a dispatcher and executing.
    Running,
    /// Executor reported success. Terminal.
    Finished,
    /// Executor reported an error or timed out. Terminal; a retry job may
    /// continue the chain under a new identity.
    Failed,
    /// Externally cancelled. Terminal, never retried automatically.
    Terminated,
    /// A dependency resolved non-successfully, so this job can never run.
    /// Terminal.
    Incomplete,
}

/// Error returned when parsing a state name fails.
#[derive(Debug, Error)]
#[error("unknown job state: {0}")]
pub struct ParseStateError(String);

impl JobState {
    /// The fixed set of valid states, for display and filtering.
    pub fn all() -> &'static [JobState] {
        &[
            JobState::New,
            JobState::Pending,
            JobState::Ready,
            JobState::Running,
            JobState::Finished,
            JobState::Failed,
            JobState::Terminated,
            JobState::Incomplete,
        ]
    }

    /// Whether this state is terminal (absorbing).
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Finished | JobState::Failed | JobState::Terminated | JobState::Incomplete
        )
    }

    /// Whether this state is the successful terminal state.
    pub fn is_success(&self) -> bool {
        matches!(self, JobState::Finished)
    }

    /// Check whether a transition from `self` to `to` is legal.
    pub fn can_transition_to(&self, to: JobState) -> bool {
        use JobState::*;
        match (*self, to) {
            (New, Pending) => true,
            (Pending, Ready) => true,
            (Ready, Running) => true,
            (Running, Finished) | (Running, Failed) => true,
            // Cancellation is allowed from any non-terminal state.
            (from, Terminated) if !from.is_terminal() => true,
            // A dependency resolved non-successfully before this job ran.
            (Pending, Incomplete) | (Ready, Incomplete) => true,
            _ => false,
        }
    }

    /// Canonical lowercase name of the state.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::New => "new",
            JobState::Pending => "pending",
            JobState::Ready => "ready",
            JobState::Running => "running",
            JobState::Finished => "finished",
            JobState::Failed => "failed",
            JobState::Terminated => "terminated",
            JobState::Incomplete => "incomplete",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobState::all()
            .iter()
            .find(|state| state.as_str() == s)
            .copied()
            .ok_or_else(|| ParseStateError(s.to_string()))
    }
}
