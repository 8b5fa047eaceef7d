//! Core domain types: job records, lifecycle states, and retry policies.

pub mod job;
pub mod retry;
pub mod state;
pub mod types;
