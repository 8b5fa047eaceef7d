//! Executor abstraction and the process-based implementation.
//!
//! The dispatcher hands a claimed job to an [`Executor`] and routes the
//! outcome back through the lifecycle. [`ProcessExecutor`] runs the job's
//! command as a child process, honors the cancellation signal, and feeds the
//! statistics collector with memory samples while the child runs.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;

use crate::core::job::Job;
use crate::stats::{StatsCollector, MEMORY_CHARACTERISTIC};

/// Outcome of one job execution attempt.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Whether the executor reported success.
    pub success: bool,
    /// Captured standard output, if any.
    pub output: Option<String>,
    /// Error description when the attempt failed.
    pub error: Option<String>,
}

impl ExecutionResult {
    /// Create a successful result.
    pub fn success(output: Option<String>) -> Self {
        Self {
            success: true,
            output,
            error: None,
        }
    }

    /// Create a failed result.
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: None,
            error: Some(error.into()),
        }
    }

    /// Attach captured output to a failed result.
    pub fn with_output(mut self, output: impl Into<String>) -> Self {
        self.output = Some(output.into());
        self
    }
}

/// Runs one job to completion.
///
/// Implementations must stop promptly when `cancel` flips to `true`; the
/// result returned after a cancellation is discarded by the dispatcher.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Execute the job's command and report the outcome.
    async fn run(&self, job: &Job, cancel: watch::Receiver<bool>) -> ExecutionResult;
}

/// Executor that spawns the job's command as a child process.
///
/// Stdout and stderr are captured; the child is killed when the run future is
/// dropped (dispatcher timeout) or the cancellation signal fires.
pub struct ProcessExecutor {
    stats: Option<Arc<StatsCollector>>,
}

impl ProcessExecutor {
    /// Create an executor without statistics sampling.
    pub fn new() -> Self {
        Self { stats: None }
    }

    /// Enable memory sampling through the given collector.
    pub fn with_stats(mut self, stats: Arc<StatsCollector>) -> Self {
        self.stats = Some(stats);
        self
    }
}

impl Default for ProcessExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Executor for ProcessExecutor {
    async fn run(&self, job: &Job, mut cancel: watch::Receiver<bool>) -> ExecutionResult {
        let mut child = match tokio::process::Command::new(&job.command)
            .args(&job.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                return ExecutionResult::failure(format!(
                    "failed to spawn '{}': {}",
                    job.command, e
                ));
            }
        };

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let out_reader = tokio::spawn(read_to_string(stdout));
        let err_reader = tokio::spawn(read_to_string(stderr));

        // Sample the child's resident memory while it runs. The sampler stops
        // when the stop signal fires or the pid disappears.
        let (stop_tx, stop_rx) = watch::channel(false);
        let sampler = match (&self.stats, child.id()) {
            (Some(stats), Some(pid)) => Some(tokio::spawn(sample_memory(
                Arc::clone(stats),
                job.id,
                pid,
                stop_rx,
            ))),
            _ => None,
        };

        let status = tokio::select! {
            status = child.wait() => status,
            _ = cancelled(&mut cancel) => {
                let _ = stop_tx.send(true);
                if let Err(e) = child.kill().await {
                    tracing::warn!(job_id = %job.id, error = %e, "Failed to kill cancelled child process");
                }
                return ExecutionResult::failure("execution cancelled");
            }
        };
        let _ = stop_tx.send(true);
        if let Some(sampler) = sampler {
            let _ = sampler.await;
        }

        let stdout = out_reader.await.unwrap_or_default();
        let stderr = err_reader.await.unwrap_or_default();

        match status {
            Ok(status) if status.success() => ExecutionResult::success(non_empty(stdout)),
            Ok(status) => {
                let mut result = ExecutionResult::failure(match non_empty(stderr) {
                    Some(err) => format!("exited with {}: {}", status, err),
                    None => format!("exited with {}", status),
                });
                if let Some(out) = non_empty(stdout) {
                    result = result.with_output(out);
                }
                result
            }
            Err(e) => ExecutionResult::failure(format!("failed to wait for child: {}", e)),
        }
    }
}

/// Resolve when the cancellation flag flips to `true`.
///
/// A dropped sender means no cancellation can ever arrive; park forever and
/// let the sibling select branch win.
async fn cancelled(cancel: &mut watch::Receiver<bool>) {
    loop {
        if *cancel.borrow() {
            return;
        }
        if cancel.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

async fn read_to_string(pipe: Option<impl tokio::io::AsyncRead + Unpin>) -> String {
    let mut buffer = String::new();
    if let Some(mut pipe) = pipe {
        let _ = pipe.read_to_string(&mut buffer).await;
    }
    buffer
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim_end();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// Periodically record the child's resident set size in bytes.
async fn sample_memory(
    stats: Arc<StatsCollector>,
    job_id: crate::core::types::JobId,
    pid: u32,
    mut stop: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(stats.interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                match resident_bytes(pid) {
                    Some(bytes) => stats.record(job_id, MEMORY_CHARACTERISTIC, bytes).await,
                    None => break,
                }
            }
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
        }
    }
}

/// Resident set size of a process in bytes, or `None` once it has exited.
#[cfg(target_os = "linux")]
fn resident_bytes(pid: u32) -> Option<f64> {
    let statm = std::fs::read_to_string(format!("/proc/{}/statm", pid)).ok()?;
    let resident_pages: f64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    Some(resident_pages * 4096.0)
}

#[cfg(not(target_os = "linux"))]
fn resident_bytes(_pid: u32) -> Option<f64> {
    None
}
