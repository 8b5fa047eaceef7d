//! The dispatcher: polls the store, claims eligible jobs, and runs them.
//!
//! The dispatcher owns no scheduling state beyond the set of workers it has
//! spawned locally. Claims go through the store's atomic claim operation, so
//! any number of dispatcher processes can share one store; a lost claim is
//! simply skipped. Control operations arrive over a command channel held by
//! [`DispatcherHandle`].

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::config::EngineConfig;
use crate::core::job::Job;
use crate::core::retry::{ExponentialRetryScheduler, RetryScheduler};
use crate::core::state::JobState;
use crate::core::types::JobId;
use crate::execution::{ExecutionResult, Executor};
use crate::scheduler::lifecycle::Lifecycle;
use crate::storage::{JobStore, StorageError};

/// Upper bound on jobs fetched per poll.
const DISPATCH_BATCH: usize = 16;

/// Errors surfaced by dispatcher control operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The referenced job does not exist.
    #[error("job not found: {0}")]
    JobNotFound(JobId),

    /// Underlying storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The dispatcher has already shut down.
    #[error("dispatcher is no longer running")]
    ChannelClosed,
}

/// Control messages accepted by a running dispatcher.
enum DispatcherCommand {
    Cancel {
        job_id: JobId,
        response: oneshot::Sender<Result<bool, DispatchError>>,
    },
    Shutdown {
        response: oneshot::Sender<()>,
    },
}

/// Handle for controlling a running dispatcher.
#[derive(Clone)]
pub struct DispatcherHandle {
    command_tx: mpsc::Sender<DispatcherCommand>,
}

impl DispatcherHandle {
    /// Cancel a job, whether it is waiting or currently running here.
    ///
    /// Returns `true` when the job was moved to `Terminated` by this call.
    pub async fn cancel(&self, job_id: JobId) -> Result<bool, DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(DispatcherCommand::Cancel {
                job_id,
                response: tx,
            })
            .await
            .map_err(|_| DispatchError::ChannelClosed)?;
        rx.await.map_err(|_| DispatchError::ChannelClosed)?
    }

    /// Stop the dispatcher, waiting for running jobs up to the configured
    /// shutdown timeout.
    pub async fn shutdown(&self) -> Result<(), DispatchError> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(DispatcherCommand::Shutdown { response: tx })
            .await
            .map_err(|_| DispatchError::ChannelClosed)?;
        rx.await.map_err(|_| DispatchError::ChannelClosed)
    }

    /// Whether the dispatcher is still accepting commands.
    pub fn is_running(&self) -> bool {
        !self.command_tx.is_closed()
    }
}

/// One locally running job.
struct RunningJob {
    cancel_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Polls the store and executes claimed jobs.
pub struct Dispatcher<S: JobStore + 'static> {
    store: Arc<S>,
    lifecycle: Arc<Lifecycle<S>>,
    executor: Arc<dyn Executor>,
    config: EngineConfig,
}

impl<S: JobStore + 'static> Dispatcher<S> {
    /// Create a dispatcher with default settings and exponential backoff.
    pub fn new(store: Arc<S>, executor: Arc<dyn Executor>) -> Self {
        Self::with_config(store, executor, EngineConfig::default())
    }

    /// Create a dispatcher with the given settings. The retry policy is
    /// derived from `retry_base` and `max_retry_delay`.
    pub fn with_config(store: Arc<S>, executor: Arc<dyn Executor>, config: EngineConfig) -> Self {
        let retry = Arc::new(
            ExponentialRetryScheduler::new(config.retry_base.max(1))
                .with_max_delay(config.max_retry_delay),
        );
        Self::with_retry_scheduler(store, executor, config, retry)
    }

    /// Create a dispatcher with an explicit retry policy.
    pub fn with_retry_scheduler(
        store: Arc<S>,
        executor: Arc<dyn Executor>,
        config: EngineConfig,
        retry: Arc<dyn RetryScheduler>,
    ) -> Self {
        let lifecycle = Arc::new(Lifecycle::new(Arc::clone(&store), retry));
        Self {
            store,
            lifecycle,
            executor,
            config,
        }
    }

    /// Start the dispatch loop, returning a control handle and the loop's
    /// join handle.
    pub fn start(self) -> (DispatcherHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let handle = DispatcherHandle { command_tx };
        let join = tokio::spawn(self.run(command_rx));
        (handle, join)
    }

    async fn run(self, mut command_rx: mpsc::Receiver<DispatcherCommand>) {
        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_jobs));
        let running: Arc<Mutex<HashMap<JobId, RunningJob>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let mut poll = tokio::time::interval(self.config.poll_interval);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        tracing::info!(
            max_concurrent = self.config.max_concurrent_jobs,
            poll_interval_ms = self.config.poll_interval.as_millis() as u64,
            "Dispatcher started"
        );

        loop {
            tokio::select! {
                _ = poll.tick() => {
                    self.tick(&semaphore, &running).await;
                }
                command = command_rx.recv() => {
                    match command {
                        Some(DispatcherCommand::Cancel { job_id, response }) => {
                            let result = self.handle_cancel(job_id, &running).await;
                            let _ = response.send(result);
                        }
                        Some(DispatcherCommand::Shutdown { response }) => {
                            self.drain(&running).await;
                            let _ = response.send(());
                            break;
                        }
                        None => {
                            self.drain(&running).await;
                            break;
                        }
                    }
                }
            }
        }
        tracing::info!("Dispatcher stopped");
    }

    /// One poll cycle: promote, reconcile, dispatch.
    async fn tick(
        &self,
        semaphore: &Arc<Semaphore>,
        running: &Arc<Mutex<HashMap<JobId, RunningJob>>>,
    ) {
        if let Err(e) = self.lifecycle.promote_pending().await {
            tracing::warn!(error = %e, "Failed to promote pending jobs");
        }
        self.reconcile_cancelled(running).await;
        if let Err(e) = self.dispatch(semaphore, running).await {
            tracing::warn!(error = %e, "Dispatch cycle failed");
        }
    }

    /// Signal local workers whose jobs were resolved externally, e.g. a
    /// cancellation issued through another dispatcher on the same store.
    async fn reconcile_cancelled(&self, running: &Arc<Mutex<HashMap<JobId, RunningJob>>>) {
        let ids: Vec<JobId> = running.lock().await.keys().copied().collect();
        for id in ids {
            let externally_resolved = match self.store.get_job(&id).await {
                Ok(job) => job.state != JobState::Running,
                Err(StorageError::NotFound(_)) => true,
                Err(e) => {
                    tracing::warn!(job_id = %id, error = %e, "Failed to reconcile running job");
                    false
                }
            };
            if externally_resolved {
                if let Some(entry) = running.lock().await.get(&id) {
                    tracing::info!(job_id = %id, "Job resolved externally, stopping local worker");
                    let _ = entry.cancel_tx.send(true);
                }
            }
        }
    }

    /// Claim and start as many eligible jobs as free execution slots allow.
    async fn dispatch(
        &self,
        semaphore: &Arc<Semaphore>,
        running: &Arc<Mutex<HashMap<JobId, RunningJob>>>,
    ) -> Result<(), DispatchError> {
        let limit = semaphore.available_permits().min(DISPATCH_BATCH);
        if limit == 0 {
            return Ok(());
        }
        let candidates = self.store.find_dispatchable(Utc::now(), limit).await?;
        for mut job in candidates {
            let permit = match Arc::clone(semaphore).try_acquire_owned() {
                Ok(permit) => permit,
                Err(_) => break,
            };

            let token = uuid::Uuid::new_v4();
            if !self.store.try_claim(&job.id, token).await? {
                // Another dispatcher won; nothing to do.
                continue;
            }
            // Mirror the won claim locally rather than re-reading the store:
            // a read fault here must not orphan a job we already own.
            job.mark_claimed(token);
            tracing::info!(job_id = %job.id, command = %job.command, "Job claimed");

            let (cancel_tx, cancel_rx) = watch::channel(false);
            let id = job.id;
            let worker = self.spawn_worker(job, cancel_rx, permit, Arc::clone(running));
            running.lock().await.insert(
                id,
                RunningJob {
                    cancel_tx,
                    handle: worker,
                },
            );
        }
        Ok(())
    }

    fn spawn_worker(
        &self,
        job: Job,
        cancel_rx: watch::Receiver<bool>,
        permit: tokio::sync::OwnedSemaphorePermit,
        running: Arc<Mutex<HashMap<JobId, RunningJob>>>,
    ) -> JoinHandle<()> {
        let executor = Arc::clone(&self.executor);
        let lifecycle = Arc::clone(&self.lifecycle);
        let budget = job.max_runtime.or(self.config.execution_timeout);

        tokio::spawn(async move {
            let _permit = permit;
            let result = match budget {
                Some(budget) => {
                    match tokio::time::timeout(budget, executor.run(&job, cancel_rx)).await {
                        Ok(result) => result,
                        Err(_) => ExecutionResult::failure(format!(
                            "execution exceeded the {}s budget",
                            budget.as_secs()
                        )),
                    }
                }
                None => executor.run(&job, cancel_rx).await,
            };

            // A cancelled job is already Terminated; the conditional
            // transitions inside complete/fail absorb that race.
            let outcome = if result.success {
                lifecycle.complete(&job, result.output).await
            } else {
                lifecycle.fail(&job, result.error).await.map(|_| ())
            };
            if let Err(e) = outcome {
                tracing::error!(job_id = %job.id, error = %e, "Failed to resolve job outcome");
            }

            running.lock().await.remove(&job.id);
        })
    }

    async fn handle_cancel(
        &self,
        job_id: JobId,
        running: &Arc<Mutex<HashMap<JobId, RunningJob>>>,
    ) -> Result<bool, DispatchError> {
        let terminated = match self.lifecycle.terminate(&job_id).await {
            Ok(terminated) => terminated,
            Err(crate::scheduler::lifecycle::LifecycleError::Storage(StorageError::NotFound(
                _,
            ))) => return Err(DispatchError::JobNotFound(job_id)),
            Err(crate::scheduler::lifecycle::LifecycleError::Storage(e)) => return Err(e.into()),
        };
        if let Some(entry) = running.lock().await.get(&job_id) {
            let _ = entry.cancel_tx.send(true);
        }
        Ok(terminated)
    }

    /// Wait for running jobs to finish, up to the shutdown timeout; then
    /// cancel stragglers.
    async fn drain(&self, running: &Arc<Mutex<HashMap<JobId, RunningJob>>>) {
        let deadline = tokio::time::Instant::now() + self.config.shutdown_timeout;
        loop {
            {
                let mut guard = running.lock().await;
                guard.retain(|_, entry| !entry.handle.is_finished());
                if guard.is_empty() {
                    return;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let guard = running.lock().await;
        tracing::warn!(
            remaining = guard.len(),
            "Shutdown timeout reached, cancelling remaining jobs"
        );
        for entry in guard.values() {
            let _ = entry.cancel_tx.send(true);
        }
    }
}
