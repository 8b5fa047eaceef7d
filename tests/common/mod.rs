//! Shared fixtures for integration tests.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use conveyor::{
    Dispatcher, DispatcherHandle, EngineConfig, ExecutionResult, Executor, FixedRetryScheduler,
    InMemoryStore, Job, JobId, JobState, JobStore,
};

/// Executor scripted through the job's command string:
/// `succeed` completes, `fail` always fails, `succeed-after:N` fails the
/// first N attempts of that command, and `block` waits for cancellation.
pub struct ScriptedExecutor {
    attempts: Mutex<HashMap<String, usize>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Total attempts observed for a command.
    pub fn attempts_for(&self, command: &str) -> usize {
        *self.attempts.lock().unwrap().get(command).unwrap_or(&0)
    }

    fn next_attempt(&self, command: &str) -> usize {
        let mut attempts = self.attempts.lock().unwrap();
        let counter = attempts.entry(command.to_string()).or_insert(0);
        let attempt = *counter;
        *counter += 1;
        attempt
    }
}

#[async_trait]
impl Executor for ScriptedExecutor {
    async fn run(&self, job: &Job, mut cancel: watch::Receiver<bool>) -> ExecutionResult {
        let attempt = self.next_attempt(&job.command);
        match job.command.as_str() {
            "succeed" => ExecutionResult::success(Some(format!("attempt {attempt}"))),
            "fail" => ExecutionResult::failure("scripted failure"),
            command if command.starts_with("succeed-after:") => {
                let failures: usize = command["succeed-after:".len()..]
                    .parse()
                    .expect("scripted command threshold");
                if attempt < failures {
                    ExecutionResult::failure(format!("scripted failure {attempt}"))
                } else {
                    ExecutionResult::success(Some(format!("attempt {attempt}")))
                }
            }
            "block" => loop {
                if *cancel.borrow() {
                    break ExecutionResult::failure("execution cancelled");
                }
                if cancel.changed().await.is_err() {
                    break ExecutionResult::failure("cancel channel closed");
                }
            },
            other => ExecutionResult::failure(format!("unknown scripted command {other}")),
        }
    }
}

/// Engine settings tightened for tests: fast polling, zero retry delay.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        poll_interval: Duration::from_millis(10),
        shutdown_timeout: Duration::from_millis(500),
        ..EngineConfig::default()
    }
}

/// Start a dispatcher over the store with zero-delay retries.
pub fn start_dispatcher(
    store: Arc<InMemoryStore>,
    executor: Arc<ScriptedExecutor>,
    config: EngineConfig,
) -> (DispatcherHandle, JoinHandle<()>) {
    Dispatcher::with_retry_scheduler(
        store,
        executor,
        config,
        Arc::new(FixedRetryScheduler::new(Duration::ZERO)),
    )
    .start()
}

/// Poll until the job reaches the state, panicking after a few seconds.
pub async fn wait_for_state(store: &Arc<InMemoryStore>, id: &JobId, state: JobState) -> Job {
    for _ in 0..300 {
        let job = store.get_job(id).await.expect("job should exist");
        if job.state == state {
            return job;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let job = store.get_job(id).await.expect("job should exist");
    panic!("job {id} stuck in {}, expected {state}", job.state);
}

/// The deepest record of the retry chain rooted at `id`.
pub async fn chain_tip(store: &Arc<InMemoryStore>, id: &JobId) -> Job {
    let mut job = store.get_job(id).await.expect("job should exist");
    while let Some(next) = store
        .retry_jobs(&job.id)
        .await
        .expect("retry query should succeed")
        .into_iter()
        .last()
    {
        job = next;
    }
    job
}

/// Poll until the retry chain rooted at `id` ends in the given state.
pub async fn wait_for_chain_tip(store: &Arc<InMemoryStore>, id: &JobId, state: JobState) -> Job {
    for _ in 0..300 {
        let tip = chain_tip(store, id).await;
        if tip.state == state {
            return tip;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let tip = chain_tip(store, id).await;
    panic!("chain tip stuck in {}, expected {state}", tip.state);
}
