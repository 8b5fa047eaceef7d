//! Retry chains driven through a live dispatcher.

use std::sync::Arc;
use std::time::Duration;

use conveyor::{
    Dispatcher, EngineConfig, ExponentialRetryScheduler, InMemoryStore, Job, JobQueue, JobState,
    JobStore, QueueError,
};

use crate::common::{
    chain_tip, fast_config, start_dispatcher, wait_for_chain_tip, wait_for_state, ScriptedExecutor,
};

#[tokio::test]
async fn test_flaky_job_recovers_through_retry_chain() {
    let store = Arc::new(InMemoryStore::new());
    let queue = JobQueue::new(store.clone());
    let executor = Arc::new(ScriptedExecutor::new());
    let (handle, join) = start_dispatcher(store.clone(), executor.clone(), fast_config());

    let id = queue
        .submit(Job::new("succeed-after:2").with_max_retries(3))
        .await
        .unwrap();

    let tip = wait_for_chain_tip(&store, &id, JobState::Finished).await;
    assert_eq!(executor.attempts_for("succeed-after:2"), 3);

    // Every link points at its immediate predecessor.
    let first = store.retry_jobs(&id).await.unwrap().pop().unwrap();
    assert_eq!(first.original_job_id, Some(id));
    assert_eq!(tip.original_job_id, Some(first.id));

    // Failed attempts stay failed; only the last link finished.
    assert_eq!(store.get_job(&id).await.unwrap().state, JobState::Failed);
    assert_eq!(first.state, JobState::Failed);

    handle.shutdown().await.unwrap();
    join.await.unwrap();
}

#[tokio::test]
async fn test_exhausted_budget_leaves_chain_failed() {
    let store = Arc::new(InMemoryStore::new());
    let queue = JobQueue::new(store.clone());
    let executor = Arc::new(ScriptedExecutor::new());
    let (handle, join) = start_dispatcher(store.clone(), executor.clone(), fast_config());

    let id = queue
        .submit(Job::new("fail").with_max_retries(2))
        .await
        .unwrap();

    let tip = wait_for_chain_tip(&store, &id, JobState::Failed).await;

    // Root plus two retries, no further records.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(executor.attempts_for("fail"), 3);
    assert!(store.retry_jobs(&tip.id).await.unwrap().is_empty());

    handle.shutdown().await.unwrap();
    join.await.unwrap();
}

#[tokio::test]
async fn test_zero_budget_job_fails_once() {
    let store = Arc::new(InMemoryStore::new());
    let queue = JobQueue::new(store.clone());
    let executor = Arc::new(ScriptedExecutor::new());
    let (handle, join) = start_dispatcher(store.clone(), executor.clone(), fast_config());

    let id = queue.submit(Job::new("fail")).await.unwrap();
    wait_for_state(&store, &id, JobState::Failed).await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(executor.attempts_for("fail"), 1);
    assert!(store.retry_jobs(&id).await.unwrap().is_empty());

    handle.shutdown().await.unwrap();
    join.await.unwrap();
}

#[tokio::test]
async fn test_exponential_backoff_delays_retry_eligibility() {
    let store = Arc::new(InMemoryStore::new());
    let queue = JobQueue::new(store.clone());
    let executor = Arc::new(ScriptedExecutor::new());
    // Real exponential policy: the retry must not run before its delay.
    let config = fast_config();
    let dispatcher = Dispatcher::with_retry_scheduler(
        store.clone(),
        executor.clone(),
        config,
        Arc::new(ExponentialRetryScheduler::new(30)),
    );
    let (handle, join) = dispatcher.start();

    let id = queue
        .submit(Job::new("fail").with_max_retries(1))
        .await
        .unwrap();
    wait_for_state(&store, &id, JobState::Failed).await;

    let retry = loop {
        if let Some(retry) = store.retry_jobs(&id).await.unwrap().pop() {
            break retry;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };

    // First retry of a base-30 policy waits 30 seconds; it must still be
    // waiting well after the failure.
    let delay = (retry.eligible_at - store.get_job(&id).await.unwrap().finished_at.unwrap())
        .num_seconds();
    assert!((29..=31).contains(&delay), "delay was {delay}s");

    tokio::time::sleep(Duration::from_millis(200)).await;
    let retry = store.get_job(&retry.id).await.unwrap();
    assert_ne!(retry.state, JobState::Running);
    assert_ne!(retry.state, JobState::Finished);
    assert_eq!(executor.attempts_for("fail"), 1);

    handle.shutdown().await.unwrap();
    join.await.unwrap();
}

#[tokio::test]
async fn test_manual_retry_restarts_an_exhausted_chain() {
    let store = Arc::new(InMemoryStore::new());
    let queue = JobQueue::new(store.clone());
    let executor = Arc::new(ScriptedExecutor::new());
    let (handle, join) = start_dispatcher(store.clone(), executor.clone(), fast_config());

    let id = queue
        .submit(Job::new("succeed-after:1"))
        .await
        .unwrap();
    wait_for_state(&store, &id, JobState::Failed).await;

    // No budget, so the chain is dead until an operator intervenes.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.retry_jobs(&id).await.unwrap().is_empty());

    let retry_id = queue.retry_now(&id).await.unwrap();
    wait_for_state(&store, &retry_id, JobState::Finished).await;
    assert_eq!(
        store.get_job(&retry_id).await.unwrap().original_job_id,
        Some(id)
    );

    handle.shutdown().await.unwrap();
    join.await.unwrap();
}

#[tokio::test]
async fn test_manual_retry_rejected_while_chain_is_live() {
    let store = Arc::new(InMemoryStore::new());
    let queue = JobQueue::new(store.clone());
    let executor = Arc::new(ScriptedExecutor::new());
    let (handle, join) = start_dispatcher(store.clone(), executor, fast_config());

    let id = queue.submit(Job::new("block")).await.unwrap();
    wait_for_state(&store, &id, JobState::Running).await;

    match queue.retry_now(&id).await {
        Err(QueueError::RetryNotAllowed(state)) => assert_eq!(state, JobState::Running),
        other => panic!("expected RetryNotAllowed, got {other:?}"),
    }

    handle.cancel(id).await.unwrap();
    handle.shutdown().await.unwrap();
    join.await.unwrap();
}

#[tokio::test]
async fn test_dependent_waits_for_retry_chain_to_succeed() {
    let store = Arc::new(InMemoryStore::new());
    let queue = JobQueue::new(store.clone());
    let executor = Arc::new(ScriptedExecutor::new());
    let (handle, join) = start_dispatcher(store.clone(), executor.clone(), fast_config());

    let flaky = queue
        .submit(Job::new("succeed-after:1").with_max_retries(2))
        .await
        .unwrap();
    let dependent = queue
        .submit(Job::new("succeed").with_dependency(flaky))
        .await
        .unwrap();

    let dependent_job = wait_for_state(&store, &dependent, JobState::Finished).await;

    // The dependent started only after some link of the chain finished.
    let tip = chain_tip(&store, &flaky).await;
    assert_eq!(tip.state, JobState::Finished);
    assert!(tip.finished_at.unwrap() <= dependent_job.started_at.unwrap());

    handle.shutdown().await.unwrap();
    join.await.unwrap();
}

#[tokio::test]
async fn test_manifest_default_retry_budget_applies() {
    // Submitting through manifest settings: unspecified budgets fall back to
    // the engine default.
    let config = EngineConfig::default();
    let job = Job::new("fail").with_max_retries(config.default_max_retries);
    assert_eq!(job.max_retries, 3);
}
