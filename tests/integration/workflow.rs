//! End-to-end dependency workflows through a live dispatcher.

use std::sync::Arc;

use conveyor::{InMemoryStore, Job, JobQueue, JobState, JobStore};

use crate::common::{fast_config, start_dispatcher, wait_for_state, ScriptedExecutor};

#[tokio::test]
async fn test_linear_pipeline_runs_in_dependency_order() {
    let store = Arc::new(InMemoryStore::new());
    let queue = JobQueue::new(store.clone());
    let executor = Arc::new(ScriptedExecutor::new());
    let (handle, join) = start_dispatcher(store.clone(), executor, fast_config());

    let extract = queue.submit(Job::new("succeed")).await.unwrap();
    let transform = queue
        .submit(Job::new("succeed").with_dependency(extract))
        .await
        .unwrap();
    let load = queue
        .submit(Job::new("succeed").with_dependency(transform))
        .await
        .unwrap();

    wait_for_state(&store, &load, JobState::Finished).await;

    let extract = store.get_job(&extract).await.unwrap();
    let transform = store.get_job(&transform).await.unwrap();
    let load = store.get_job(&load).await.unwrap();
    assert!(extract.finished_at.unwrap() <= transform.started_at.unwrap());
    assert!(transform.finished_at.unwrap() <= load.started_at.unwrap());

    handle.shutdown().await.unwrap();
    join.await.unwrap();
}

#[tokio::test]
async fn test_diamond_graph_waits_for_both_branches() {
    let store = Arc::new(InMemoryStore::new());
    let queue = JobQueue::new(store.clone());
    let executor = Arc::new(ScriptedExecutor::new());
    let (handle, join) = start_dispatcher(store.clone(), executor, fast_config());

    let top = queue.submit(Job::new("succeed")).await.unwrap();
    let left = queue
        .submit(Job::new("succeed").with_dependency(top))
        .await
        .unwrap();
    let right = queue
        .submit(Job::new("succeed").with_dependency(top))
        .await
        .unwrap();
    let bottom = queue
        .submit(Job::new("succeed").with_dependencies([left, right]))
        .await
        .unwrap();

    wait_for_state(&store, &bottom, JobState::Finished).await;

    let bottom = store.get_job(&bottom).await.unwrap();
    for branch in [left, right] {
        let branch = store.get_job(&branch).await.unwrap();
        assert!(branch.finished_at.unwrap() <= bottom.started_at.unwrap());
    }

    handle.shutdown().await.unwrap();
    join.await.unwrap();
}

#[tokio::test]
async fn test_job_with_blocked_dependency_never_starts() {
    let store = Arc::new(InMemoryStore::new());
    let queue = JobQueue::new(store.clone());
    let executor = Arc::new(ScriptedExecutor::new());
    let (handle, join) = start_dispatcher(store.clone(), executor.clone(), fast_config());

    let blocker = queue.submit(Job::new("block")).await.unwrap();
    let gated = queue
        .submit(Job::new("succeed").with_dependency(blocker))
        .await
        .unwrap();

    wait_for_state(&store, &blocker, JobState::Running).await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let gated_job = store.get_job(&gated).await.unwrap();
    assert_eq!(gated_job.state, JobState::Pending);
    assert_eq!(executor.attempts_for("succeed"), 0);

    handle.cancel(blocker).await.unwrap();
    handle.shutdown().await.unwrap();
    join.await.unwrap();
}

#[tokio::test]
async fn test_cancelling_running_job_terminates_without_retry() {
    let store = Arc::new(InMemoryStore::new());
    let queue = JobQueue::new(store.clone());
    let executor = Arc::new(ScriptedExecutor::new());
    let (handle, join) = start_dispatcher(store.clone(), executor, fast_config());

    // A generous retry budget must not resurrect a terminated job.
    let id = queue
        .submit(Job::new("block").with_max_retries(5))
        .await
        .unwrap();
    wait_for_state(&store, &id, JobState::Running).await;

    assert!(handle.cancel(id).await.unwrap());
    wait_for_state(&store, &id, JobState::Terminated).await;

    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert!(store.retry_jobs(&id).await.unwrap().is_empty());

    handle.shutdown().await.unwrap();
    join.await.unwrap();
}

#[tokio::test]
async fn test_two_dispatchers_share_one_store() {
    let store = Arc::new(InMemoryStore::new());
    let queue = JobQueue::new(store.clone());
    let executor = Arc::new(ScriptedExecutor::new());
    let (handle_a, join_a) = start_dispatcher(store.clone(), executor.clone(), fast_config());
    let (handle_b, join_b) = start_dispatcher(store.clone(), executor.clone(), fast_config());

    let mut ids = Vec::new();
    for _ in 0..8 {
        ids.push(queue.submit(Job::new("succeed")).await.unwrap());
    }
    for id in &ids {
        wait_for_state(&store, id, JobState::Finished).await;
    }

    // Each job ran exactly once despite two competing dispatchers.
    assert_eq!(executor.attempts_for("succeed"), 8);

    handle_a.shutdown().await.unwrap();
    handle_b.shutdown().await.unwrap();
    join_a.await.unwrap();
    join_b.await.unwrap();
}
