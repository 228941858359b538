
use futures::TryStreamExt;
use queuectl::dlq::DeadLetterQueue;
use queuectl::error::QueueError;
use queuectl::scheduler::{Job, JobState, RetryPolicy};
use test_harness::TestStore;
use uuid::Uuid;

/// Enqueue `command` and fail it straight into the dead letter queue.
async fn dead_job(ts: &TestStore, command: &str) -> Job {
    let queue = ts.queue();
    let job = queue.enqueue(command).await.unwrap();
    let claimed = queue.claim_next("w1").await.unwrap().unwrap();
    assert_eq!(claimed.id, job.id);
    let policy = RetryPolicy {
        max_retries: 1,
        backoff_base: 2,
    };
    let dead = queue.fail(&claimed, "w1", &policy).await.unwrap();
    assert_eq!(dead.state, JobState::Dead);
    dead
}

#[tokio::test]
async fn test_list_dead_is_empty_without_failures() {
    let ts = TestStore::new().await;
    ts.queue().enqueue("true").await.unwrap();

    let dlq = DeadLetterQueue::new(ts.store.clone());
    let dead: Vec<Job> = dlq.list_dead().try_collect().await.unwrap();
    assert!(dead.is_empty());
}

#[tokio::test]
async fn test_list_dead_newest_first() {
    let ts = TestStore::new().await;
    let first = dead_job(&ts, "exit 1").await;
    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let second = dead_job(&ts, "exit 2").await;
    ts.queue().enqueue("true").await.unwrap();

    let dlq = DeadLetterQueue::new(ts.store.clone());
    let dead: Vec<Job> = dlq.list_dead().try_collect().await.unwrap();
    let ids: Vec<Uuid> = dead.iter().map(|j| j.id).collect();
    assert_eq!(ids, vec![second.id, first.id]);

    // Each call runs a fresh query.
    let again: Vec<Job> = dlq.list_dead().try_collect().await.unwrap();
    assert_eq!(again.len(), 2);
}

#[tokio::test]
async fn test_requeue_resets_dead_job() {
    let ts = TestStore::new().await;
    let dead = dead_job(&ts, "false").await;
    ts.set_config("max-retries", "4").await;

    let dlq = DeadLetterQueue::new(ts.store.clone());
    let job = dlq.requeue(&dead.id.to_string()).await.unwrap();

    assert_eq!(job.id, dead.id);
    assert_eq!(job.state, JobState::Pending);
    assert_eq!(job.attempts, 0);
    assert_eq!(job.max_retries, 4);
    assert!(job.owner.is_none());
    assert!(job.next_run_at.is_none());
    assert_eq!(ts.job(dead.id).await, job);

    let dead_now: Vec<Job> = dlq.list_dead().try_collect().await.unwrap();
    assert!(dead_now.is_empty());

    // Back in the queue and claimable right away.
    let claimed = ts.queue().claim_next("w2").await.unwrap().unwrap();
    assert_eq!(claimed.id, dead.id);
}

#[tokio::test]
async fn test_requeue_unknown_job_is_not_found() {
    let ts = TestStore::new().await;
    let dlq = DeadLetterQueue::new(ts.store.clone());
    let id = Uuid::new_v4();

    let err = dlq.requeue(&id.to_string()).await.unwrap_err();
    assert!(matches!(err, QueueError::JobNotFound(ref missing) if *missing == id.to_string()));
    assert!(err.is_rejection());
}

#[tokio::test]
async fn test_requeue_malformed_id_is_rejected() {
    let ts = TestStore::new().await;
    let dlq = DeadLetterQueue::new(ts.store.clone());

    let err = dlq.requeue("not-a-uuid").await.unwrap_err();
    assert!(matches!(err, QueueError::InvalidJobId(_)));
}

#[tokio::test]
async fn test_requeue_non_dead_job_changes_nothing() {
    let ts = TestStore::new().await;
    let queue = ts.queue();
    let dlq = DeadLetterQueue::new(ts.store.clone());

    let pending = queue.enqueue("true").await.unwrap();
    let err = dlq.requeue_id(pending.id).await.unwrap_err();
    assert!(matches!(
        err,
        QueueError::InvalidState { state: JobState::Pending, .. }
    ));
    assert_eq!(ts.job(pending.id).await, pending);

    let claimed = queue.claim_next("w1").await.unwrap().unwrap();
    let err = dlq.requeue_id(claimed.id).await.unwrap_err();
    assert!(matches!(
        err,
        QueueError::InvalidState { state: JobState::Processing, .. }
    ));
    assert_eq!(ts.job(claimed.id).await, claimed);

    let completed = queue.complete(&claimed, "w1").await.unwrap();
    let err = dlq.requeue_id(completed.id).await.unwrap_err();
    assert!(matches!(
        err,
        QueueError::InvalidState { state: JobState::Completed, .. }
    ));
    assert_eq!(ts.job(completed.id).await, completed);
}
