
use std::time::Duration;

use futures::TryStreamExt;
use queuectl::dlq::DeadLetterQueue;
use queuectl::scheduler::{Job, JobState, WorkerRegistry};
use queuectl::store::ControlChannel;
use queuectl::supervisor::Supervisor;
use queuectl::worker::{ExitReason, Worker};
use test_harness::{assert_eventually, fast_worker_config, TestStore};
use tokio_util::sync::CancellationToken;

const RUN_TIMEOUT: Duration = Duration::from_secs(15);

#[tokio::test]
async fn test_successful_job_completes() {
    let ts = TestStore::new().await;
    let job = ts.queue().enqueue("true").await.unwrap();

    let worker = Worker::new(
        ts.store.clone(),
        fast_worker_config(1).with_job_limit(1),
        CancellationToken::new(),
    );
    let report = tokio::time::timeout(RUN_TIMEOUT, worker.run())
        .await
        .expect("worker finished")
        .unwrap();

    assert_eq!(report.reason, ExitReason::LimitReached);
    assert_eq!(report.processed, 1);
    assert_eq!(report.completed, 1);

    let job = ts.job(job.id).await;
    assert_eq!(job.state, JobState::Completed);
    assert!(job.owner.is_none());
    assert_eq!(job.attempts, 0);

    let workers = WorkerRegistry::new(ts.store.clone()).all_workers().await.unwrap();
    assert!(workers.is_empty(), "worker row should be removed on exit");
}

#[tokio::test]
async fn test_failing_job_retries_then_dies_then_requeues() {
    let ts = TestStore::new().await;
    ts.set_config("max-retries", "2").await;
    ts.set_config("backoff-base", "2").await;
    let job = ts.queue().enqueue("exit 1").await.unwrap();
    assert_eq!(job.max_retries, 2);

    let worker = Worker::new(
        ts.store.clone(),
        fast_worker_config(1).with_job_limit(2),
        CancellationToken::new(),
    );
    let handle = tokio::spawn(worker.run());

    // First attempt fails and waits roughly two seconds.
    let store = ts.store.clone();
    let id = job.id;
    assert_eventually(
        || {
            let queue = queuectl::JobQueue::new(store.clone());
            async move {
                let job = queue.get_job(&id).await.unwrap().unwrap();
                job.attempts == 1 && job.state == JobState::Pending
            }
        },
        Duration::from_secs(5),
        "first failure was never recorded",
    )
    .await;

    // Backoff keeps it pending for two seconds, far longer than the poll above.
    let retrying = ts.job(job.id).await;
    assert_eq!(retrying.state, JobState::Pending);
    assert_eq!(retrying.attempts, 1);
    assert!(retrying.owner.is_none());
    let wait = retrying.next_run_at.expect("backoff scheduled") - retrying.updated_at;
    assert_eq!(wait.num_seconds(), 2);

    let report = tokio::time::timeout(RUN_TIMEOUT, handle)
        .await
        .expect("worker finished")
        .unwrap()
        .unwrap();
    assert_eq!(report.processed, 2);
    assert_eq!(report.retried, 1);
    assert_eq!(report.dead, 1);

    let dead = ts.job(job.id).await;
    assert_eq!(dead.state, JobState::Dead);
    assert_eq!(dead.attempts, 2);
    assert!(dead.owner.is_none());

    let dlq = DeadLetterQueue::new(ts.store.clone());
    let listed: Vec<Job> = dlq.list_dead().try_collect().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, job.id);

    let requeued = dlq.requeue(&job.id.to_string()).await.unwrap();
    assert_eq!(requeued.state, JobState::Pending);
    assert_eq!(requeued.attempts, 0);
    assert!(requeued.owner.is_none());
    assert!(requeued.next_run_at.is_none());
    ts.assert_invariants().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_workers_run_each_job_once() {
    let ts = TestStore::new().await;
    let log = ts.dir().join("runs.log");
    for i in 0..5 {
        ts.queue()
            .enqueue(format!("echo {} >> '{}'", i, log.display()))
            .await
            .unwrap();
    }

    let supervisor = Supervisor::new(
        ts.store.clone(),
        fast_worker_config(5).with_job_limit(1),
        CancellationToken::new(),
    );
    let reports = tokio::time::timeout(RUN_TIMEOUT, supervisor.run())
        .await
        .expect("supervisor finished")
        .unwrap();

    assert_eq!(reports.len(), 5);
    assert!(reports.iter().all(|r| r.processed == 1 && r.completed == 1));

    let counts = ts.queue().counts().await.unwrap();
    assert_eq!(counts.completed, 5);
    assert_eq!(counts.pending + counts.processing + counts.dead, 0);

    let runs = std::fs::read_to_string(&log).unwrap();
    let mut lines: Vec<&str> = runs.lines().collect();
    lines.sort_unstable();
    assert_eq!(lines, vec!["0", "1", "2", "3", "4"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_signal_lets_running_job_finish() {
    let ts = TestStore::new().await;
    let job = ts.queue().enqueue("sleep 1").await.unwrap();

    let supervisor = Supervisor::new(ts.store.clone(), fast_worker_config(1), CancellationToken::new());
    let handle = tokio::spawn(supervisor.run());

    let store = ts.store.clone();
    let id = job.id;
    assert_eventually(
        || {
            let queue = queuectl::JobQueue::new(store.clone());
            async move {
                let job = queue.get_job(&id).await.unwrap().unwrap();
                job.state == JobState::Processing
            }
        },
        Duration::from_secs(5),
        "job was never claimed",
    )
    .await;

    Supervisor::stop(&ts.store).await.unwrap();

    let reports = tokio::time::timeout(RUN_TIMEOUT, handle)
        .await
        .expect("supervisor finished")
        .unwrap()
        .unwrap();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].reason, ExitReason::StopRequested);
    assert_eq!(reports[0].completed, 1);

    let job = ts.job(job.id).await;
    assert_eq!(job.state, JobState::Completed);
    assert!(job.owner.is_none());

    let workers = WorkerRegistry::new(ts.store.clone()).all_workers().await.unwrap();
    assert!(workers.is_empty());
}

#[tokio::test]
async fn test_stop_flag_survives_until_reset() {
    let ts = TestStore::new().await;
    let job = ts.queue().enqueue("true").await.unwrap();
    Supervisor::stop(&ts.store).await.unwrap();

    let reports = Supervisor::new(ts.store.clone(), fast_worker_config(2), CancellationToken::new())
        .run()
        .await
        .unwrap();
    assert_eq!(reports.len(), 2);
    assert!(reports
        .iter()
        .all(|r| r.reason == ExitReason::StopRequested && r.processed == 0));
    assert_eq!(ts.job(job.id).await.state, JobState::Pending);

    let reports = Supervisor::new(
        ts.store.clone(),
        fast_worker_config(1).with_job_limit(1).with_reset_stop(true),
        CancellationToken::new(),
    )
    .run()
    .await
    .unwrap();
    assert_eq!(reports[0].completed, 1);
    assert_eq!(ts.job(job.id).await.state, JobState::Completed);

    let control = ControlChannel::new(ts.store.clone());
    assert!(!control.is_stop_requested().await.unwrap());
}

#[tokio::test]
async fn test_shutdown_token_stops_idle_workers() {
    let ts = TestStore::new().await;
    let shutdown = CancellationToken::new();
    let supervisor = Supervisor::new(ts.store.clone(), fast_worker_config(3), shutdown.clone());
    let handle = tokio::spawn(supervisor.run());

    let registry = WorkerRegistry::new(ts.store.clone());
    assert_eventually(
        || {
            let registry = registry.clone();
            async move { registry.all_workers().await.unwrap().len() == 3 }
        },
        Duration::from_secs(5),
        "workers never registered",
    )
    .await;

    shutdown.cancel();
    let reports = tokio::time::timeout(RUN_TIMEOUT, handle)
        .await
        .expect("supervisor finished")
        .unwrap()
        .unwrap();

    assert_eq!(reports.len(), 3);
    assert!(reports.iter().all(|r| r.reason == ExitReason::Shutdown));
    assert!(registry.all_workers().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_config_change_applies_to_next_failure() {
    let ts = TestStore::new().await;
    let job = ts.queue().enqueue("exit 7").await.unwrap();
    assert_eq!(job.max_retries, 3);
    ts.set_config("max-retries", "1").await;

    let report = Worker::new(
        ts.store.clone(),
        fast_worker_config(1).with_job_limit(1),
        CancellationToken::new(),
    )
    .run()
    .await
    .unwrap();
    assert_eq!(report.dead, 1);

    let dead = ts.job(job.id).await;
    assert_eq!(dead.state, JobState::Dead);
    assert_eq!(dead.attempts, 1);
    assert_eq!(dead.max_retries, 1);
}
