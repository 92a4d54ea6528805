use std::sync::Arc;
use std::time::{Duration, Instant};

use jobforge_core::config::{OpenCircuitAction, RetryConfig, SchedulingPolicyKind};
use jobforge_core::{CircuitBreaker, CircuitBreakerConfig, CircuitState, SchedulerError};
use jobforge_domain::{Job, JobStatus, JobStore, RetryPolicy};
use jobforge_infrastructure::database::InMemoryJobStore;
use jobforge_infrastructure::job_queue::{JobQueue, JobQueueConfig};
use jobforge_infrastructure::job_registry::{CancelRequest, JobRegistry};
use jobforge_testing_utils::{JobBuilder, ScriptedExecutor, Step, TestAssertions, TestEnv};
use jobforge_worker::{ExecutorRegistry, JobRunner, Requeuer, RunOutcome};
use tokio_util::sync::CancellationToken;

struct Harness {
    queue: Arc<JobQueue>,
    registry: Arc<JobRegistry>,
    executors: Arc<ExecutorRegistry>,
    requeuer: Arc<Requeuer>,
}

fn harness() -> Harness {
    let queue = Arc::new(JobQueue::new(JobQueueConfig {
        policy: SchedulingPolicyKind::Fifo,
        ..Default::default()
    }));
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let registry = Arc::new(JobRegistry::new(store));
    let requeuer = Arc::new(Requeuer::new(
        queue.clone(),
        registry.clone(),
        Duration::from_millis(50),
        CancellationToken::new(),
    ));
    Harness {
        queue,
        registry,
        executors: Arc::new(ExecutorRegistry::new()),
        requeuer,
    }
}

fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(RetryConfig {
        max_attempts,
        base_delay_ms: 5,
        multiplier: 2.0,
        max_delay_ms: 50,
        jitter: 0.0,
    })
}

fn runner(h: &Harness) -> JobRunner {
    JobRunner::new(h.registry.clone(), h.executors.clone(), h.requeuer.clone())
        .with_retry_policy(fast_retry(3))
        .with_job_timeout(Duration::from_secs(5))
}

async fn submit(h: &Harness, job: Job) -> Job {
    h.registry.register(job).await.unwrap()
}

#[tokio::test]
async fn test_successful_run_completes_job() {
    let h = harness();
    let executor = ScriptedExecutor::new(
        "render",
        vec![Step::Succeed(serde_json::json!({"quality": 0.9}))],
    )
    .shared();
    h.executors.register("render", executor.clone());
    let runner = runner(&h);

    let job = submit(&h, JobBuilder::new("render").build()).await;
    let report = runner.run(job.clone(), "worker-1").await;

    assert_eq!(report.outcome, RunOutcome::Completed);
    assert!(!report.timed_out);
    let stored = h.registry.get(job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Completed);
    assert_eq!(stored.attempt_count, 1);
    assert_eq!(stored.result, Some(serde_json::json!({"quality": 0.9})));
    assert_eq!(executor.calls()[0].worker_id, "worker-1");
}

#[tokio::test]
async fn test_retry_recovers_after_transient_failure() {
    let h = harness();
    let executor = ScriptedExecutor::failing_times("sync", 1).shared();
    h.executors.register("sync", executor.clone());
    let runner = runner(&h);

    let job = submit(&h, JobBuilder::new("sync").with_max_attempts(3).build()).await;
    let first = runner.run(job.clone(), "worker-1").await;
    assert_eq!(first.outcome, RunOutcome::Retrying);

    let queue = h.queue.clone();
    assert!(
        TestEnv::wait_for(
            move || {
                let queue = queue.clone();
                async move { !queue.is_empty() }
            },
            Duration::from_secs(2)
        )
        .await
    );
    let retried = h.queue.pop().unwrap();
    let second = runner.run(retried, "worker-2").await;

    assert_eq!(second.outcome, RunOutcome::Completed);
    let stored = h.registry.get(job.id).unwrap();
    TestAssertions::assert_status(&stored, JobStatus::Completed);
    assert_eq!(stored.attempt_count, 2);
    assert_eq!(executor.call_count(), 2);
}

#[tokio::test]
async fn test_transient_failures_retry_until_exhausted() {
    let h = harness();
    let executor = ScriptedExecutor::always(
        "flaky",
        Step::Fail(SchedulerError::transient("connection reset")),
    )
    .shared();
    h.executors.register("flaky", executor.clone());
    let runner = runner(&h);

    let job = submit(&h, JobBuilder::new("flaky").with_max_attempts(3).build()).await;
    let mut next = job.clone();
    let mut outcomes = Vec::new();
    for _ in 0..3 {
        let report = runner.run(next.clone(), "worker-1").await;
        outcomes.push(report.outcome);
        if report.outcome != RunOutcome::Retrying {
            break;
        }
        let queue = h.queue.clone();
        assert!(
            TestEnv::wait_for(
                move || {
                    let queue = queue.clone();
                    async move { !queue.is_empty() }
                },
                Duration::from_secs(2)
            )
            .await
        );
        next = h.queue.pop().unwrap();
    }

    assert_eq!(
        outcomes,
        vec![RunOutcome::Retrying, RunOutcome::Retrying, RunOutcome::Failed]
    );
    let stored = h.registry.get(job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.attempt_count, 3);
    assert!(stored.last_error.unwrap().contains("connection reset"));
    assert_eq!(
        executor.calls().iter().map(|c| c.attempt).collect::<Vec<_>>(),
        vec![1, 2, 3]
    );
    assert_eq!(h.registry.counters().retried, 2);
}

#[tokio::test]
async fn test_validation_failure_is_not_retried() {
    let h = harness();
    h.executors.register(
        "strict",
        Arc::new(ScriptedExecutor::always(
            "strict",
            Step::Fail(SchedulerError::validation("missing input")),
        )),
    );
    let runner = runner(&h);

    let job = submit(&h, JobBuilder::new("strict").build()).await;
    let report = runner.run(job.clone(), "worker-1").await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    let stored = h.registry.get(job.id).unwrap();
    assert_eq!(stored.attempt_count, 1);
    assert_eq!(stored.status, JobStatus::Failed);
}

#[tokio::test]
async fn test_unknown_job_type_fails_without_attempt() {
    let h = harness();
    let runner = runner(&h);

    let job = submit(&h, JobBuilder::new("mystery").build()).await;
    let report = runner.run(job.clone(), "worker-1").await;

    assert_eq!(report.outcome, RunOutcome::Failed);
    let stored = h.registry.get(job.id).unwrap();
    assert_eq!(stored.attempt_count, 0);
    assert!(stored.last_error.unwrap().contains("mystery"));
}

#[tokio::test]
async fn test_circuit_rejects_sixth_job_then_admits_trial() {
    let h = harness();
    let executor = ScriptedExecutor::new(
        "gpu",
        (0..5)
            .map(|_| Step::Fail(SchedulerError::validation("device lost")))
            .collect(),
    )
    .shared();
    h.executors.register("gpu", executor.clone());
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 5,
        cool_down_ms: 100,
        ..Default::default()
    }));
    let runner = runner(&h).with_circuit_breaker(breaker.clone());

    for _ in 0..5 {
        let job = submit(&h, JobBuilder::new("gpu").build()).await;
        assert_eq!(runner.run(job, "worker-1").await.outcome, RunOutcome::Failed);
    }
    assert_eq!(breaker.state("gpu"), CircuitState::Open);

    let sixth = submit(&h, JobBuilder::new("gpu").build()).await;
    let report = runner.run(sixth.clone(), "worker-1").await;
    assert_eq!(report.outcome, RunOutcome::CircuitRejected);
    assert_eq!(executor.call_count(), 5);
    let stored = h.registry.get(sixth.id).unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert_eq!(stored.attempt_count, 0);

    tokio::time::sleep(Duration::from_millis(150)).await;
    let trial = submit(&h, JobBuilder::new("gpu").build()).await;
    assert_eq!(
        runner.run(trial, "worker-1").await.outcome,
        RunOutcome::Completed
    );
    assert_eq!(breaker.state("gpu"), CircuitState::Closed);
    assert_eq!(executor.call_count(), 6);
}

#[tokio::test]
async fn test_open_circuit_requeue_keeps_attempts() {
    let h = harness();
    h.executors.register(
        "gpu",
        Arc::new(ScriptedExecutor::new(
            "gpu",
            vec![Step::Fail(SchedulerError::validation("device lost"))],
        )),
    );
    let breaker = Arc::new(CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 1,
        cool_down_ms: 100,
        ..Default::default()
    }));
    let runner = runner(&h)
        .with_circuit_breaker(breaker)
        .with_open_circuit_action(OpenCircuitAction::Requeue);

    let first = submit(&h, JobBuilder::new("gpu").build()).await;
    assert_eq!(runner.run(first, "worker-1").await.outcome, RunOutcome::Failed);

    let second = submit(&h, JobBuilder::new("gpu").build()).await;
    let report = runner.run(second.clone(), "worker-1").await;
    assert_eq!(report.outcome, RunOutcome::CircuitRequeued);
    let stored = h.registry.get(second.id).unwrap();
    assert_eq!(stored.status, JobStatus::Pending);
    assert_eq!(stored.attempt_count, 0);

    let queue = h.queue.clone();
    let id = second.id;
    assert!(
        TestEnv::wait_for(
            move || {
                let queue = queue.clone();
                async move { queue.contains(id) }
            },
            Duration::from_secs(2)
        )
        .await
    );
}

#[tokio::test]
async fn test_timeout_abandons_execution_and_requests_recycle() {
    let h = harness();
    h.executors.register(
        "stuck",
        Arc::new(ScriptedExecutor::always(
            "stuck",
            Step::Stall(Duration::from_secs(30)),
        )),
    );
    let runner = runner(&h).with_retry_policy(fast_retry(1));

    let job = submit(
        &h,
        JobBuilder::new("stuck")
            .with_max_attempts(1)
            .with_timeout(Duration::from_millis(50))
            .build(),
    )
    .await;

    let started = Instant::now();
    let report = runner.run(job.clone(), "worker-1").await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(report.timed_out);
    assert_eq!(report.outcome, RunOutcome::Failed);

    let stored = h.registry.get(job.id).unwrap();
    assert_eq!(stored.status, JobStatus::Failed);
    assert!(stored.last_error.unwrap().contains("50ms"));
}

#[tokio::test]
async fn test_cancel_running_job_signals_executor() {
    let h = harness();
    h.executors.register(
        "long",
        Arc::new(ScriptedExecutor::always(
            "long",
            Step::Sleep(Duration::from_secs(30)),
        )),
    );
    let runner = Arc::new(runner(&h));

    let job = submit(&h, JobBuilder::new("long").build()).await;
    let handle = {
        let runner = runner.clone();
        let job = job.clone();
        tokio::spawn(async move { runner.run(job, "worker-1").await })
    };

    let registry = h.registry.clone();
    let id = job.id;
    assert!(
        TestEnv::wait_for(
            move || {
                let registry = registry.clone();
                async move {
                    registry
                        .get(id)
                        .is_some_and(|j| j.status == JobStatus::Running && j.attempt_count == 1)
                }
            },
            Duration::from_secs(2)
        )
        .await
    );

    assert_eq!(
        h.registry.request_cancel(job.id).unwrap(),
        CancelRequest::Signalled
    );
    let report = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(h.registry.get(job.id).unwrap().status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_cancel_flag_before_dispatch_skips_executor() {
    let h = harness();
    let executor = ScriptedExecutor::always_ok("render").shared();
    h.executors.register("render", executor.clone());
    let runner = runner(&h);

    let job = submit(&h, JobBuilder::new("render").build()).await;
    assert_eq!(
        h.registry.request_cancel(job.id).unwrap(),
        CancelRequest::Flagged
    );

    let report = runner.run(job.clone(), "worker-1").await;
    assert_eq!(report.outcome, RunOutcome::Cancelled);
    assert_eq!(executor.call_count(), 0);
    assert_eq!(h.registry.get(job.id).unwrap().status, JobStatus::Cancelled);
}
