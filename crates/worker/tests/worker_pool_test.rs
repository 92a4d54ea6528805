use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use jobforge_core::config::SchedulingPolicyKind;
use jobforge_domain::{JobStatus, JobStore, WorkerStatus};
use jobforge_infrastructure::database::InMemoryJobStore;
use jobforge_infrastructure::job_queue::{JobQueue, JobQueueConfig};
use jobforge_infrastructure::job_registry::JobRegistry;
use jobforge_testing_utils::{JobBuilder, ScriptedExecutor, Step, TestEnv};
use jobforge_worker::{ExecutorRegistry, JobRunner, PoolConfig, Requeuer, WorkerPool};
use tokio_util::sync::CancellationToken;

struct Fixture {
    queue: Arc<JobQueue>,
    registry: Arc<JobRegistry>,
    pool: WorkerPool,
}

fn fixture(executor: Arc<ScriptedExecutor>, min_workers: usize, max_workers: usize) -> Fixture {
    let queue = Arc::new(JobQueue::new(JobQueueConfig {
        policy: SchedulingPolicyKind::Fifo,
        ..Default::default()
    }));
    let store: Arc<dyn JobStore> = Arc::new(InMemoryJobStore::new());
    let registry = Arc::new(JobRegistry::new(store));
    let shutdown = CancellationToken::new();
    let executors = Arc::new(ExecutorRegistry::new());
    executors.set_default(executor);
    let requeuer = Arc::new(Requeuer::new(
        queue.clone(),
        registry.clone(),
        Duration::from_millis(50),
        shutdown.clone(),
    ));
    let runner = Arc::new(
        JobRunner::new(registry.clone(), executors, requeuer)
            .with_job_timeout(Duration::from_secs(5)),
    );
    let pool = WorkerPool::new(
        PoolConfig {
            min_workers,
            max_workers,
            poll_interval: Duration::from_millis(20),
        },
        queue.clone(),
        runner,
        shutdown,
    );
    Fixture {
        queue,
        registry,
        pool,
    }
}

async fn enqueue(f: &Fixture, count: usize) -> Vec<jobforge_domain::JobId> {
    let mut ids = Vec::new();
    for _ in 0..count {
        let job = f
            .registry
            .register(JobBuilder::new("batch").build())
            .await
            .unwrap();
        f.queue.push(job.clone()).unwrap();
        ids.push(job.id);
    }
    ids
}

#[tokio::test]
async fn test_pool_processes_every_job_exactly_once() {
    let executor = ScriptedExecutor::always("batch", Step::Sleep(Duration::from_millis(5))).shared();
    let f = fixture(executor.clone(), 4, 4);
    assert_eq!(f.pool.start().await, 4);

    let ids = enqueue(&f, 40).await;
    let registry = f.registry.clone();
    let expected = ids.clone();
    let all_done = TestEnv::wait_for(
        move || {
            let registry = registry.clone();
            let expected = expected.clone();
            async move {
                expected
                    .iter()
                    .all(|id| registry.get(*id).is_some_and(|j| j.status == JobStatus::Completed))
            }
        },
        Duration::from_secs(10),
    )
    .await;
    assert!(all_done);

    let executed: Vec<_> = executor.calls().iter().map(|c| c.job_id).collect();
    assert_eq!(executed.len(), 40);
    assert_eq!(executed.iter().collect::<HashSet<_>>().len(), 40);
    assert!(executor.peak_in_flight() <= 4);

    let completed: u64 = f.pool.worker_records().iter().map(|r| r.jobs_completed).sum();
    assert_eq!(completed, 40);

    assert!(f.pool.shutdown(Duration::from_secs(2)).await.is_clean());
}

#[tokio::test]
async fn test_scale_to_clamps_and_drains() {
    let executor = ScriptedExecutor::always("batch", Step::Sleep(Duration::from_millis(200))).shared();
    let f = fixture(executor.clone(), 1, 3);

    assert_eq!(f.pool.start().await, 1);
    assert_eq!(f.pool.scale_to(10).await, 3);
    assert_eq!(f.pool.size(), 3);

    let ids = enqueue(&f, 3).await;
    let exec = executor.clone();
    assert!(
        TestEnv::wait_for(
            move || {
                let exec = exec.clone();
                async move { exec.in_flight() == 3 }
            },
            Duration::from_secs(2)
        )
        .await
    );

    // 缩容不会打断正在执行的任务
    assert_eq!(f.pool.scale_to(0).await, 1);
    assert_eq!(f.pool.size(), 1);
    let registry = f.registry.clone();
    assert!(
        TestEnv::wait_for(
            move || {
                let registry = registry.clone();
                let ids = ids.clone();
                async move {
                    ids.iter()
                        .all(|id| registry.get(*id).is_some_and(|j| j.status == JobStatus::Completed))
                }
            },
            Duration::from_secs(3)
        )
        .await
    );

    assert!(f.pool.shutdown(Duration::from_secs(2)).await.is_clean());
    assert_eq!(executor.call_count(), 3);
}

#[tokio::test]
async fn test_shutdown_is_bounded_and_leaves_job_recoverable() {
    let executor = ScriptedExecutor::always("batch", Step::Stall(Duration::from_secs(60))).shared();
    let f = fixture(executor.clone(), 1, 1);
    f.pool.start().await;

    let ids = enqueue(&f, 1).await;
    let exec = executor.clone();
    assert!(
        TestEnv::wait_for(
            move || {
                let exec = exec.clone();
                async move { exec.in_flight() == 1 }
            },
            Duration::from_secs(2)
        )
        .await
    );
    assert_eq!(f.pool.busy_workers(), 1);

    let started = std::time::Instant::now();
    let report = f.pool.shutdown(Duration::from_millis(200)).await;
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(report.aborted, 1);
    assert!(f
        .pool
        .worker_records()
        .iter()
        .all(|r| r.status == WorkerStatus::Stopped));

    // 任务没有到达终态，下次启动时会被恢复
    let job = f.registry.get(ids[0]).unwrap();
    assert_eq!(job.status, JobStatus::Running);
    assert_eq!(f.pool.scale_to(3).await, 0);
}
