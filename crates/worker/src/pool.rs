//! Worker池
//!
//! 每个Worker是一个独立的tokio task：带超时地从队列取任务，交给 [`JobRunner`] 执行。
//! 缩容时被选中的Worker进入Draining，执行完手上的任务后退出；
//! 任务超时后Worker换一个新身份继续工作，被放弃的执行留在后台自行结束。

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::future::join_all;
use jobforge_core::config::SchedulerConfig;
use jobforge_domain::{MetricEvent, MetricEventType, WorkerRecord, WorkerStatus};
use jobforge_infrastructure::job_queue::JobQueue;
use jobforge_infrastructure::observability::MetricsRecorder;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::components::{JobRunner, RunOutcome};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub min_workers: usize,
    pub max_workers: usize,
    pub poll_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 1,
            max_workers: 8,
            poll_interval: Duration::from_millis(500),
        }
    }
}

impl From<&SchedulerConfig> for PoolConfig {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            min_workers: config.min_workers,
            max_workers: config.max_workers,
            poll_interval: config.poll_interval(),
        }
    }
}

impl PoolConfig {
    pub fn clamp(&self, workers: usize) -> usize {
        workers.clamp(self.min_workers, self.max_workers.max(self.min_workers))
    }
}

/// 关闭结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    /// 在超时内正常退出的Worker数
    pub joined: usize,
    /// 超时后被中止的Worker数
    pub aborted: usize,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.aborted == 0
    }
}

struct WorkerHandle {
    slot: u64,
    stop: CancellationToken,
    handle: JoinHandle<()>,
}

struct PoolShared {
    queue: Arc<JobQueue>,
    runner: Arc<JobRunner>,
    records: Mutex<HashMap<String, WorkerRecord>>,
    shutdown: CancellationToken,
    poll_interval: Duration,
    host: String,
    next_worker_id: AtomicU64,
}

impl PoolShared {
    fn records(&self) -> MutexGuard<'_, HashMap<String, WorkerRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn new_worker_id(&self) -> String {
        let n = self.next_worker_id.fetch_add(1, Ordering::SeqCst) + 1;
        format!("{}-worker-{}", self.host, n)
    }

    fn with_record(&self, worker_id: &str, f: impl FnOnce(&mut WorkerRecord)) {
        if let Some(record) = self.records().get_mut(worker_id) {
            f(record);
            record.heartbeat();
        }
    }
}

pub struct WorkerPool {
    config: PoolConfig,
    shared: Arc<PoolShared>,
    recorder: Option<MetricsRecorder>,
    workers: tokio::sync::Mutex<Vec<WorkerHandle>>,
    draining: tokio::sync::Mutex<Vec<WorkerHandle>>,
    active: AtomicUsize,
    next_slot: AtomicU64,
}

impl WorkerPool {
    pub fn new(
        config: PoolConfig,
        queue: Arc<JobQueue>,
        runner: Arc<JobRunner>,
        shutdown: CancellationToken,
    ) -> Self {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());
        let poll_interval = config.poll_interval;
        Self {
            config,
            shared: Arc::new(PoolShared {
                queue,
                runner,
                records: Mutex::new(HashMap::new()),
                shutdown,
                poll_interval,
                host,
                next_worker_id: AtomicU64::new(0),
            }),
            recorder: None,
            workers: tokio::sync::Mutex::new(Vec::new()),
            draining: tokio::sync::Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            next_slot: AtomicU64::new(0),
        }
    }

    /// 扩缩容时发出WorkersScaled事件
    pub fn with_recorder(mut self, recorder: MetricsRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// 当前目标Worker数（不含Draining）
    pub fn size(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// 正在执行任务的Worker数
    pub fn busy_workers(&self) -> usize {
        self.shared
            .records()
            .values()
            .filter(|r| r.status == WorkerStatus::Busy)
            .count()
    }

    pub fn worker_records(&self) -> Vec<WorkerRecord> {
        let mut records: Vec<WorkerRecord> = self.shared.records().values().cloned().collect();
        records.sort_by(|a, b| a.worker_id.cmp(&b.worker_id));
        records
    }

    /// 启动到 `min_workers`
    pub async fn start(&self) -> usize {
        self.scale_to(self.config.min_workers).await
    }

    /// 调整Worker数，目标值被限制在 `[min_workers, max_workers]`
    pub async fn scale_to(&self, target: usize) -> usize {
        if self.shared.shutdown.is_cancelled() {
            return self.size();
        }
        let target = self.config.clamp(target);
        let mut workers = self.workers.lock().await;
        let from = workers.len();

        if target > from {
            for _ in from..target {
                workers.push(self.spawn_worker());
            }
        } else if target < from {
            let mut draining = self.draining.lock().await;
            draining.retain(|w| !w.handle.is_finished());
            for worker in workers.drain(target..) {
                worker.stop.cancel();
                debug!("Worker槽位 {} 进入排空", worker.slot);
                draining.push(worker);
            }
        }

        self.active.store(workers.len(), Ordering::SeqCst);
        if target != from {
            info!("Worker池规模: {} -> {}", from, target);
            if let Some(recorder) = &self.recorder {
                recorder.record(
                    MetricEvent::new(MetricEventType::WorkersScaled)
                        .with_field("from", from as u64)
                        .with_field("to", target as u64),
                );
            }
        }
        target
    }

    fn spawn_worker(&self) -> WorkerHandle {
        let slot = self.next_slot.fetch_add(1, Ordering::SeqCst);
        let stop = self.shared.shutdown.child_token();
        let shared = self.shared.clone();
        let worker_stop = stop.clone();
        let handle = tokio::spawn(async move {
            worker_loop(shared, worker_stop).await;
        });
        WorkerHandle { slot, stop, handle }
    }

    /// 停止所有Worker，最多等待 `timeout`，超时的Worker被中止。
    ///
    /// 被中止Worker上的任务保持Running，下次启动时按中断处理。
    pub async fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        self.shared.shutdown.cancel();
        let mut handles: Vec<WorkerHandle> = self.workers.lock().await.drain(..).collect();
        handles.extend(self.draining.lock().await.drain(..));
        self.active.store(0, Ordering::SeqCst);

        let total = handles.len();
        info!("关闭Worker池: {} 个Worker，超时 {:?}", total, timeout);

        let mut join_handles: Vec<JoinHandle<()>> = handles.into_iter().map(|w| w.handle).collect();
        let joined = tokio::time::timeout(timeout, join_all(join_handles.iter_mut()))
            .await
            .is_ok();

        let mut report = ShutdownReport::default();
        for handle in join_handles {
            if handle.is_finished() {
                report.joined += 1;
            } else {
                handle.abort();
                report.aborted += 1;
            }
        }
        if !joined {
            warn!("{} 个Worker未能在 {:?} 内退出，已中止", report.aborted, timeout);
        }

        for record in self.shared.records().values_mut() {
            record.status = WorkerStatus::Stopped;
        }
        info!("Worker池已关闭 (正常退出: {}, 中止: {})", report.joined, report.aborted);
        report
    }
}

async fn worker_loop(shared: Arc<PoolShared>, stop: CancellationToken) {
    let mut worker_id = register_worker(&shared);
    info!("Worker {} 已启动", worker_id);

    loop {
        let job = tokio::select! {
            biased;
            _ = stop.cancelled() => break,
            job = shared.queue.pop_timeout(shared.poll_interval) => job,
        };

        let Some(job) = job else {
            shared.with_record(&worker_id, |_| {});
            continue;
        };

        let job_id = job.id;
        shared.with_record(&worker_id, |record| {
            record.status = WorkerStatus::Busy;
            record.current_job_id = Some(job_id);
        });

        let report = shared.runner.run(job, &worker_id).await;

        let draining = stop.is_cancelled();
        shared.with_record(&worker_id, |record| {
            match report.outcome {
                RunOutcome::Completed => record.jobs_completed += 1,
                RunOutcome::Failed | RunOutcome::CircuitRejected => record.jobs_failed += 1,
                _ => {}
            }
            record.current_job_id = None;
            record.status = if draining {
                WorkerStatus::Draining
            } else {
                WorkerStatus::Idle
            };
        });

        if report.timed_out && !draining {
            let replacement = register_worker(&shared);
            warn!("Worker {} 执行超时，回收为 {}", worker_id, replacement);
            shared.records().remove(&worker_id);
            worker_id = replacement;
        }
    }

    shared.records().remove(&worker_id);
    info!("Worker {} 已退出", worker_id);
}

fn register_worker(shared: &PoolShared) -> String {
    let worker_id = shared.new_worker_id();
    shared
        .records()
        .insert(worker_id.clone(), WorkerRecord::new(worker_id.clone()));
    worker_id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp() {
        let config = PoolConfig {
            min_workers: 2,
            max_workers: 6,
            poll_interval: Duration::from_millis(10),
        };
        assert_eq!(config.clamp(0), 2);
        assert_eq!(config.clamp(4), 4);
        assert_eq!(config.clamp(100), 6);
    }
}
