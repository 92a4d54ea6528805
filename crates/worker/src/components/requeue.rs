use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use jobforge_core::SchedulerError;
use jobforge_domain::{JobId, JobStatus, MetricEvent, MetricEventType};
use jobforge_infrastructure::job_queue::JobQueue;
use jobforge_infrastructure::job_registry::JobRegistry;
use jobforge_infrastructure::observability::MetricsRecorder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// 延迟重新入队
///
/// 重试、熔断冷却与启动恢复的任务都经由这里回到队列。等待期间可被关闭信号打断，
/// 此时任务保持Pending留在存储中，由下次启动恢复。
pub struct Requeuer {
    queue: Arc<JobQueue>,
    registry: Arc<JobRegistry>,
    recorder: Option<MetricsRecorder>,
    full_backoff: Duration,
    shutdown: CancellationToken,
    pending: Arc<AtomicUsize>,
}

struct PendingGuard(Arc<AtomicUsize>);

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Requeuer {
    pub fn new(
        queue: Arc<JobQueue>,
        registry: Arc<JobRegistry>,
        full_backoff: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            queue,
            registry,
            recorder: None,
            full_backoff: full_backoff.max(Duration::from_millis(10)),
            shutdown,
            pending: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_recorder(mut self, recorder: MetricsRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    /// 正在等待重新入队的任务数
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    /// 在 `delay` 之后把Pending任务放回队列
    pub fn schedule(&self, job_id: JobId, delay: Duration) {
        self.pending.fetch_add(1, Ordering::SeqCst);
        let guard = PendingGuard(self.pending.clone());
        let queue = self.queue.clone();
        let registry = self.registry.clone();
        let recorder = self.recorder.clone();
        let shutdown = self.shutdown.clone();
        let backoff = self.full_backoff;

        debug!("任务 {} 将在 {:?} 后重新入队", job_id, delay);
        tokio::spawn(async move {
            let _guard = guard;
            if !delay.is_zero() {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        debug!("关闭中，任务 {} 保持Pending", job_id);
                        return;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            loop {
                if shutdown.is_cancelled() {
                    return;
                }

                match registry.finalize_pending_cancel(job_id).await {
                    Ok(Some(job)) => {
                        info!("任务 {} 在等待重新入队时被取消", job_id);
                        if let Some(recorder) = &recorder {
                            recorder.record(MetricEvent::for_job(MetricEventType::JobCancelled, &job));
                        }
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        debug!("任务 {} 不再需要重新入队: {}", job_id, e);
                        return;
                    }
                }

                let job = match registry.get(job_id) {
                    Some(job) if job.status == JobStatus::Pending => job,
                    _ => return,
                };

                match queue.push(job) {
                    Ok(entry) => {
                        debug!("任务 {} 已重新入队 (sequence: {})", job_id, entry.sequence);
                        return;
                    }
                    Err(SchedulerError::QueueFull { capacity }) => {
                        warn!(
                            "队列已满 (容量: {})，任务 {} 将在 {:?} 后再次尝试入队",
                            capacity, job_id, backoff
                        );
                        tokio::select! {
                            _ = shutdown.cancelled() => return,
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                    Err(e) => {
                        warn!("任务 {} 重新入队失败: {}", job_id, e);
                        return;
                    }
                }
            }
        });
    }
}
