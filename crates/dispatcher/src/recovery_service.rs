use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use jobforge_core::{SchedulerError, SchedulerResult};
use jobforge_domain::{Job, JobId, JobStatus, JobStore};
use jobforge_infrastructure::job_queue::JobQueue;
use jobforge_infrastructure::job_registry::JobRegistry;
use jobforge_worker::Requeuer;
use serde::Serialize;
use tracing::{debug, error, info, warn};

/// 启动恢复报告
#[derive(Debug, Clone, Default, Serialize)]
pub struct RecoveryReport {
    /// 从存储装载的记录数（不含已在注册表中的任务）
    pub loaded: usize,
    /// 重新放回队列的Pending任务
    pub requeued: Vec<JobId>,
    /// 中断后回到Pending的Running任务
    pub interrupted: Vec<JobId>,
    /// 中断时已耗尽尝试次数而失败的任务
    pub failed: Vec<JobId>,
    /// 原样装载的终态任务数
    pub terminal: usize,
    pub recovery_duration_ms: u64,
    pub errors: Vec<String>,
}

/// 恢复服务接口
#[async_trait]
pub trait RecoveryService: Send + Sync {
    /// 系统启动时恢复任务状态
    async fn recover_system_state(&self) -> SchedulerResult<RecoveryReport>;
}

/// 从任务存储恢复：Pending重新入队，Running按可重试失败处理（至多一次）
pub struct SystemRecoveryService {
    store: Arc<dyn JobStore>,
    registry: Arc<JobRegistry>,
    queue: Arc<JobQueue>,
    requeuer: Arc<Requeuer>,
}

impl SystemRecoveryService {
    pub fn new(
        store: Arc<dyn JobStore>,
        registry: Arc<JobRegistry>,
        queue: Arc<JobQueue>,
        requeuer: Arc<Requeuer>,
    ) -> Self {
        Self {
            store,
            registry,
            queue,
            requeuer,
        }
    }

    /// 放回队列；队列已满时交给延迟入队任务
    fn enqueue(&self, job: Job) {
        let job_id = job.id;
        match self.queue.push(job) {
            Ok(entry) => debug!("恢复的任务 {} 已入队 (sequence: {})", job_id, entry.sequence),
            Err(SchedulerError::QueueFull { capacity }) => {
                warn!(
                    "队列已满 (容量: {})，恢复的任务 {} 改为延迟入队",
                    capacity, job_id
                );
                self.requeuer.schedule(job_id, std::time::Duration::ZERO);
            }
            Err(e) => warn!("恢复的任务 {} 入队失败: {}", job_id, e),
        }
    }

    async fn recover_interrupted(&self, job_id: JobId, report: &mut RecoveryReport) {
        match self
            .registry
            .update(job_id, |tracked| tracked.job.recover_interrupted())
            .await
        {
            Ok((job, true)) => {
                info!(
                    "任务 {} 执行被中断，回到Pending (已尝试 {}/{})",
                    job_id, job.attempt_count, job.max_attempts
                );
                report.interrupted.push(job_id);
                self.enqueue(job);
            }
            Ok((job, false)) => {
                warn!(
                    "任务 {} 执行被中断且尝试次数已用尽 ({}/{})，标记为失败",
                    job_id, job.attempt_count, job.max_attempts
                );
                report.failed.push(job_id);
            }
            Err(e) => {
                error!("恢复中断任务 {} 失败: {}", job_id, e);
                report.errors.push(format!("{job_id}: {e}"));
            }
        }
    }
}

#[async_trait]
impl RecoveryService for SystemRecoveryService {
    async fn recover_system_state(&self) -> SchedulerResult<RecoveryReport> {
        let started = Instant::now();
        info!("开始恢复任务状态");

        let mut jobs = self.store.load_all().await?;
        jobs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));

        let mut report = RecoveryReport::default();
        for job in jobs {
            // 进程内已登记的任务以注册表为准
            if self.registry.contains(job.id) {
                continue;
            }
            report.loaded += 1;
            let job_id = job.id;
            let status = job.status;
            self.registry.restore(job.clone());

            match status {
                JobStatus::Pending => {
                    report.requeued.push(job_id);
                    self.enqueue(job);
                }
                JobStatus::Running => self.recover_interrupted(job_id, &mut report).await,
                _ => report.terminal += 1,
            }
        }

        report.recovery_duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "任务状态恢复完成: 装载 {} 个, 重新入队 {} 个, 中断恢复 {} 个, 失败 {} 个, 耗时 {}ms",
            report.loaded,
            report.requeued.len(),
            report.interrupted.len(),
            report.failed.len(),
            report.recovery_duration_ms
        );
        if !report.errors.is_empty() {
            warn!("恢复过程中出现 {} 个错误", report.errors.len());
        }
        Ok(report)
    }
}
