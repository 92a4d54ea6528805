//! 单个任务的执行流程
//!
//! 取到任务后依次：登记为Running → 解析执行器 → 检查熔断器 → 消耗一次尝试 →
//! 在超时内调用执行器 → 分类结果并更新任务。执行器在独立的task中运行，
//! 超时只会触发取消令牌并放弃等待，不会强行终止执行器。

use std::sync::Arc;
use std::time::Duration;

use jobforge_core::config::OpenCircuitAction;
use jobforge_core::{CircuitBreaker, CircuitState, SchedulerError};
use jobforge_domain::{
    ExecutionContext, Job, JobId, MetricEvent, MetricEventType, RetryPolicy,
};
use jobforge_infrastructure::job_registry::{Dispatch, JobRegistry};
use jobforge_infrastructure::observability::MetricsRecorder;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::requeue::Requeuer;
use crate::executor_registry::ExecutorRegistry;

/// 一次执行的最终去向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    /// 已回到Pending，等待延迟后重试
    Retrying,
    Failed,
    Cancelled,
    /// 熔断器打开，按配置直接失败
    CircuitRejected,
    /// 熔断器打开，冷却后重新入队，不消耗尝试次数
    CircuitRequeued,
    /// 任务已不在可执行状态
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    pub outcome: RunOutcome,
    /// 执行超时，Worker需要回收
    pub timed_out: bool,
}

impl RunReport {
    fn new(outcome: RunOutcome) -> Self {
        Self {
            outcome,
            timed_out: false,
        }
    }
}

enum FailureDecision {
    Retry,
    Fail,
    Cancel,
}

pub struct JobRunner {
    registry: Arc<JobRegistry>,
    executors: Arc<ExecutorRegistry>,
    requeuer: Arc<Requeuer>,
    breaker: Arc<CircuitBreaker>,
    retry_policy: RetryPolicy,
    recorder: Option<MetricsRecorder>,
    job_timeout: Duration,
    open_circuit_action: OpenCircuitAction,
}

impl JobRunner {
    pub fn new(
        registry: Arc<JobRegistry>,
        executors: Arc<ExecutorRegistry>,
        requeuer: Arc<Requeuer>,
    ) -> Self {
        Self {
            registry,
            executors,
            requeuer,
            breaker: Arc::new(CircuitBreaker::default()),
            retry_policy: RetryPolicy::default(),
            recorder: None,
            job_timeout: Duration::from_secs(300),
            open_circuit_action: OpenCircuitAction::Reject,
        }
    }

    pub fn with_circuit_breaker(mut self, breaker: Arc<CircuitBreaker>) -> Self {
        self.breaker = breaker;
        self
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn with_recorder(mut self, recorder: MetricsRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_job_timeout(mut self, job_timeout: Duration) -> Self {
        self.job_timeout = job_timeout;
        self
    }

    pub fn with_open_circuit_action(mut self, action: OpenCircuitAction) -> Self {
        self.open_circuit_action = action;
        self
    }

    pub fn circuit_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    fn emit(&self, event: MetricEvent) {
        if let Some(recorder) = &self.recorder {
            recorder.record(event);
        }
    }

    fn emit_for(&self, event_type: MetricEventType, job: &Job) {
        self.emit(MetricEvent::for_job(event_type, job));
    }

    /// 执行一个刚从队列取出的任务
    pub async fn run(&self, job: Job, worker_id: &str) -> RunReport {
        let job_id = job.id;
        let token = CancellationToken::new();

        let job = match self.registry.begin_dispatch(job_id, token.clone()).await {
            Ok(Dispatch::Run(job)) => job,
            Ok(Dispatch::Cancelled(job)) => {
                info!("任务 {} 在执行前已被取消", job_id);
                self.emit_for(MetricEventType::JobCancelled, &job);
                return RunReport::new(RunOutcome::Cancelled);
            }
            Err(e) => {
                warn!("任务 {} 无法开始执行: {}", job_id, e);
                return RunReport::new(RunOutcome::Skipped);
            }
        };

        let executor = match self.executors.resolve(&job.job_type) {
            Ok(executor) => executor,
            Err(e) => {
                error!("任务 {} 没有可用的执行器: {}", job_id, e);
                return self.finish_failed(job_id, e).await;
            }
        };

        let permit = match self.breaker.try_acquire(&job.job_type) {
            Ok(permit) => permit,
            Err(e) => return self.handle_open_circuit(&job, e).await,
        };

        let job = match self
            .registry
            .update(job_id, |tracked| tracked.job.begin_attempt())
            .await
        {
            Ok((job, _)) => job,
            Err(e) => {
                warn!("任务 {} 无法开始第一次尝试: {}", job_id, e);
                return RunReport::new(RunOutcome::Skipped);
            }
        };

        let timeout = job.effective_timeout(self.job_timeout);
        let ctx = ExecutionContext::for_job(&job, worker_id, timeout, token.clone());
        self.emit(
            MetricEvent::for_job(MetricEventType::JobStarted, &job).with_field("worker_id", worker_id),
        );
        debug!(
            "Worker {} 开始执行任务 {} (第{}/{}次尝试, 超时 {:?})",
            worker_id, job_id, job.attempt_count, job.max_attempts, timeout
        );

        let mut handle = tokio::spawn(async move { executor.execute(ctx).await });
        let (result, timed_out) = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(result)) => (result, false),
            Ok(Err(join_error)) => (
                Err(SchedulerError::internal_failure(format!("执行器异常退出: {join_error}"))),
                false,
            ),
            Err(_) => {
                // 放弃等待，执行器通过取消令牌自行退出
                token.cancel();
                warn!("任务 {} 执行超时 ({:?})，放弃等待", job_id, timeout);
                (
                    Err(SchedulerError::ExecutionTimeout {
                        timeout_ms: timeout.as_millis() as u64,
                    }),
                    true,
                )
            }
        };

        let mut report = match result {
            Ok(value) => {
                permit.record_success();
                self.finish_completed(job_id, value).await
            }
            Err(error) => {
                if self.registry.is_cancel_requested(job_id) {
                    // 取消导致的失败不计入熔断器
                    drop(permit);
                } else if let Some(transition) = permit.record_failure() {
                    if transition.to == CircuitState::Open {
                        self.emit(
                            MetricEvent::new(MetricEventType::CircuitOpened)
                                .with_field("job_type", transition.operation_class.as_str())
                                .with_field("from", transition.from.to_string()),
                        );
                    }
                }
                if timed_out {
                    self.emit_for(MetricEventType::JobTimedOut, &job);
                }
                self.finish_with_error(job_id, error).await
            }
        };
        report.timed_out = timed_out;
        report
    }

    async fn finish_completed(&self, job_id: JobId, value: serde_json::Value) -> RunReport {
        match self
            .registry
            .update(job_id, |tracked| tracked.job.complete(value))
            .await
        {
            Ok((job, _)) => {
                info!("任务完成: {}", job.entity_description());
                self.emit(MetricEvent::job_completed(&job));
                RunReport::new(RunOutcome::Completed)
            }
            Err(e) => {
                error!("记录任务 {} 完成状态失败: {}", job_id, e);
                RunReport::new(RunOutcome::Skipped)
            }
        }
    }

    async fn finish_failed(&self, job_id: JobId, error: SchedulerError) -> RunReport {
        let message = error.to_string();
        match self
            .registry
            .update(job_id, |tracked| tracked.job.fail(message))
            .await
        {
            Ok((job, _)) => {
                self.emit(
                    MetricEvent::for_job(MetricEventType::JobFailed, &job)
                        .with_field("error", error.to_string()),
                );
                RunReport::new(RunOutcome::Failed)
            }
            Err(e) => {
                error!("记录任务 {} 失败状态失败: {}", job_id, e);
                RunReport::new(RunOutcome::Skipped)
            }
        }
    }

    async fn finish_with_error(&self, job_id: JobId, error: SchedulerError) -> RunReport {
        let retry_policy = &self.retry_policy;
        let message = error.to_string();
        let decided = self
            .registry
            .update(job_id, |tracked| {
                if tracked.cancel_requested {
                    tracked.job.cancel(Some(format!("任务被取消: {message}")))?;
                    Ok(FailureDecision::Cancel)
                } else if retry_policy.should_retry(&tracked.job, &error) {
                    tracked.job.requeue(Some(message.clone()))?;
                    Ok(FailureDecision::Retry)
                } else {
                    tracked.job.fail(message.clone())?;
                    Ok(FailureDecision::Fail)
                }
            })
            .await;

        match decided {
            Ok((job, FailureDecision::Cancel)) => {
                info!("任务 {} 已取消", job_id);
                self.emit_for(MetricEventType::JobCancelled, &job);
                RunReport::new(RunOutcome::Cancelled)
            }
            Ok((job, FailureDecision::Retry)) => {
                let delay = self.retry_policy.delay_for_attempt(job.attempt_count);
                warn!(
                    "任务 {} 第{}次尝试失败，{:?} 后重试: {}",
                    job_id, job.attempt_count, delay, error
                );
                self.emit(
                    MetricEvent::for_job(MetricEventType::JobRetried, &job)
                        .with_field("delay_ms", delay.as_millis() as u64)
                        .with_field("error", error.to_string()),
                );
                self.requeuer.schedule(job_id, delay);
                RunReport::new(RunOutcome::Retrying)
            }
            Ok((job, FailureDecision::Fail)) => {
                error!(
                    "任务 {} 最终失败 (尝试 {}/{}): {}",
                    job_id, job.attempt_count, job.max_attempts, error
                );
                self.emit(
                    MetricEvent::for_job(MetricEventType::JobFailed, &job)
                        .with_field("error", error.to_string()),
                );
                RunReport::new(RunOutcome::Failed)
            }
            Err(e) => {
                error!("记录任务 {} 执行结果失败: {}", job_id, e);
                RunReport::new(RunOutcome::Skipped)
            }
        }
    }

    async fn handle_open_circuit(&self, job: &Job, error: SchedulerError) -> RunReport {
        self.emit(
            MetricEvent::for_job(MetricEventType::CircuitRejected, job)
                .with_field("action", format!("{:?}", self.open_circuit_action)),
        );

        match self.open_circuit_action {
            OpenCircuitAction::Reject => {
                warn!("熔断器打开，拒绝任务 {} ({})", job.id, job.job_type);
                let message = error.to_string();
                match self
                    .registry
                    .update(job.id, |tracked| tracked.job.fail(message))
                    .await
                {
                    Ok(_) => RunReport::new(RunOutcome::CircuitRejected),
                    Err(e) => {
                        error!("记录任务 {} 拒绝状态失败: {}", job.id, e);
                        RunReport::new(RunOutcome::Skipped)
                    }
                }
            }
            OpenCircuitAction::Requeue => {
                let delay = self
                    .breaker
                    .remaining_cool_down(&job.job_type)
                    .unwrap_or_else(|| self.breaker.config().cool_down());
                info!(
                    "熔断器打开，任务 {} 将在 {:?} 后重新入队",
                    job.id, delay
                );
                match self
                    .registry
                    .update(job.id, |tracked| tracked.job.requeue(None))
                    .await
                {
                    Ok(_) => {
                        self.requeuer.schedule(job.id, delay);
                        RunReport::new(RunOutcome::CircuitRequeued)
                    }
                    Err(e) => {
                        error!("任务 {} 重新入队失败: {}", job.id, e);
                        RunReport::new(RunOutcome::Skipped)
                    }
                }
            }
        }
    }
}
