//! 调度器
//!
//! 对外的管理入口：提交、查询、取消、列表与统计，并负责组件的启动与有界关闭。
//! 所有组件在构造时注入，[`SchedulerBuilder`] 按配置装配默认实现。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use jobforge_core::config::AppConfig;
use jobforge_core::{CircuitBreaker, CircuitState, SchedulerError, SchedulerResult};
use jobforge_domain::{
    Job, JobExecutor, JobFilter, JobId, JobSpec, JobStatus, JobStore, MetricEvent,
    MetricEventType, RetryPolicy, UsageSampler, WorkloadProbe,
};
use jobforge_infrastructure::database::create_job_store;
use jobforge_infrastructure::job_queue::{JobQueue, JobQueueConfig};
use jobforge_infrastructure::job_registry::{CancelRequest, JobRegistry};
use jobforge_infrastructure::observability::{MetricsPipeline, MetricsRecorder, MetricsReport};
use jobforge_infrastructure::resource_monitor::{ResourceMonitor, SysinfoSampler};
use jobforge_worker::{ExecutorRegistry, JobRunner, PoolConfig, Requeuer, ShutdownReport, WorkerPool};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::autoscaler::Autoscaler;
use crate::recovery_service::{RecoveryReport, RecoveryService, SystemRecoveryService};
use crate::retention::RetentionSweeper;
use crate::workload::SchedulerWorkload;

/// 调度统计，只在任务状态变化时改变
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStats {
    /// 每秒完成的任务数
    pub throughput: f64,
    pub avg_latency_ms: f64,
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
    pub queue_depth: usize,
    pub workers_active: usize,
    pub workers_busy: usize,
    pub dropped_events: u64,
    pub circuits: BTreeMap<String, CircuitState>,
}

pub struct SchedulerBuilder {
    config: AppConfig,
    store: Option<Arc<dyn JobStore>>,
    executors: Arc<ExecutorRegistry>,
    sampler: Option<Arc<dyn UsageSampler>>,
}

impl SchedulerBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            store: None,
            executors: Arc::new(ExecutorRegistry::new()),
            sampler: None,
        }
    }

    /// 未指定时按 `persistence` 配置创建
    pub fn with_store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_executors(mut self, executors: Arc<ExecutorRegistry>) -> Self {
        self.executors = executors;
        self
    }

    pub fn with_executor(self, job_type: impl Into<String>, executor: Arc<dyn JobExecutor>) -> Self {
        self.executors.register(job_type, executor);
        self
    }

    pub fn with_default_executor(self, executor: Arc<dyn JobExecutor>) -> Self {
        self.executors.set_default(executor);
        self
    }

    /// 未指定时使用sysinfo采样
    pub fn with_usage_sampler(mut self, sampler: Arc<dyn UsageSampler>) -> Self {
        self.sampler = Some(sampler);
        self
    }

    pub async fn build(self) -> SchedulerResult<Scheduler> {
        let config = self.config;
        config.validate()?;

        let store = match self.store {
            Some(store) => store,
            None => create_job_store(&config.persistence).await?,
        };
        let sampler = self
            .sampler
            .unwrap_or_else(|| Arc::new(SysinfoSampler::new()) as Arc<dyn UsageSampler>);

        let shutdown = CancellationToken::new();
        let queue = Arc::new(JobQueue::new(JobQueueConfig::from(&config.scheduler)));
        let registry = Arc::new(JobRegistry::new(store));
        let pipeline = Arc::new(MetricsPipeline::new(config.metrics.clone()));
        let recorder = pipeline.recorder();

        // 队列满时的退避取重试间隔上限
        let requeuer = Arc::new(
            Requeuer::new(
                queue.clone(),
                registry.clone(),
                Duration::from_millis(config.retry.max_delay_ms),
                shutdown.clone(),
            )
            .with_recorder(recorder.clone()),
        );
        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let runner = Arc::new(
            JobRunner::new(registry.clone(), self.executors, requeuer.clone())
                .with_circuit_breaker(breaker.clone())
                .with_retry_policy(RetryPolicy::new(config.retry.clone()))
                .with_recorder(recorder.clone())
                .with_job_timeout(config.scheduler.job_timeout())
                .with_open_circuit_action(config.scheduler.open_circuit_action),
        );
        let pool = Arc::new(
            WorkerPool::new(
                PoolConfig::from(&config.scheduler),
                queue.clone(),
                runner,
                shutdown.clone(),
            )
            .with_recorder(recorder.clone()),
        );
        let workload: Arc<dyn WorkloadProbe> =
            Arc::new(SchedulerWorkload::new(queue.clone(), pool.clone()));
        let monitor = Arc::new(
            ResourceMonitor::new(config.resource_monitor.clone(), sampler, workload.clone())
                .with_recorder(recorder.clone()),
        );

        info!(
            "调度器已装配 (策略: {}, Worker: {}-{}, 队列容量: {:?})",
            config.scheduler.policy,
            config.scheduler.min_workers,
            config.scheduler.max_workers,
            config.scheduler.max_queue_size
        );

        Ok(Scheduler {
            config,
            queue,
            registry,
            requeuer,
            breaker,
            pool,
            monitor,
            workload,
            pipeline,
            recorder,
            shutdown,
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            background: tokio::sync::Mutex::new(Vec::new()),
        })
    }
}

pub struct Scheduler {
    config: AppConfig,
    queue: Arc<JobQueue>,
    registry: Arc<JobRegistry>,
    requeuer: Arc<Requeuer>,
    breaker: Arc<CircuitBreaker>,
    pool: Arc<WorkerPool>,
    monitor: Arc<ResourceMonitor>,
    workload: Arc<dyn WorkloadProbe>,
    pipeline: Arc<MetricsPipeline>,
    recorder: MetricsRecorder,
    shutdown: CancellationToken,
    started: AtomicBool,
    stopping: AtomicBool,
    background: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn builder(config: AppConfig) -> SchedulerBuilder {
        SchedulerBuilder::new(config)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn monitor(&self) -> &Arc<ResourceMonitor> {
        &self.monitor
    }

    pub fn is_running(&self) -> bool {
        self.started.load(Ordering::SeqCst) && !self.stopping.load(Ordering::SeqCst)
    }

    /// 提交任务，持久化成功后返回任务ID
    pub async fn submit(&self, spec: JobSpec) -> SchedulerResult<JobId> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShuttingDown);
        }
        spec.validate()?;

        if let Some(capacity) = self.queue.capacity() {
            if self.queue.len() >= capacity {
                warn!("队列已满 (容量: {})，拒绝提交 {} 任务", capacity, spec.job_type);
                return Err(SchedulerError::QueueFull { capacity });
            }
        }

        let job = Job::from_spec(spec, self.config.retry.max_attempts);
        let job = self.registry.register(job).await?;

        if let Err(e) = self.queue.push(job.clone()) {
            // 检查容量与入队之间被并发提交占满
            warn!("任务 {} 入队失败，撤销提交: {}", job.id, e);
            if let Err(discard_error) = self.registry.discard(job.id).await {
                warn!("撤销任务 {} 失败: {}", job.id, discard_error);
            }
            return Err(e);
        }

        self.recorder
            .record(MetricEvent::for_job(MetricEventType::JobSubmitted, &job));
        info!("任务已提交: {}", job.entity_description());
        Ok(job.id)
    }

    pub fn status(&self, job_id: JobId) -> SchedulerResult<Job> {
        self.registry
            .get(job_id)
            .ok_or_else(|| SchedulerError::not_found(job_id))
    }

    /// 取消任务。
    ///
    /// 队列中的任务立即变为Cancelled；已被取出或等待重试的任务打上取消标记，
    /// 由取到它的一方终结；Running任务触发取消令牌，最终状态取决于执行器。
    /// 终态任务返回 `false`。
    pub async fn cancel(&self, job_id: JobId) -> SchedulerResult<bool> {
        let job = self.status(job_id)?;
        if job.is_terminal() {
            return Ok(false);
        }

        if job.status == JobStatus::Pending && self.queue.remove(job_id).is_ok() {
            let job = self.registry.cancel_pending(job_id).await?;
            self.recorder
                .record(MetricEvent::for_job(MetricEventType::JobCancelled, &job));
            info!("任务 {} 已从队列移除并取消", job_id);
            return Ok(true);
        }

        match self.registry.request_cancel(job_id)? {
            CancelRequest::AlreadyTerminal => Ok(false),
            CancelRequest::Flagged => {
                debug!("任务 {} 不在队列中，已标记取消", job_id);
                Ok(true)
            }
            CancelRequest::Signalled => {
                info!("任务 {} 正在运行，已发送取消信号", job_id);
                Ok(true)
            }
        }
    }

    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        self.registry.list(filter)
    }

    pub fn stats(&self) -> SchedulerStats {
        let counters = self.registry.counters();
        let circuits = self
            .breaker
            .snapshots()
            .into_iter()
            .map(|snapshot| (snapshot.operation_class, snapshot.state))
            .collect();

        SchedulerStats {
            throughput: counters.throughput(),
            avg_latency_ms: counters.avg_latency_ms(),
            submitted: counters.submitted,
            completed: counters.completed,
            failed: counters.failed,
            cancelled: counters.cancelled,
            retried: counters.retried,
            queue_depth: self.queue.len(),
            workers_active: self.pool.size(),
            workers_busy: self.pool.busy_workers(),
            dropped_events: self.recorder.dropped(),
            circuits,
        }
    }

    pub fn metrics_report(&self) -> MetricsReport {
        self.pipeline.report()
    }

    /// 恢复存储中的任务并启动所有后台组件
    pub async fn start(&self) -> SchedulerResult<RecoveryReport> {
        if self.stopping.load(Ordering::SeqCst) {
            return Err(SchedulerError::ShuttingDown);
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::Internal("调度器已经启动".to_string()));
        }

        self.pipeline.start().await;

        let recovery = SystemRecoveryService::new(
            self.registry.store().clone(),
            self.registry.clone(),
            self.queue.clone(),
            self.requeuer.clone(),
        );
        let report = recovery.recover_system_state().await?;

        if self.config.resource_monitor.enabled {
            self.monitor.start().await;
        }
        let workers = self.pool.start().await;

        let mut background = self.background.lock().await;
        if self.config.autoscale.enabled {
            let autoscaler = Autoscaler::new(
                self.config.autoscale.clone(),
                self.config.scheduler.min_workers,
                self.config.scheduler.max_workers,
            );
            background.push(autoscaler.spawn(
                self.pool.clone(),
                self.monitor.clone(),
                self.workload.clone(),
                self.shutdown.child_token(),
            ));
        }
        background.push(
            RetentionSweeper::from_config(self.registry.clone(), &self.config.scheduler)
                .spawn(self.shutdown.child_token()),
        );
        background.push(spawn_report_loop(
            self.pipeline.clone(),
            Duration::from_millis(self.config.metrics.report_interval_ms.max(1)),
            self.shutdown.child_token(),
        ));

        info!("调度器已启动 ({} 个Worker)", workers);
        Ok(report)
    }

    /// 在 `scheduler.shutdown_timeout_ms` 内关闭
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutdown_with_timeout(self.config.scheduler.shutdown_timeout())
            .await
    }

    /// 停止接收任务，全部组件共享 `timeout` 内的同一个截止时间。
    ///
    /// Worker先退出，后台循环、资源监控与指标管道只能使用剩余的时间，
    /// 超时的组件被中止。未完成的任务保持Pending或Running留在存储中，下次启动时恢复。
    pub async fn shutdown_with_timeout(&self, timeout: Duration) -> ShutdownReport {
        if self.stopping.swap(true, Ordering::SeqCst) {
            debug!("调度器已在关闭中");
            return ShutdownReport::default();
        }
        let deadline = Instant::now() + timeout;
        info!("开始关闭调度器 (超时: {:?})", timeout);

        self.shutdown.cancel();
        let report = self.pool.shutdown(remaining(deadline)).await;

        let mut handles: Vec<JoinHandle<()>> = self.background.lock().await.drain(..).collect();
        if tokio::time::timeout_at(deadline, join_all(handles.iter_mut()))
            .await
            .is_err()
        {
            warn!("后台任务未能在关闭截止时间前退出，已中止");
            for handle in &handles {
                handle.abort();
            }
        }

        match tokio::time::timeout_at(deadline, self.registry.flush_dirty()).await {
            Ok(0) => {}
            Ok(left) => warn!("{} 个任务的最新状态未能持久化", left),
            Err(_) => warn!("补写脏记录超时，剩余 {} 个", self.registry.dirty_count()),
        }
        self.monitor.stop_within(remaining(deadline)).await;
        self.pipeline.stop_within(remaining(deadline)).await;
        log_report(&self.pipeline.report());

        info!(
            "调度器已关闭 (Worker正常退出: {}, 中止: {}, 等待重新入队: {})",
            report.joined,
            report.aborted,
            self.requeuer.pending()
        );
        report
    }
}

fn remaining(deadline: Instant) -> Duration {
    deadline.saturating_duration_since(Instant::now())
}

fn spawn_report_loop(
    pipeline: Arc<MetricsPipeline>,
    interval: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => log_report(&pipeline.report()),
            }
        }
    })
}

fn log_report(report: &MetricsReport) {
    info!(
        events = report.events_recorded,
        dropped = report.events_dropped,
        queue_depth = report.queue_depth,
        ema_latency_ms = report.ema_latency_ms.unwrap_or_default(),
        "指标报告"
    );
    for diagnostic in &report.diagnostics {
        warn!("{} 建议: {}", diagnostic.message, diagnostic.recommendation);
    }
}
