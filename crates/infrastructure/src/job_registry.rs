//! 任务注册表
//!
//! 内存中保存每个任务的最新快照，所有状态变更都经过这里并写穿到 [`JobStore`]。
//! 变更在锁内对副本执行，成功后才替换原记录；持久化在锁外进行，
//! 存储层依据revision丢弃过期写入，因此并发写穿不会让记录倒退。
//!
//! 写穿失败时有限次重试，仍失败的任务标记为脏记录，由 [`JobRegistry::flush_dirty`]
//! 补写最新快照。脏记录不会被保留期清理删除。

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobforge_core::{SchedulerError, SchedulerResult};
use jobforge_domain::{Job, JobFilter, JobId, JobStatus, JobStore};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 单次写穿的最大尝试次数
const PERSIST_ATTEMPTS: u32 = 3;
const PERSIST_RETRY_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
pub struct TrackedJob {
    pub job: Job,
    pub cancel_requested: bool,
    /// 仅在Running期间存在
    pub cancellation: Option<CancellationToken>,
}

impl TrackedJob {
    fn new(job: Job) -> Self {
        Self {
            job,
            cancel_requested: false,
            cancellation: None,
        }
    }
}

/// Worker取到任务后的调度结果
#[derive(Debug, Clone)]
pub enum Dispatch {
    /// 已转为Running，可以执行
    Run(Job),
    /// 取出前已收到取消请求，任务已终结为Cancelled
    Cancelled(Job),
}

/// 取消请求的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelRequest {
    AlreadyTerminal,
    /// Pending但不在队列中，等取到它的一方终结
    Flagged,
    /// Running，已触发取消令牌
    Signalled,
}

/// 精确的累计计数，只在任务状态变化时更新
#[derive(Debug, Clone, Default, Serialize)]
pub struct RegistryCounters {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub retried: u64,
    pub total_latency_ms: u64,
    pub first_dispatch_at: Option<DateTime<Utc>>,
    pub last_completion_at: Option<DateTime<Utc>>,
}

impl RegistryCounters {
    /// 完成数 / (最后一次完成 - 第一次派发) 秒
    pub fn throughput(&self) -> f64 {
        match (self.first_dispatch_at, self.last_completion_at) {
            (Some(first), Some(last)) if self.completed > 0 => {
                let secs = (last - first).num_milliseconds() as f64 / 1000.0;
                if secs > 0.0 {
                    self.completed as f64 / secs
                } else {
                    0.0
                }
            }
            _ => 0.0,
        }
    }

    pub fn avg_latency_ms(&self) -> f64 {
        if self.completed == 0 {
            0.0
        } else {
            self.total_latency_ms as f64 / self.completed as f64
        }
    }

    fn observe(&mut self, before: JobStatus, after: &Job) {
        if before == after.status {
            return;
        }
        match (before, after.status) {
            (JobStatus::Pending, JobStatus::Running) => {
                if let Some(started) = after.started_at {
                    self.first_dispatch_at =
                        Some(self.first_dispatch_at.map_or(started, |f| f.min(started)));
                }
            }
            (JobStatus::Running, JobStatus::Pending) => self.retried += 1,
            (_, JobStatus::Completed) => {
                self.completed += 1;
                if let Some(latency) = after.latency() {
                    self.total_latency_ms += latency.num_milliseconds().max(0) as u64;
                }
                if let Some(finished) = after.finished_at {
                    self.last_completion_at =
                        Some(self.last_completion_at.map_or(finished, |l| l.max(finished)));
                }
            }
            (_, JobStatus::Failed) => self.failed += 1,
            (_, JobStatus::Cancelled) => self.cancelled += 1,
            _ => {}
        }
    }
}

pub struct JobRegistry {
    jobs: Mutex<HashMap<JobId, TrackedJob>>,
    counters: Mutex<RegistryCounters>,
    dirty: Mutex<HashSet<JobId>>,
    store: Arc<dyn JobStore>,
}

impl JobRegistry {
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            jobs: Mutex::new(HashMap::new()),
            counters: Mutex::new(RegistryCounters::default()),
            dirty: Mutex::new(HashSet::new()),
            store,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    fn jobs(&self) -> MutexGuard<'_, HashMap<JobId, TrackedJob>> {
        self.jobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn counters_mut(&self) -> MutexGuard<'_, RegistryCounters> {
        self.counters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn dirty(&self) -> MutexGuard<'_, HashSet<JobId>> {
        self.dirty.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn persist(&self, job: &Job) {
        let mut attempt = 1;
        loop {
            match self.store.save(job).await {
                Ok(()) => {
                    self.dirty().remove(&job.id);
                    return;
                }
                Err(e) if attempt < PERSIST_ATTEMPTS => {
                    warn!(
                        "任务 {} 持久化失败，第{}次重试 (revision: {}): {}",
                        job.id, attempt, job.revision, e
                    );
                    tokio::time::sleep(PERSIST_RETRY_DELAY * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        "任务 {} 持久化失败，标记为待补写 (revision: {}, 状态: {}): {}",
                        job.id, job.revision, job.status, e
                    );
                    self.dirty().insert(job.id);
                    return;
                }
            }
        }
    }

    /// 存储中落后于内存状态的任务数
    pub fn dirty_count(&self) -> usize {
        self.dirty().len()
    }

    /// 补写所有脏记录的最新快照，返回仍未写入的数量
    pub async fn flush_dirty(&self) -> usize {
        let ids: Vec<JobId> = self.dirty().iter().copied().collect();
        if ids.is_empty() {
            return 0;
        }

        let mut flushed = 0;
        for id in ids {
            let Some(job) = self.get(id) else {
                self.dirty().remove(&id);
                continue;
            };
            match self.store.save(&job).await {
                Ok(()) => {
                    self.dirty().remove(&id);
                    flushed += 1;
                }
                Err(e) => warn!("补写任务 {} 失败: {}", id, e),
            }
        }

        let remaining = self.dirty_count();
        info!("脏记录补写完成: 成功 {} 个, 剩余 {} 个", flushed, remaining);
        remaining
    }

    /// 登记新提交的任务，持久化成功后才返回
    pub async fn register(&self, job: Job) -> SchedulerResult<Job> {
        {
            let mut jobs = self.jobs();
            if jobs.contains_key(&job.id) {
                return Err(SchedulerError::Internal(format!("任务 {} 已存在", job.id)));
            }
            jobs.insert(job.id, TrackedJob::new(job.clone()));
        }

        if let Err(e) = self.store.save(&job).await {
            self.jobs().remove(&job.id);
            return Err(e);
        }
        self.counters_mut().submitted += 1;
        debug!("任务已登记: {}", job.entity_description());
        Ok(job)
    }

    /// 撤销一次尚未确认的登记，同时删除持久化记录
    pub async fn discard(&self, id: JobId) -> SchedulerResult<()> {
        if self.jobs().remove(&id).is_none() {
            return Err(SchedulerError::not_found(id));
        }
        {
            let mut counters = self.counters_mut();
            counters.submitted = counters.submitted.saturating_sub(1);
        }
        self.store.delete(id).await?;
        Ok(())
    }

    /// 恢复时装载已持久化的记录，不写回存储
    pub fn restore(&self, job: Job) {
        self.jobs().insert(job.id, TrackedJob::new(job));
    }

    pub fn get(&self, id: JobId) -> Option<Job> {
        self.jobs().get(&id).map(|tracked| tracked.job.clone())
    }

    pub fn contains(&self, id: JobId) -> bool {
        self.jobs().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.jobs().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_cancel_requested(&self, id: JobId) -> bool {
        self.jobs()
            .get(&id)
            .is_some_and(|tracked| tracked.cancel_requested)
    }

    pub fn list(&self, filter: &JobFilter) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs()
            .values()
            .filter(|tracked| filter.matches(&tracked.job))
            .map(|tracked| tracked.job.clone())
            .collect();
        jobs.sort_by(|a, b| a.submitted_at.cmp(&b.submitted_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        jobs
    }

    pub fn status_counts(&self) -> HashMap<JobStatus, usize> {
        let mut counts = HashMap::new();
        for tracked in self.jobs().values() {
            *counts.entry(tracked.job.status).or_insert(0) += 1;
        }
        counts
    }

    pub fn counters(&self) -> RegistryCounters {
        self.counters_mut().clone()
    }

    /// 在副本上执行变更，成功后提交并写穿
    pub async fn update<R>(
        &self,
        id: JobId,
        f: impl FnOnce(&mut TrackedJob) -> SchedulerResult<R>,
    ) -> SchedulerResult<(Job, R)> {
        let (snapshot, output, before) = {
            let mut jobs = self.jobs();
            let tracked = jobs.get_mut(&id).ok_or_else(|| SchedulerError::not_found(id))?;
            let before = tracked.job.status;
            let mut draft = tracked.clone();
            let output = f(&mut draft)?;
            if draft.job.status != JobStatus::Running {
                draft.cancellation = None;
            }
            *tracked = draft;
            (tracked.job.clone(), output, before)
        };

        self.counters_mut().observe(before, &snapshot);
        self.persist(&snapshot).await;
        Ok((snapshot, output))
    }

    /// Pending → Running；若已请求取消则直接终结为Cancelled
    pub async fn begin_dispatch(
        &self,
        id: JobId,
        cancellation: CancellationToken,
    ) -> SchedulerResult<Dispatch> {
        let (job, started) = self
            .update(id, |tracked| {
                if tracked.cancel_requested {
                    tracked.job.cancel(Some("任务在执行前被取消".to_string()))?;
                    return Ok(false);
                }
                tracked.job.mark_running()?;
                tracked.cancellation = Some(cancellation);
                Ok(true)
            })
            .await?;
        Ok(if started {
            Dispatch::Run(job)
        } else {
            Dispatch::Cancelled(job)
        })
    }

    /// 标记取消请求；Running任务同时触发其取消令牌
    pub fn request_cancel(&self, id: JobId) -> SchedulerResult<CancelRequest> {
        let mut jobs = self.jobs();
        let tracked = jobs.get_mut(&id).ok_or_else(|| SchedulerError::not_found(id))?;
        match tracked.job.status {
            status if status.is_terminal() => Ok(CancelRequest::AlreadyTerminal),
            JobStatus::Running => {
                tracked.cancel_requested = true;
                if let Some(token) = &tracked.cancellation {
                    token.cancel();
                }
                Ok(CancelRequest::Signalled)
            }
            _ => {
                tracked.cancel_requested = true;
                Ok(CancelRequest::Flagged)
            }
        }
    }

    /// 已从队列移除的Pending任务直接终结为Cancelled
    pub async fn cancel_pending(&self, id: JobId) -> SchedulerResult<Job> {
        let (job, _) = self
            .update(id, |tracked| {
                tracked.cancel_requested = true;
                tracked.job.cancel(Some("任务被取消".to_string()))
            })
            .await?;
        Ok(job)
    }

    /// 若Pending任务带有取消请求则终结它，返回终结后的任务
    pub async fn finalize_pending_cancel(&self, id: JobId) -> SchedulerResult<Option<Job>> {
        if !self.is_cancel_requested(id) {
            return Ok(None);
        }
        let (job, cancelled) = self
            .update(id, |tracked| {
                if tracked.cancel_requested && tracked.job.status == JobStatus::Pending {
                    tracked.job.cancel(Some("任务被取消".to_string()))?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            })
            .await?;
        Ok(cancelled.then_some(job))
    }

    /// 删除早于 `cutoff` 结束的终态任务，返回删除数量
    pub async fn purge_terminal_before(&self, cutoff: DateTime<Utc>) -> usize {
        let dirty = self.dirty().clone();
        let expired: Vec<JobId> = {
            let mut jobs = self.jobs();
            let expired: Vec<JobId> = jobs
                .values()
                .filter(|tracked| {
                    tracked.job.is_terminal()
                        && !dirty.contains(&tracked.job.id)
                        && tracked.job.finished_at.unwrap_or(tracked.job.updated_at) < cutoff
                })
                .map(|tracked| tracked.job.id)
                .collect();
            for id in &expired {
                jobs.remove(id);
            }
            expired
        };

        for id in &expired {
            if let Err(e) = self.store.delete(*id).await {
                warn!("删除过期任务 {} 失败: {}", id, e);
            }
        }
        expired.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::InMemoryJobStore;
    use async_trait::async_trait;
    use jobforge_domain::JobSpec;
    use mockall::mock;

    mock! {
        pub Store {}

        #[async_trait]
        impl JobStore for Store {
            async fn save(&self, job: &Job) -> SchedulerResult<()>;
            async fn find_by_id(&self, id: JobId) -> SchedulerResult<Option<Job>>;
            async fn load_all(&self) -> SchedulerResult<Vec<Job>>;
            async fn delete(&self, id: JobId) -> SchedulerResult<bool>;
        }
    }

    fn registry() -> (JobRegistry, Arc<InMemoryJobStore>) {
        let store = Arc::new(InMemoryJobStore::new());
        (JobRegistry::new(store.clone()), store)
    }

    fn job() -> Job {
        Job::from_spec(JobSpec::new("shell"), 3)
    }

    #[tokio::test]
    async fn test_register_persists_before_ack() {
        let (registry, store) = registry();
        let job = registry.register(job()).await.unwrap();
        assert_eq!(store.find_by_id(job.id).await.unwrap(), Some(job.clone()));
        assert_eq!(registry.get(job.id), Some(job));
        assert_eq!(registry.counters().submitted, 1);
    }

    #[tokio::test]
    async fn test_discard_removes_record_and_counter() {
        let (registry, store) = registry();
        let job = registry.register(job()).await.unwrap();
        registry.discard(job.id).await.unwrap();

        assert!(!registry.contains(job.id));
        assert_eq!(store.find_by_id(job.id).await.unwrap(), None);
        assert_eq!(registry.counters().submitted, 0);
        assert!(matches!(
            registry.discard(job.id).await,
            Err(SchedulerError::JobNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_register_rolls_back_on_store_failure() {
        let mut store = MockStore::new();
        store
            .expect_save()
            .times(1)
            .returning(|_| Err(SchedulerError::Persistence("disk full".into())));
        let registry = JobRegistry::new(Arc::new(store));

        let job = job();
        let result = registry.register(job.clone()).await;
        assert!(matches!(result, Err(SchedulerError::Persistence(_))));
        assert!(!registry.contains(job.id));
    }

    #[tokio::test]
    async fn test_update_failure_leaves_job_unchanged() {
        let (registry, _) = registry();
        let job = registry.register(job()).await.unwrap();
        let result = registry
            .update(job.id, |tracked| tracked.job.complete(serde_json::Value::Null))
            .await;
        assert!(matches!(result, Err(SchedulerError::InvalidTransition { .. })));
        assert_eq!(registry.get(job.id).unwrap().revision, job.revision);
    }

    #[tokio::test]
    async fn test_dispatch_honours_pending_cancel() {
        let (registry, store) = registry();
        let job = registry.register(job()).await.unwrap();

        assert_eq!(
            registry.request_cancel(job.id).unwrap(),
            CancelRequest::Flagged
        );
        let dispatch = registry
            .begin_dispatch(job.id, CancellationToken::new())
            .await
            .unwrap();
        match dispatch {
            Dispatch::Cancelled(job) => assert_eq!(job.status, JobStatus::Cancelled),
            Dispatch::Run(_) => panic!("cancelled job must not run"),
        }
        let stored = store.find_by_id(job.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Cancelled);
        assert_eq!(registry.counters().cancelled, 1);
    }

    #[tokio::test]
    async fn test_cancel_running_fires_token() {
        let (registry, _) = registry();
        let job = registry.register(job()).await.unwrap();
        let token = CancellationToken::new();
        registry.begin_dispatch(job.id, token.clone()).await.unwrap();

        assert_eq!(
            registry.request_cancel(job.id).unwrap(),
            CancelRequest::Signalled
        );
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn test_cancel_unknown_and_terminal() {
        let (registry, _) = registry();
        assert!(matches!(
            registry.request_cancel(uuid::Uuid::new_v4()),
            Err(SchedulerError::JobNotFound { .. })
        ));

        let job = registry.register(job()).await.unwrap();
        registry.cancel_pending(job.id).await.unwrap();
        assert_eq!(
            registry.request_cancel(job.id).unwrap(),
            CancelRequest::AlreadyTerminal
        );
    }

    #[tokio::test]
    async fn test_counters_track_completion() {
        let (registry, _) = registry();
        let job = registry.register(job()).await.unwrap();
        registry
            .begin_dispatch(job.id, CancellationToken::new())
            .await
            .unwrap();
        registry
            .update(job.id, |tracked| {
                tracked.job.begin_attempt()?;
                tracked.job.complete(serde_json::json!("done"))
            })
            .await
            .unwrap();

        let counters = registry.counters();
        assert_eq!(counters.completed, 1);
        assert!(counters.first_dispatch_at.is_some());
        assert!(counters.last_completion_at.is_some());
        // 无新活动时统计保持不变
        let again = registry.counters();
        assert_eq!(again.throughput(), counters.throughput());
        assert_eq!(again.avg_latency_ms(), counters.avg_latency_ms());
    }

    #[tokio::test]
    async fn test_list_filters_and_orders() {
        let (registry, _) = registry();
        let mut ids = Vec::new();
        for tenant in ["a", "b", "a"] {
            let job = Job::from_spec(JobSpec::new("shell").with_tenant(tenant), 3);
            ids.push(registry.register(job).await.unwrap().id);
        }

        let listed = registry.list(&JobFilter::default().with_tenant("a"));
        assert_eq!(listed.len(), 2);
        assert!(listed[0].submitted_at <= listed[1].submitted_at);
        assert_eq!(registry.list(&JobFilter::default().with_limit(1)).len(), 1);
    }

    #[tokio::test]
    async fn test_purge_terminal_before() {
        let (registry, store) = registry();
        let done = registry.register(job()).await.unwrap();
        let pending = registry.register(job()).await.unwrap();
        registry.cancel_pending(done.id).await.unwrap();

        let purged = registry
            .purge_terminal_before(Utc::now() + chrono::Duration::seconds(1))
            .await;
        assert_eq!(purged, 1);
        assert!(!registry.contains(done.id));
        assert!(registry.contains(pending.id));
        assert!(store.find_by_id(done.id).await.unwrap().is_none());
        assert_eq!(registry.counters().cancelled, 1);
    }

    /// 终态写入失败的存储：`failing` 为真时拒绝终态写入，并记录最后成功写入的状态
    fn terminal_write_store(
        failing: Arc<std::sync::atomic::AtomicBool>,
        terminal_attempts: Arc<std::sync::atomic::AtomicU32>,
        last_saved: Arc<Mutex<Option<JobStatus>>>,
    ) -> MockStore {
        use std::sync::atomic::Ordering;

        let mut store = MockStore::new();
        store.expect_save().returning(move |job| {
            if job.status.is_terminal() {
                terminal_attempts.fetch_add(1, Ordering::SeqCst);
                if failing.load(Ordering::SeqCst) {
                    return Err(SchedulerError::Persistence("database is locked".into()));
                }
            }
            *last_saved.lock().unwrap() = Some(job.status);
            Ok(())
        });
        store.expect_delete().returning(|_| Ok(true));
        store
    }

    #[tokio::test]
    async fn test_lost_terminal_write_is_retried_then_flushed() {
        use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

        let failing = Arc::new(AtomicBool::new(false));
        let attempts = Arc::new(AtomicU32::new(0));
        let last_saved = Arc::new(Mutex::new(None));
        let registry = JobRegistry::new(Arc::new(terminal_write_store(
            failing.clone(),
            attempts.clone(),
            last_saved.clone(),
        )));

        let job = registry.register(job()).await.unwrap();
        registry
            .begin_dispatch(job.id, CancellationToken::new())
            .await
            .unwrap();
        registry
            .update(job.id, |tracked| tracked.job.begin_attempt())
            .await
            .unwrap();
        assert_eq!(*last_saved.lock().unwrap(), Some(JobStatus::Running));

        failing.store(true, Ordering::SeqCst);
        let (completed, _) = registry
            .update(job.id, |tracked| {
                tracked.job.complete(serde_json::json!({"rows": 10}))
            })
            .await
            .unwrap();
        assert_eq!(completed.status, JobStatus::Completed);
        assert_eq!(attempts.load(Ordering::SeqCst), PERSIST_ATTEMPTS);
        // 存储仍停留在Running，任务被标记为待补写
        assert_eq!(*last_saved.lock().unwrap(), Some(JobStatus::Running));
        assert_eq!(registry.dirty_count(), 1);

        // 待补写的终态任务不会被清理
        let far_future = Utc::now() + chrono::Duration::days(1);
        assert_eq!(registry.purge_terminal_before(far_future).await, 0);
        assert!(registry.contains(job.id));

        assert_eq!(registry.flush_dirty().await, 1);

        failing.store(false, Ordering::SeqCst);
        assert_eq!(registry.flush_dirty().await, 0);
        assert_eq!(registry.dirty_count(), 0);
        assert_eq!(*last_saved.lock().unwrap(), Some(JobStatus::Completed));
        assert_eq!(registry.purge_terminal_before(far_future).await, 1);
    }

    #[tokio::test]
    async fn test_later_successful_write_clears_dirty_mark() {
        let (registry, store) = registry();
        let job = registry.register(job()).await.unwrap();
        registry.dirty().insert(job.id);

        registry.cancel_pending(job.id).await.unwrap();
        assert_eq!(registry.dirty_count(), 0);
        assert_eq!(
            store.find_by_id(job.id).await.unwrap().unwrap().status,
            JobStatus::Cancelled
        );
    }
}
