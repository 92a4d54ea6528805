//! 策略排序的待执行任务队列
//!
//! 队列在构造时选定一种调度策略（FIFO / Priority / SJF / FairShare），
//! push、pop、remove 在同一把锁下完成，临界区只包含 O(log n) 的堆操作
//! （FairShare为 O(租户数)）。`pop_timeout` 在锁外通过 `Notify` 等待，
//! 等待时间总是有上限。
//!
//! 被删除的任务在堆中采用惰性删除：`live` 表是唯一的事实来源，
//! 出堆时跳过已不在表中的条目。

mod fair_share;
mod sort_key;

use std::collections::{BTreeMap, BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use jobforge_core::config::SchedulingPolicyKind;
use jobforge_core::{SchedulerError, SchedulerResult};
use jobforge_domain::{Job, JobId, PriorityTier};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use fair_share::FairShareState;
use sort_key::HeapItem;
pub use sort_key::SortKey;

/// 未预估时长的任务在FairShare中的单位成本
pub const UNIT_COST: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct JobQueueConfig {
    pub policy: SchedulingPolicyKind,
    pub max_size: Option<usize>,
    pub sjf_aging_factor: f64,
}

impl Default for JobQueueConfig {
    fn default() -> Self {
        Self {
            policy: SchedulingPolicyKind::Priority,
            max_size: None,
            sjf_aging_factor: 0.0,
        }
    }
}

impl From<&jobforge_core::config::SchedulerConfig> for JobQueueConfig {
    fn from(config: &jobforge_core::config::SchedulerConfig) -> Self {
        Self {
            policy: config.policy,
            max_size: config.max_queue_size,
            sjf_aging_factor: config.sjf_aging_factor,
        }
    }
}

/// 入队凭据
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub job_id: JobId,
    pub sequence: u64,
    pub key: SortKey,
    pub tier: PriorityTier,
    pub tenant: String,
}

#[derive(Debug)]
struct LiveEntry {
    entry: QueueEntry,
    job: Job,
}

#[derive(Debug)]
enum PolicyState {
    Heap(BinaryHeap<HeapItem>),
    FairShare(FairShareState),
}

#[derive(Debug)]
struct QueueState {
    policy_state: PolicyState,
    live: HashMap<JobId, LiveEntry>,
    tier_counts: BTreeMap<PriorityTier, usize>,
    next_sequence: u64,
}

impl QueueState {
    fn take_live(&mut self, job_id: &JobId) -> Option<LiveEntry> {
        let live = self.live.remove(job_id)?;
        if let Some(count) = self.tier_counts.get_mut(&live.entry.tier) {
            *count = count.saturating_sub(1);
        }
        Some(live)
    }

    fn maybe_compact(&mut self) {
        if let PolicyState::Heap(heap) = &mut self.policy_state {
            if heap.len() > 64 && heap.len() > self.live.len() * 2 {
                let live = &self.live;
                heap.retain(|item| {
                    live.get(&item.job_id)
                        .is_some_and(|l| l.entry.sequence == item.key.sequence())
                });
            }
        }
    }
}

pub struct JobQueue {
    config: JobQueueConfig,
    state: Mutex<QueueState>,
    available: Notify,
    created_at: Instant,
}

impl JobQueue {
    pub fn new(config: JobQueueConfig) -> Self {
        let policy_state = match config.policy {
            SchedulingPolicyKind::FairShare => PolicyState::FairShare(FairShareState::default()),
            _ => PolicyState::Heap(BinaryHeap::new()),
        };
        let tier_counts = PriorityTier::ALL.iter().map(|tier| (*tier, 0)).collect();
        Self {
            config,
            state: Mutex::new(QueueState {
                policy_state,
                live: HashMap::new(),
                tier_counts,
                next_sequence: 0,
            }),
            available: Notify::new(),
            created_at: Instant::now(),
        }
    }

    pub fn with_policy(policy: SchedulingPolicyKind) -> Self {
        Self::new(JobQueueConfig {
            policy,
            ..Default::default()
        })
    }

    pub fn policy(&self) -> SchedulingPolicyKind {
        self.config.policy
    }

    pub fn capacity(&self) -> Option<usize> {
        self.config.max_size
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        // 临界区内没有会panic的用户代码，锁中毒时沿用内部状态
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn push(&self, job: Job) -> SchedulerResult<QueueEntry> {
        let enqueue_offset = self.created_at.elapsed().as_secs_f64();
        let entry = {
            let mut state = self.lock();
            if let Some(capacity) = self.config.max_size {
                if state.live.len() >= capacity {
                    return Err(SchedulerError::QueueFull { capacity });
                }
            }
            if state.live.contains_key(&job.id) {
                return Err(SchedulerError::Internal(format!(
                    "任务 {} 已在队列中",
                    job.id
                )));
            }

            let sequence = state.next_sequence;
            state.next_sequence += 1;
            let key = SortKey::for_job(
                self.config.policy,
                &job,
                sequence,
                self.config.sjf_aging_factor,
                enqueue_offset,
            );
            let entry = QueueEntry {
                job_id: job.id,
                sequence,
                key,
                tier: job.tier,
                tenant: job.tenant_key().to_string(),
            };

            match &mut state.policy_state {
                PolicyState::Heap(heap) => heap.push(HeapItem {
                    key,
                    job_id: job.id,
                }),
                PolicyState::FairShare(fair) => {
                    let cost = job
                        .estimated_duration()
                        .map(|d| d.as_secs_f64())
                        .filter(|secs| *secs > 0.0)
                        .unwrap_or(UNIT_COST);
                    fair.push(&entry.tenant, sequence, job.id, cost);
                }
            }
            *state.tier_counts.entry(job.tier).or_insert(0) += 1;
            state.live.insert(
                job.id,
                LiveEntry {
                    entry: entry.clone(),
                    job,
                },
            );
            entry
        };

        debug!(
            "任务入队: {} (序号: {}, 策略: {})",
            entry.job_id, entry.sequence, self.config.policy
        );
        self.available.notify_one();
        Ok(entry)
    }

    /// 非阻塞地取出当前最应执行的任务
    pub fn pop(&self) -> Option<Job> {
        let mut guard = self.lock();
        let state = &mut *guard;
        loop {
            let job_id = match &mut state.policy_state {
                PolicyState::Heap(heap) => {
                    let item = heap.pop()?;
                    let current = state
                        .live
                        .get(&item.job_id)
                        .is_some_and(|l| l.entry.sequence == item.key.sequence());
                    if !current {
                        continue;
                    }
                    item.job_id
                }
                PolicyState::FairShare(fair) => fair.pop()?,
            };
            if let Some(live) = state.take_live(&job_id) {
                state.maybe_compact();
                return Some(live.job);
            }
        }
    }

    /// 等待直到有任务可取或超时，不会无限期阻塞
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<Job> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(job) = self.pop() {
                return Some(job);
            }
            let notified = self.available.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.pop();
            }
        }
    }

    /// 取消仍在队列中的任务；已被取走时返回 JobNotFound
    pub fn remove(&self, job_id: JobId) -> SchedulerResult<Job> {
        let mut state = self.lock();
        let live = state
            .take_live(&job_id)
            .ok_or_else(|| SchedulerError::not_found(job_id))?;
        if let PolicyState::FairShare(fair) = &mut state.policy_state {
            fair.remove(&live.entry.tenant, job_id);
        }
        state.maybe_compact();
        debug!("任务出队(取消): {}", job_id);
        Ok(live.job)
    }

    pub fn contains(&self, job_id: JobId) -> bool {
        self.lock().live.contains_key(&job_id)
    }

    pub fn len(&self) -> usize {
        self.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 各优先级档位的待处理数量
    pub fn peek_distribution(&self) -> BTreeMap<PriorityTier, usize> {
        self.lock().tier_counts.clone()
    }

    /// 队列填充率，无界队列返回None
    pub fn fill_ratio(&self) -> Option<f64> {
        self.config
            .max_size
            .map(|capacity| self.len() as f64 / capacity as f64)
    }

    /// FairShare下租户当前的虚拟时间
    pub fn tenant_virtual_time(&self, tenant: &str) -> Option<f64> {
        match &self.lock().policy_state {
            PolicyState::FairShare(fair) => fair.virtual_time(tenant),
            PolicyState::Heap(_) => None,
        }
    }
}
