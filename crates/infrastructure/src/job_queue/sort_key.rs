use std::cmp::Ordering;

use jobforge_core::config::SchedulingPolicyKind;
use jobforge_domain::{Job, JobId};

/// 策略相关的排序键，值越小越先出队
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SortKey {
    /// FIFO：提交序号
    Sequence(u64),
    /// Priority：(档位, 提交序号)
    Priority { tier_rank: u8, sequence: u64 },
    /// SJF：预估时长（秒，含等待老化），未预估的任务排在最后
    ShortestJob {
        estimate_secs: Option<f64>,
        sequence: u64,
    },
    /// FairShare：租户内按提交序号，租户间由虚拟时间决定
    TenantSequence(u64),
}

impl SortKey {
    /// 根据策略计算任务的排序键。
    ///
    /// `enqueue_offset_secs` 为入队时刻相对队列创建时刻的秒数，
    /// SJF老化把 `estimate - f * waited` 换算成不随时间变化的
    /// `estimate + f * enqueue_offset`，保证堆内顺序稳定。
    pub fn for_job(
        policy: SchedulingPolicyKind,
        job: &Job,
        sequence: u64,
        aging_factor: f64,
        enqueue_offset_secs: f64,
    ) -> Self {
        match policy {
            SchedulingPolicyKind::Fifo => SortKey::Sequence(sequence),
            SchedulingPolicyKind::Priority => SortKey::Priority {
                tier_rank: job.tier.rank(),
                sequence,
            },
            SchedulingPolicyKind::Sjf => SortKey::ShortestJob {
                estimate_secs: job.estimated_duration().map(|estimate| {
                    estimate.as_secs_f64() + aging_factor * enqueue_offset_secs
                }),
                sequence,
            },
            SchedulingPolicyKind::FairShare => SortKey::TenantSequence(sequence),
        }
    }

    pub fn sequence(&self) -> u64 {
        match self {
            SortKey::Sequence(sequence)
            | SortKey::TenantSequence(sequence)
            | SortKey::Priority { sequence, .. }
            | SortKey::ShortestJob { sequence, .. } => *sequence,
        }
    }

    fn compare(&self, other: &Self) -> Ordering {
        match (self, other) {
            (
                SortKey::Priority {
                    tier_rank: a,
                    sequence: sa,
                },
                SortKey::Priority {
                    tier_rank: b,
                    sequence: sb,
                },
            ) => a.cmp(b).then(sa.cmp(sb)),
            (
                SortKey::ShortestJob {
                    estimate_secs: a,
                    sequence: sa,
                },
                SortKey::ShortestJob {
                    estimate_secs: b,
                    sequence: sb,
                },
            ) => match (a, b) {
                (Some(a), Some(b)) => a.total_cmp(b).then(sa.cmp(sb)),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => sa.cmp(sb),
            },
            // 同一队列内只会出现同一种键，其余情况按序号比较
            _ => self.sequence().cmp(&other.sequence()),
        }
    }
}

/// 堆元素，按排序键反向比较，使 `BinaryHeap` 成为最小堆
#[derive(Debug, Clone)]
pub(crate) struct HeapItem {
    pub key: SortKey,
    pub job_id: JobId,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        other.key.compare(&self.key)
    }
}
