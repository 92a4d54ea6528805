use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{SchedulerError, SchedulerResult};

/// 调度策略，在构造时选定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SchedulingPolicyKind {
    Fifo,
    #[default]
    Priority,
    Sjf,
    FairShare,
}

impl fmt::Display for SchedulingPolicyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SchedulingPolicyKind::Fifo => "fifo",
            SchedulingPolicyKind::Priority => "priority",
            SchedulingPolicyKind::Sjf => "sjf",
            SchedulingPolicyKind::FairShare => "fair_share",
        };
        write!(f, "{name}")
    }
}

/// 熔断器打开时对任务的处理方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OpenCircuitAction {
    /// 直接以CircuitOpen失败
    #[default]
    Reject,
    /// 放回队列，等待冷却结束
    Requeue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub policy: SchedulingPolicyKind,
    pub min_workers: usize,
    pub max_workers: usize,
    /// 队列容量上限，None表示无界
    pub max_queue_size: Option<usize>,
    /// 单个任务默认超时（毫秒）
    pub job_timeout_ms: u64,
    /// Worker阻塞出队的最长等待（毫秒）
    pub poll_interval_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// 终态任务的保留时长（秒）
    pub retention_secs: u64,
    pub retention_sweep_interval_ms: u64,
    pub open_circuit_action: OpenCircuitAction,
    /// SJF等待老化系数，0表示关闭
    pub sjf_aging_factor: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            policy: SchedulingPolicyKind::Priority,
            min_workers: 1,
            max_workers: 8,
            max_queue_size: Some(10_000),
            job_timeout_ms: 300_000, // 默认5分钟超时
            poll_interval_ms: 500,
            shutdown_timeout_ms: 30_000,
            retention_secs: 3600,
            retention_sweep_interval_ms: 60_000,
            open_circuit_action: OpenCircuitAction::Reject,
            sjf_aging_factor: 0.0,
        }
    }
}

impl SchedulerConfig {
    pub fn job_timeout(&self) -> Duration {
        Duration::from_millis(self.job_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.max_workers == 0 {
            return Err(SchedulerError::Configuration(
                "最大Worker数必须大于0".to_string(),
            ));
        }
        if self.min_workers > self.max_workers {
            return Err(SchedulerError::Configuration(format!(
                "min_workers ({}) 不能大于 max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        if self.max_queue_size == Some(0) {
            return Err(SchedulerError::Configuration(
                "队列容量必须大于0".to_string(),
            ));
        }
        if self.job_timeout_ms == 0 {
            return Err(SchedulerError::Configuration(
                "任务超时时间必须大于0".to_string(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(SchedulerError::Configuration(
                "轮询间隔必须大于0".to_string(),
            ));
        }
        if self.sjf_aging_factor < 0.0 {
            return Err(SchedulerError::Configuration(
                "SJF老化系数不能为负数".to_string(),
            ));
        }
        Ok(())
    }
}
