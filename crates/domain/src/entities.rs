use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobforge_core::{SchedulerError, SchedulerResult};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::value_objects::PriorityTier;

pub type JobId = Uuid;

/// 未指定租户时的公平调度键
pub const DEFAULT_TENANT: &str = "default";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = SchedulerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            _ => Err(SchedulerError::Serialization(format!(
                "Invalid job status: {s}"
            ))),
        }
    }
}

/// 提交任务时的输入
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub job_type: String,
    #[serde(default)]
    pub tier: PriorityTier,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub estimated_duration_ms: Option<u64>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    /// 为空时使用 retry.max_attempts
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl JobSpec {
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            tier: PriorityTier::Normal,
            tenant: None,
            estimated_duration_ms: None,
            timeout_ms: None,
            max_attempts: None,
            payload: serde_json::Value::Null,
        }
    }

    pub fn with_tier(mut self, tier: PriorityTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_estimate(mut self, estimate: Duration) -> Self {
        self.estimated_duration_ms = Some(estimate.as_millis() as u64);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.job_type.trim().is_empty() {
            return Err(SchedulerError::InvalidJobSpec(
                "任务类型不能为空".to_string(),
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(SchedulerError::InvalidJobSpec(
                "max_attempts必须大于0".to_string(),
            ));
        }
        if self.timeout_ms == Some(0) {
            return Err(SchedulerError::InvalidJobSpec(
                "timeout_ms必须大于0".to_string(),
            ));
        }
        if matches!(self.tenant.as_deref(), Some(t) if t.trim().is_empty()) {
            return Err(SchedulerError::InvalidJobSpec(
                "租户名称不能为空".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// 任务类型，同时作为熔断器的操作类别
    pub job_type: String,
    pub tier: PriorityTier,
    pub tenant: Option<String>,
    pub estimated_duration_ms: Option<u64>,
    pub timeout_ms: Option<u64>,
    pub status: JobStatus,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub last_error: Option<String>,
    pub payload: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    /// 每次变更递增，存储层据此拒绝过期写入
    pub revision: u64,
}

impl Job {
    pub fn from_spec(spec: JobSpec, default_max_attempts: u32) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            job_type: spec.job_type,
            tier: spec.tier,
            tenant: spec.tenant,
            estimated_duration_ms: spec.estimated_duration_ms,
            timeout_ms: spec.timeout_ms,
            status: JobStatus::Pending,
            attempt_count: 0,
            max_attempts: spec.max_attempts.unwrap_or(default_max_attempts).max(1),
            last_error: None,
            payload: spec.payload,
            result: None,
            submitted_at: now,
            started_at: None,
            finished_at: None,
            updated_at: now,
            revision: 0,
        }
    }

    pub fn tenant_key(&self) -> &str {
        self.tenant.as_deref().unwrap_or(DEFAULT_TENANT)
    }

    pub fn estimated_duration(&self) -> Option<Duration> {
        self.estimated_duration_ms.map(Duration::from_millis)
    }

    /// 任务自身超时，缺省时使用调度器配置
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.timeout_ms.map(Duration::from_millis).unwrap_or(default)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn attempts_remaining(&self) -> bool {
        self.attempt_count < self.max_attempts
    }

    /// 从提交到结束的耗时
    pub fn latency(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|finished| finished - self.submitted_at)
    }

    pub fn entity_description(&self) -> String {
        format!(
            "任务 {} (类型: {}, 优先级: {}, 状态: {})",
            self.id, self.job_type, self.tier, self.status
        )
    }
}

/// 任务列表查询条件，结果按提交时间排序
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub job_type: Option<String>,
    pub tier: Option<PriorityTier>,
    pub tenant: Option<String>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    pub fn with_tier(mut self, tier: PriorityTier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self.job_type.as_deref().map_or(true, |t| job.job_type == t)
            && self.tier.map_or(true, |t| job.tier == t)
            && self.tenant.as_deref().map_or(true, |t| job.tenant_key() == t)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkerStatus {
    Idle,
    Busy,
    Draining,
    Stopped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    pub worker_id: String,
    pub status: WorkerStatus,
    pub current_job_id: Option<JobId>,
    pub jobs_completed: u64,
    pub jobs_failed: u64,
    pub last_heartbeat: DateTime<Utc>,
}

impl WorkerRecord {
    pub fn new(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            status: WorkerStatus::Idle,
            current_job_id: None,
            jobs_completed: 0,
            jobs_failed: 0,
            last_heartbeat: Utc::now(),
        }
    }

    pub fn heartbeat(&mut self) {
        self.last_heartbeat = Utc::now();
    }

    pub fn is_available(&self) -> bool {
        matches!(self.status, WorkerStatus::Idle)
    }
}
