//! 任务执行器接口定义
//!
//! 调度器不关心任务本身做什么，具体工作由外部的 [`JobExecutor`] 完成。
//! Worker为每次尝试构造一个 [`ExecutionContext`]，其中携带：
//! - 任务载荷（不透明的JSON）
//! - 协作式取消令牌
//! - 当前尝试次数（从1开始）
//!
//! ## 取消与超时
//!
//! 超时或取消发生时，Worker会触发取消令牌并放弃等待执行结果，
//! 不会强行终止执行器。执行器应当在合适的检查点查看
//! `cancellation.is_cancelled()` 并尽快返回 [`SchedulerError::Cancelled`]。
//!
//! ## 错误分类
//!
//! 执行器返回的错误决定任务是否重试：
//! - `SchedulerError::transient(..)` 与超时可以重试
//! - `SchedulerError::validation(..)`、`SchedulerError::internal_failure(..)` 直接失败
//!
//! ## 实现示例
//!
//! ```rust
//! use async_trait::async_trait;
//! use jobforge_core::{SchedulerError, SchedulerResult};
//! use jobforge_domain::ports::{ExecutionContext, JobExecutor};
//!
//! pub struct ThumbnailExecutor;
//!
//! #[async_trait]
//! impl JobExecutor for ThumbnailExecutor {
//!     async fn execute(&self, ctx: ExecutionContext) -> SchedulerResult<serde_json::Value> {
//!         let path = ctx.payload["path"]
//!             .as_str()
//!             .ok_or_else(|| SchedulerError::validation("缺少path参数"))?;
//!         if ctx.cancellation.is_cancelled() {
//!             return Err(SchedulerError::Cancelled);
//!         }
//!         Ok(serde_json::json!({ "thumbnail": format!("{path}.thumb.png") }))
//!     }
//!
//!     fn name(&self) -> &str {
//!         "thumbnail"
//!     }
//! }
//! ```
//!
//! [`SchedulerError::Cancelled`]: jobforge_core::SchedulerError::Cancelled

use std::time::Duration;

use async_trait::async_trait;
use jobforge_core::SchedulerResult;
use tokio_util::sync::CancellationToken;

use crate::entities::{Job, JobId};

/// 单次尝试的执行上下文
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub job_id: JobId,
    pub job_type: String,
    pub payload: serde_json::Value,
    /// 当前尝试次数，从1开始
    pub attempt: u32,
    pub max_attempts: u32,
    pub timeout: Duration,
    pub worker_id: String,
    pub cancellation: CancellationToken,
}

impl ExecutionContext {
    pub fn for_job(
        job: &Job,
        worker_id: impl Into<String>,
        timeout: Duration,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type.clone(),
            payload: job.payload.clone(),
            attempt: job.attempt_count,
            max_attempts: job.max_attempts,
            timeout,
            worker_id: worker_id.into(),
            cancellation,
        }
    }

    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[async_trait]
pub trait JobExecutor: Send + Sync {
    /// 执行一次尝试，成功时返回结果
    async fn execute(&self, ctx: ExecutionContext) -> SchedulerResult<serde_json::Value>;

    fn name(&self) -> &str;

    fn supports_job_type(&self, _job_type: &str) -> bool {
        true
    }
}
