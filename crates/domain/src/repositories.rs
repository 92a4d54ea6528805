//! 领域仓储抽象
//!
//! 定义任务记录持久化的抽象接口，遵循依赖倒置原则

use async_trait::async_trait;
use jobforge_core::SchedulerResult;

use crate::entities::{Job, JobId};

/// 任务记录存储
///
/// 实现必须无损地保存任务的每个字段；`save` 为upsert，
/// 当已存储记录的revision更新时忽略本次写入。
#[async_trait]
pub trait JobStore: Send + Sync {
    async fn save(&self, job: &Job) -> SchedulerResult<()>;
    async fn find_by_id(&self, id: JobId) -> SchedulerResult<Option<Job>>;
    async fn load_all(&self) -> SchedulerResult<Vec<Job>>;
    /// 返回记录是否存在
    async fn delete(&self, id: JobId) -> SchedulerResult<bool>;
}
