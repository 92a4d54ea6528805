use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 执行失败的分类，决定失败是否可以重试
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// 瞬时故障（网络抖动、资源暂时不可用等），可以重试
    Transient,
    /// 参数或输入校验失败，重试也不会成功
    Validation,
    /// 执行器内部缺陷
    Internal,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Validation => write!(f, "validation"),
            FailureKind::Internal => write!(f, "internal"),
        }
    }
}

/// 调度器错误类型定义
#[derive(Debug, Clone, Error)]
pub enum SchedulerError {
    #[error("队列已满 (容量: {capacity})")]
    QueueFull { capacity: usize },

    #[error("任务未找到: {id}")]
    JobNotFound { id: String },

    #[error("非法的状态转换: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("任务执行超时 ({timeout_ms}ms)")]
    ExecutionTimeout { timeout_ms: u64 },

    #[error("任务执行失败 [{kind}]: {message}")]
    Execution { message: String, kind: FailureKind },

    #[error("熔断器已打开，拒绝执行: {class}")]
    CircuitOpen { class: String },

    #[error("任务已取消")]
    Cancelled,

    #[error("不支持的任务类型: {0}")]
    UnsupportedJobType(String),

    #[error("无效的任务参数: {0}")]
    InvalidJobSpec(String),

    #[error("持久化错误: {0}")]
    Persistence(String),

    #[error("序列化错误: {0}")]
    Serialization(String),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("调度器正在关闭")]
    ShuttingDown,

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// 瞬时执行失败
    pub fn transient(message: impl Into<String>) -> Self {
        SchedulerError::Execution {
            message: message.into(),
            kind: FailureKind::Transient,
        }
    }

    /// 校验类执行失败
    pub fn validation(message: impl Into<String>) -> Self {
        SchedulerError::Execution {
            message: message.into(),
            kind: FailureKind::Validation,
        }
    }

    /// 执行器内部错误
    pub fn internal_failure(message: impl Into<String>) -> Self {
        SchedulerError::Execution {
            message: message.into(),
            kind: FailureKind::Internal,
        }
    }

    pub fn not_found(id: impl fmt::Display) -> Self {
        SchedulerError::JobNotFound { id: id.to_string() }
    }

    /// 默认的失败分类：超时与瞬时故障可重试，校验与程序错误不可重试
    pub fn is_retryable(&self) -> bool {
        match self {
            SchedulerError::ExecutionTimeout { .. } => true,
            SchedulerError::Execution { kind, .. } => *kind == FailureKind::Transient,
            SchedulerError::Persistence(_) => true,
            _ => false,
        }
    }
}

impl From<serde_json::Error> for SchedulerError {
    fn from(e: serde_json::Error) -> Self {
        SchedulerError::Serialization(e.to_string())
    }
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_classification() {
        assert!(SchedulerError::ExecutionTimeout { timeout_ms: 10 }.is_retryable());
        assert!(SchedulerError::transient("network").is_retryable());
        assert!(!SchedulerError::validation("bad input").is_retryable());
        assert!(!SchedulerError::internal_failure("bug").is_retryable());
        assert!(!SchedulerError::Cancelled.is_retryable());
        assert!(!SchedulerError::CircuitOpen {
            class: "transcode".to_string()
        }
        .is_retryable());
    }

    #[test]
    fn test_error_display() {
        let err = SchedulerError::QueueFull { capacity: 8 };
        assert!(err.to_string().contains('8'));

        let err = SchedulerError::not_found("abc");
        assert!(matches!(err, SchedulerError::JobNotFound { ref id } if id == "abc"));
    }
}
