//! 调度编排
//!
//! 把队列、注册表、Worker池、资源监控与指标管道组装成 [`Scheduler`]，
//! 并负责启动恢复、自动扩缩容与终态任务清理。

pub mod autoscaler;
pub mod recovery_service;
pub mod retention;
pub mod scheduler;
pub mod workload;

pub use autoscaler::{Autoscaler, ScaleDecision};
pub use recovery_service::{RecoveryReport, RecoveryService, SystemRecoveryService};
pub use retention::RetentionSweeper;
pub use scheduler::{Scheduler, SchedulerBuilder, SchedulerStats};
pub use workload::SchedulerWorkload;
