//! 任务状态机
//!
//! Pending → Running → {Completed | Pending(重试) | Failed | Cancelled}；Pending → Cancelled。
//! 终态不可离开，所有状态变更都经过 [`Job::transition_to`]。

use chrono::Utc;
use jobforge_core::{SchedulerError, SchedulerResult};

use crate::entities::{Job, JobStatus};

pub fn can_transition(from: JobStatus, to: JobStatus) -> bool {
    use JobStatus::*;
    matches!(
        (from, to),
        (Pending, Running)
            | (Pending, Cancelled)
            | (Running, Completed)
            | (Running, Pending)
            | (Running, Failed)
            | (Running, Cancelled)
    )
}

impl Job {
    pub fn transition_to(&mut self, to: JobStatus) -> SchedulerResult<()> {
        if !can_transition(self.status, to) {
            return Err(SchedulerError::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        let now = Utc::now();
        match to {
            JobStatus::Running => self.started_at = Some(now),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                self.finished_at = Some(now)
            }
            JobStatus::Pending => {}
        }
        self.status = to;
        self.touch();
        Ok(())
    }

    /// 记录一次变更
    pub fn touch(&mut self) {
        self.revision += 1;
        self.updated_at = Utc::now();
    }

    /// Pending → Running，由取到任务的Worker调用
    pub fn mark_running(&mut self) -> SchedulerResult<()> {
        self.transition_to(JobStatus::Running)
    }

    /// 即将调用执行器，消耗一次尝试
    pub fn begin_attempt(&mut self) -> SchedulerResult<u32> {
        if self.status != JobStatus::Running {
            return Err(SchedulerError::InvalidTransition {
                from: self.status.to_string(),
                to: JobStatus::Running.to_string(),
            });
        }
        self.attempt_count += 1;
        self.touch();
        Ok(self.attempt_count)
    }

    pub fn complete(&mut self, result: serde_json::Value) -> SchedulerResult<()> {
        self.transition_to(JobStatus::Completed)?;
        self.result = Some(result);
        self.last_error = None;
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> SchedulerResult<()> {
        self.transition_to(JobStatus::Failed)?;
        self.last_error = Some(error.into());
        Ok(())
    }

    /// Running → Pending，等待重试或熔断冷却后重新入队
    pub fn requeue(&mut self, error: Option<String>) -> SchedulerResult<()> {
        self.transition_to(JobStatus::Pending)?;
        if error.is_some() {
            self.last_error = error;
        }
        self.started_at = None;
        Ok(())
    }

    pub fn cancel(&mut self, reason: Option<String>) -> SchedulerResult<()> {
        self.transition_to(JobStatus::Cancelled)?;
        if reason.is_some() {
            self.last_error = reason;
        }
        Ok(())
    }

    /// 进程重启时发现的Running任务按可重试失败处理（至多一次语义）。
    ///
    /// 返回 true 表示任务回到Pending等待重新入队。
    pub fn recover_interrupted(&mut self) -> SchedulerResult<bool> {
        let error = "任务执行被进程中断".to_string();
        if self.attempts_remaining() {
            self.requeue(Some(error))?;
            Ok(true)
        } else {
            self.fail(error)?;
            Ok(false)
        }
    }
}
