//! Test data builders for creating jobs with sensible defaults

use std::time::Duration;

use chrono::{DateTime, Utc};
use jobforge_domain::{Job, JobSpec, JobStatus, PriorityTier};

/// Builder for creating test Job entities
pub struct JobBuilder {
    job: Job,
}

impl JobBuilder {
    pub fn new(job_type: &str) -> Self {
        Self {
            job: Job::from_spec(JobSpec::new(job_type), 3),
        }
    }

    pub fn with_tier(mut self, tier: PriorityTier) -> Self {
        self.job.tier = tier;
        self
    }

    pub fn with_tenant(mut self, tenant: &str) -> Self {
        self.job.tenant = Some(tenant.to_string());
        self
    }

    pub fn with_estimate(mut self, estimate: Duration) -> Self {
        self.job.estimated_duration_ms = Some(estimate.as_millis() as u64);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.job.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.job.payload = payload;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.job.max_attempts = max_attempts;
        self
    }

    pub fn with_attempt_count(mut self, attempt_count: u32) -> Self {
        self.job.attempt_count = attempt_count;
        self
    }

    /// 直接设置状态，不经过状态机
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.job.status = status;
        let now = Utc::now();
        match status {
            JobStatus::Running => self.job.started_at = Some(now),
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled => {
                self.job.finished_at = Some(now)
            }
            JobStatus::Pending => {}
        }
        self
    }

    pub fn with_submitted_at(mut self, submitted_at: DateTime<Utc>) -> Self {
        self.job.submitted_at = submitted_at;
        self
    }

    pub fn with_finished_at(mut self, finished_at: DateTime<Utc>) -> Self {
        self.job.finished_at = Some(finished_at);
        self
    }

    pub fn build(self) -> Job {
        self.job
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_builder() {
        let job = JobBuilder::new("render")
            .with_tier(PriorityTier::Urgent)
            .with_tenant("acme")
            .with_estimate(Duration::from_secs(3))
            .with_status(JobStatus::Running)
            .build();

        assert_eq!(job.job_type, "render");
        assert_eq!(job.tier, PriorityTier::Urgent);
        assert_eq!(job.tenant_key(), "acme");
        assert_eq!(job.estimated_duration_ms, Some(3_000));
        assert!(job.started_at.is_some());
    }
}
