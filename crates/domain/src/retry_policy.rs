use std::time::Duration;

use jobforge_core::{config::RetryConfig, SchedulerError};

use crate::entities::Job;

/// 纯计算的退避策略，不持有任何运行时状态
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.config.max_delay_ms)
    }

    /// `min(base * multiplier^n, max_delay)`，不含抖动
    pub fn capped_delay(&self, n: u32) -> Duration {
        let base = self.config.base_delay_ms as f64;
        let exponential = base * self.config.multiplier.powi(n.min(i32::MAX as u32) as i32);
        let capped = exponential.min(self.config.max_delay_ms as f64);
        millis_to_duration(capped)
    }

    /// 第 n 次退避（从0开始）的实际等待时间，带对称随机抖动
    pub fn next_delay(&self, n: u32) -> Duration {
        let capped = self.capped_delay(n);
        if self.config.jitter <= 0.0 {
            return capped;
        }
        // 添加随机抖动以避免雷群效应
        let capped_ms = capped.as_secs_f64() * 1000.0;
        let jitter = capped_ms * self.config.jitter * (rand::random::<f64>() - 0.5) * 2.0;
        millis_to_duration(capped_ms + jitter)
    }

    /// 已执行 attempt_count 次后，下一次重试前的等待
    pub fn delay_for_attempt(&self, attempt_count: u32) -> Duration {
        self.next_delay(attempt_count.saturating_sub(1))
    }

    pub fn should_retry(&self, job: &Job, error: &SchedulerError) -> bool {
        job.attempts_remaining() && error.is_retryable()
    }
}

fn millis_to_duration(millis: f64) -> Duration {
    Duration::from_nanos((millis.max(0.0) * 1_000_000.0).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::JobSpec;
    use jobforge_core::FailureKind;

    fn policy(jitter: f64) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_attempts: 3,
            base_delay_ms: 100,
            multiplier: 2.0,
            max_delay_ms: 1_000,
            jitter,
        })
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = policy(0.0);
        assert_eq!(policy.next_delay(0), Duration::from_millis(100));
        assert_eq!(policy.next_delay(1), Duration::from_millis(200));
        assert_eq!(policy.next_delay(2), Duration::from_millis(400));
        assert_eq!(policy.next_delay(3), Duration::from_millis(800));
        assert_eq!(policy.next_delay(4), Duration::from_millis(1_000));
        assert_eq!(policy.next_delay(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = policy(0.5);
        for _ in 0..200 {
            let delay = policy.next_delay(1).as_secs_f64();
            assert!((0.1 - 1e-9..=0.3 + 1e-9).contains(&delay), "delay {delay}");
        }
    }

    #[test]
    fn test_delay_for_attempt_uses_previous_exponent() {
        let policy = policy(0.0);
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
    }

    #[test]
    fn test_should_retry() {
        let policy = policy(0.0);
        let mut job = Job::from_spec(JobSpec::new("shell"), 3);
        job.mark_running().unwrap();
        job.begin_attempt().unwrap();

        assert!(policy.should_retry(&job, &SchedulerError::transient("io")));
        assert!(policy.should_retry(&job, &SchedulerError::ExecutionTimeout { timeout_ms: 5 }));
        assert!(!policy.should_retry(&job, &SchedulerError::validation("bad input")));
        assert!(!policy.should_retry(
            &job,
            &SchedulerError::Execution {
                message: "bug".into(),
                kind: FailureKind::Internal,
            }
        ));

        job.attempt_count = 3;
        assert!(!policy.should_retry(&job, &SchedulerError::transient("io")));
    }
}
