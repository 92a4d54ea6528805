//! Test helper utilities for asynchronous assertions

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobforge_domain::{Job, JobStatus};
use tokio::time::sleep;

/// Test environment setup utilities
pub struct TestEnv;

impl TestEnv {
    /// Poll a condition every 10ms until it holds or the timeout elapses
    pub async fn wait_for<F, Fut>(condition: F, timeout: Duration) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        Self::wait_for_with_interval(condition, timeout, Duration::from_millis(10)).await
    }

    /// Wait for a condition with a custom poll interval
    pub async fn wait_for_with_interval<F, Fut>(
        mut condition: F,
        timeout: Duration,
        poll_interval: Duration,
    ) -> bool
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = bool>,
    {
        let start = tokio::time::Instant::now();
        while start.elapsed() < timeout {
            if condition().await {
                return true;
            }
            sleep(poll_interval).await;
        }
        condition().await
    }

    pub fn timestamp_with_offset(offset_seconds: i64) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(offset_seconds)
    }
}

/// Common assertions on job collections
pub struct TestAssertions;

impl TestAssertions {
    pub fn assert_status(job: &Job, expected: JobStatus) {
        assert_eq!(
            job.status, expected,
            "job {} ({}) expected {:?}, last_error: {:?}",
            job.id, job.job_type, expected, job.last_error
        );
    }

    pub fn assert_all<T, P>(items: &[T], predicate: P, message: &str)
    where
        T: std::fmt::Debug,
        P: Fn(&T) -> bool,
    {
        for item in items {
            assert!(predicate(item), "{message}: {item:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_wait_for() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let reached = TestEnv::wait_for(
            move || {
                let counter = counter.clone();
                async move { counter.fetch_add(1, Ordering::SeqCst) >= 3 }
            },
            Duration::from_secs(1),
        )
        .await;
        assert!(reached);

        let never = TestEnv::wait_for(|| async { false }, Duration::from_millis(30)).await;
        assert!(!never);
    }
}
