use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobforge_core::config::SchedulerConfig;
use jobforge_infrastructure::job_registry::JobRegistry;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// 定期补写脏记录并清理超过保留期的终态任务
pub struct RetentionSweeper {
    registry: Arc<JobRegistry>,
    retention: Duration,
    interval: Duration,
}

impl RetentionSweeper {
    pub fn new(registry: Arc<JobRegistry>, retention: Duration, interval: Duration) -> Self {
        Self {
            registry,
            retention,
            interval,
        }
    }

    pub fn from_config(registry: Arc<JobRegistry>, config: &SchedulerConfig) -> Self {
        Self::new(
            registry,
            Duration::from_secs(config.retention_secs),
            Duration::from_millis(config.retention_sweep_interval_ms.max(1)),
        )
    }

    /// 清理一次，返回删除的任务数
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let retention = chrono::Duration::from_std(self.retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = now.checked_sub_signed(retention).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let purged = self.registry.purge_terminal_before(cutoff).await;
        if purged > 0 {
            info!("已清理 {} 个过期任务 (早于 {})", purged, cutoff);
        }
        purged
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // 第一次tick立即完成，跳过
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.registry.flush_dirty().await;
                        self.sweep_at(Utc::now()).await;
                    }
                }
            }
            debug!("任务保留清理已停止");
        })
    }
}
