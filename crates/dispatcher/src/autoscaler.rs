//! 定时扩缩容
//!
//! 扩容条件：利用率低于上水位、队列有积压且未达上限。
//! 缩容条件：利用率低于下水位且队列为空，并持续 `scale_down_window`。
//! 两个水位之间不做调整。

use std::sync::Arc;
use std::time::Instant;

use jobforge_core::config::AutoscaleConfig;
use jobforge_domain::{ResourceSnapshot, WorkloadProbe};
use jobforge_infrastructure::resource_monitor::ResourceMonitor;
use jobforge_worker::WorkerPool;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleDecision {
    Up(usize),
    Down(usize),
    Hold,
}

pub struct Autoscaler {
    config: AutoscaleConfig,
    min_workers: usize,
    max_workers: usize,
    idle_since: Option<Instant>,
}

impl Autoscaler {
    pub fn new(config: AutoscaleConfig, min_workers: usize, max_workers: usize) -> Self {
        Self {
            config,
            min_workers,
            max_workers: max_workers.max(min_workers),
            idle_since: None,
        }
    }

    pub fn decide(&mut self, snapshot: &ResourceSnapshot, current: usize, now: Instant) -> ScaleDecision {
        let utilization = snapshot.utilization();

        if utilization < self.config.high_watermark
            && snapshot.queue_depth > 0
            && current < self.max_workers
        {
            self.idle_since = None;
            return ScaleDecision::Up((current + self.config.step).min(self.max_workers));
        }

        if utilization < self.config.low_watermark
            && snapshot.queue_depth == 0
            && current > self.min_workers
        {
            let idle_since = *self.idle_since.get_or_insert(now);
            if now.duration_since(idle_since) >= self.config.scale_down_window() {
                // 下一次缩容需要重新积累一个完整窗口
                self.idle_since = Some(now);
                return ScaleDecision::Down(
                    current.saturating_sub(self.config.step).max(self.min_workers),
                );
            }
            return ScaleDecision::Hold;
        }

        self.idle_since = None;
        ScaleDecision::Hold
    }

    /// 启动定时循环，直到 `shutdown` 被取消
    pub fn spawn(
        mut self,
        pool: Arc<WorkerPool>,
        monitor: Arc<ResourceMonitor>,
        workload: Arc<dyn WorkloadProbe>,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let interval = self.config.interval();
        tokio::spawn(async move {
            info!(
                "自动扩缩容已启动 (间隔: {:?}, 水位: {}/{})",
                interval, self.config.low_watermark, self.config.high_watermark
            );
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let mut snapshot = monitor.snapshot();
                snapshot.queue_depth = workload.queue_depth();
                let current = pool.size();
                match self.decide(&snapshot, current, Instant::now()) {
                    ScaleDecision::Up(target) | ScaleDecision::Down(target) => {
                        debug!(
                            "扩缩容决策: {} -> {} (利用率: {:.1}%, 队列深度: {})",
                            current,
                            target,
                            snapshot.utilization(),
                            snapshot.queue_depth
                        );
                        pool.scale_to(target).await;
                    }
                    ScaleDecision::Hold => {}
                }
            }
            debug!("自动扩缩容已停止");
        })
    }
}
