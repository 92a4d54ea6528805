use std::collections::VecDeque;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::Utc;
use jobforge_core::config::ResourceMonitorConfig;
use jobforge_domain::{MetricEvent, ResourceSnapshot, UsageSample, UsageSampler, WorkloadProbe};
use sysinfo::System;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::observability::MetricsRecorder;

const STOP_TIMEOUT: Duration = Duration::from_secs(2);

/// 基于sysinfo的主机采样器
///
/// CPU使用率需要两次刷新之间的间隔才有意义，首次读数通常为0。
/// sysinfo不提供GPU读数。
pub struct SysinfoSampler {
    system: Mutex<System>,
}

impl SysinfoSampler {
    pub fn new() -> Self {
        let mut system = System::new();
        system.refresh_cpu();
        system.refresh_memory();
        Self {
            system: Mutex::new(system),
        }
    }
}

impl Default for SysinfoSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl UsageSampler for SysinfoSampler {
    fn sample(&self) -> UsageSample {
        let mut system = self
            .system
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        system.refresh_cpu();
        system.refresh_memory();

        let cpu_percent = system.global_cpu_info().cpu_usage() as f64;
        let total = system.total_memory();
        let memory_percent = if total == 0 {
            0.0
        } else {
            system.used_memory() as f64 / total as f64 * 100.0
        };

        UsageSample {
            cpu_percent: cpu_percent.clamp(0.0, 100.0),
            memory_percent: memory_percent.clamp(0.0, 100.0),
            gpu_percent: None,
        }
    }
}

struct MonitorState {
    latest: RwLock<ResourceSnapshot>,
    history: Mutex<VecDeque<ResourceSnapshot>>,
}

/// 资源监控器
///
/// 按固定周期采样主机资源与调度负载，只保留最新快照和有限的历史。
pub struct ResourceMonitor {
    config: ResourceMonitorConfig,
    sampler: Arc<dyn UsageSampler>,
    probe: Arc<dyn WorkloadProbe>,
    recorder: Option<MetricsRecorder>,
    state: Arc<MonitorState>,
    cancel: CancellationToken,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ResourceMonitor {
    pub fn new(
        config: ResourceMonitorConfig,
        sampler: Arc<dyn UsageSampler>,
        probe: Arc<dyn WorkloadProbe>,
    ) -> Self {
        Self {
            config,
            sampler,
            probe,
            recorder: None,
            state: Arc::new(MonitorState {
                latest: RwLock::new(ResourceSnapshot::empty()),
                history: Mutex::new(VecDeque::new()),
            }),
            cancel: CancellationToken::new(),
            handle: tokio::sync::Mutex::new(None),
        }
    }

    /// 每次采样同时发出ResourceSampled事件
    pub fn with_recorder(mut self, recorder: MetricsRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn config(&self) -> &ResourceMonitorConfig {
        &self.config
    }

    /// 最新快照
    pub fn snapshot(&self) -> ResourceSnapshot {
        self.state
            .latest
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// 历史快照，从旧到新
    pub fn history(&self) -> Vec<ResourceSnapshot> {
        self.state
            .history
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .cloned()
            .collect()
    }

    /// 立即采样一次
    pub fn sample_now(&self) -> ResourceSnapshot {
        Self::collect(
            &self.config,
            self.sampler.as_ref(),
            self.probe.as_ref(),
            self.recorder.as_ref(),
            &self.state,
        )
    }

    fn collect(
        config: &ResourceMonitorConfig,
        sampler: &dyn UsageSampler,
        probe: &dyn WorkloadProbe,
        recorder: Option<&MetricsRecorder>,
        state: &MonitorState,
    ) -> ResourceSnapshot {
        let usage = sampler.sample();
        let snapshot = ResourceSnapshot {
            cpu_percent: usage.cpu_percent,
            memory_percent: usage.memory_percent,
            gpu_percent: usage.gpu_percent,
            queue_depth: probe.queue_depth(),
            active_workers: probe.active_workers(),
            timestamp: Utc::now(),
        };

        if snapshot.cpu_percent >= config.cpu_warning_percent {
            warn!(
                "CPU使用率过高: {:.1}% (阈值: {:.1}%)",
                snapshot.cpu_percent, config.cpu_warning_percent
            );
        }
        if snapshot.memory_percent >= config.memory_warning_percent {
            warn!(
                "内存使用率过高: {:.1}% (阈值: {:.1}%)",
                snapshot.memory_percent, config.memory_warning_percent
            );
        }

        *state
            .latest
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot.clone();
        {
            let mut history = state
                .history
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            history.push_back(snapshot.clone());
            while history.len() > config.history_size.max(1) {
                history.pop_front();
            }
        }

        if let Some(recorder) = recorder {
            recorder.record(MetricEvent::resource_sampled(
                &snapshot,
                probe.queue_capacity(),
            ));
        }

        debug!(
            "资源采样: cpu={:.1}% mem={:.1}% queue={} workers={}",
            snapshot.cpu_percent,
            snapshot.memory_percent,
            snapshot.queue_depth,
            snapshot.active_workers
        );
        snapshot
    }

    /// 启动周期采样，禁用时只做一次采样
    pub async fn start(&self) {
        self.sample_now();
        if !self.config.enabled {
            info!("资源监控已禁用");
            return;
        }

        let mut guard = self.handle.lock().await;
        if guard.is_some() {
            return;
        }

        let config = self.config.clone();
        let sampler = self.sampler.clone();
        let probe = self.probe.clone();
        let recorder = self.recorder.clone();
        let state = self.state.clone();
        let cancel = self.cancel.clone();

        *guard = Some(tokio::spawn(async move {
            let mut ticker = interval(config.sample_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // 第一次tick立即完成，启动时已经采样过
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        Self::collect(&config, sampler.as_ref(), probe.as_ref(), recorder.as_ref(), &state);
                    }
                }
            }
            debug!("资源监控循环已退出");
        }));
        info!("资源监控已启动，采样间隔 {}ms", self.config.sample_interval_ms);
    }

    pub async fn stop(&self) {
        self.stop_within(STOP_TIMEOUT).await;
    }

    /// 停止采样，最多等待 `timeout`
    pub async fn stop_within(&self, timeout: Duration) {
        self.cancel.cancel();
        let Some(mut handle) = self.handle.lock().await.take() else {
            return;
        };
        if tokio::time::timeout(timeout, &mut handle).await.is_err() {
            warn!("资源监控未能按时退出，强制中止");
            handle.abort();
        } else {
            info!("资源监控已停止");
        }
    }
}
