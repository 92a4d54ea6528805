//! 非阻塞指标管道
//!
//! 生产者通过 [`MetricsRecorder::record`] 把事件放进有界缓冲区，缓冲区满时
//! 直接丢弃并计数，永远不会阻塞或返回错误。后台消费者按批次（数量上限或
//! 最长等待）取出事件，维护滚动聚合并推导诊断。
//!
//! 消费者在等待事件时同时监听停止令牌，`stop` 以显式超时等待其退出。

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use jobforge_core::config::MetricsConfig;
use jobforge_domain::{MetricEvent, MetricEventType};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::diagnostics::{self, Diagnostic, DiagnosticInput};
use super::metrics_collector::MetricsCollector;

#[derive(Debug, Default)]
struct RecorderStats {
    recorded: AtomicU64,
    dropped: AtomicU64,
}

/// 可廉价克隆的事件写入端
#[derive(Clone)]
pub struct MetricsRecorder {
    tx: mpsc::Sender<MetricEvent>,
    stats: Arc<RecorderStats>,
}

impl MetricsRecorder {
    /// 尝试写入事件，缓冲区满或管道已关闭时丢弃
    pub fn record(&self, event: MetricEvent) {
        match self.tx.try_send(event) {
            Ok(()) => {
                self.stats.recorded.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub fn recorded(&self) -> u64 {
        self.stats.recorded.load(Ordering::Relaxed)
    }

    /// 单调递增的丢弃计数
    pub fn dropped(&self) -> u64 {
        self.stats.dropped.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ClassReport {
    pub completed: u64,
    pub failed: u64,
    pub error_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MetricsReport {
    pub generated_at: DateTime<Utc>,
    pub events_recorded: u64,
    pub events_dropped: u64,
    pub events_processed: u64,
    pub batches_processed: u64,
    pub drop_rate: f64,
    pub ema_latency_ms: Option<f64>,
    pub ema_quality: Option<f64>,
    pub totals: BTreeMap<String, u64>,
    pub classes: BTreeMap<String, ClassReport>,
    pub queue_depth: usize,
    pub queue_capacity: Option<usize>,
    pub diagnostics: Vec<Diagnostic>,
}

#[derive(Debug, Default, Clone, Copy)]
struct ClassCounts {
    completed: u64,
    failed: u64,
}

#[derive(Debug, Default)]
struct Aggregates {
    ema_latency_ms: Option<f64>,
    ema_quality: Option<f64>,
    totals: HashMap<MetricEventType, u64>,
    classes: HashMap<String, ClassCounts>,
    queue_depth: usize,
    queue_capacity: Option<usize>,
    events_processed: u64,
    batches_processed: u64,
}

fn ema(previous: Option<f64>, sample: f64, alpha: f64) -> f64 {
    match previous {
        Some(previous) => alpha * sample + (1.0 - alpha) * previous,
        None => sample,
    }
}

impl Aggregates {
    fn apply(&mut self, event: &MetricEvent, alpha: f64) {
        *self.totals.entry(event.event_type).or_insert(0) += 1;
        self.events_processed += 1;

        match event.event_type {
            MetricEventType::JobCompleted => {
                if let Some(latency) = event.u64_field("latency_ms") {
                    self.ema_latency_ms = Some(ema(self.ema_latency_ms, latency as f64, alpha));
                }
                if let Some(quality) = event.f64_field("quality") {
                    self.ema_quality = Some(ema(self.ema_quality, quality, alpha));
                }
                if let Some(class) = event.job_type() {
                    self.classes.entry(class.to_string()).or_default().completed += 1;
                }
            }
            // 每次失败的尝试：要么重试，要么最终失败
            MetricEventType::JobFailed | MetricEventType::JobRetried => {
                if let Some(class) = event.job_type() {
                    self.classes.entry(class.to_string()).or_default().failed += 1;
                }
            }
            MetricEventType::ResourceSampled => {
                if let Some(depth) = event.u64_field("queue_depth") {
                    self.queue_depth = depth as usize;
                }
                self.queue_capacity = event.u64_field("queue_capacity").map(|c| c as usize);
            }
            _ => {}
        }
    }
}

struct PipelineShared {
    config: MetricsConfig,
    aggregates: Mutex<Aggregates>,
    collector: MetricsCollector,
    running: AtomicBool,
    stop: CancellationToken,
}

impl PipelineShared {
    fn aggregates(&self) -> std::sync::MutexGuard<'_, Aggregates> {
        self.aggregates
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn process_batch(&self, batch: &[MetricEvent]) {
        if batch.is_empty() {
            return;
        }
        {
            let mut aggregates = self.aggregates();
            for event in batch {
                aggregates.apply(event, self.config.ema_alpha);
            }
            aggregates.batches_processed += 1;
        }
        for event in batch {
            self.collector.record_event(event);
        }
        debug!("指标批次已处理: {} 个事件", batch.len());
    }
}

pub struct MetricsPipeline {
    shared: Arc<PipelineShared>,
    recorder: MetricsRecorder,
    receiver: Mutex<Option<mpsc::Receiver<MetricEvent>>>,
    handle: tokio::sync::Mutex<Option<JoinHandle<()>>>,
    reported_drops: AtomicU64,
}

impl MetricsPipeline {
    pub fn new(config: MetricsConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.buffer_size.max(1));
        Self {
            shared: Arc::new(PipelineShared {
                config,
                aggregates: Mutex::new(Aggregates::default()),
                collector: MetricsCollector::new(),
                running: AtomicBool::new(false),
                stop: CancellationToken::new(),
            }),
            recorder: MetricsRecorder {
                tx,
                stats: Arc::new(RecorderStats::default()),
            },
            receiver: Mutex::new(Some(rx)),
            handle: tokio::sync::Mutex::new(None),
            reported_drops: AtomicU64::new(0),
        }
    }

    pub fn recorder(&self) -> MetricsRecorder {
        self.recorder.clone()
    }

    /// 非阻塞写入，见 [`MetricsRecorder::record`]
    pub fn record(&self, event: MetricEvent) {
        self.recorder.record(event);
    }

    pub fn dropped(&self) -> u64 {
        self.recorder.dropped()
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// 启动后台消费者，重复调用无效果
    pub async fn start(&self) {
        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(mut rx) = receiver else {
            debug!("指标管道已经启动过");
            return;
        };

        self.shared.running.store(true, Ordering::SeqCst);
        let shared = self.shared.clone();
        let handle = tokio::spawn(async move {
            let batch_size = shared.config.batch_size.max(1);
            let batch_timeout = shared.config.batch_timeout();
            let mut batch = Vec::with_capacity(batch_size);

            while !shared.stop.is_cancelled() {
                let deadline = Instant::now() + batch_timeout;
                let mut finished = false;
                while batch.len() < batch_size {
                    tokio::select! {
                        biased;
                        _ = shared.stop.cancelled() => {
                            finished = true;
                            break;
                        }
                        received = tokio::time::timeout_at(deadline, rx.recv()) => match received {
                            Ok(Some(event)) => batch.push(event),
                            Ok(None) => {
                                finished = true;
                                break;
                            }
                            Err(_) => break,
                        },
                    }
                }
                shared.process_batch(&batch);
                batch.clear();
                if finished {
                    break;
                }
            }
            shared.running.store(false, Ordering::SeqCst);

            // 退出前处理缓冲区中剩余的事件
            while let Ok(event) = rx.try_recv() {
                batch.push(event);
                if batch.len() >= batch_size {
                    shared.process_batch(&batch);
                    batch.clear();
                }
            }
            shared.process_batch(&batch);
            debug!("指标消费者已退出");
        });

        *self.handle.lock().await = Some(handle);
        info!(
            "指标管道已启动 (缓冲区: {}, 批大小: {}, 批超时: {}ms)",
            self.shared.config.buffer_size,
            self.shared.config.batch_size,
            self.shared.config.batch_timeout_ms
        );
    }

    /// 停止消费者并在 `join_timeout` 内等待其退出，超时则中止
    pub async fn stop(&self) {
        self.stop_within(self.shared.config.join_timeout()).await;
    }

    /// 同 [`stop`](Self::stop)，等待时间取 `timeout` 与 `join_timeout` 中较小者
    pub async fn stop_within(&self, timeout: Duration) {
        self.shared.stop.cancel();
        let Some(mut handle) = self.handle.lock().await.take() else {
            self.shared.running.store(false, Ordering::SeqCst);
            return;
        };
        let timeout = timeout.min(self.shared.config.join_timeout());
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(Ok(())) => info!("指标管道已停止"),
            Ok(Err(e)) => warn!("指标消费者异常退出: {}", e),
            Err(_) => {
                warn!("指标消费者在 {:?} 内未退出，强制中止", timeout);
                handle.abort();
            }
        }
        self.shared.running.store(false, Ordering::SeqCst);
    }

    /// 生成当前聚合报告
    pub fn report(&self) -> MetricsReport {
        let recorded = self.recorder.recorded();
        let dropped = self.recorder.dropped();

        let previously_reported = self.reported_drops.swap(dropped, Ordering::Relaxed);
        self.shared
            .collector
            .record_dropped(dropped.saturating_sub(previously_reported));

        let aggregates = self.shared.aggregates();
        let classes: BTreeMap<String, ClassReport> = aggregates
            .classes
            .iter()
            .map(|(class, counts)| {
                let samples = counts.completed + counts.failed;
                let error_rate = if samples == 0 {
                    0.0
                } else {
                    counts.failed as f64 / samples as f64
                };
                (
                    class.clone(),
                    ClassReport {
                        completed: counts.completed,
                        failed: counts.failed,
                        error_rate,
                    },
                )
            })
            .collect();

        let input = DiagnosticInput {
            queue_depth: aggregates.queue_depth,
            queue_capacity: aggregates.queue_capacity,
            events_recorded: recorded,
            events_dropped: dropped,
            classes: aggregates
                .classes
                .iter()
                .map(|(class, counts)| (class.clone(), counts.completed, counts.failed))
                .collect(),
            ema_latency_ms: aggregates.ema_latency_ms,
            latency_target_ms: self.shared.config.latency_target_ms,
            min_class_samples: self.shared.config.min_class_samples,
        };

        MetricsReport {
            generated_at: Utc::now(),
            events_recorded: recorded,
            events_dropped: dropped,
            events_processed: aggregates.events_processed,
            batches_processed: aggregates.batches_processed,
            drop_rate: diagnostics::drop_rate(recorded, dropped),
            ema_latency_ms: aggregates.ema_latency_ms,
            ema_quality: aggregates.ema_quality,
            totals: aggregates
                .totals
                .iter()
                .map(|(event_type, count)| (event_type.to_string(), *count))
                .collect(),
            classes,
            queue_depth: aggregates.queue_depth,
            queue_capacity: aggregates.queue_capacity,
            diagnostics: diagnostics::evaluate(&input),
        }
    }
}
