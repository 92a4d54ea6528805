use serde::Serialize;

/// 队列填充率超过该值视为拥塞
pub const QUEUE_CONGESTION_RATIO: f64 = 0.8;
/// 事件丢弃率超过该值视为事件丢失
pub const EVENT_LOSS_RATIO: f64 = 0.05;
/// 类别错误率超过该值视为该类别失败
pub const CLASS_FAILURE_RATIO: f64 = 0.1;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagnosticKind {
    QueueCongestion { fill_ratio: f64 },
    EventLoss { drop_rate: f64 },
    ClassFailing { class: String, error_rate: f64 },
    SlowPath { latency_ms: f64, target_ms: u64 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Diagnostic {
    #[serde(flatten)]
    pub kind: DiagnosticKind,
    pub message: String,
    pub recommendation: String,
}

/// 计算诊断所需的聚合输入
#[derive(Debug, Clone, Default)]
pub struct DiagnosticInput {
    pub queue_depth: usize,
    pub queue_capacity: Option<usize>,
    pub events_recorded: u64,
    pub events_dropped: u64,
    /// (类别, 成功数, 失败数)
    pub classes: Vec<(String, u64, u64)>,
    pub ema_latency_ms: Option<f64>,
    pub latency_target_ms: u64,
    pub min_class_samples: u64,
}

pub fn drop_rate(recorded: u64, dropped: u64) -> f64 {
    let total = recorded + dropped;
    if total == 0 {
        0.0
    } else {
        dropped as f64 / total as f64
    }
}

/// 根据聚合数据推导诊断结论
pub fn evaluate(input: &DiagnosticInput) -> Vec<Diagnostic> {
    let mut diagnostics = Vec::new();

    if let Some(capacity) = input.queue_capacity.filter(|c| *c > 0) {
        let fill_ratio = input.queue_depth as f64 / capacity as f64;
        if fill_ratio > QUEUE_CONGESTION_RATIO {
            diagnostics.push(Diagnostic {
                kind: DiagnosticKind::QueueCongestion { fill_ratio },
                message: format!(
                    "queue congestion: {}/{} ({:.0}%)",
                    input.queue_depth,
                    capacity,
                    fill_ratio * 100.0
                ),
                recommendation: "提高max_workers或队列容量，或降低提交速率".to_string(),
            });
        }
    }

    let rate = drop_rate(input.events_recorded, input.events_dropped);
    if rate > EVENT_LOSS_RATIO {
        diagnostics.push(Diagnostic {
            kind: DiagnosticKind::EventLoss { drop_rate: rate },
            message: format!("event loss: {:.1}% of metric events dropped", rate * 100.0),
            recommendation: "增大metrics.buffer_size或metrics.batch_size".to_string(),
        });
    }

    for (class, succeeded, failed) in &input.classes {
        let samples = succeeded + failed;
        if samples == 0 || samples < input.min_class_samples {
            continue;
        }
        let error_rate = *failed as f64 / samples as f64;
        if error_rate > CLASS_FAILURE_RATIO {
            diagnostics.push(Diagnostic {
                kind: DiagnosticKind::ClassFailing {
                    class: class.clone(),
                    error_rate,
                },
                message: format!(
                    "class failing: {class} error rate {:.1}% over {samples} attempts",
                    error_rate * 100.0
                ),
                recommendation: format!("检查{class}类任务的执行器与下游依赖"),
            });
        }
    }

    if let Some(latency_ms) = input.ema_latency_ms {
        if input.latency_target_ms > 0 && latency_ms > input.latency_target_ms as f64 {
            diagnostics.push(Diagnostic {
                kind: DiagnosticKind::SlowPath {
                    latency_ms,
                    target_ms: input.latency_target_ms,
                },
                message: format!(
                    "slow path: average latency {latency_ms:.0}ms exceeds target {}ms",
                    input.latency_target_ms
                ),
                recommendation: "增加Worker数量或为长任务设置更低的优先级".to_string(),
            });
        }
    }

    diagnostics
}
