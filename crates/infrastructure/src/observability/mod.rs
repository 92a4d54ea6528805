//! Metrics pipeline, diagnostics and the `metrics` facade mirror

pub mod diagnostics;
pub mod metrics_collector;
pub mod metrics_pipeline;

pub use diagnostics::{Diagnostic, DiagnosticKind};
pub use metrics_collector::MetricsCollector;
pub use metrics_pipeline::{ClassReport, MetricsPipeline, MetricsRecorder, MetricsReport};
