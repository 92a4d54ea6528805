//! Mirror of the in-process aggregates into the `metrics` facade
//!
//! Nothing is exported unless the binary installs a recorder
//! (e.g. the Prometheus exporter); without one every call is a no-op.

use jobforge_domain::{MetricEvent, MetricEventType};
use metrics::{counter, gauge, histogram, Counter, Gauge, Histogram};

/// Metrics collector for the batch engine
pub struct MetricsCollector {
    jobs_submitted_total: Counter,
    jobs_completed_total: Counter,
    jobs_failed_total: Counter,
    jobs_retried_total: Counter,
    jobs_cancelled_total: Counter,
    jobs_timed_out_total: Counter,
    circuit_rejections_total: Counter,
    circuit_opened_total: Counter,
    job_latency: Histogram,
    dropped_events_total: Counter,

    queue_depth: Gauge,
    active_workers: Gauge,
    cpu_percent: Gauge,
    memory_percent: Gauge,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsCollector {
    pub fn new() -> Self {
        Self {
            jobs_submitted_total: counter!("jobforge_jobs_submitted_total"),
            jobs_completed_total: counter!("jobforge_jobs_completed_total"),
            jobs_failed_total: counter!("jobforge_jobs_failed_total"),
            jobs_retried_total: counter!("jobforge_jobs_retried_total"),
            jobs_cancelled_total: counter!("jobforge_jobs_cancelled_total"),
            jobs_timed_out_total: counter!("jobforge_jobs_timed_out_total"),
            circuit_rejections_total: counter!("jobforge_circuit_rejections_total"),
            circuit_opened_total: counter!("jobforge_circuit_opened_total"),
            job_latency: histogram!("jobforge_job_latency_seconds"),
            dropped_events_total: counter!("jobforge_metric_events_dropped_total"),
            queue_depth: gauge!("jobforge_queue_depth"),
            active_workers: gauge!("jobforge_active_workers"),
            cpu_percent: gauge!("jobforge_cpu_percent"),
            memory_percent: gauge!("jobforge_memory_percent"),
        }
    }

    /// Record a consumed lifecycle event
    pub fn record_event(&self, event: &MetricEvent) {
        match event.event_type {
            MetricEventType::JobSubmitted => self.jobs_submitted_total.increment(1),
            MetricEventType::JobStarted => {}
            MetricEventType::JobCompleted => {
                self.jobs_completed_total.increment(1);
                if let Some(latency_ms) = event.u64_field("latency_ms") {
                    self.job_latency.record(latency_ms as f64 / 1000.0);
                }
                if let Some(job_type) = event.job_type() {
                    counter!("jobforge_class_completed_total", "job_type" => job_type.to_string())
                        .increment(1);
                }
            }
            MetricEventType::JobFailed => {
                self.jobs_failed_total.increment(1);
                if let Some(job_type) = event.job_type() {
                    counter!("jobforge_class_failed_total", "job_type" => job_type.to_string())
                        .increment(1);
                }
            }
            MetricEventType::JobRetried => self.jobs_retried_total.increment(1),
            MetricEventType::JobCancelled => self.jobs_cancelled_total.increment(1),
            MetricEventType::JobTimedOut => self.jobs_timed_out_total.increment(1),
            MetricEventType::CircuitRejected => self.circuit_rejections_total.increment(1),
            MetricEventType::CircuitOpened => self.circuit_opened_total.increment(1),
            MetricEventType::WorkersScaled => {
                if let Some(workers) = event.u64_field("to") {
                    self.active_workers.set(workers as f64);
                }
            }
            MetricEventType::ResourceSampled => {
                if let Some(depth) = event.u64_field("queue_depth") {
                    self.queue_depth.set(depth as f64);
                }
                if let Some(workers) = event.u64_field("active_workers") {
                    self.active_workers.set(workers as f64);
                }
                if let Some(cpu) = event.f64_field("cpu_percent") {
                    self.cpu_percent.set(cpu);
                }
                if let Some(memory) = event.f64_field("memory_percent") {
                    self.memory_percent.set(memory);
                }
            }
        }
    }

    /// Record events lost to a full buffer
    pub fn record_dropped(&self, count: u64) {
        if count > 0 {
            self.dropped_events_total.increment(count);
        }
    }
}
