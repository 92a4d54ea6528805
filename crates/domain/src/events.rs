//! 指标事件
//!
//! 调度器与Worker生命周期中产生的事件，由指标管道异步消费；
//! 事件在负载高时可以被丢弃，丢弃数量会被计数。

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::entities::Job;
use crate::value_objects::ResourceSnapshot;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum MetricEventType {
    JobSubmitted,
    JobStarted,
    JobCompleted,
    JobFailed,
    JobRetried,
    JobCancelled,
    JobTimedOut,
    CircuitRejected,
    CircuitOpened,
    WorkersScaled,
    ResourceSampled,
}

impl MetricEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricEventType::JobSubmitted => "JobSubmitted",
            MetricEventType::JobStarted => "JobStarted",
            MetricEventType::JobCompleted => "JobCompleted",
            MetricEventType::JobFailed => "JobFailed",
            MetricEventType::JobRetried => "JobRetried",
            MetricEventType::JobCancelled => "JobCancelled",
            MetricEventType::JobTimedOut => "JobTimedOut",
            MetricEventType::CircuitRejected => "CircuitRejected",
            MetricEventType::CircuitOpened => "CircuitOpened",
            MetricEventType::WorkersScaled => "WorkersScaled",
            MetricEventType::ResourceSampled => "ResourceSampled",
        }
    }
}

impl fmt::Display for MetricEventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricEvent {
    pub event_type: MetricEventType,
    pub timestamp: DateTime<Utc>,
    pub fields: Map<String, Value>,
}

impl MetricEvent {
    pub fn new(event_type: MetricEventType) -> Self {
        Self {
            event_type,
            timestamp: Utc::now(),
            fields: Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.fields.insert(key.to_string(), value.into());
        self
    }

    /// 以任务为主体的事件，带上任务ID和类别
    pub fn for_job(event_type: MetricEventType, job: &Job) -> Self {
        Self::new(event_type)
            .with_field("job_id", job.id.to_string())
            .with_field("job_type", job.job_type.clone())
            .with_field("tier", job.tier.as_str())
            .with_field("attempt", job.attempt_count)
    }

    pub fn job_completed(job: &Job) -> Self {
        let mut event = Self::for_job(MetricEventType::JobCompleted, job);
        if let Some(latency) = job.latency() {
            event = event.with_field("latency_ms", latency.num_milliseconds().max(0) as u64);
        }
        if let Some(quality) = job
            .result
            .as_ref()
            .and_then(|r| r.get("quality"))
            .and_then(Value::as_f64)
        {
            event = event.with_field("quality", quality);
        }
        event
    }

    pub fn resource_sampled(snapshot: &ResourceSnapshot, queue_capacity: Option<usize>) -> Self {
        let mut event = Self::new(MetricEventType::ResourceSampled)
            .with_field("cpu_percent", snapshot.cpu_percent)
            .with_field("memory_percent", snapshot.memory_percent)
            .with_field("queue_depth", snapshot.queue_depth as u64)
            .with_field("active_workers", snapshot.active_workers as u64);
        if let Some(gpu) = snapshot.gpu_percent {
            event = event.with_field("gpu_percent", gpu);
        }
        if let Some(capacity) = queue_capacity {
            event = event.with_field("queue_capacity", capacity as u64);
        }
        event
    }

    pub fn job_type(&self) -> Option<&str> {
        self.fields.get("job_type").and_then(Value::as_str)
    }

    pub fn u64_field(&self, key: &str) -> Option<u64> {
        self.fields.get(key).and_then(Value::as_u64)
    }

    pub fn f64_field(&self, key: &str) -> Option<f64> {
        self.fields.get(key).and_then(Value::as_f64)
    }
}
