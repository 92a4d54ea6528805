//! Scripted test doubles for the executor and monitoring ports

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jobforge_core::{SchedulerError, SchedulerResult};
use jobforge_domain::{
    ExecutionContext, JobExecutor, JobId, UsageSample, UsageSampler, WorkloadProbe,
};
use serde_json::json;

/// One scripted response of a [`ScriptedExecutor`]
#[derive(Debug, Clone)]
pub enum Step {
    Succeed(serde_json::Value),
    Fail(SchedulerError),
    /// Sleep, returning early with `Cancelled` when the token fires
    Sleep(Duration),
    /// Sleep without looking at the cancellation token
    Stall(Duration),
}

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub job_id: JobId,
    pub job_type: String,
    pub attempt: u32,
    pub worker_id: String,
}

#[derive(Default)]
struct ExecutorState {
    script: VecDeque<Step>,
    calls: Vec<RecordedCall>,
}

/// Executor that replays a script of outcomes, then falls back to a default step
pub struct ScriptedExecutor {
    name: String,
    state: Mutex<ExecutorState>,
    fallback: Step,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new(name: &str, script: Vec<Step>) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(ExecutorState {
                script: script.into(),
                calls: Vec::new(),
            }),
            fallback: Step::Succeed(json!({"ok": true})),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn always_ok(name: &str) -> Self {
        Self::new(name, Vec::new())
    }

    pub fn always(name: &str, step: Step) -> Self {
        Self::new(name, Vec::new()).with_fallback(step)
    }

    /// Transient failures for the first `times` calls, then success
    pub fn failing_times(name: &str, times: usize) -> Self {
        let script = (0..times)
            .map(|i| Step::Fail(SchedulerError::transient(format!("scripted failure {}", i + 1))))
            .collect();
        Self::new(name, script)
    }

    pub fn with_fallback(mut self, step: Step) -> Self {
        self.fallback = step;
        self
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .calls
            .clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls().len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of concurrent executions observed
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn next_step(&self, ctx: &ExecutionContext) -> Step {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.calls.push(RecordedCall {
            job_id: ctx.job_id,
            job_type: ctx.job_type.clone(),
            attempt: ctx.attempt,
            worker_id: ctx.worker_id.clone(),
        });
        state
            .script
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobExecutor for ScriptedExecutor {
    async fn execute(&self, ctx: ExecutionContext) -> SchedulerResult<serde_json::Value> {
        let step = self.next_step(&ctx);
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::SeqCst);
        let _guard = InFlightGuard(&self.in_flight);

        match step {
            Step::Succeed(value) => Ok(value),
            Step::Fail(error) => Err(error),
            Step::Sleep(duration) => {
                tokio::select! {
                    _ = ctx.cancellation.cancelled() => Err(SchedulerError::Cancelled),
                    _ = tokio::time::sleep(duration) => Ok(json!({"slept_ms": duration.as_millis() as u64})),
                }
            }
            Step::Stall(duration) => {
                tokio::time::sleep(duration).await;
                Ok(json!({"stalled_ms": duration.as_millis() as u64}))
            }
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Usage sampler returning a fixed reading
pub struct FixedUsageSampler {
    sample: UsageSample,
}

impl FixedUsageSampler {
    pub fn new(cpu_percent: f64, memory_percent: f64) -> Self {
        Self {
            sample: UsageSample {
                cpu_percent,
                memory_percent,
                gpu_percent: None,
            },
        }
    }

    pub fn idle() -> Self {
        Self::new(0.0, 0.0)
    }
}

impl UsageSampler for FixedUsageSampler {
    fn sample(&self) -> UsageSample {
        self.sample
    }
}

/// Workload probe with settable values
#[derive(Default)]
pub struct StaticWorkload {
    pub queue_depth: AtomicUsize,
    pub active_workers: AtomicUsize,
    pub capacity: Option<usize>,
}

impl StaticWorkload {
    pub fn new(queue_depth: usize, active_workers: usize, capacity: Option<usize>) -> Self {
        Self {
            queue_depth: AtomicUsize::new(queue_depth),
            active_workers: AtomicUsize::new(active_workers),
            capacity,
        }
    }
}

impl WorkloadProbe for StaticWorkload {
    fn queue_depth(&self) -> usize {
        self.queue_depth.load(Ordering::SeqCst)
    }

    fn queue_capacity(&self) -> Option<usize> {
        self.capacity
    }

    fn active_workers(&self) -> usize {
        self.active_workers.load(Ordering::SeqCst)
    }
}
