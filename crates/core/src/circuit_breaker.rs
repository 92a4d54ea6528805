use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{SchedulerError, SchedulerResult};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Circuit is closed - normal operation
    Closed,
    /// Circuit is open - calls are blocked
    Open,
    /// Circuit is half-open - a single trial call is allowed through
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Number of consecutive failures before opening the circuit
    pub failure_threshold: u32,
    /// How long the circuit stays open before a half-open trial
    pub cool_down_ms: u64,
    /// Consecutive failures further apart than this do not accumulate
    pub failure_window_ms: Option<u64>,
    /// Cool-down growth after a failed half-open trial
    pub cool_down_multiplier: f64,
    /// Upper bound for the grown cool-down
    pub max_cool_down_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down_ms: 30_000,
            failure_window_ms: None,
            cool_down_multiplier: 1.0,
            max_cool_down_ms: 300_000, // 5 minutes
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cool_down(&self) -> Duration {
        Duration::from_millis(self.cool_down_ms)
    }

    pub fn validate(&self) -> SchedulerResult<()> {
        if self.failure_threshold == 0 {
            return Err(SchedulerError::Configuration(
                "circuit_breaker.failure_threshold必须大于0".to_string(),
            ));
        }
        if self.cool_down_multiplier < 1.0 {
            return Err(SchedulerError::Configuration(
                "circuit_breaker.cool_down_multiplier不能小于1.0".to_string(),
            ));
        }
        if self.max_cool_down_ms < self.cool_down_ms {
            return Err(SchedulerError::Configuration(
                "circuit_breaker.max_cool_down_ms不能小于cool_down_ms".to_string(),
            ));
        }
        Ok(())
    }
}

/// Point-in-time view of one operation class
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitSnapshot {
    pub operation_class: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    /// Milliseconds since the circuit last opened
    pub open_elapsed_ms: Option<u64>,
    pub current_cool_down_ms: u64,
    pub total_successes: u64,
    pub total_failures: u64,
    pub rejected_calls: u64,
}

/// A state change produced by recording an outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitTransition {
    pub operation_class: String,
    pub from: CircuitState,
    pub to: CircuitState,
}

#[derive(Debug)]
struct ClassCircuit {
    operation_class: String,
    state: CircuitState,
    consecutive_failures: u32,
    last_failure_at: Option<Instant>,
    opened_at: Option<Instant>,
    current_cool_down: Duration,
    trial_in_flight: bool,
    total_successes: u64,
    total_failures: u64,
    rejected_calls: u64,
}

impl ClassCircuit {
    fn new(operation_class: &str, config: &CircuitBreakerConfig) -> Self {
        Self {
            operation_class: operation_class.to_string(),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure_at: None,
            opened_at: None,
            current_cool_down: config.cool_down(),
            trial_in_flight: false,
            total_successes: 0,
            total_failures: 0,
            rejected_calls: 0,
        }
    }

    fn transition(&mut self, to: CircuitState, now: Instant) -> CircuitTransition {
        let from = self.state;
        self.state = to;
        if to == CircuitState::Open {
            self.opened_at = Some(now);
        }
        CircuitTransition {
            operation_class: self.operation_class.clone(),
            from,
            to,
        }
    }

    fn snapshot(&self, now: Instant) -> CircuitSnapshot {
        CircuitSnapshot {
            operation_class: self.operation_class.clone(),
            state: self.state,
            consecutive_failures: self.consecutive_failures,
            open_elapsed_ms: self
                .opened_at
                .filter(|_| self.state != CircuitState::Closed)
                .map(|at| now.saturating_duration_since(at).as_millis() as u64),
            current_cool_down_ms: self.current_cool_down.as_millis() as u64,
            total_successes: self.total_successes,
            total_failures: self.total_failures,
            rejected_calls: self.rejected_calls,
        }
    }
}

fn lock(circuit: &Mutex<ClassCircuit>) -> MutexGuard<'_, ClassCircuit> {
    circuit.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Per-operation-class circuit breaker
///
/// Each class owns an independent state machine guarded by its own mutex, so
/// outcome recording for one class never contends with another class.
pub struct CircuitBreaker {
    config: Arc<CircuitBreakerConfig>,
    classes: Mutex<HashMap<String, Arc<Mutex<ClassCircuit>>>>,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config: Arc::new(config),
            classes: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn circuit(&self, class: &str) -> Arc<Mutex<ClassCircuit>> {
        let mut classes = self
            .classes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        classes
            .entry(class.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ClassCircuit::new(class, &self.config))))
            .clone()
    }

    /// Ask permission to run one call of `class`
    pub fn try_acquire(&self, class: &str) -> SchedulerResult<CircuitPermit> {
        self.try_acquire_at(class, Instant::now())
    }

    pub fn try_acquire_at(&self, class: &str, now: Instant) -> SchedulerResult<CircuitPermit> {
        let circuit = self.circuit(class);
        let trial = {
            let mut state = lock(&circuit);
            match state.state {
                CircuitState::Closed => false,
                CircuitState::Open => {
                    let opened_at = state.opened_at.unwrap_or(now);
                    if now.saturating_duration_since(opened_at) >= state.current_cool_down {
                        state.transition(CircuitState::HalfOpen, now);
                        state.trial_in_flight = true;
                        info!(class = class, "Circuit half-open, admitting trial call");
                        true
                    } else {
                        state.rejected_calls += 1;
                        return Err(SchedulerError::CircuitOpen {
                            class: class.to_string(),
                        });
                    }
                }
                CircuitState::HalfOpen => {
                    if state.trial_in_flight {
                        state.rejected_calls += 1;
                        return Err(SchedulerError::CircuitOpen {
                            class: class.to_string(),
                        });
                    }
                    state.trial_in_flight = true;
                    true
                }
            }
        };

        Ok(CircuitPermit {
            circuit,
            config: Arc::clone(&self.config),
            trial,
            resolved: false,
        })
    }

    /// Current state of a class; unknown classes are closed
    pub fn state(&self, class: &str) -> CircuitState {
        let classes = self
            .classes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        classes
            .get(class)
            .map(|c| lock(c).state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Time left before an open class admits its trial call
    pub fn remaining_cool_down(&self, class: &str) -> Option<Duration> {
        let circuit = self.circuit(class);
        let state = lock(&circuit);
        match (state.state, state.opened_at) {
            (CircuitState::Open, Some(opened_at)) => {
                Some(state.current_cool_down.saturating_sub(opened_at.elapsed()))
            }
            _ => None,
        }
    }

    pub fn snapshot(&self, class: &str) -> Option<CircuitSnapshot> {
        let classes = self
            .classes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        classes.get(class).map(|c| lock(c).snapshot(Instant::now()))
    }

    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let now = Instant::now();
        let classes = self
            .classes
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut snapshots: Vec<_> = classes.values().map(|c| lock(c).snapshot(now)).collect();
        snapshots.sort_by(|a, b| a.operation_class.cmp(&b.operation_class));
        snapshots
    }

    /// Reset a class to closed (for maintenance)
    pub fn reset(&self, class: &str) {
        let circuit = self.circuit(class);
        let mut state = lock(&circuit);
        *state = ClassCircuit::new(class, &self.config);
        debug!(class = class, "Circuit reset");
    }
}

/// Admission granted by [`CircuitBreaker::try_acquire`]
///
/// Dropping a permit without recording an outcome releases a half-open
/// trial slot and leaves the state untouched.
#[must_use = "record the call outcome on the permit"]
pub struct CircuitPermit {
    circuit: Arc<Mutex<ClassCircuit>>,
    config: Arc<CircuitBreakerConfig>,
    trial: bool,
    resolved: bool,
}

impl CircuitPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn record_success(self) -> Option<CircuitTransition> {
        self.record_success_at(Instant::now())
    }

    pub fn record_success_at(mut self, now: Instant) -> Option<CircuitTransition> {
        self.resolved = true;
        let mut state = lock(&self.circuit);
        state.total_successes += 1;

        if self.trial {
            state.trial_in_flight = false;
            if state.state == CircuitState::HalfOpen {
                state.consecutive_failures = 0;
                state.last_failure_at = None;
                state.current_cool_down = self.config.cool_down();
                let transition = state.transition(CircuitState::Closed, now);
                info!(class = %state.operation_class, "Circuit closed after successful trial");
                return Some(transition);
            }
        } else if state.state == CircuitState::Closed {
            state.consecutive_failures = 0;
        }
        None
    }

    pub fn record_failure(self) -> Option<CircuitTransition> {
        self.record_failure_at(Instant::now())
    }

    pub fn record_failure_at(mut self, now: Instant) -> Option<CircuitTransition> {
        self.resolved = true;
        let mut state = lock(&self.circuit);
        state.total_failures += 1;

        if self.trial {
            state.trial_in_flight = false;
            if state.state == CircuitState::HalfOpen {
                let grown = Duration::from_millis(
                    (state.current_cool_down.as_millis() as f64 * self.config.cool_down_multiplier)
                        as u64,
                );
                state.current_cool_down =
                    grown.min(Duration::from_millis(self.config.max_cool_down_ms));
                state.last_failure_at = Some(now);
                let transition = state.transition(CircuitState::Open, now);
                warn!(
                    class = %state.operation_class,
                    cool_down_ms = state.current_cool_down.as_millis() as u64,
                    "Half-open trial failed, circuit re-opened"
                );
                return Some(transition);
            }
            return None;
        }

        if state.state != CircuitState::Closed {
            return None;
        }

        if let (Some(window), Some(last)) = (self.config.failure_window_ms, state.last_failure_at) {
            if now.saturating_duration_since(last) > Duration::from_millis(window) {
                state.consecutive_failures = 0;
            }
        }
        state.consecutive_failures += 1;
        state.last_failure_at = Some(now);

        if state.consecutive_failures >= self.config.failure_threshold {
            state.current_cool_down = self.config.cool_down();
            let transition = state.transition(CircuitState::Open, now);
            warn!(
                class = %state.operation_class,
                failures = state.consecutive_failures,
                "Circuit opened"
            );
            return Some(transition);
        }
        None
    }
}

impl Drop for CircuitPermit {
    fn drop(&mut self) {
        if !self.resolved && self.trial {
            lock(&self.circuit).trial_in_flight = false;
        }
    }
}
