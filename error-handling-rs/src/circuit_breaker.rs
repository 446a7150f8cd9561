//! # Circuit Breaker
//!
//! One circuit per external dependency (language-model provider, database,
//! distributed cache), all owned by a single `CircuitBreaker` registry.
//!
//! - **Closed**: calls pass through, consecutive failures inside a rolling
//!   window are counted.
//! - **Open**: calls fail fast with `DependencyUnavailable` and the dependency
//!   is never invoked.
//! - **HalfOpen**: entered once the cool-down has elapsed; exactly one trial
//!   call is admitted. Its success closes the circuit, its failure reopens it
//!   and restarts the cool-down.
//!
//! Each circuit sits behind its own mutex, so callers of different
//! dependencies never contend. Every transition bumps a generation counter;
//! outcomes of calls admitted under an older generation still count towards
//! the totals but can no longer move the state machine. This keeps a burst of
//! concurrent failures from tripping the circuit twice or skipping HalfOpen.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::types::{Error, Result};

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation, requests allowed
    Closed,
    /// Failing, requests blocked
    Open,
    /// Testing recovery, a single trial request allowed
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }

    fn gauge_value(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "CLOSED"),
            CircuitState::Open => write!(f, "OPEN"),
            CircuitState::HalfOpen => write!(f, "HALF-OPEN"),
        }
    }
}

/// Configuration for a single circuit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that trip the circuit
    pub failure_threshold: u32,
    /// Time to keep the circuit open before admitting the trial call
    pub cool_down: Duration,
    /// A failure further apart than this from the previous one restarts the count
    pub failure_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cool_down: Duration::from_secs(60),
            failure_window: Duration::from_secs(60),
        }
    }
}

/// A state change of one dependency's circuit
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitTransition {
    pub dependency: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub at: DateTime<Utc>,
}

/// Health snapshot for a circuit
#[derive(Debug, Clone, Serialize)]
pub struct CircuitHealth {
    pub dependency: String,
    pub state: CircuitState,
    /// Consecutive failures counted in the current closed period
    pub failure_count: u32,
    pub total_successes: u64,
    pub total_failures: u64,
    /// Calls refused without invoking the dependency
    pub rejected_calls: u64,
    /// Transition counts keyed as `"from->to"`
    pub transitions: HashMap<String, u64>,
    pub time_in_state: Duration,
    pub last_failure_age: Option<Duration>,
    /// Remaining cool-down while open
    pub estimated_time_to_retry: Option<Duration>,
}

#[derive(Debug)]
struct CircuitStats {
    state: CircuitState,
    generation: u64,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_state_change: Instant,
    trial_in_flight: bool,
    total_successes: u64,
    total_failures: u64,
    rejected_calls: u64,
    transitions: HashMap<(CircuitState, CircuitState), u64>,
}

impl CircuitStats {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            generation: 0,
            failure_count: 0,
            last_failure: None,
            last_state_change: Instant::now(),
            trial_in_flight: false,
            total_successes: 0,
            total_failures: 0,
            rejected_calls: 0,
            transitions: HashMap::new(),
        }
    }
}

#[derive(Debug)]
struct Circuit {
    dependency: String,
    config: CircuitBreakerConfig,
    stats: Mutex<CircuitStats>,
    events: broadcast::Sender<CircuitTransition>,
}

impl Circuit {
    fn lock(&self) -> MutexGuard<'_, CircuitStats> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn transition(&self, stats: &mut CircuitStats, to: CircuitState) {
        let from = stats.state;
        stats.state = to;
        stats.generation += 1;
        stats.last_state_change = Instant::now();
        *stats.transitions.entry((from, to)).or_insert(0) += 1;

        match to {
            CircuitState::Open => warn!(
                circuit = %self.dependency,
                from = %from,
                failures = stats.failure_count,
                cool_down_ms = self.config.cool_down.as_millis() as u64,
                "Circuit OPEN"
            ),
            CircuitState::HalfOpen => info!(
                circuit = %self.dependency,
                "Circuit HALF-OPEN: admitting trial call"
            ),
            CircuitState::Closed => info!(
                circuit = %self.dependency,
                from = %from,
                "Circuit CLOSED: dependency recovered"
            ),
        }

        counter!(
            "circuit_breaker_transitions_total",
            1,
            "dependency" => self.dependency.clone(),
            "from" => from.as_str(),
            "to" => to.as_str()
        );
        gauge!(
            "circuit_breaker_state",
            to.gauge_value(),
            "dependency" => self.dependency.clone()
        );

        // Nobody listening is fine
        let _ = self.events.send(CircuitTransition {
            dependency: self.dependency.clone(),
            from,
            to,
            at: Utc::now(),
        });
    }

    fn admit(self: &Arc<Self>) -> Result<CallPermit> {
        let mut stats = self.lock();

        let trial = match stats.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = stats.last_state_change.elapsed();
                if elapsed >= self.config.cool_down {
                    self.transition(&mut stats, CircuitState::HalfOpen);
                    stats.trial_in_flight = true;
                    true
                } else {
                    stats.rejected_calls += 1;
                    let remaining = self.config.cool_down - elapsed;
                    debug!(
                        circuit = %self.dependency,
                        remaining_ms = remaining.as_millis() as u64,
                        "Circuit open, request rejected"
                    );
                    counter!("circuit_breaker_rejected_total", 1, "dependency" => self.dependency.clone());
                    return Err(Error::DependencyUnavailable {
                        dependency: self.dependency.clone(),
                        retry_after: Some(remaining),
                    });
                }
            }
            CircuitState::HalfOpen => {
                if stats.trial_in_flight {
                    stats.rejected_calls += 1;
                    counter!("circuit_breaker_rejected_total", 1, "dependency" => self.dependency.clone());
                    return Err(Error::DependencyUnavailable {
                        dependency: self.dependency.clone(),
                        retry_after: None,
                    });
                }
                stats.trial_in_flight = true;
                true
            }
        };

        Ok(CallPermit {
            circuit: Arc::clone(self),
            generation: stats.generation,
            trial,
            settled: false,
        })
    }

    fn settle(&self, generation: u64, trial: bool, success: bool) {
        let mut stats = self.lock();

        if success {
            stats.total_successes += 1;
        } else {
            stats.total_failures += 1;
        }

        if generation != stats.generation {
            // Admitted before the last transition; too late to matter.
            return;
        }

        let now = Instant::now();
        match stats.state {
            CircuitState::Closed => {
                if success {
                    stats.failure_count = 0;
                    return;
                }
                if let Some(last) = stats.last_failure {
                    if now.duration_since(last) > self.config.failure_window {
                        stats.failure_count = 0;
                    }
                }
                stats.failure_count += 1;
                stats.last_failure = Some(now);
                if stats.failure_count >= self.config.failure_threshold {
                    self.transition(&mut stats, CircuitState::Open);
                }
            }
            CircuitState::HalfOpen if trial => {
                stats.trial_in_flight = false;
                if success {
                    stats.failure_count = 0;
                    self.transition(&mut stats, CircuitState::Closed);
                } else {
                    stats.last_failure = Some(now);
                    self.transition(&mut stats, CircuitState::Open);
                }
            }
            _ => {}
        }
    }

    fn health(&self) -> CircuitHealth {
        let stats = self.lock();
        let time_in_state = stats.last_state_change.elapsed();
        let estimated_time_to_retry = match stats.state {
            CircuitState::Open => Some(self.config.cool_down.saturating_sub(time_in_state)),
            _ => None,
        };

        CircuitHealth {
            dependency: self.dependency.clone(),
            state: stats.state,
            failure_count: stats.failure_count,
            total_successes: stats.total_successes,
            total_failures: stats.total_failures,
            rejected_calls: stats.rejected_calls,
            transitions: stats
                .transitions
                .iter()
                .map(|((from, to), count)| (format!("{}->{}", from.as_str(), to.as_str()), *count))
                .collect(),
            time_in_state,
            last_failure_age: stats.last_failure.map(|t| t.elapsed()),
            estimated_time_to_retry,
        }
    }
}

/// Right to make one call through a circuit.
///
/// Settle it with [`CallPermit::success`] or [`CallPermit::failure`]. A trial
/// permit dropped unsettled (the caller was cancelled) counts as a failed
/// trial so the circuit cannot get stuck half-open.
#[derive(Debug)]
pub struct CallPermit {
    circuit: Arc<Circuit>,
    generation: u64,
    trial: bool,
    settled: bool,
}

impl CallPermit {
    /// Whether this permit is the HalfOpen trial call
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.circuit.settle(self.generation, self.trial, true);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.circuit.settle(self.generation, self.trial, false);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled && self.trial {
            warn!(circuit = %self.circuit.dependency, "Trial call abandoned, reopening circuit");
            self.circuit.settle(self.generation, true, false);
        }
    }
}

/// Registry of per-dependency circuits
#[derive(Debug)]
pub struct CircuitBreaker {
    default_config: CircuitBreakerConfig,
    overrides: HashMap<String, CircuitBreakerConfig>,
    circuits: DashMap<String, Arc<Circuit>>,
    events: broadcast::Sender<CircuitTransition>,
}

impl CircuitBreaker {
    /// Creates a registry whose circuits use `default_config` unless overridden
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            default_config,
            overrides: HashMap::new(),
            circuits: DashMap::new(),
            events,
        }
    }

    /// Sets the configuration used for one dependency
    pub fn with_dependency_config<S: Into<String>>(mut self, dependency: S, config: CircuitBreakerConfig) -> Self {
        self.overrides.insert(dependency.into(), config);
        self
    }

    fn circuit(&self, dependency: &str) -> Arc<Circuit> {
        if let Some(circuit) = self.circuits.get(dependency) {
            return Arc::clone(circuit.value());
        }
        let entry = self.circuits.entry(dependency.to_string()).or_insert_with(|| {
            let config = self
                .overrides
                .get(dependency)
                .cloned()
                .unwrap_or_else(|| self.default_config.clone());
            Arc::new(Circuit {
                dependency: dependency.to_string(),
                config,
                stats: Mutex::new(CircuitStats::new()),
                events: self.events.clone(),
            })
        });
        Arc::clone(entry.value())
    }

    /// Makes sure a circuit exists so it shows up in health reports before first use
    pub fn register(&self, dependency: &str) {
        self.circuit(dependency);
    }

    /// Asks for permission to call `dependency`
    pub fn try_acquire(&self, dependency: &str) -> Result<CallPermit> {
        self.circuit(dependency).admit()
    }

    /// Executes an async operation with circuit breaker protection
    pub async fn execute<F, T>(&self, dependency: &str, operation: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let permit = self.try_acquire(dependency)?;
        match operation.await {
            Ok(value) => {
                permit.success();
                Ok(value)
            }
            Err(err) => {
                permit.failure();
                Err(err)
            }
        }
    }

    /// Gets the current state of a circuit
    pub fn state(&self, dependency: &str) -> CircuitState {
        self.circuits
            .get(dependency)
            .map(|circuit| circuit.lock().state)
            .unwrap_or(CircuitState::Closed)
    }

    /// Gets health metrics for a circuit
    pub fn health(&self, dependency: &str) -> CircuitHealth {
        self.circuit(dependency).health()
    }

    /// Gets health metrics for all circuits, ordered by dependency name
    pub fn all_health(&self) -> Vec<CircuitHealth> {
        let mut health: Vec<CircuitHealth> = self.circuits.iter().map(|c| c.value().health()).collect();
        health.sort_by(|a, b| a.dependency.cmp(&b.dependency));
        health
    }

    /// Forces a circuit back to closed
    pub fn reset(&self, dependency: &str) {
        let circuit = self.circuit(dependency);
        let mut stats = circuit.lock();
        stats.failure_count = 0;
        stats.trial_in_flight = false;
        if stats.state != CircuitState::Closed {
            circuit.transition(&mut stats, CircuitState::Closed);
        }
        info!(circuit = %dependency, "Circuit manually reset to CLOSED state");
    }

    /// Subscribes to state transitions of every circuit
    pub fn subscribe(&self) -> broadcast::Receiver<CircuitTransition> {
        self.events.subscribe()
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
