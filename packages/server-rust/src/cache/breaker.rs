//! Three-state circuit breaker guarding the cache backend.
//!
//! All counters and the state live behind one mutex, so concurrent outcomes
//! cannot race past a threshold. Each transition bumps a generation number;
//! outcomes reported by calls admitted under an older generation are ignored,
//! so a slow call that started before the circuit opened cannot close it or
//! extend its open period.

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{info, warn};

use super::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

/// Point-in-time view of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure: Option<Instant>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure: Option<Instant>,
    probes_in_flight: u32,
    generation: u64,
}

impl Inner {
    fn transition(&mut self, to: CircuitState) {
        let from = self.state;
        self.state = to;
        self.generation += 1;
        self.probes_in_flight = 0;
        self.success_count = 0;
        if to == CircuitState::Closed {
            self.failure_count = 0;
        }
        metrics::counter!("tablefence_circuit_transitions_total", "to" => to.as_str()).increment(1);
        match to {
            CircuitState::Open => warn!(
                from = from.as_str(),
                failures = self.failure_count,
                "cache circuit opened"
            ),
            _ => info!(from = from.as_str(), to = to.as_str(), "cache circuit transition"),
        }
    }
}

/// Circuit breaker with consecutive-failure opening and timed half-open probing.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                success_count: 0,
                last_failure: None,
                probes_in_flight: 0,
                generation: 0,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    /// Current state, without applying any pending `open → half_open` transition.
    #[must_use]
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    #[must_use]
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            last_failure: inner.last_failure,
        }
    }

    /// Asks to make one backend call.
    ///
    /// Returns `None` when the call must be short-circuited: the circuit is
    /// open and its timeout has not elapsed, or it is half-open and all probe
    /// slots are taken. An open circuit whose timeout has elapsed moves to
    /// `half_open` here and admits this call as a probe.
    pub fn try_acquire(&self) -> Option<CallPermit<'_>> {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::Open {
            let cooled = match inner.last_failure {
                Some(at) => at.elapsed() >= self.config.open_timeout,
                None => true,
            };
            if !cooled {
                metrics::counter!("tablefence_cache_short_circuits_total").increment(1);
                return None;
            }
            inner.transition(CircuitState::HalfOpen);
        }

        let probe = inner.state == CircuitState::HalfOpen;
        if probe {
            if inner.probes_in_flight >= self.config.half_open_max_probes {
                metrics::counter!("tablefence_cache_short_circuits_total").increment(1);
                return None;
            }
            inner.probes_in_flight += 1;
        }
        Some(CallPermit {
            breaker: self,
            generation: inner.generation,
            probe,
            settled: false,
        })
    }

    fn on_success(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        match inner.state {
            CircuitState::Closed => inner.failure_count = 0,
            CircuitState::HalfOpen => {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    inner.transition(CircuitState::Closed);
                }
            }
            CircuitState::Open => {}
        }
    }

    fn on_failure(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation != generation {
            return;
        }
        match inner.state {
            CircuitState::Closed => {
                inner.failure_count += 1;
                inner.last_failure = Some(Instant::now());
                if inner.failure_count >= self.config.failure_threshold {
                    inner.transition(CircuitState::Open);
                }
            }
            CircuitState::HalfOpen => {
                inner.failure_count += 1;
                inner.last_failure = Some(Instant::now());
                inner.transition(CircuitState::Open);
            }
            CircuitState::Open => {}
        }
    }

    fn on_abandon(&self, generation: u64) {
        let mut inner = self.inner.lock();
        if inner.generation == generation && inner.state == CircuitState::HalfOpen {
            inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
        }
    }
}

/// Admission for one backend call. Report the outcome with
/// [`success`](Self::success) or [`failure`](Self::failure).
///
/// Dropping the permit without reporting (a cancelled call, or a failure that
/// says nothing about backend health) frees its probe slot and counts as
/// neither.
#[must_use = "report the call outcome or drop the permit explicitly"]
pub struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    generation: u64,
    probe: bool,
    settled: bool,
}

impl CallPermit<'_> {
    /// Whether this call is a half-open probe.
    #[must_use]
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.on_success(self.generation);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.on_failure(self.generation);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled && self.probe {
            self.breaker.on_abandon(self.generation);
        }
    }
}
