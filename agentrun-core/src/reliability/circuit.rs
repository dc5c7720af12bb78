//! Per-backend circuit breakers.

use crate::error::AiError;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive transient failures that open the circuit
    pub failure_threshold: u32,
    /// How long an open circuit fails fast before allowing a probe
    pub cooldown_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold.max(1);
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown_ms = cooldown.as_millis() as u64;
        self
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

/// Circuit state of one backend identity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    consecutive_failures: u32,
    opened_at: Instant,
    probe_in_flight: bool,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at: Instant::now(),
            probe_in_flight: false,
        }
    }

    fn trip(&mut self, backend: &str) {
        self.state = CircuitState::Open;
        self.opened_at = Instant::now();
        self.probe_in_flight = false;
        tracing::warn!(
            backend,
            failures = self.consecutive_failures,
            state = "open",
            "circuit opened"
        );
    }
}

/// Circuit breakers keyed by backend identity.
///
/// Shared by every run that targets the same backend id. All transitions
/// happen under the map's per-entry lock:
/// `Closed -> Open` after `failure_threshold` consecutive transient failures,
/// `Open -> HalfOpen` once the cooldown has elapsed (granting one probe),
/// `HalfOpen -> Closed` when the probe succeeds, and
/// `HalfOpen -> Open` when it fails, which restarts the cooldown.
#[derive(Debug, Default)]
pub struct CircuitBreakers {
    config: CircuitBreakerConfig,
    breakers: DashMap<String, Breaker>,
}

impl CircuitBreakers {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state for a backend; unknown backends are closed
    pub fn state(&self, backend: &str) -> CircuitState {
        self.breakers
            .get(backend)
            .map_or(CircuitState::Closed, |b| b.state)
    }

    /// Ask permission to contact a backend.
    ///
    /// Fails with [`AiError::CircuitOpen`] while the circuit is open, or while
    /// it is half-open and the single probe slot is taken.
    pub fn acquire(&self, backend: &str) -> Result<CircuitPermit<'_>, AiError> {
        let cooldown = self.config.cooldown();
        let mut breaker = self
            .breakers
            .entry(backend.to_string())
            .or_insert_with(Breaker::new);

        let probe = match breaker.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = breaker.opened_at.elapsed();
                if elapsed < cooldown {
                    return Err(AiError::CircuitOpen {
                        backend: backend.to_string(),
                        retry_after: cooldown - elapsed,
                    });
                }
                breaker.state = CircuitState::HalfOpen;
                breaker.probe_in_flight = true;
                tracing::info!(backend, state = "half_open", "circuit cooldown elapsed, probing");
                true
            }
            CircuitState::HalfOpen => {
                if breaker.probe_in_flight {
                    return Err(AiError::CircuitOpen {
                        backend: backend.to_string(),
                        retry_after: Duration::ZERO,
                    });
                }
                breaker.probe_in_flight = true;
                true
            }
        };

        Ok(CircuitPermit {
            breakers: self,
            backend: backend.to_string(),
            probe,
            settled: false,
        })
    }

    fn on_success(&self, backend: &str, probe: bool) {
        let Some(mut breaker) = self.breakers.get_mut(backend) else {
            return;
        };
        match breaker.state {
            CircuitState::HalfOpen if probe => {
                breaker.state = CircuitState::Closed;
                breaker.consecutive_failures = 0;
                breaker.probe_in_flight = false;
                tracing::info!(backend, state = "closed", "circuit probe succeeded");
            }
            CircuitState::Closed => breaker.consecutive_failures = 0,
            // Late answers from before the circuit opened do not close it
            _ => {}
        }
    }

    fn on_failure(&self, backend: &str, probe: bool) {
        let threshold = self.config.failure_threshold.max(1);
        let Some(mut breaker) = self.breakers.get_mut(backend) else {
            return;
        };
        match breaker.state {
            CircuitState::HalfOpen if probe => {
                tracing::warn!(backend, "circuit probe failed");
                breaker.trip(backend);
            }
            CircuitState::Closed => {
                breaker.consecutive_failures += 1;
                if breaker.consecutive_failures >= threshold {
                    breaker.trip(backend);
                }
            }
            _ => {}
        }
    }

    fn on_abandon(&self, backend: &str, probe: bool) {
        if !probe {
            return;
        }
        if let Some(mut breaker) = self.breakers.get_mut(backend) {
            if breaker.state == CircuitState::HalfOpen {
                breaker.probe_in_flight = false;
                tracing::debug!(backend, "circuit probe abandoned, slot released");
            }
        }
    }

    /// Forget every backend's state
    pub fn reset(&self) {
        self.breakers.clear();
    }
}

/// Permission to make one backend call.
///
/// Settle it with [`CircuitPermit::success`] or [`CircuitPermit::failure`].
/// Dropping an unsettled permit (for example when the run is cancelled)
/// releases a held probe slot without counting as either outcome.
#[must_use = "a permit must be settled with success() or failure()"]
#[derive(Debug)]
pub struct CircuitPermit<'a> {
    breakers: &'a CircuitBreakers,
    backend: String,
    probe: bool,
    settled: bool,
}

impl CircuitPermit<'_> {
    /// Whether this call is the half-open probe
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    /// The backend answered; it is healthy from the circuit's point of view
    pub fn success(mut self) {
        self.settled = true;
        self.breakers.on_success(&self.backend, self.probe);
    }

    /// The call failed transiently
    pub fn failure(mut self) {
        self.settled = true;
        self.breakers.on_failure(&self.backend, self.probe);
    }
}

impl Drop for CircuitPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breakers.on_abandon(&self.backend, self.probe);
        }
    }
}
