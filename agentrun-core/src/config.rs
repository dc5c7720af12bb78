//! Runner configuration.

use crate::idempotency::IdempotencyConfig;
use crate::reliability::{CircuitBreakerConfig, RetryPolicy};
use serde::{Deserialize, Serialize};

/// Configuration of an [`AgentRunner`](crate::runtime::AgentRunner).
///
/// Every field has a default, so partial documents deserialize.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub retry: RetryPolicy,
    pub circuit: CircuitBreakerConfig,
    pub idempotency: IdempotencyConfig,
    /// Derive an idempotency key for deterministic runs that carry none
    pub derive_idempotency_keys: bool,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            circuit: CircuitBreakerConfig::default(),
            idempotency: IdempotencyConfig::default(),
            derive_idempotency_keys: true,
        }
    }
}

impl RunnerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_circuit(mut self, circuit: CircuitBreakerConfig) -> Self {
        self.circuit = circuit;
        self
    }

    pub fn with_idempotency(mut self, idempotency: IdempotencyConfig) -> Self {
        self.idempotency = idempotency;
        self
    }

    pub fn with_derived_idempotency_keys(mut self, enabled: bool) -> Self {
        self.derive_idempotency_keys = enabled;
        self
    }
}
