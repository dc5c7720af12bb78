//! Process-wide mutable state shared by runs.

use crate::config::RunnerConfig;
use crate::idempotency::{IdempotencyConfig, IdempotencyManager};
use crate::reliability::{CircuitBreakerConfig, CircuitBreakers};
use std::sync::Arc;

/// Circuit breakers and idempotency records.
///
/// Runners built with the same context share both, so runs against one
/// backend identity see one circuit and one idempotency table. State is
/// held in memory only and lost on restart.
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    breakers: Arc<CircuitBreakers>,
    idempotency: Arc<IdempotencyManager>,
}

impl ExecutionContext {
    pub fn new(circuit: CircuitBreakerConfig, idempotency: IdempotencyConfig) -> Self {
        Self {
            breakers: Arc::new(CircuitBreakers::new(circuit)),
            idempotency: Arc::new(IdempotencyManager::new(idempotency)),
        }
    }

    pub fn from_config(config: &RunnerConfig) -> Self {
        Self::new(config.circuit.clone(), config.idempotency.clone())
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    pub fn idempotency(&self) -> &IdempotencyManager {
        &self.idempotency
    }

    /// Clear circuit and idempotency state
    pub fn reset(&self) {
        self.breakers.reset();
        self.idempotency.reset();
        tracing::debug!("execution context reset");
    }
}
