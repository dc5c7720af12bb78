//! Reliability layer: retries with backoff behind per-backend circuit breakers.
//!
//! Every attempt asks the backend's circuit for a permit first, so an open
//! circuit fails fast without contacting the backend. Only transient
//! provider failures are retried and only they count against the circuit.

pub mod circuit;
pub mod retry;

pub use circuit::{CircuitBreakerConfig, CircuitBreakers, CircuitPermit, CircuitState};
pub use retry::RetryPolicy;

use crate::backend::{BackendEventStream, ModelBackend};
use crate::error::AiError;
use crate::types::{BackendResponse, RequestEnvelope};
use std::future::Future;
use std::sync::Arc;

/// A successful outcome and the retries it took to get there.
#[derive(Debug)]
pub struct Attempted<T> {
    pub value: T,
    pub retries: u32,
}

/// Executes envelopes against a backend with retry and circuit breaking.
#[derive(Debug, Clone)]
pub struct ReliabilityLayer {
    policy: RetryPolicy,
    breakers: Arc<CircuitBreakers>,
}

impl ReliabilityLayer {
    pub fn new(policy: RetryPolicy, breakers: Arc<CircuitBreakers>) -> Self {
        Self { policy, breakers }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakers> {
        &self.breakers
    }

    /// Execute a non-streaming request.
    ///
    /// Each attempt gets a fresh clone of `envelope`.
    pub async fn execute(
        &self,
        backend: &dyn ModelBackend,
        envelope: &RequestEnvelope,
    ) -> Result<Attempted<BackendResponse>, AiError> {
        let backend_id = backend.info().id.clone();
        self.execute_with_retry(&backend_id, || backend.execute(envelope.clone()))
            .await
    }

    /// Open a stream.
    ///
    /// Only opening the stream is retried. Once events flow, a failure is
    /// terminal for the run because fragments may already be delivered.
    pub async fn open_stream(
        &self,
        backend: &dyn ModelBackend,
        envelope: &RequestEnvelope,
    ) -> Result<Attempted<Box<BackendEventStream>>, AiError> {
        let backend_id = backend.info().id.clone();
        self.execute_with_retry(&backend_id, || backend.execute_stream(envelope.clone()))
            .await
    }

    async fn execute_with_retry<T, F, Fut>(
        &self,
        backend_id: &str,
        mut operation: F,
    ) -> Result<Attempted<T>, AiError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, AiError>>,
    {
        let mut attempt = 0;
        let mut last_error: Option<AiError> = None;

        loop {
            let permit = match self.breakers.acquire(backend_id) {
                Ok(permit) => permit,
                // Refused after the backend was already contacted: the
                // failure that tripped the circuit is the real outcome
                Err(open) => {
                    return Err(last_error.unwrap_or(open));
                }
            };

            match operation().await {
                Ok(value) => {
                    permit.success();
                    return Ok(Attempted {
                        value,
                        retries: attempt,
                    });
                }
                Err(e) => {
                    if e.is_retryable() {
                        permit.failure();
                    } else {
                        permit.success();
                    }

                    if !e.is_retryable()
                        || attempt >= self.policy.max_retries
                        || self.breakers.state(backend_id) == CircuitState::Open
                    {
                        return Err(with_retries(e, attempt));
                    }

                    let retry_after = e.as_provider().and_then(|p| p.retry_after);
                    let delay = self.policy.delay_for(attempt, retry_after);
                    tracing::warn!(
                        backend = backend_id,
                        attempt = attempt + 1,
                        max_retries = self.policy.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "transient backend failure, retrying"
                    );

                    last_error = Some(with_retries(e, attempt));
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn with_retries(error: AiError, retries: u32) -> AiError {
    match error {
        AiError::Provider(p) => AiError::Provider(p.with_retries(retries)),
        other => other,
    }
}
