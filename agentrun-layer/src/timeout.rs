//! Per-attempt deadlines.

use agentrun_core::backend::{BackendEventStream, ModelBackend};
use agentrun_core::error::AiError;
use agentrun_core::impl_layered_backend;
use agentrun_core::layer::{Layer, LayeredBackend};
use agentrun_core::types::*;
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Duration;

/// Bounds every backend attempt.
///
/// An overrun surfaces as a transient [`ErrorKind::Timeout`](agentrun_core::ErrorKind::Timeout)
/// provider error, so the runner retries it like any other timeout. Put this
/// layer innermost so each retry gets a fresh deadline.
#[derive(Debug, Clone)]
pub struct TimeoutLayer {
    timeout: Duration,
    idle_timeout: Option<Duration>,
}

impl TimeoutLayer {
    /// Deadline for a call, or for opening a stream
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            idle_timeout: None,
        }
    }

    /// Maximum gap between two stream events
    pub fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = Some(idle_timeout);
        self
    }
}

impl<B: ModelBackend> Layer<B> for TimeoutLayer {
    type LayeredBackend = TimeoutBackend<B>;

    fn layer(&self, inner: B) -> Self::LayeredBackend {
        TimeoutBackend {
            inner,
            timeout: self.timeout,
            idle_timeout: self.idle_timeout,
        }
    }
}

/// Backend wrapped with deadlines
#[derive(Debug)]
pub struct TimeoutBackend<B> {
    inner: B,
    timeout: Duration,
    idle_timeout: Option<Duration>,
}

#[async_trait]
impl<B: ModelBackend> LayeredBackend for TimeoutBackend<B> {
    type Inner = B;

    fn inner(&self) -> &Self::Inner {
        &self.inner
    }

    async fn layered_execute(&self, envelope: RequestEnvelope) -> Result<BackendResponse, AiError> {
        tokio::time::timeout(self.timeout, self.inner.execute(envelope))
            .await
            .map_err(|_| AiError::timeout(format!("backend call exceeded {:?}", self.timeout)))?
    }

    async fn layered_execute_stream(
        &self,
        envelope: RequestEnvelope,
    ) -> Result<Box<BackendEventStream>, AiError> {
        let mut inner = tokio::time::timeout(self.timeout, self.inner.execute_stream(envelope))
            .await
            .map_err(|_| AiError::timeout(format!("opening stream exceeded {:?}", self.timeout)))??;

        let Some(idle) = self.idle_timeout else {
            return Ok(inner);
        };

        let bounded = async_stream::stream! {
            loop {
                match tokio::time::timeout(idle, inner.next()).await {
                    Ok(Some(item)) => yield item,
                    Ok(None) => break,
                    Err(_) => {
                        yield Err(AiError::timeout(format!("stream idle for {idle:?}")));
                        break;
                    }
                }
            }
        };
        Ok(Box::new(Box::pin(bounded)))
    }
}

impl_layered_backend!(TimeoutBackend);
