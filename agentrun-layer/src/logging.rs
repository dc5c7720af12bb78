//! Logging layer for backend operations.

use agentrun_core::backend::{BackendEventStream, ModelBackend};
use agentrun_core::error::AiError;
use agentrun_core::impl_layered_backend;
use agentrun_core::layer::{Layer, LayeredBackend};
use agentrun_core::types::*;
use async_trait::async_trait;
use futures::StreamExt;
use std::time::Instant;

/// Logging layer that logs backend operations.
#[derive(Debug, Clone)]
pub struct LoggingLayer {
    prefix: String,
}

impl LoggingLayer {
    /// Create a new logging layer
    pub fn new() -> Self {
        Self {
            prefix: "[agentrun]".to_string(),
        }
    }

    /// Create a logging layer with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }
}

impl Default for LoggingLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: ModelBackend> Layer<B> for LoggingLayer {
    type LayeredBackend = LoggingBackend<B>;

    fn layer(&self, inner: B) -> Self::LayeredBackend {
        LoggingBackend {
            inner,
            prefix: self.prefix.clone(),
        }
    }
}

/// Backend wrapped with logging
#[derive(Debug)]
pub struct LoggingBackend<B> {
    inner: B,
    prefix: String,
}

#[async_trait]
impl<B: ModelBackend> LayeredBackend for LoggingBackend<B> {
    type Inner = B;

    fn inner(&self) -> &Self::Inner {
        &self.inner
    }

    async fn layered_execute(&self, envelope: RequestEnvelope) -> Result<BackendResponse, AiError> {
        let request_id = envelope.request_id.clone();
        tracing::debug!(
            request_id = %request_id,
            model = %envelope.model,
            messages = envelope.input.len(),
            params = envelope.params.len(),
            "{} execute request",
            self.prefix
        );

        let start = Instant::now();
        let result = self.inner.execute(envelope).await;
        let elapsed = start.elapsed();

        match &result {
            Ok(response) => {
                tracing::debug!(
                    request_id = %request_id,
                    response_id = %response.id,
                    tokens = response.usage.map_or(0, |u| u.total_tokens()),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "{} execute success",
                    self.prefix
                );
            }
            Err(e) => {
                tracing::error!(
                    request_id = %request_id,
                    error_class = e.class(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "{} execute error: {}",
                    self.prefix,
                    e
                );
            }
        }

        result
    }

    async fn layered_execute_stream(
        &self,
        envelope: RequestEnvelope,
    ) -> Result<Box<BackendEventStream>, AiError> {
        let request_id = envelope.request_id.clone();
        tracing::debug!(
            request_id = %request_id,
            model = %envelope.model,
            messages = envelope.input.len(),
            "{} execute_stream request",
            self.prefix
        );

        let start = Instant::now();
        let mut inner = match self.inner.execute_stream(envelope).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!(
                    request_id = %request_id,
                    error_class = e.class(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "{} execute_stream error: {}",
                    self.prefix,
                    e
                );
                return Err(e);
            }
        };
        tracing::debug!(
            request_id = %request_id,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "{} execute_stream opened",
            self.prefix
        );

        let prefix = self.prefix.clone();
        let logged = async_stream::stream! {
            let mut deltas = 0usize;
            while let Some(item) = inner.next().await {
                match &item {
                    Ok(BackendEvent::Delta { .. }) => deltas += 1,
                    Err(e) => tracing::error!(
                        request_id = %request_id,
                        deltas,
                        error_class = e.class(),
                        "{} stream error: {}",
                        prefix,
                        e
                    ),
                    Ok(_) => {}
                }
                yield item;
            }
            tracing::debug!(
                request_id = %request_id,
                deltas,
                elapsed_ms = start.elapsed().as_millis() as u64,
                "{} stream finished",
                prefix
            );
        };

        Ok(Box::new(Box::pin(logged)))
    }
}

impl_layered_backend!(LoggingBackend);
