//! Model backend trait and core abstractions.

use crate::error::AiError;
use crate::types::*;
use async_trait::async_trait;
use futures::Stream;
use std::fmt::Debug;
use std::sync::Arc;

/// Stream type alias for backend-native streaming events
pub type BackendEventStream = dyn Stream<Item = Result<BackendEvent, AiError>> + Send + Unpin;

/// Core trait for model backends.
///
/// Implementations execute a request envelope against one upstream. They
/// must classify failures through [`crate::error::ErrorKind`] so the
/// reliability layer can tell transient failures from permanent ones.
/// Higher-level concerns (retries, idempotency, validation) live in the
/// runner, not here.
#[async_trait]
pub trait ModelBackend: Send + Sync + Debug + 'static {
    /// Get backend information
    fn info(&self) -> Arc<BackendInfo>;

    /// Execute a request and wait for the complete response
    async fn execute(&self, envelope: RequestEnvelope) -> Result<BackendResponse, AiError>;

    /// Execute a request as a stream of events
    ///
    /// An `Err` here means the stream could not be opened; failures after
    /// that arrive as `Err` items in the stream.
    async fn execute_stream(
        &self,
        envelope: RequestEnvelope,
    ) -> Result<Box<BackendEventStream>, AiError>;
}

#[async_trait]
impl<B: ModelBackend + ?Sized> ModelBackend for Arc<B> {
    fn info(&self) -> Arc<BackendInfo> {
        (**self).info()
    }

    async fn execute(&self, envelope: RequestEnvelope) -> Result<BackendResponse, AiError> {
        (**self).execute(envelope).await
    }

    async fn execute_stream(
        &self,
        envelope: RequestEnvelope,
    ) -> Result<Box<BackendEventStream>, AiError> {
        (**self).execute_stream(envelope).await
    }
}
