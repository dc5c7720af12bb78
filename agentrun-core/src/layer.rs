//! Layer trait and abstractions.
//!
//! Inspired by OpenDAL's architecture, layers provide a composable way to wrap
//! backends with cross-cutting concerns like logging or per-attempt timeouts.

use crate::backend::ModelBackend;
use crate::error::AiError;
use crate::types::*;
use async_trait::async_trait;
use std::sync::Arc;

/// Layer trait for wrapping backends.
///
/// Each layer wraps an inner backend and returns a new backend with
/// enhanced capabilities.
pub trait Layer<B: ModelBackend> {
    /// The type of the layered backend
    type LayeredBackend: ModelBackend;

    /// Wrap the inner backend with this layer
    fn layer(&self, inner: B) -> Self::LayeredBackend;
}

/// Helper trait for layered backends.
///
/// Provides default forwarding implementations for backend methods.
/// Implementers only need to override the methods they want to intercept.
#[async_trait]
pub trait LayeredBackend: Sized + ModelBackend {
    /// The inner backend type
    type Inner: ModelBackend;

    /// Get a reference to the inner backend
    fn inner(&self) -> &Self::Inner;

    /// Default implementation for info - forwards to inner
    fn layered_info(&self) -> Arc<BackendInfo> {
        self.inner().info()
    }

    /// Default implementation for execute - forwards to inner
    async fn layered_execute(&self, envelope: RequestEnvelope) -> Result<BackendResponse, AiError> {
        self.inner().execute(envelope).await
    }

    /// Default implementation for execute_stream - forwards to inner
    async fn layered_execute_stream(
        &self,
        envelope: RequestEnvelope,
    ) -> Result<Box<crate::backend::BackendEventStream>, AiError> {
        self.inner().execute_stream(envelope).await
    }
}

/// Macro to implement ModelBackend by forwarding to LayeredBackend methods.
///
/// The wrapper type must be generic over its inner backend, as in
/// `impl_layered_backend!(LoggingBackend)` for `LoggingBackend<B>`.
#[macro_export]
macro_rules! impl_layered_backend {
    ($type:ident) => {
        #[async_trait::async_trait]
        impl<B: $crate::backend::ModelBackend> $crate::backend::ModelBackend for $type<B> {
            fn info(&self) -> std::sync::Arc<$crate::types::BackendInfo> {
                $crate::layer::LayeredBackend::layered_info(self)
            }

            async fn execute(
                &self,
                envelope: $crate::types::RequestEnvelope,
            ) -> Result<$crate::types::BackendResponse, $crate::error::AiError> {
                $crate::layer::LayeredBackend::layered_execute(self, envelope).await
            }

            async fn execute_stream(
                &self,
                envelope: $crate::types::RequestEnvelope,
            ) -> Result<Box<$crate::backend::BackendEventStream>, $crate::error::AiError> {
                $crate::layer::LayeredBackend::layered_execute_stream(self, envelope).await
            }
        }
    };
}
