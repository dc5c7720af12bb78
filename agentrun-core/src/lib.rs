//! # Agentrun Core
//!
//! Core abstractions and the reliable agent runner.
//!
//! This crate turns declarative agent definitions into backend requests that
//! honor each model's capabilities, then executes them with retries, circuit
//! breaking, idempotency and normalized streaming. Backends and layers plug
//! in through the [`ModelBackend`] and [`Layer`] traits.

pub mod agent;
pub mod backend;
pub mod capability;
pub mod config;
pub mod context;
pub mod error;
pub mod idempotency;
pub mod layer;
pub mod metrics;
pub mod reliability;
pub mod request;
pub mod runtime;
pub mod schema;
pub mod strategy;
pub mod stream;
pub mod template;
pub mod types;

#[cfg(test)]
mod test_support;

// Re-exports
pub use agent::{AgentDefinition, RunMetadata, RunOptions};
pub use backend::{BackendEventStream, ModelBackend};
pub use capability::{CapabilityPolicy, ModelCapabilities, ParamRule, ParamSupport, StructuredOutput};
pub use config::RunnerConfig;
pub use context::ExecutionContext;
pub use error::{AiError, ErrorKind, ProviderError, SchemaViolation};
pub use idempotency::{IdempotencyConfig, IdempotencyManager, RecordStatus};
pub use layer::{Layer, LayeredBackend};
pub use metrics::{
    InMemoryMetricsSink, MetricsSink, ModelPrice, NoopMetricsSink, PriceTable, PricingSource,
    RunMetrics, TracingMetricsSink,
};
pub use reliability::{CircuitBreakerConfig, CircuitBreakers, CircuitState, RetryPolicy};
pub use request::RequestBuilder;
pub use runtime::{AgentRunner, AgentRunnerBuilder};
pub use strategy::{JsonModeStrategy, JsonOutputStrategy, JsonSchemaStrategy, PromptOnlyStrategy};
pub use stream::{ChannelStreamHandler, StreamEvent, StreamEvents, StreamHandler, StreamNormalizer};
pub use types::*;

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AiError>;
