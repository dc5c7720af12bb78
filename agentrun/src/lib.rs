//! # Agentrun
//!
//! Reliable execution of declarative LLM agents.
//!
//! An [`AgentDefinition`] names a model, a prompt template and optionally an
//! output schema. The [`AgentRunner`] renders it into a request the target
//! model actually accepts, then executes it with retries, per-backend circuit
//! breaking, idempotency and normalized streaming.
//!
//! ## Quick Start
//!
//! ```toml
//! [dependencies]
//! agentrun = { version = "0.1", features = ["openai", "layers"] }
//! ```
//!
//! ```ignore
//! use agentrun::prelude::*;
//! use std::time::Duration;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let backend = OpenAiBackend::builder().api_key("your-api-key").build()?;
//!
//! let runner = AgentRunner::builder(backend)
//!     .layer(TimeoutLayer::new(Duration::from_secs(30)))
//!     .layer(LoggingLayer::new())
//!     .metrics(TracingMetricsSink)
//!     .finish();
//!
//! let agent = AgentDefinition::new("explainer", "gpt-4o-mini", "Explain {{topic}} briefly.");
//! let mut vars = Variables::new();
//! vars.insert("topic".into(), "ownership in Rust".into());
//!
//! let result = runner.run(&agent, &vars, RunOptions::new()).await?;
//! println!("{}", result.content.to_text());
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `default`: `openai` and `layers`
//! - `openai`: OpenAI and OpenAI-compatible backends
//! - `layers`: Built-in layers (logging, timeout)
//! - `schema`: Output schemas derived from Rust types via schemars
//! - `full`: All features enabled

// Re-export core types and traits
pub use agentrun_core::*;

// Re-export backends under `provider` module
#[cfg(feature = "agentrun-provider")]
pub mod provider {
    //! Model backend implementations.
    pub use agentrun_provider::*;
}

// Re-export layers under `layer` module
#[cfg(feature = "agentrun-layer")]
pub mod layer {
    //! Built-in backend layers.
    pub use agentrun_layer::*;
}

// Re-export schemars when schema feature is enabled
#[cfg(feature = "schema")]
pub mod schemars {
    pub use ::schemars::*;
}

/// JSON Schema of `T`, ready for [`AgentDefinition::with_output_schema`]
#[cfg(feature = "schema")]
pub fn schema_of<T: ::schemars::JsonSchema>() -> serde_json::Value {
    ::schemars::schema_for!(T).to_value()
}

/// Prelude module for convenient imports
pub mod prelude {
    //! Prelude module containing the most commonly used types and traits.
    //!
    //! ```
    //! use agentrun::prelude::*;
    //! ```

    pub use crate::{
        AgentDefinition, AgentRunner, AiError, ChannelStreamHandler, Content, ExecutionResult,
        Layer, Message, ModelBackend, Result, RetryPolicy, RunOptions, RunnerConfig,
        StreamHandler, TracingMetricsSink, Usage, Variables,
    };

    #[cfg(feature = "agentrun-provider")]
    pub use crate::provider::*;

    #[cfg(feature = "agentrun-layer")]
    pub use crate::layer::*;

    #[cfg(feature = "schema")]
    pub use crate::schema_of;
}
