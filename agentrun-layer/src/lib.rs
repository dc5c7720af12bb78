//! # Agentrun Layers
//!
//! Built-in backend layers for Agentrun.
//!
//! Currently implemented layers:
//! - `LoggingLayer`: Logs every backend call and stream with timing information
//! - `TimeoutLayer`: Bounds each attempt, reporting overruns as transient timeouts
//!
//! Retries and circuit breaking are not layers; the runner owns them so
//! retry counts reach results and metrics.
//!
//! ## Usage
//!
//! ```ignore
//! use agentrun_core::AgentRunner;
//! use agentrun_layer::{LoggingLayer, TimeoutLayer};
//!
//! let runner = AgentRunner::builder(backend)
//!     .layer(TimeoutLayer::new(Duration::from_secs(30)))
//!     .layer(LoggingLayer::new())
//!     .finish();
//! ```

pub mod logging;
pub mod timeout;

#[cfg(test)]
mod mock;

// Re-exports
pub use logging::{LoggingBackend, LoggingLayer};
pub use timeout::{TimeoutBackend, TimeoutLayer};
