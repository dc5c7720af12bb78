//! Runtime layer for Agentrun.
//!
//! The runtime sits between callers holding agent definitions and the
//! backend interface. It is responsible for:
//! - Building backend-neutral envelopes through the capability policy
//! - Deduplicating runs by idempotency key
//! - Executing under retry and circuit breaking
//! - Normalizing streams and validating structured output
//! - Emitting one metrics record per run

pub mod runner;

pub use runner::{derive_idempotency_key, AgentRunner, AgentRunnerBuilder};
