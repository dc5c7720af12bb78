//! Agent definitions and per-run options.

use crate::stream::StreamHandler;
use crate::types::{param, Parameters};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Immutable agent template.
///
/// Built once and reused across any number of runs, possibly concurrently.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentDefinition {
    pub name: String,
    /// System text, routed either to the instructions slot or a leading system entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    /// User message template with `{{name}}` placeholders
    pub template: String,
    pub model: String,
    /// JSON Schema for structured output
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    /// Default parameters under their generic names
    #[serde(default)]
    pub parameters: Parameters,
}

impl AgentDefinition {
    /// Create a new agent definition
    pub fn new(
        name: impl Into<String>,
        model: impl Into<String>,
        template: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            instructions: None,
            template: template.into(),
            model: model.into(),
            output_schema: None,
            parameters: Parameters::new(),
        }
    }

    /// Set the system instructions
    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    /// Request structured output matching `schema`
    pub fn with_output_schema(mut self, schema: serde_json::Value) -> Self {
        self.output_schema = Some(schema);
        self
    }

    /// Set a default parameter by generic name
    pub fn with_parameter(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    /// Set temperature
    pub fn with_temperature(self, temperature: f32) -> Self {
        self.with_parameter(param::TEMPERATURE, serde_json::json!(temperature))
    }

    /// Set max tokens
    pub fn with_max_tokens(self, max_tokens: u32) -> Self {
        self.with_parameter(param::MAX_TOKENS, serde_json::json!(max_tokens))
    }

    /// Set the reproducibility seed
    pub fn with_seed(self, seed: i64) -> Self {
        self.with_parameter(param::SEED, serde_json::json!(seed))
    }
}

/// Free-form run metadata, including the flags the request builder reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RunMetadata {
    /// Route system text to the dedicated instructions slot
    #[serde(default)]
    pub responses_use_instructions: bool,
    /// Reject schemas whose root does not forbid additional properties
    #[serde(default)]
    pub strict_schema: bool,
    /// Trace id propagated to metrics; generated when absent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

/// Per-invocation options. Constructed fresh for every call.
#[derive(Clone, Default)]
pub struct RunOptions {
    pub deterministic: bool,
    pub idempotency_key: Option<String>,
    pub streaming: bool,
    /// Overrides for the definition's default parameters
    pub parameters: Parameters,
    pub metadata: RunMetadata,
    /// Receives canonical streaming callbacks when `streaming` is set
    pub handler: Option<Arc<dyn StreamHandler>>,
    pub cancellation: Option<CancellationToken>,
}

impl RunOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn deterministic(mut self, deterministic: bool) -> Self {
        self.deterministic = deterministic;
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    /// Stream the run, delivering canonical callbacks to `handler`
    pub fn streaming(mut self, handler: Arc<dyn StreamHandler>) -> Self {
        self.streaming = true;
        self.handler = Some(handler);
        self
    }

    /// Override a definition parameter for this run
    pub fn parameter(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }

    pub fn metadata(mut self, metadata: RunMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn responses_use_instructions(mut self, enabled: bool) -> Self {
        self.metadata.responses_use_instructions = enabled;
        self
    }

    pub fn strict_schema(mut self, strict: bool) -> Self {
        self.metadata.strict_schema = strict;
        self
    }

    pub fn trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.metadata.trace_id = Some(trace_id.into());
        self
    }

    pub fn cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }
}

impl fmt::Debug for RunOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RunOptions")
            .field("deterministic", &self.deterministic)
            .field("idempotency_key", &self.idempotency_key)
            .field("streaming", &self.streaming)
            .field("parameters", &self.parameters)
            .field("metadata", &self.metadata)
            .field("handler", &self.handler.is_some())
            .field("cancellation", &self.cancellation.is_some())
            .finish()
    }
}
