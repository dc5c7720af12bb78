//! Core types shared by the request builder, backends and the runner.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Generic parameter names understood by the capability policy.
pub mod param {
    pub const TEMPERATURE: &str = "temperature";
    pub const TOP_P: &str = "top_p";
    pub const MAX_TOKENS: &str = "max_tokens";
    pub const SEED: &str = "seed";
    pub const STOP: &str = "stop";
    pub const FREQUENCY_PENALTY: &str = "frequency_penalty";
    pub const PRESENCE_PENALTY: &str = "presence_penalty";
    pub const REASONING_EFFORT: &str = "reasoning_effort";
}

/// Request parameters keyed by name.
///
/// Ordered so that serialization (and anything hashed from it) is stable.
pub type Parameters = BTreeMap<String, serde_json::Value>;

/// Template variable bindings.
pub type Variables = BTreeMap<String, serde_json::Value>;

/// Message role
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One entry of the input sequence sent to a backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    /// Create a new user message with text
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: text.into(),
        }
    }

    /// Create a new assistant message with text
    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: text.into(),
        }
    }

    /// Create a new system message with text
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: text.into(),
        }
    }
}

/// Token usage statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    /// Input tokens served from the upstream prompt cache
    pub cached_tokens: u32,
    /// Set when the counts were estimated locally rather than reported
    #[serde(default)]
    pub estimated: bool,
}

impl Usage {
    pub fn new(input_tokens: u32, output_tokens: u32) -> Self {
        Self {
            input_tokens,
            output_tokens,
            ..Default::default()
        }
    }

    pub fn with_cached_tokens(mut self, cached_tokens: u32) -> Self {
        self.cached_tokens = cached_tokens;
        self
    }

    pub fn total_tokens(&self) -> u32 {
        self.input_tokens.saturating_add(self.output_tokens)
    }
}

/// Finish reason
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    Other(String),
}

/// A tool invocation requested by the model.
///
/// The runner reports these; it never executes them.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolInvocation {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
}

/// Response format for backends that support output constraints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponseFormat {
    /// Plain text response
    Text,
    /// JSON object response (basic JSON mode, no schema enforcement upstream)
    JsonObject,
    /// JSON Schema response (schema enforced upstream)
    JsonSchema {
        name: String,
        schema: serde_json::Value,
        strict: bool,
    },
}

/// Structured output contract attached to an envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchemaDirective {
    pub name: String,
    /// Schema with `additionalProperties: false` at the root
    pub schema: serde_json::Value,
    pub strict: bool,
}

/// Backend-neutral request produced by the request builder.
///
/// Owned by a single run. The reliability layer clones it for every
/// attempt; the original is never mutated after it is built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestEnvelope {
    pub request_id: String,
    pub model: String,
    /// Dedicated instructions slot, used instead of a leading system entry
    #[serde(skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
    pub input: Vec<Message>,
    /// Final parameters, already filtered, clamped and renamed for `model`
    pub params: Parameters,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub schema: Option<SchemaDirective>,
    pub stream: bool,
}

impl RequestEnvelope {
    /// Create an envelope with just a model and input
    pub fn new(model: impl Into<String>, input: Vec<Message>) -> Self {
        Self {
            request_id: uuid::Uuid::new_v4().to_string(),
            model: model.into(),
            instructions: None,
            input,
            params: Parameters::new(),
            response_format: None,
            schema: None,
            stream: false,
        }
    }

    /// Look up a final parameter by its backend field name
    pub fn param(&self, field: &str) -> Option<&serde_json::Value> {
        self.params.get(field)
    }

    /// Characters of prompt text, used for usage estimation
    pub(crate) fn prompt_chars(&self) -> usize {
        self.instructions.as_deref().map_or(0, str::len)
            + self.input.iter().map(|m| m.content.len()).sum::<usize>()
    }
}

/// What a backend returns for a non-streaming call.
///
/// The runner turns this into an [`ExecutionResult`] once timing, retries
/// and validation are known.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackendResponse {
    pub id: String,
    pub model: String,
    pub content: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolInvocation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    pub finish_reason: FinishReason,
}

impl BackendResponse {
    pub fn text(model: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            model: model.into(),
            content: content.into(),
            tool_calls: Vec::new(),
            usage: None,
            finish_reason: FinishReason::Stop,
        }
    }

    pub fn with_usage(mut self, usage: Usage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Backend-native streaming event
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BackendEvent {
    Started { id: String, model: String },
    Delta { text: String },
    ToolCall(ToolInvocation),
    Usage(Usage),
    Finished { reason: FinishReason },
}

/// Backend identity
#[derive(Debug, Clone)]
pub struct BackendInfo {
    /// Circuit-breaker identity; runs against the same id share one circuit
    pub id: String,
    pub name: String,
}

/// Produced content of a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Content {
    Text(String),
    Structured(serde_json::Value),
}

impl Content {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Content::Text(text) => Some(text),
            Content::Structured(_) => None,
        }
    }

    pub fn as_structured(&self) -> Option<&serde_json::Value> {
        match self {
            Content::Structured(value) => Some(value),
            Content::Text(_) => None,
        }
    }

    /// Textual rendering regardless of variant
    pub fn to_text(&self) -> String {
        match self {
            Content::Text(text) => text.clone(),
            Content::Structured(value) => value.to_string(),
        }
    }
}

/// Terminal artifact of a run. Immutable once built.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub request_id: String,
    pub content: Content,
    pub usage: Usage,
    pub elapsed: Duration,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default)]
    pub tool_calls: Vec<ToolInvocation>,
    pub retries: u32,
    pub finish_reason: FinishReason,
}

/// Run metadata handed to `on_start`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunMeta {
    pub request_id: String,
    pub trace_id: String,
    pub backend: String,
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
}
