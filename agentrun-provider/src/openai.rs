//! OpenAI backend implementation using async-openai crate.
//!
//! The backend maps request envelopes onto chat completions and maps
//! responses, stream chunks and failures back. Retries, validation and
//! idempotency are handled by the runner.

use crate::classify::into_ai_error;
use agentrun_core::backend::{BackendEventStream, ModelBackend};
use agentrun_core::error::AiError;
use agentrun_core::types::*;
use async_openai::config::OpenAIConfig;
use async_openai::types::{
    ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
    ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
    ChatCompletionStreamOptions, CompletionUsage, CreateChatCompletionRequest,
    CreateChatCompletionRequestArgs, CreateChatCompletionResponse,
    CreateChatCompletionStreamResponse, FinishReason as OpenAIFinishReason, ReasoningEffort,
    ResponseFormat as OpenAIResponseFormat,
    ResponseFormatJsonSchema as OpenAIResponseFormatJsonSchema, Stop,
};
use async_openai::Client;
use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;

/// OpenAI backend using async-openai
#[derive(Clone)]
pub struct OpenAiBackend {
    client: Client<OpenAIConfig>,
    info: Arc<BackendInfo>,
}

impl std::fmt::Debug for OpenAiBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAiBackend")
            .field("info", &self.info)
            .finish()
    }
}

impl OpenAiBackend {
    /// Create a new OpenAI backend with default configuration
    pub fn new(api_key: impl Into<String>) -> Self {
        let config = OpenAIConfig::new().with_api_key(api_key);

        Self {
            client: Client::with_config(config),
            info: Arc::new(BackendInfo {
                id: "openai".to_string(),
                name: "OpenAI".to_string(),
            }),
        }
    }

    /// Create a builder for more configuration options
    pub fn builder() -> OpenAiBuilder {
        OpenAiBuilder::default()
    }

    /// Convert our Message type to OpenAI's ChatCompletionRequestMessage
    fn convert_message(msg: &Message) -> Result<ChatCompletionRequestMessage, AiError> {
        let content = msg.content.clone();

        match msg.role {
            Role::System => {
                let msg = ChatCompletionRequestSystemMessageArgs::default()
                    .content(content)
                    .build()
                    .map_err(|e| {
                        AiError::invalid_request(format!("Failed to build system message: {e}"))
                    })?;
                Ok(ChatCompletionRequestMessage::System(msg))
            }
            Role::User => {
                let msg = ChatCompletionRequestUserMessageArgs::default()
                    .content(content)
                    .build()
                    .map_err(|e| {
                        AiError::invalid_request(format!("Failed to build user message: {e}"))
                    })?;
                Ok(ChatCompletionRequestMessage::User(msg))
            }
            Role::Assistant => {
                let msg = ChatCompletionRequestAssistantMessageArgs::default()
                    .content(content)
                    .build()
                    .map_err(|e| {
                        AiError::invalid_request(format!("Failed to build assistant message: {e}"))
                    })?;
                Ok(ChatCompletionRequestMessage::Assistant(msg))
            }
        }
    }

    /// Convert our ResponseFormat to OpenAI's ResponseFormat
    fn convert_response_format(format: &ResponseFormat) -> OpenAIResponseFormat {
        match format {
            ResponseFormat::Text => OpenAIResponseFormat::Text,
            ResponseFormat::JsonObject => OpenAIResponseFormat::JsonObject,
            ResponseFormat::JsonSchema {
                name,
                schema,
                strict,
            } => OpenAIResponseFormat::JsonSchema {
                json_schema: OpenAIResponseFormatJsonSchema {
                    name: name.clone(),
                    schema: Some(schema.clone()),
                    strict: Some(*strict),
                    description: None,
                },
            },
        }
    }

    /// Build CreateChatCompletionRequest from a request envelope
    ///
    /// Instructions become a leading system message. Parameters arrive under
    /// their backend field names; unknown ones are skipped.
    pub(crate) fn build_request(
        envelope: &RequestEnvelope,
    ) -> Result<CreateChatCompletionRequest, AiError> {
        let mut messages = Vec::with_capacity(envelope.input.len() + 1);
        if let Some(instructions) = &envelope.instructions {
            messages.push(Self::convert_message(&Message::system(instructions.clone()))?);
        }
        for msg in &envelope.input {
            messages.push(Self::convert_message(msg)?);
        }

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder.model(&envelope.model).messages(messages);

        for (field, value) in &envelope.params {
            match field.as_str() {
                "temperature" => {
                    builder.temperature(number::<f32>(field, value)?);
                }
                "top_p" => {
                    builder.top_p(number::<f32>(field, value)?);
                }
                "frequency_penalty" => {
                    builder.frequency_penalty(number::<f32>(field, value)?);
                }
                "presence_penalty" => {
                    builder.presence_penalty(number::<f32>(field, value)?);
                }
                "max_tokens" => {
                    #[allow(deprecated)]
                    builder.max_tokens(number::<u32>(field, value)?);
                }
                "max_completion_tokens" => {
                    builder.max_completion_tokens(number::<u32>(field, value)?);
                }
                "seed" => {
                    builder.seed(number::<i64>(field, value)?);
                }
                "stop" => {
                    builder.stop(parse::<Stop>(field, value)?);
                }
                "reasoning_effort" => {
                    builder.reasoning_effort(parse::<ReasoningEffort>(field, value)?);
                }
                other => {
                    tracing::debug!(param = other, "parameter not forwarded to OpenAI");
                }
            }
        }

        if let Some(response_format) = &envelope.response_format {
            builder.response_format(Self::convert_response_format(response_format));
        }
        if envelope.stream {
            let options = parse::<ChatCompletionStreamOptions>(
                "stream_options",
                &serde_json::json!({"include_usage": true}),
            )?;
            builder.stream(true).stream_options(options);
        }

        builder
            .build()
            .map_err(|e| AiError::invalid_request(format!("Failed to build request: {e}")))
    }

    /// Convert OpenAI response to a backend response
    pub(crate) fn convert_response(response: CreateChatCompletionResponse) -> BackendResponse {
        let usage = response.usage.as_ref().map(convert_usage);
        let mut converted = BackendResponse::text(response.model, String::new());
        converted.id = response.id;
        converted.usage = usage;

        if let Some(choice) = response.choices.into_iter().next() {
            converted.content = choice.message.content.unwrap_or_default();
            converted.tool_calls = choice
                .message
                .tool_calls
                .unwrap_or_default()
                .into_iter()
                .map(|call| ToolInvocation {
                    arguments: serde_json::from_str(&call.function.arguments)
                        .unwrap_or(Value::String(call.function.arguments)),
                    id: call.id,
                    name: call.function.name,
                })
                .collect();
            converted.finish_reason = choice
                .finish_reason
                .map_or(FinishReason::Stop, convert_finish_reason);
        }

        converted
    }

    /// Convert one stream chunk into backend events
    ///
    /// `Finished` is held back by the caller until the stream ends, because
    /// the usage chunk arrives after the finish reason.
    pub(crate) fn convert_stream_chunk(
        chunk: CreateChatCompletionStreamResponse,
        started: &mut bool,
        finish: &mut Option<FinishReason>,
    ) -> Vec<BackendEvent> {
        let mut events = Vec::new();
        if !*started {
            *started = true;
            events.push(BackendEvent::Started {
                id: chunk.id.clone(),
                model: chunk.model.clone(),
            });
        }

        for choice in chunk.choices.into_iter().filter(|c| c.index == 0) {
            if let Some(text) = choice.delta.content {
                if !text.is_empty() {
                    events.push(BackendEvent::Delta { text });
                }
            }
            if let Some(reason) = choice.finish_reason {
                *finish = Some(convert_finish_reason(reason));
            }
        }

        if let Some(usage) = &chunk.usage {
            events.push(BackendEvent::Usage(convert_usage(usage)));
        }
        events
    }
}

fn convert_usage(usage: &CompletionUsage) -> Usage {
    let cached = usage
        .prompt_tokens_details
        .as_ref()
        .and_then(|d| d.cached_tokens)
        .unwrap_or(0);
    Usage::new(usage.prompt_tokens, usage.completion_tokens).with_cached_tokens(cached)
}

fn convert_finish_reason(reason: OpenAIFinishReason) -> FinishReason {
    match reason {
        OpenAIFinishReason::Stop => FinishReason::Stop,
        OpenAIFinishReason::Length => FinishReason::Length,
        OpenAIFinishReason::ToolCalls => FinishReason::ToolCalls,
        OpenAIFinishReason::ContentFilter => FinishReason::ContentFilter,
        _ => FinishReason::Other("function_call".to_string()),
    }
}

fn parse<T: DeserializeOwned>(field: &str, value: &Value) -> Result<T, AiError> {
    serde_json::from_value(value.clone())
        .map_err(|e| AiError::invalid_request(format!("invalid value for {field}: {e}")))
}

fn number<T: DeserializeOwned>(field: &str, value: &Value) -> Result<T, AiError> {
    // Integral floats such as 100.0 are accepted for integer fields
    match value.as_f64() {
        Some(f) if f.fract() == 0.0 && value.is_f64() => parse(field, &Value::from(f as i64)),
        _ => parse(field, value),
    }
}

#[async_trait]
impl ModelBackend for OpenAiBackend {
    fn info(&self) -> Arc<BackendInfo> {
        self.info.clone()
    }

    async fn execute(&self, envelope: RequestEnvelope) -> Result<BackendResponse, AiError> {
        let mut request = Self::build_request(&envelope)?;
        request.stream = None;
        request.stream_options = None;

        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(into_ai_error)?;

        Ok(Self::convert_response(response))
    }

    async fn execute_stream(
        &self,
        envelope: RequestEnvelope,
    ) -> Result<Box<BackendEventStream>, AiError> {
        let mut envelope = envelope;
        envelope.stream = true;
        let request = Self::build_request(&envelope)?;

        let mut upstream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(into_ai_error)?;

        let events = async_stream::stream! {
            let mut started = false;
            let mut finish = None;
            while let Some(chunk) = upstream.next().await {
                match chunk {
                    Ok(chunk) => {
                        for event in OpenAiBackend::convert_stream_chunk(chunk, &mut started, &mut finish) {
                            yield Ok(event);
                        }
                    }
                    Err(e) => {
                        yield Err(into_ai_error(e));
                        return;
                    }
                }
            }
            yield Ok(BackendEvent::Finished {
                reason: finish.unwrap_or(FinishReason::Stop),
            });
        };

        Ok(Box::new(Box::pin(events)))
    }
}

/// Builder for OpenAI backend with custom configuration
#[derive(Default)]
pub struct OpenAiBuilder {
    api_key: Option<String>,
    api_base: Option<String>,
    org_id: Option<String>,
}

impl OpenAiBuilder {
    /// Set API key
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    /// Set API base URL (for OpenAI-compatible APIs like DeepSeek)
    pub fn api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = Some(api_base.into());
        self
    }

    /// Set organization ID
    pub fn organization(mut self, org_id: impl Into<String>) -> Self {
        self.org_id = Some(org_id.into());
        self
    }

    /// Build the backend
    pub fn build(self) -> Result<OpenAiBackend, AiError> {
        self.build_with_id("openai", "OpenAI")
    }

    /// Build a backend with a custom backend ID and name
    ///
    /// The ID is the circuit breaker identity, so OpenAI-compatible APIs
    /// such as DeepSeek get their own circuit.
    pub fn build_with_id(
        self,
        backend_id: impl Into<String>,
        backend_name: impl Into<String>,
    ) -> Result<OpenAiBackend, AiError> {
        let api_key = self
            .api_key
            .ok_or_else(|| AiError::configuration("API key is required"))?;

        let mut config = OpenAIConfig::new().with_api_key(api_key);

        if let Some(api_base) = self.api_base {
            config = config.with_api_base(api_base);
        }

        if let Some(org_id) = self.org_id {
            config = config.with_org_id(org_id);
        }

        Ok(OpenAiBackend {
            client: Client::with_config(config),
            info: Arc::new(BackendInfo {
                id: backend_id.into(),
                name: backend_name.into(),
            }),
        })
    }
}
