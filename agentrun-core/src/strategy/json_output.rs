//! JSON output strategies for different backends.
//!
//! This module defines strategies for requesting structured output from
//! backends with different capabilities:
//! - JsonSchemaStrategy: backends with native JSON Schema support
//! - JsonModeStrategy: backends with basic JSON object mode only
//! - PromptOnlyStrategy: backends with no output constraint at all

use crate::capability::StructuredOutput;
use crate::error::AiError;
use crate::types::{Message, RequestEnvelope, ResponseFormat, Role, SchemaDirective};

/// Strategy for requesting JSON output in a request envelope.
pub trait JsonOutputStrategy: Send + Sync {
    /// Get the strategy name for debugging
    fn name(&self) -> &str;

    /// Apply this strategy to an envelope that carries `directive`.
    ///
    /// This method may:
    /// - Set response_format to JsonSchema (for backends that support it)
    /// - Set response_format to JsonObject and inject the schema as an instruction
    /// - Only inject the schema as an instruction
    fn apply(&self, envelope: &mut RequestEnvelope, directive: &SchemaDirective)
        -> Result<(), AiError>;
}

/// JSON Schema strategy for backends that enforce schemas upstream.
#[derive(Debug, Clone, Default)]
pub struct JsonSchemaStrategy;

impl JsonSchemaStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl JsonOutputStrategy for JsonSchemaStrategy {
    fn name(&self) -> &str {
        "JsonSchemaStrategy"
    }

    fn apply(
        &self,
        envelope: &mut RequestEnvelope,
        directive: &SchemaDirective,
    ) -> Result<(), AiError> {
        envelope.response_format = Some(ResponseFormat::JsonSchema {
            name: directive.name.clone(),
            schema: directive.schema.clone(),
            strict: directive.strict,
        });
        Ok(())
    }
}

/// Build a JSON instruction from a schema
fn build_json_instruction(schema: &serde_json::Value) -> Result<String, AiError> {
    let schema_str = serde_json::to_string_pretty(schema)?;
    Ok(format!(
        "You must respond with valid JSON that matches this schema:\n```json\n{}\n```\n\nIMPORTANT:\n\
        1. Only return the JSON object, nothing else\n\
        2. Ensure all required fields are present\n\
        3. Do not add fields that the schema does not declare\n\
        4. Use the correct data types for each field",
        schema_str
    ))
}

/// Put the instruction where the system text lives.
///
/// Appends to the instructions slot when the envelope uses one, otherwise to
/// the leading system entry, creating that entry if needed.
fn inject_instruction(envelope: &mut RequestEnvelope, instruction: String) {
    if let Some(instructions) = envelope.instructions.as_mut() {
        instructions.push_str("\n\n");
        instructions.push_str(&instruction);
        return;
    }
    match envelope.input.first_mut() {
        Some(first) if first.role == Role::System => {
            first.content.push_str("\n\n");
            first.content.push_str(&instruction);
        }
        _ => envelope.input.insert(0, Message::system(instruction)),
    }
}

/// JSON Mode strategy for backends that only support JSON object mode.
///
/// This strategy:
/// 1. Sets response_format to JsonObject
/// 2. Injects the schema into the system text to guide the model
#[derive(Debug, Clone, Default)]
pub struct JsonModeStrategy;

impl JsonModeStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl JsonOutputStrategy for JsonModeStrategy {
    fn name(&self) -> &str {
        "JsonModeStrategy"
    }

    fn apply(
        &self,
        envelope: &mut RequestEnvelope,
        directive: &SchemaDirective,
    ) -> Result<(), AiError> {
        envelope.response_format = Some(ResponseFormat::JsonObject);
        inject_instruction(envelope, build_json_instruction(&directive.schema)?);
        Ok(())
    }
}

/// Strategy for backends without any output constraint.
#[derive(Debug, Clone, Default)]
pub struct PromptOnlyStrategy;

impl JsonOutputStrategy for PromptOnlyStrategy {
    fn name(&self) -> &str {
        "PromptOnlyStrategy"
    }

    fn apply(
        &self,
        envelope: &mut RequestEnvelope,
        directive: &SchemaDirective,
    ) -> Result<(), AiError> {
        inject_instruction(envelope, build_json_instruction(&directive.schema)?);
        Ok(())
    }
}

/// Pick the strategy matching a model's structured-output support.
pub fn detect_json_strategy(support: StructuredOutput) -> Box<dyn JsonOutputStrategy> {
    match support {
        StructuredOutput::JsonSchema => Box::new(JsonSchemaStrategy::new()),
        StructuredOutput::JsonMode => Box::new(JsonModeStrategy::new()),
        StructuredOutput::Unsupported => Box::new(PromptOnlyStrategy),
    }
}
