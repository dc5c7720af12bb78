//! Turns an agent definition and run options into a request envelope.

use crate::agent::{AgentDefinition, RunOptions};
use crate::capability::{CapabilityPolicy, ModelCapabilities};
use crate::error::AiError;
use crate::schema;
use crate::strategy::detect_json_strategy;
use crate::template;
use crate::types::*;
use serde_json::json;

/// Seed forwarded by deterministic runs that do not choose their own.
pub const DETERMINISTIC_SEED: i64 = 42;

/// Builds backend-neutral request envelopes.
#[derive(Debug, Clone, Default)]
pub struct RequestBuilder {
    policy: CapabilityPolicy,
}

impl RequestBuilder {
    pub fn new(policy: CapabilityPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &CapabilityPolicy {
        &self.policy
    }

    /// Build the envelope for one run.
    ///
    /// Fails with [`AiError::Template`] on unbound placeholders and with
    /// [`AiError::SchemaDefinition`] when a strict schema is requested but the
    /// definition's schema does not forbid additional properties at the root.
    pub fn build(
        &self,
        definition: &AgentDefinition,
        variables: &Variables,
        options: &RunOptions,
    ) -> Result<RequestEnvelope, AiError> {
        let user = template::render(&definition.template, variables)?;
        let caps = self.policy.capabilities(&definition.model);

        let mut input = Vec::with_capacity(2);
        let mut instructions = None;
        if let Some(system) = &definition.instructions {
            if options.metadata.responses_use_instructions {
                instructions = Some(system.clone());
            } else {
                input.push(Message::system(system.clone()));
            }
        }
        input.push(Message::user(user));

        let mut envelope = RequestEnvelope::new(definition.model.clone(), input);
        envelope.instructions = instructions;
        envelope.stream = options.streaming;
        envelope.params = resolve_params(caps, definition, options);

        if let Some(raw) = &definition.output_schema {
            let directive = SchemaDirective {
                name: directive_name(&definition.name),
                schema: prepare_schema(raw, options.metadata.strict_schema)?,
                strict: options.metadata.strict_schema,
            };
            let strategy = detect_json_strategy(caps.structured_output());
            tracing::debug!(
                model = %definition.model,
                strategy = strategy.name(),
                "attaching schema directive"
            );
            strategy.apply(&mut envelope, &directive)?;
            envelope.schema = Some(directive);
        }

        Ok(envelope)
    }
}

fn prepare_schema(raw: &serde_json::Value, strict: bool) -> Result<serde_json::Value, AiError> {
    match schema::check_strict(raw) {
        Ok(()) => Ok(raw.clone()),
        Err(err) if strict => Err(err),
        Err(err) => {
            tracing::warn!(reason = %err, "closing schema root with additionalProperties=false");
            schema::close_root(raw)
        }
    }
}

/// Response-format names are restricted to `[A-Za-z0-9_-]`.
fn directive_name(agent: &str) -> String {
    let name: String = agent
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .take(64)
        .collect();
    if name.is_empty() {
        "response".to_string()
    } else {
        name
    }
}

fn resolve_params(
    caps: &ModelCapabilities,
    definition: &AgentDefinition,
    options: &RunOptions,
) -> Parameters {
    let mut merged = definition.parameters.clone();
    merged.extend(options.parameters.clone());

    if options.deterministic {
        if caps.supports(param::TEMPERATURE) {
            let min = caps.range(param::TEMPERATURE).map_or(0.0, |(min, _)| min);
            merged.insert(param::TEMPERATURE.to_string(), json!(min));
        }
        if caps.supports(param::SEED) {
            merged
                .entry(param::SEED.to_string())
                .or_insert_with(|| json!(DETERMINISTIC_SEED));
        }
    }

    let mut resolved = Parameters::new();
    for (name, value) in &merged {
        match caps.apply(name, value) {
            Some((field, applied)) => {
                if &applied != value {
                    tracing::debug!(param = %name, from = %value, to = %applied, "clamped parameter");
                }
                resolved.insert(field, applied);
            }
            None => {
                tracing::debug!(param = %name, model = %definition.model, "dropped unsupported parameter");
            }
        }
    }
    resolved
}
