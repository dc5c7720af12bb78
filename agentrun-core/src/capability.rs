//! Per-model capability policy.
//!
//! A static table keyed by model identifier prefix describes which request
//! parameters each model family accepts, the numeric or enum range they are
//! clamped to, and any field renaming the upstream requires. Parameters a
//! model does not support are dropped rather than rejected, so one agent
//! definition stays portable across providers.

use crate::types::param;
use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// How a single parameter is treated for a model.
#[derive(Debug, Clone, PartialEq)]
pub enum ParamRule {
    /// Dropped before the request is sent
    Unsupported,
    /// Forwarded unchanged
    Passthrough,
    /// Numeric value clamped into `[min, max]`
    Clamp { min: f64, max: f64 },
    /// Forwarded under a different field name
    RenameTo(&'static str),
    /// String value forwarded only if it is one of the listed values
    OneOf(&'static [&'static str]),
}

/// How a model family supports structured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StructuredOutput {
    /// Native JSON Schema response format
    JsonSchema,
    /// JSON object mode; the schema travels as an instruction
    JsonMode,
    /// No upstream support; the schema travels as an instruction only
    Unsupported,
}

/// Capabilities of one model family.
#[derive(Debug, Clone)]
pub struct ModelCapabilities {
    rules: HashMap<&'static str, ParamRule>,
    structured_output: StructuredOutput,
}

impl ModelCapabilities {
    /// A model with no supported parameters
    pub fn new(structured_output: StructuredOutput) -> Self {
        Self {
            rules: HashMap::new(),
            structured_output,
        }
    }

    /// Set the rule for a parameter
    pub fn rule(mut self, name: &'static str, rule: ParamRule) -> Self {
        self.rules.insert(name, rule);
        self
    }

    pub fn structured_output(&self) -> StructuredOutput {
        self.structured_output
    }

    /// Rule for a generic parameter name; unknown names are unsupported
    pub fn rule_for(&self, name: &str) -> &ParamRule {
        self.rules.get(name).unwrap_or(&ParamRule::Unsupported)
    }

    /// Whether the parameter reaches the backend at all
    pub fn supports(&self, name: &str) -> bool {
        !matches!(self.rule_for(name), ParamRule::Unsupported)
    }

    /// Backend field name for a generic parameter
    pub fn field_name<'a>(&self, name: &'a str) -> Option<&'a str> {
        match self.rule_for(name) {
            ParamRule::Unsupported => None,
            ParamRule::RenameTo(field) => Some(field),
            _ => Some(name),
        }
    }

    /// Numeric range, if the parameter is clamped
    pub fn range(&self, name: &str) -> Option<(f64, f64)> {
        match self.rule_for(name) {
            ParamRule::Clamp { min, max } => Some((*min, *max)),
            _ => None,
        }
    }

    /// Apply the rule to a value.
    ///
    /// Returns the backend field name and the value to send, or `None` when
    /// the parameter must be dropped.
    pub fn apply(&self, name: &str, value: &Value) -> Option<(String, Value)> {
        match self.rule_for(name) {
            ParamRule::Unsupported => None,
            ParamRule::Passthrough => Some((name.to_string(), value.clone())),
            ParamRule::RenameTo(field) => Some((field.to_string(), value.clone())),
            ParamRule::Clamp { min, max } => {
                let number = value.as_f64()?;
                let clamped = number.clamp(*min, *max);
                // Integers stay integers when the clamp does not move them
                if clamped == number && (value.is_i64() || value.is_u64()) {
                    return Some((name.to_string(), value.clone()));
                }
                serde_json::Number::from_f64(clamped)
                    .map(|n| (name.to_string(), Value::Number(n)))
            }
            ParamRule::OneOf(allowed) => {
                let s = value.as_str()?;
                allowed
                    .iter()
                    .any(|a| *a == s)
                    .then(|| (name.to_string(), value.clone()))
            }
        }
    }
}

/// What the policy reports for one model/parameter pair.
#[derive(Debug, Clone, PartialEq)]
pub struct ParamSupport {
    pub supported: bool,
    pub field: Option<String>,
    pub range: Option<(f64, f64)>,
}

const EFFORTS: &[&str] = &["low", "medium", "high"];

fn sampling_model(structured: StructuredOutput, temp_max: f64, seed: bool) -> ModelCapabilities {
    let caps = ModelCapabilities::new(structured)
        .rule(param::TEMPERATURE, ParamRule::Clamp { min: 0.0, max: temp_max })
        .rule(param::TOP_P, ParamRule::Clamp { min: 0.0, max: 1.0 })
        .rule(param::MAX_TOKENS, ParamRule::Passthrough)
        .rule(param::STOP, ParamRule::Passthrough);
    if seed {
        caps.rule(param::SEED, ParamRule::Passthrough)
    } else {
        caps
    }
}

fn with_penalties(caps: ModelCapabilities) -> ModelCapabilities {
    caps.rule(param::FREQUENCY_PENALTY, ParamRule::Clamp { min: -2.0, max: 2.0 })
        .rule(param::PRESENCE_PENALTY, ParamRule::Clamp { min: -2.0, max: 2.0 })
}

fn reasoning_model() -> ModelCapabilities {
    ModelCapabilities::new(StructuredOutput::JsonSchema)
        .rule(param::MAX_TOKENS, ParamRule::RenameTo("max_completion_tokens"))
        .rule(param::SEED, ParamRule::Passthrough)
        .rule(param::REASONING_EFFORT, ParamRule::OneOf(EFFORTS))
}

static BUILTIN: Lazy<CapabilityPolicy> = Lazy::new(|| {
    CapabilityPolicy::empty(with_penalties(sampling_model(
        StructuredOutput::JsonMode,
        2.0,
        false,
    )))
    .with_model(
        "gpt-4o",
        with_penalties(sampling_model(StructuredOutput::JsonSchema, 2.0, true)),
    )
    .with_model(
        "gpt-4.1",
        with_penalties(sampling_model(StructuredOutput::JsonSchema, 2.0, true)),
    )
    .with_model(
        "gpt-3.5",
        with_penalties(sampling_model(StructuredOutput::JsonMode, 2.0, true)),
    )
    .with_model("o1", reasoning_model())
    .with_model("o3", reasoning_model())
    .with_model("o4", reasoning_model())
    .with_model("gpt-5", reasoning_model())
    .with_model(
        "claude",
        sampling_model(StructuredOutput::Unsupported, 1.0, false),
    )
    .with_model(
        "deepseek-chat",
        with_penalties(sampling_model(StructuredOutput::JsonMode, 2.0, false)),
    )
    .with_model(
        "deepseek-reasoner",
        ModelCapabilities::new(StructuredOutput::JsonMode)
            .rule(param::MAX_TOKENS, ParamRule::Passthrough),
    )
});

/// Lookup table from model identifier to capabilities.
///
/// Entries match by prefix and the longest matching prefix wins, so
/// `gpt-4o-mini` resolves through `gpt-4o`. Models matching no entry use
/// the fallback capabilities.
#[derive(Debug, Clone)]
pub struct CapabilityPolicy {
    entries: Vec<(String, Arc<ModelCapabilities>)>,
    fallback: Arc<ModelCapabilities>,
}

impl CapabilityPolicy {
    /// A policy with no entries
    pub fn empty(fallback: ModelCapabilities) -> Self {
        Self {
            entries: Vec::new(),
            fallback: Arc::new(fallback),
        }
    }

    /// The built-in table for well-known model families
    pub fn builtin() -> Self {
        BUILTIN.clone()
    }

    /// Register (or replace) the entry for a model prefix
    pub fn with_model(mut self, prefix: impl Into<String>, caps: ModelCapabilities) -> Self {
        let prefix = prefix.into();
        self.entries.retain(|(p, _)| *p != prefix);
        self.entries.push((prefix, Arc::new(caps)));
        self
    }

    /// Capabilities for a model identifier
    pub fn capabilities(&self, model: &str) -> &ModelCapabilities {
        self.entries
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map_or(&self.fallback, |(_, caps)| caps)
    }

    /// Whether a parameter is supported, its range and its backend field name
    pub fn resolve(&self, model: &str, name: &str) -> ParamSupport {
        let caps = self.capabilities(model);
        ParamSupport {
            supported: caps.supports(name),
            field: caps.field_name(name).map(str::to_string),
            range: caps.range(name),
        }
    }
}

impl Default for CapabilityPolicy {
    fn default() -> Self {
        Self::builtin()
    }
}
