//! Validation of produced values against the output schema.
//!
//! Values are checked with `jsonschema` (draft 7 semantics, local `$ref`
//! included), so nested types derived by schemars are validated in full.

use crate::error::{AiError, SchemaViolation};
use jsonschema::error::ValidationErrorKind;
use jsonschema::{Draft, JSONSchema};
use serde_json::{Map, Value};

/// Validate `value` against `schema`.
///
/// Collects every violation rather than stopping at the first. A schema
/// that does not compile is an [`AiError::SchemaDefinition`].
pub fn validate(value: &Value, schema: &Value) -> Result<(), AiError> {
    let compiled = JSONSchema::options()
        .with_draft(Draft::Draft7)
        .compile(schema)
        .map_err(|e| AiError::schema_definition(format!("invalid output schema: {e}")))?;

    let violations: Vec<SchemaViolation> = match compiled.validate(value) {
        Ok(()) => return Ok(()),
        Err(errors) => errors.flat_map(|e| to_violations(&e)).collect(),
    };
    Err(AiError::Schema { violations })
}

/// Convert one validator error, naming the offending field where the
/// error is reported on its parent object.
fn to_violations(error: &jsonschema::ValidationError<'_>) -> Vec<SchemaViolation> {
    let path = json_path(&error.instance_path.to_string());
    match &error.kind {
        ValidationErrorKind::Required { property } => {
            let name = property.as_str().map_or_else(|| property.to_string(), str::to_string);
            vec![SchemaViolation::new(
                format!("{path}.{name}"),
                format!("missing required field \"{name}\""),
            )]
        }
        ValidationErrorKind::AdditionalProperties { unexpected } => unexpected
            .iter()
            .map(|name| {
                SchemaViolation::new(
                    format!("{path}.{name}"),
                    format!("additional property \"{name}\" is not allowed"),
                )
            })
            .collect(),
        _ => vec![SchemaViolation::new(path, error.to_string())],
    }
}

/// `/owner/tags/1` -> `$.owner.tags[1]`
fn json_path(pointer: &str) -> String {
    let mut path = String::from("$");
    for segment in pointer.split('/').skip(1) {
        let segment = segment.replace("~1", "/").replace("~0", "~");
        if segment.parse::<usize>().is_ok() {
            path.push_str(&format!("[{segment}]"));
        } else {
            path.push('.');
            path.push_str(&segment);
        }
    }
    path
}

/// Ensure a schema is usable for strict structured output.
///
/// The root must describe an object and forbid additional properties.
pub fn check_strict(schema: &Value) -> Result<(), AiError> {
    let root = schema
        .as_object()
        .ok_or_else(|| AiError::schema_definition("schema root must be a JSON object"))?;

    if let Some(ty) = root.get("type") {
        if !type_allows(ty, "object") {
            return Err(AiError::schema_definition(
                "schema root must have type \"object\"",
            ));
        }
    }

    match root.get("additionalProperties") {
        Some(Value::Bool(false)) => Ok(()),
        _ => Err(AiError::schema_definition(
            "schema root must set \"additionalProperties\": false",
        )),
    }
}

/// Copy of `schema` with `additionalProperties: false` forced at the root.
pub fn close_root(schema: &Value) -> Result<Value, AiError> {
    let mut root: Map<String, Value> = schema
        .as_object()
        .cloned()
        .ok_or_else(|| AiError::schema_definition("schema root must be a JSON object"))?;
    root.insert("additionalProperties".to_string(), Value::Bool(false));
    Ok(Value::Object(root))
}

fn type_allows(ty: &Value, name: &str) -> bool {
    match ty {
        Value::String(s) => s == name,
        Value::Array(list) => list.iter().any(|t| t.as_str() == Some(name)),
        _ => true,
    }
}
