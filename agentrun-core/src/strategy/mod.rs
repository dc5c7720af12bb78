//! Strategy layer for backend-specific behaviors.
//!
//! This module defines strategy patterns for handling differences between
//! backends, such as JSON output modes (JSON Schema vs JSON Object).

pub mod json_output;

pub use json_output::{
    detect_json_strategy, JsonModeStrategy, JsonOutputStrategy, JsonSchemaStrategy,
    PromptOnlyStrategy,
};
