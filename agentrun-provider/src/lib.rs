//! # Agentrun Providers
//!
//! Model backend implementations for various AI services.

pub mod classify;
pub mod openai;

// Re-exports
pub use classify::{classify, into_ai_error};
pub use openai::{OpenAiBackend, OpenAiBuilder};

use agentrun_core::error::AiError;

/// Create a DeepSeek backend (OpenAI-compatible)
///
/// DeepSeek uses the OpenAI API protocol but with a different endpoint.
/// The backend id is `deepseek`, so it gets its own circuit breaker.
///
/// # Example
///
/// ```ignore
/// use agentrun_provider::deepseek;
///
/// let backend = deepseek("your-api-key")?;
/// ```
pub fn deepseek(api_key: impl Into<String>) -> Result<OpenAiBackend, AiError> {
    OpenAiBackend::builder()
        .api_key(api_key)
        .api_base("https://api.deepseek.com/v1")
        .build_with_id("deepseek", "DeepSeek")
}
