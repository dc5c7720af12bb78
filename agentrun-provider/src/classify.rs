//! Classification of async-openai failures.
//!
//! Every vendor error crosses into the runner through [`classify`], so the
//! reliability layer only ever sees the closed [`ErrorKind`] set.

use agentrun_core::error::{AiError, ErrorKind, ProviderError};
use async_openai::error::{ApiError, OpenAIError};

/// Map an async-openai error onto an [`ErrorKind`]
pub fn classify(err: &OpenAIError) -> ErrorKind {
    match err {
        OpenAIError::Reqwest(e) => {
            if e.is_timeout() {
                ErrorKind::Timeout
            } else if e.is_connect() {
                ErrorKind::Connection
            } else if let Some(status) = e.status() {
                ErrorKind::from_status(status.as_u16())
            } else if e.is_request() || e.is_body() {
                ErrorKind::Connection
            } else {
                ErrorKind::Other
            }
        }
        OpenAIError::ApiError(api) => classify_api_error(api),
        OpenAIError::StreamError(_) => ErrorKind::Connection,
        OpenAIError::InvalidArgument(_) => ErrorKind::InvalidRequest,
        _ => ErrorKind::Other,
    }
}

/// Classify an error body by its `code`, then its `type`
fn classify_api_error(api: &ApiError) -> ErrorKind {
    let code = api.code.as_deref().unwrap_or_default();
    let kind = api.r#type.as_deref().unwrap_or_default();

    match (code, kind) {
        ("rate_limit_exceeded", _) | (_, "rate_limit_error") => ErrorKind::RateLimited,
        // Out of credit: retrying cannot help
        ("insufficient_quota", _) => ErrorKind::Authentication,
        ("invalid_api_key" | "invalid_authentication", _)
        | (_, "authentication_error" | "permission_error") => ErrorKind::Authentication,
        ("model_not_found", _) | (_, "not_found_error") => ErrorKind::ModelNotFound,
        ("content_filter" | "content_policy_violation", _) => ErrorKind::ContentFilter,
        ("server_error" | "service_unavailable", _)
        | (_, "server_error" | "api_error" | "overloaded_error") => ErrorKind::ServerError,
        ("context_length_exceeded" | "invalid_value", _) | (_, "invalid_request_error") => {
            ErrorKind::InvalidRequest
        }
        _ => ErrorKind::Other,
    }
}

/// Convert an async-openai error into a classified [`AiError`]
pub fn into_ai_error(err: OpenAIError) -> AiError {
    let kind = classify(&err);
    let mut provider = ProviderError::new(kind, err.to_string());
    if let OpenAIError::Reqwest(e) = &err {
        provider.status = e.status().map(|s| s.as_u16());
    }
    AiError::Provider(provider)
}
