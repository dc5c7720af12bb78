//! Error types for agent runs.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Closed classification of backend failures.
///
/// Backend adapters map vendor errors into one of these kinds at their
/// boundary; the reliability layer only ever looks at the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// The request did not complete in time
    Timeout,
    /// The connection could not be established or was reset
    Connection,
    /// The upstream throttled the request
    RateLimited,
    /// The upstream failed internally (5xx)
    ServerError,
    /// Credentials were missing or rejected
    Authentication,
    /// The upstream rejected the request as malformed
    InvalidRequest,
    /// The requested model does not exist
    ModelNotFound,
    /// The upstream refused to produce content
    ContentFilter,
    /// Anything the adapter could not classify
    Other,
}

impl ErrorKind {
    /// Whether a failure of this kind may succeed if attempted again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorKind::Timeout
                | ErrorKind::Connection
                | ErrorKind::RateLimited
                | ErrorKind::ServerError
        )
    }

    /// Map an HTTP status code to an error kind.
    pub fn from_status(status: u16) -> Self {
        match status {
            408 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimited,
            401 | 403 => ErrorKind::Authentication,
            404 => ErrorKind::ModelNotFound,
            400 | 409 | 413 | 422 => ErrorKind::InvalidRequest,
            500..=599 => ErrorKind::ServerError,
            _ => ErrorKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::Connection => "connection",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ServerError => "server_error",
            ErrorKind::Authentication => "authentication",
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::ModelNotFound => "model_not_found",
            ErrorKind::ContentFilter => "content_filter",
            ErrorKind::Other => "other",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified backend failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderError {
    pub kind: ErrorKind,
    pub message: String,
    /// HTTP status, when the failure came from an HTTP response
    pub status: Option<u16>,
    /// Upstream hint for how long to wait before trying again
    pub retry_after: Option<Duration>,
    /// Retries performed before this error became terminal
    pub retries: u32,
}

impl ProviderError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            status: None,
            retry_after: None,
            retries: 0,
        }
    }

    /// Build an error from an HTTP status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            ..Self::new(ErrorKind::from_status(status), message)
        }
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn is_transient(&self) -> bool {
        self.kind.is_transient()
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(status) = self.status {
            write!(f, " (status {})", status)?;
        }
        if self.retries > 0 {
            write!(f, " after {} retries", self.retries)?;
        }
        Ok(())
    }
}

/// One structural mismatch between a value and its schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaViolation {
    /// JSON path of the offending value, rooted at `$`
    pub path: String,
    pub message: String,
}

impl SchemaViolation {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for SchemaViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

fn join_violations(violations: &[SchemaViolation]) -> String {
    violations
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// The main error type for agent runs.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AiError {
    /// The user template referenced placeholders with no bound variable
    #[error("Template error: unbound placeholders [{}]", .missing.join(", "))]
    Template { missing: Vec<String> },

    /// The output schema is malformed or not strict-compliant
    #[error("Schema definition error: {0}")]
    SchemaDefinition(String),

    /// The produced output failed schema validation
    #[error("Schema validation failed: {}", join_violations(.violations))]
    Schema { violations: Vec<SchemaViolation> },

    /// Backend failure, classified by the adapter
    #[error("Provider error: {0}")]
    Provider(ProviderError),

    /// The circuit for this backend is open; the backend was not contacted
    #[error("Circuit open for backend {backend}, retry after {retry_after:?}")]
    CircuitOpen {
        backend: String,
        retry_after: Duration,
    },

    /// The run was cancelled or abandoned before completing
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Stream protocol errors
    #[error("Stream error: {0}")]
    Stream(String),
}

impl AiError {
    /// Create a provider error of the given kind
    pub fn provider(kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self::Provider(ProviderError::new(kind, msg))
    }

    /// Create a timeout error
    pub fn timeout(msg: impl Into<String>) -> Self {
        Self::provider(ErrorKind::Timeout, msg)
    }

    /// Create a rate limit error
    pub fn rate_limit(msg: impl Into<String>) -> Self {
        Self::provider(ErrorKind::RateLimited, msg)
    }

    /// Create an authentication error
    pub fn authentication(msg: impl Into<String>) -> Self {
        Self::provider(ErrorKind::Authentication, msg)
    }

    /// Create an invalid request error
    pub fn invalid_request(msg: impl Into<String>) -> Self {
        Self::provider(ErrorKind::InvalidRequest, msg)
    }

    /// Create a schema definition error
    pub fn schema_definition(msg: impl Into<String>) -> Self {
        Self::SchemaDefinition(msg.into())
    }

    /// Create a cancellation error
    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::Cancelled(msg.into())
    }

    /// Create a configuration error
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Create a stream error
    pub fn stream(msg: impl Into<String>) -> Self {
        Self::Stream(msg.into())
    }

    /// The provider error, if this is one
    pub fn as_provider(&self) -> Option<&ProviderError> {
        match self {
            AiError::Provider(e) => Some(e),
            _ => None,
        }
    }

    /// Whether the reliability layer may retry this error.
    ///
    /// Only transient provider failures qualify. Everything else is
    /// deterministic or a fast-fail and propagates immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AiError::Provider(e) if e.is_transient())
    }

    /// Whether the caller may reasonably try the same run again later.
    pub fn is_retryable_by_caller(&self) -> bool {
        match self {
            AiError::Provider(e) => e.is_transient(),
            AiError::CircuitOpen { .. } | AiError::Cancelled(_) => true,
            _ => false,
        }
    }

    /// Stable error class reported to metrics sinks.
    pub fn class(&self) -> &'static str {
        match self {
            AiError::Template { .. } => "template",
            AiError::SchemaDefinition(_) => "schema_definition",
            AiError::Schema { .. } => "schema",
            AiError::Provider(e) => match e.kind {
                ErrorKind::Timeout => "provider_timeout",
                ErrorKind::Connection => "provider_connection",
                ErrorKind::RateLimited => "provider_rate_limited",
                ErrorKind::ServerError => "provider_server_error",
                ErrorKind::Authentication => "provider_authentication",
                ErrorKind::InvalidRequest => "provider_invalid_request",
                ErrorKind::ModelNotFound => "provider_model_not_found",
                ErrorKind::ContentFilter => "provider_content_filter",
                ErrorKind::Other => "provider_other",
            },
            AiError::CircuitOpen { .. } => "circuit_open",
            AiError::Cancelled(_) => "cancelled",
            AiError::Configuration(_) => "configuration",
            AiError::Serialization(_) => "serialization",
            AiError::Stream(_) => "stream",
        }
    }

    /// Retries performed before the error surfaced.
    pub fn retries(&self) -> u32 {
        self.as_provider().map_or(0, |e| e.retries)
    }
}

impl From<ProviderError> for AiError {
    fn from(e: ProviderError) -> Self {
        Self::Provider(e)
    }
}

impl From<serde_json::Error> for AiError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
