//! Streaming normalization.
//!
//! Backend streams are folded into five canonical callbacks delivered to a
//! single [`StreamHandler`], always in this order:
//!
//! ```text
//! on_start -> on_delta* -> on_usage -> on_complete
//! ```
//!
//! A failure at any point replaces everything that would have followed with
//! one `on_error`. Usage reported mid-stream is held back until
//! finalization so it can never precede a delta.

use crate::backend::BackendEventStream;
use crate::error::AiError;
use crate::types::*;
use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Consumer of canonical streaming callbacks.
///
/// Callbacks run on the task driving the run and should return quickly.
pub trait StreamHandler: Send + Sync {
    fn on_start(&self, _meta: &RunMeta) {}

    fn on_delta(&self, _fragment: &str) {}

    fn on_usage(&self, _usage: &Usage) {}

    fn on_complete(&self, _result: &ExecutionResult) {}

    fn on_error(&self, _error: &AiError) {}
}

/// Canonical streaming event, as delivered by [`ChannelStreamHandler`]
#[derive(Debug, Clone)]
pub enum StreamEvent {
    Start(RunMeta),
    Delta(String),
    Usage(Usage),
    Complete(ExecutionResult),
    Error(AiError),
}

impl StreamEvent {
    /// Whether no further events follow this one
    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Complete(_) | StreamEvent::Error(_))
    }
}

/// Pull-based stream of canonical events
pub type StreamEvents = UnboundedReceiverStream<StreamEvent>;

/// Forwards callbacks into an unbounded channel.
#[derive(Debug)]
pub struct ChannelStreamHandler {
    tx: mpsc::UnboundedSender<StreamEvent>,
}

impl ChannelStreamHandler {
    /// Create a handler and the stream its events arrive on.
    ///
    /// The stream ends once the handler (and every run holding it) is dropped.
    pub fn channel() -> (Arc<Self>, StreamEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), UnboundedReceiverStream::new(rx))
    }

    fn send(&self, event: StreamEvent) {
        // The consumer may have stopped listening; that never fails the run
        let _ = self.tx.send(event);
    }
}

impl StreamHandler for ChannelStreamHandler {
    fn on_start(&self, meta: &RunMeta) {
        self.send(StreamEvent::Start(meta.clone()));
    }

    fn on_delta(&self, fragment: &str) {
        self.send(StreamEvent::Delta(fragment.to_string()));
    }

    fn on_usage(&self, usage: &Usage) {
        self.send(StreamEvent::Usage(*usage));
    }

    fn on_complete(&self, result: &ExecutionResult) {
        self.send(StreamEvent::Complete(result.clone()));
    }

    fn on_error(&self, error: &AiError) {
        self.send(StreamEvent::Error(error.clone()));
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Streaming,
    Done,
}

/// Estimate tokens from characters, four characters per token
fn estimate_tokens(chars: usize) -> u32 {
    chars.div_ceil(4).min(u32::MAX as usize) as u32
}

/// Usage estimated locally for backends that never report it
pub(crate) fn estimate_usage(envelope: &RequestEnvelope, output: &str) -> Usage {
    Usage {
        input_tokens: estimate_tokens(envelope.prompt_chars()),
        output_tokens: estimate_tokens(output.chars().count()),
        cached_tokens: 0,
        estimated: true,
    }
}

/// Aggregates backend events for one run and drives its callbacks.
///
/// Dropping a normalizer that started but never reached a terminal
/// callback reports [`AiError::Cancelled`] through `on_error`.
pub struct StreamNormalizer {
    handler: Option<Arc<dyn StreamHandler>>,
    phase: Phase,
    response: BackendResponse,
    usage: Option<Usage>,
}

impl std::fmt::Debug for StreamNormalizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamNormalizer")
            .field("has_handler", &self.handler.is_some())
            .field("phase", &self.phase)
            .field("response", &self.response)
            .finish()
    }
}

impl StreamNormalizer {
    pub fn new(handler: Option<Arc<dyn StreamHandler>>) -> Self {
        Self {
            handler,
            phase: Phase::Idle,
            response: BackendResponse::text(String::new(), String::new()),
            usage: None,
        }
    }

    /// Emit `on_start`. Later calls are ignored.
    pub fn start(&mut self, meta: &RunMeta) {
        if self.phase != Phase::Idle {
            return;
        }
        self.phase = Phase::Streaming;
        if let Some(handler) = &self.handler {
            handler.on_start(meta);
        }
    }

    /// Fold one backend event into the aggregate.
    pub fn consume(&mut self, event: BackendEvent) {
        if self.phase == Phase::Done {
            return;
        }
        match event {
            BackendEvent::Started { id, model } => {
                self.response.id = id;
                if !model.is_empty() {
                    self.response.model = model;
                }
            }
            BackendEvent::Delta { text } => {
                if text.is_empty() {
                    return;
                }
                if let Some(handler) = &self.handler {
                    handler.on_delta(&text);
                }
                self.response.content.push_str(&text);
            }
            BackendEvent::ToolCall(call) => self.response.tool_calls.push(call),
            BackendEvent::Usage(usage) => self.usage = Some(usage),
            BackendEvent::Finished { reason } => self.response.finish_reason = reason,
        }
    }

    /// Drain a backend stream to its end.
    ///
    /// The first error item stops consumption and is returned; the caller
    /// reports it through [`fail`](Self::fail).
    pub async fn consume_stream(&mut self, stream: &mut BackendEventStream) -> Result<(), AiError> {
        while let Some(item) = stream.next().await {
            self.consume(item?);
        }
        Ok(())
    }

    /// The aggregated response for `envelope`.
    ///
    /// Usage falls back to an estimate when the backend never reported it.
    pub fn response(&self, envelope: &RequestEnvelope) -> BackendResponse {
        let mut response = self.response.clone();
        if response.model.is_empty() {
            response.model = envelope.model.clone();
        }
        response.usage = Some(
            self.usage
                .unwrap_or_else(|| estimate_usage(envelope, &response.content)),
        );
        response
    }

    /// Emit `on_usage` then `on_complete`.
    pub fn complete(&mut self, result: &ExecutionResult) {
        if self.phase == Phase::Done {
            return;
        }
        self.phase = Phase::Done;
        if let Some(handler) = &self.handler {
            handler.on_usage(&result.usage);
            handler.on_complete(result);
        }
    }

    /// Emit `on_error`, replacing any remaining callbacks.
    pub fn fail(&mut self, error: &AiError) {
        if self.phase == Phase::Done {
            return;
        }
        self.phase = Phase::Done;
        if let Some(handler) = &self.handler {
            handler.on_error(error);
        }
    }

    /// Deliver a cached result through the full callback sequence.
    pub fn replay(&mut self, meta: &RunMeta, result: &ExecutionResult) {
        self.start(meta);
        let content = result.content.to_text();
        if !content.is_empty() {
            if let Some(handler) = &self.handler {
                handler.on_delta(&content);
            }
        }
        self.complete(result);
    }
}

impl Drop for StreamNormalizer {
    fn drop(&mut self) {
        if self.phase == Phase::Streaming {
            self.fail(&AiError::cancelled("stream dropped before completion"));
        }
    }
}
