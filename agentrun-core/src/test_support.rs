//! Scripted backend for unit tests.

use crate::backend::{BackendEventStream, ModelBackend};
use crate::error::AiError;
use crate::stream::StreamHandler;
use crate::types::*;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Debug, Clone)]
pub(crate) enum Step {
    Respond(BackendResponse),
    Fail(AiError),
    Stream(Vec<Result<BackendEvent, AiError>>),
}

/// A backend that replays a queue of outcomes, then repeats `fallback`.
#[derive(Debug)]
pub(crate) struct ScriptedBackend {
    info: Arc<BackendInfo>,
    steps: Mutex<VecDeque<Step>>,
    fallback: Option<Step>,
    latency: Duration,
    calls: AtomicU32,
}

impl ScriptedBackend {
    pub fn new(id: &str) -> Self {
        Self {
            info: Arc::new(BackendInfo {
                id: id.to_string(),
                name: id.to_string(),
            }),
            steps: Mutex::new(VecDeque::new()),
            fallback: None,
            latency: Duration::ZERO,
            calls: AtomicU32::new(0),
        }
    }

    pub fn respond(self, content: &str) -> Self {
        self.push(Step::Respond(
            BackendResponse::text("mock-model", content).with_usage(Usage::new(10, 5)),
        ))
    }

    pub fn respond_with(self, response: BackendResponse) -> Self {
        self.push(Step::Respond(response))
    }

    pub fn fail(self, err: AiError) -> Self {
        self.push(Step::Fail(err))
    }

    pub fn stream(self, events: Vec<Result<BackendEvent, AiError>>) -> Self {
        self.push(Step::Stream(events))
    }

    pub fn always_fail(mut self, err: AiError) -> Self {
        self.fallback = Some(Step::Fail(err));
        self
    }

    pub fn always_respond(mut self, content: &str) -> Self {
        self.fallback = Some(Step::Respond(BackendResponse::text("mock-model", content)));
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn push(self, step: Step) -> Self {
        self.steps.lock().unwrap().push_back(step);
        self
    }

    async fn next(&self) -> Step {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let step = self.steps.lock().unwrap().pop_front();
        step.or_else(|| self.fallback.clone())
            .unwrap_or_else(|| Step::Fail(AiError::stream("script exhausted")))
    }
}

pub(crate) fn text_events(model: &str, parts: &[&str], usage: Option<Usage>) -> Vec<Result<BackendEvent, AiError>> {
    let mut events = vec![Ok(BackendEvent::Started {
        id: "resp-1".to_string(),
        model: model.to_string(),
    })];
    events.extend(parts.iter().map(|p| Ok(BackendEvent::Delta { text: p.to_string() })));
    if let Some(usage) = usage {
        events.push(Ok(BackendEvent::Usage(usage)));
    }
    events.push(Ok(BackendEvent::Finished {
        reason: FinishReason::Stop,
    }));
    events
}

/// Records callbacks as short labels, in delivery order.
#[derive(Debug, Default)]
pub(crate) struct RecordingHandler {
    events: Mutex<Vec<String>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    fn push(&self, label: String) {
        self.events.lock().unwrap().push(label);
    }
}

impl StreamHandler for RecordingHandler {
    fn on_start(&self, _meta: &RunMeta) {
        self.push("start".into());
    }

    fn on_delta(&self, fragment: &str) {
        self.push(format!("delta:{fragment}"));
    }

    fn on_usage(&self, usage: &Usage) {
        self.push(format!("usage:{}/{}", usage.input_tokens, usage.output_tokens));
    }

    fn on_complete(&self, result: &ExecutionResult) {
        self.push(format!("complete:{}", result.content.to_text()));
    }

    fn on_error(&self, error: &AiError) {
        self.push(format!("error:{}", error.class()));
    }
}

#[async_trait]
impl ModelBackend for ScriptedBackend {
    fn info(&self) -> Arc<BackendInfo> {
        self.info.clone()
    }

    async fn execute(&self, _envelope: RequestEnvelope) -> Result<BackendResponse, AiError> {
        match self.next().await {
            Step::Respond(response) => Ok(response),
            Step::Fail(err) => Err(err),
            Step::Stream(_) => Err(AiError::stream("scripted a stream for execute")),
        }
    }

    async fn execute_stream(
        &self,
        _envelope: RequestEnvelope,
    ) -> Result<Box<BackendEventStream>, AiError> {
        let events = match self.next().await {
            Step::Stream(events) => events,
            Step::Respond(response) => {
                let mut events = text_events(&response.model, &[&response.content], response.usage);
                let finished = events.pop();
                events.extend(response.tool_calls.into_iter().map(|c| Ok(BackendEvent::ToolCall(c))));
                events.extend(finished);
                events
            }
            Step::Fail(err) => return Err(err),
        };
        Ok(Box::new(futures::stream::iter(events)))
    }
}
