//! Minimal backend for layer tests.

use agentrun_core::backend::{BackendEventStream, ModelBackend};
use agentrun_core::error::AiError;
use agentrun_core::types::*;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
pub(crate) struct MockBackend {
    content: String,
    failure: Option<AiError>,
    latency: Duration,
    event_gap: Duration,
}

impl MockBackend {
    pub fn new(content: &str) -> Self {
        Self {
            content: content.to_string(),
            failure: None,
            latency: Duration::ZERO,
            event_gap: Duration::ZERO,
        }
    }

    pub fn failing(err: AiError) -> Self {
        Self {
            failure: Some(err),
            ..Self::new("")
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_event_gap(mut self, gap: Duration) -> Self {
        self.event_gap = gap;
        self
    }
}

#[async_trait]
impl ModelBackend for MockBackend {
    fn info(&self) -> Arc<BackendInfo> {
        Arc::new(BackendInfo {
            id: "mock".to_string(),
            name: "Mock".to_string(),
        })
    }

    async fn execute(&self, envelope: RequestEnvelope) -> Result<BackendResponse, AiError> {
        tokio::time::sleep(self.latency).await;
        match &self.failure {
            Some(err) => Err(err.clone()),
            None => Ok(BackendResponse::text(envelope.model, self.content.clone())),
        }
    }

    async fn execute_stream(
        &self,
        envelope: RequestEnvelope,
    ) -> Result<Box<BackendEventStream>, AiError> {
        tokio::time::sleep(self.latency).await;
        if let Some(err) = &self.failure {
            return Err(err.clone());
        }
        let events = vec![
            BackendEvent::Started {
                id: "mock-1".to_string(),
                model: envelope.model,
            },
            BackendEvent::Delta {
                text: self.content.clone(),
            },
            BackendEvent::Finished {
                reason: FinishReason::Stop,
            },
        ];
        let gap = self.event_gap;
        let stream = async_stream::stream! {
            for event in events {
                tokio::time::sleep(gap).await;
                yield Ok::<_, AiError>(event);
            }
        };
        Ok(Box::new(Box::pin(stream)))
    }
}
