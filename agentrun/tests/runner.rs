//! End-to-end runs through the facade: layers, reliability, idempotency and
//! streaming composed the way an application wires them.

use agentrun::prelude::*;
use agentrun::{
    BackendEvent, BackendEventStream, BackendInfo, BackendResponse, CircuitBreakerConfig,
    CircuitState, FinishReason, InMemoryMetricsSink, RequestEnvelope, StreamEvent,
};
use async_trait::async_trait;
use futures::StreamExt;
use serde_json::json;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Answers "echo:<model>" after `slow_calls` calls that each take `delay`.
#[derive(Debug)]
struct FlakyBackend {
    slow_calls: u32,
    delay: Duration,
    reply: String,
    calls: AtomicU32,
    seen: Mutex<Vec<RequestEnvelope>>,
}

impl FlakyBackend {
    fn new(reply: &str) -> Self {
        Self {
            slow_calls: 0,
            delay: Duration::ZERO,
            reply: reply.to_string(),
            calls: AtomicU32::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    fn slow_first(mut self, calls: u32, delay: Duration) -> Self {
        self.slow_calls = calls;
        self.delay = delay;
        self
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn last_envelope(&self) -> RequestEnvelope {
        self.seen.lock().unwrap().last().cloned().unwrap()
    }

    async fn enter(&self, envelope: &RequestEnvelope) {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(envelope.clone());
        if n < self.slow_calls {
            tokio::time::sleep(self.delay).await;
        }
    }
}

#[async_trait]
impl ModelBackend for FlakyBackend {
    fn info(&self) -> Arc<BackendInfo> {
        Arc::new(BackendInfo {
            id: "flaky".to_string(),
            name: "Flaky".to_string(),
        })
    }

    async fn execute(&self, envelope: RequestEnvelope) -> Result<BackendResponse> {
        self.enter(&envelope).await;
        Ok(BackendResponse::text(envelope.model, self.reply.clone()).with_usage(Usage::new(7, 3)))
    }

    async fn execute_stream(&self, envelope: RequestEnvelope) -> Result<Box<BackendEventStream>> {
        self.enter(&envelope).await;
        let words: Vec<String> = self.reply.split_inclusive(' ').map(str::to_string).collect();
        let mut events = vec![Ok(BackendEvent::Started {
            id: "chatcmpl-1".into(),
            model: envelope.model.clone(),
        })];
        events.extend(words.into_iter().map(|text| Ok(BackendEvent::Delta { text })));
        events.push(Ok(BackendEvent::Finished {
            reason: FinishReason::Stop,
        }));
        Ok(Box::new(futures::stream::iter(events)))
    }
}

fn agent() -> AgentDefinition {
    AgentDefinition::new("greeter", "gpt-4o-mini", "Greet {{name}}")
}

fn vars() -> Variables {
    let mut vars = Variables::new();
    vars.insert("name".into(), json!("Ada"));
    vars
}

fn config() -> RunnerConfig {
    RunnerConfig::default()
        .with_retry(
            RetryPolicy::new()
                .with_max_retries(2)
                .with_initial_delay(Duration::from_millis(100))
                .with_jitter(false),
        )
        .with_circuit(
            CircuitBreakerConfig::default()
                .with_failure_threshold(3)
                .with_cooldown(Duration::from_secs(30)),
        )
}

#[tokio::test(start_paused = true)]
async fn test_layer_timeout_is_retried() {
    let backend = Arc::new(FlakyBackend::new("hello Ada").slow_first(1, Duration::from_secs(5)));
    let sink = InMemoryMetricsSink::new();
    let runner = AgentRunner::builder(backend.clone())
        .layer(TimeoutLayer::new(Duration::from_secs(1)))
        .layer(LoggingLayer::new())
        .config(config())
        .metrics(sink.clone())
        .finish();

    let result = runner.run(&agent(), &vars(), RunOptions::new()).await.unwrap();
    assert_eq!(result.content.as_text(), Some("hello Ada"));
    assert_eq!(result.retries, 1);
    assert_eq!(backend.calls(), 2);
    assert_eq!(sink.records()[0].retries, 1);
    assert_eq!(runner.context().breakers().state("flaky"), CircuitState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_persistent_timeouts_open_the_circuit() {
    let backend = Arc::new(FlakyBackend::new("late").slow_first(u32::MAX, Duration::from_secs(5)));
    let runner = AgentRunner::builder(backend.clone())
        .layer(TimeoutLayer::new(Duration::from_secs(1)))
        .config(config())
        .finish();

    let err = runner.run(&agent(), &vars(), RunOptions::new()).await.unwrap_err();
    assert_eq!(err.class(), "provider_timeout");
    assert_eq!(err.retries(), 2);
    assert_eq!(runner.context().breakers().state("flaky"), CircuitState::Open);

    let err = runner.run(&agent(), &vars(), RunOptions::new()).await.unwrap_err();
    assert!(matches!(err, AiError::CircuitOpen { .. }));
    assert_eq!(backend.calls(), 3);
}

#[tokio::test]
async fn test_concurrent_runs_share_one_execution() {
    let backend = Arc::new(FlakyBackend::new("once").slow_first(1, Duration::from_millis(50)));
    let runner = Arc::new(AgentRunner::builder(backend.clone()).config(config()).finish());

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let runner = runner.clone();
            tokio::spawn(async move {
                runner
                    .run(&agent(), &vars(), RunOptions::new().idempotency_key("shared"))
                    .await
            })
        })
        .collect();

    let mut ids = Vec::new();
    for handle in handles {
        let result = handle.await.unwrap().unwrap();
        assert_eq!(result.content.as_text(), Some("once"));
        ids.push(result.request_id);
    }
    assert_eq!(backend.calls(), 1);
    ids.dedup();
    assert_eq!(ids.len(), 1);
}

#[tokio::test]
async fn test_deterministic_runs_pin_sampling() {
    let backend = Arc::new(FlakyBackend::new("same"));
    let runner = AgentRunner::builder(backend.clone()).config(config()).finish();
    let agent = agent().with_temperature(1.2);

    for _ in 0..2 {
        runner
            .run(&agent, &vars(), RunOptions::new().deterministic(true))
            .await
            .unwrap();
    }

    // Identical inputs derive the same key, so the second run is a replay
    assert_eq!(backend.calls(), 1);
    let envelope = backend.last_envelope();
    assert_eq!(envelope.params.get("temperature"), Some(&json!(0.0)));
    assert!(envelope.params.contains_key("seed"));
}

#[tokio::test]
async fn test_streaming_through_layers_and_channel() {
    let backend = Arc::new(FlakyBackend::new("hello there Ada"));
    let runner = AgentRunner::builder(backend.clone())
        .layer(TimeoutLayer::new(Duration::from_secs(5)).with_idle_timeout(Duration::from_secs(1)))
        .layer(LoggingLayer::new())
        .config(config())
        .finish();

    let (handler, events) = ChannelStreamHandler::channel();
    let result = runner
        .run(&agent(), &vars(), RunOptions::new().streaming(handler))
        .await
        .unwrap();
    assert_eq!(result.content.as_text(), Some("hello there Ada"));
    assert!(result.usage.estimated);

    let events: Vec<StreamEvent> = events.collect().await;
    let labels: Vec<String> = events
        .iter()
        .map(|event| match event {
            StreamEvent::Start(meta) => format!("start:{}", meta.backend),
            StreamEvent::Delta(text) => format!("delta:{text}"),
            StreamEvent::Usage(_) => "usage".to_string(),
            StreamEvent::Complete(_) => "complete".to_string(),
            StreamEvent::Error(err) => format!("error:{}", err.class()),
        })
        .collect();
    assert_eq!(
        labels,
        vec![
            "start:flaky",
            "delta:hello ",
            "delta:there ",
            "delta:Ada",
            "usage",
            "complete"
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_cancellation_releases_waiters() {
    let backend = Arc::new(FlakyBackend::new("done").slow_first(1, Duration::from_secs(30)));
    let runner = Arc::new(AgentRunner::builder(backend.clone()).config(config()).finish());
    let token = CancellationToken::new();

    let owner = {
        let runner = runner.clone();
        let options = RunOptions::new()
            .idempotency_key("cancel-me")
            .cancellation(token.clone());
        tokio::spawn(async move { runner.run(&agent(), &vars(), options).await })
    };
    let waiter = {
        let runner = runner.clone();
        tokio::spawn(async move {
            runner
                .run(&agent(), &vars(), RunOptions::new().idempotency_key("cancel-me"))
                .await
        })
    };

    tokio::time::sleep(Duration::from_secs(1)).await;
    token.cancel();

    let err = owner.await.unwrap().unwrap_err();
    assert!(matches!(err, AiError::Cancelled(_)));
    assert!(err.is_retryable_by_caller());
    let err = waiter.await.unwrap().unwrap_err();
    assert!(matches!(err, AiError::Cancelled(_)));

    // The failed key executes again
    let result = runner
        .run(&agent(), &vars(), RunOptions::new().idempotency_key("cancel-me"))
        .await
        .unwrap();
    assert_eq!(result.content.as_text(), Some("done"));
    assert_eq!(backend.calls(), 2);
}
