//! AgentRunner implementation.
//!
//! The runner orchestrates one run end to end:
//!
//! ```text
//! idempotency acquire -> request builder -> reliability layer -> backend
//!     -> [stream normalizer] -> schema validator -> result -> metrics
//! ```

use crate::agent::{AgentDefinition, RunOptions};
use crate::backend::ModelBackend;
use crate::capability::CapabilityPolicy;
use crate::config::RunnerConfig;
use crate::context::ExecutionContext;
use crate::error::AiError;
use crate::idempotency::{Acquired, IdempotencyGuard};
use crate::layer::Layer;
use crate::metrics::{MetricsSink, NoopMetricsSink, PricingSource, RunMetrics};
use crate::reliability::{Attempted, ReliabilityLayer};
use crate::request::RequestBuilder;
use crate::schema;
use crate::stream::{estimate_usage, StreamNormalizer};
use crate::types::*;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Type-erased backend that can be shared across threads
type BoxedBackend = Arc<dyn ModelBackend>;

/// Builder for composing a backend with layers and runtime collaborators.
///
/// Layers wrap the backend by static dispatch; the stack is type-erased
/// once in [`finish`](Self::finish).
///
/// # Example
///
/// ```ignore
/// let runner = AgentRunner::builder(openai_backend)
///     .layer(TimeoutLayer::new(Duration::from_secs(30)))
///     .layer(LoggingLayer::new())
///     .metrics(TracingMetricsSink)
///     .finish();
/// ```
pub struct AgentRunnerBuilder<B> {
    backend: B,
    context: Option<Arc<ExecutionContext>>,
    metrics: Arc<dyn MetricsSink>,
    pricing: Option<Arc<dyn PricingSource>>,
    policy: CapabilityPolicy,
    config: RunnerConfig,
}

impl<B: ModelBackend> AgentRunnerBuilder<B> {
    /// Create a new builder with a backend
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            context: None,
            metrics: Arc::new(NoopMetricsSink),
            pricing: None,
            policy: CapabilityPolicy::builtin(),
            config: RunnerConfig::default(),
        }
    }

    /// Add a layer to wrap the backend
    ///
    /// Each call creates a new concrete type by wrapping the previous one.
    pub fn layer<L>(self, layer: L) -> AgentRunnerBuilder<L::LayeredBackend>
    where
        L: Layer<B>,
    {
        AgentRunnerBuilder {
            backend: layer.layer(self.backend),
            context: self.context,
            metrics: self.metrics,
            pricing: self.pricing,
            policy: self.policy,
            config: self.config,
        }
    }

    /// Share circuit and idempotency state with other runners
    ///
    /// Without a context, the runner creates its own from the config.
    pub fn context(mut self, context: Arc<ExecutionContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Set the metrics sink
    pub fn metrics(mut self, sink: impl MetricsSink + 'static) -> Self {
        self.metrics = Arc::new(sink);
        self
    }

    /// Set the source of per-run cost
    pub fn pricing(mut self, pricing: impl PricingSource + 'static) -> Self {
        self.pricing = Some(Arc::new(pricing));
        self
    }

    /// Replace the capability policy
    pub fn capabilities(mut self, policy: CapabilityPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Set the runner configuration
    pub fn config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Finish building and create an AgentRunner
    pub fn finish(self) -> AgentRunner {
        let context = self
            .context
            .unwrap_or_else(|| Arc::new(ExecutionContext::from_config(&self.config)));
        let reliability = ReliabilityLayer::new(self.config.retry.clone(), context.breakers().clone());

        AgentRunner {
            backend: Arc::new(self.backend),
            builder: RequestBuilder::new(self.policy),
            reliability,
            context,
            metrics: self.metrics,
            pricing: self.pricing,
            config: self.config,
        }
    }
}

/// Reliable executor of agent definitions.
///
/// Cheap to share behind an `Arc`; every run is independent apart from the
/// circuit and idempotency state held by its [`ExecutionContext`].
pub struct AgentRunner {
    backend: BoxedBackend,
    builder: RequestBuilder,
    reliability: ReliabilityLayer,
    context: Arc<ExecutionContext>,
    metrics: Arc<dyn MetricsSink>,
    pricing: Option<Arc<dyn PricingSource>>,
    config: RunnerConfig,
}

impl std::fmt::Debug for AgentRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRunner")
            .field("backend", &self.backend.info().id)
            .field("config", &self.config)
            .finish()
    }
}

impl AgentRunner {
    /// Create a new builder
    pub fn builder<B: ModelBackend>(backend: B) -> AgentRunnerBuilder<B> {
        AgentRunnerBuilder::new(backend)
    }

    /// Get backend information
    pub fn info(&self) -> Arc<BackendInfo> {
        self.backend.info()
    }

    pub fn context(&self) -> &Arc<ExecutionContext> {
        &self.context
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Build the envelope a run would send, without sending it
    pub fn prepare(
        &self,
        definition: &AgentDefinition,
        variables: &Variables,
        options: &RunOptions,
    ) -> Result<RequestEnvelope, AiError> {
        self.builder.build(definition, variables, options)
    }

    /// Flush the metrics sink
    pub fn flush_metrics(&self) {
        self.metrics.flush();
    }

    /// Execute one run.
    ///
    /// With `options.streaming`, canonical callbacks are delivered to
    /// `options.handler` while the run progresses; the returned result is
    /// the same one passed to `on_complete`.
    ///
    /// Concurrent runs sharing an idempotency key execute once; the others
    /// wait and observe the same outcome. A completed key is replayed
    /// without contacting the backend.
    pub async fn run(
        &self,
        definition: &AgentDefinition,
        variables: &Variables,
        options: RunOptions,
    ) -> Result<ExecutionResult, AiError> {
        let started = Instant::now();
        let handler = options.streaming.then(|| options.handler.clone()).flatten();
        let mut normalizer = StreamNormalizer::new(handler);

        let key = match self.resolve_key(definition, variables, &options) {
            Ok(key) => key,
            Err(e) => {
                normalizer.fail(&e);
                return Err(e);
            }
        };
        let mut meta = RunMeta {
            request_id: uuid::Uuid::new_v4().to_string(),
            trace_id: options
                .metadata
                .trace_id
                .clone()
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            backend: self.backend.info().id.clone(),
            model: definition.model.clone(),
            idempotency_key: key.clone(),
        };

        let guard = match key.as_deref() {
            None => None,
            Some(key) => match self.context.idempotency().acquire(key) {
                Acquired::New(guard) => Some(guard),
                Acquired::Completed(result) => {
                    tracing::info!(
                        request_id = %meta.request_id,
                        idempotency_key = key,
                        "replaying completed run"
                    );
                    normalizer.replay(&meta, &result);
                    self.record(&meta, &Ok(result.clone()), started, true);
                    return Ok(result);
                }
                Acquired::InFlight(waiter) => {
                    tracing::debug!(
                        request_id = %meta.request_id,
                        idempotency_key = key,
                        "waiting for in-flight run"
                    );
                    let outcome = cancellable(options.cancellation.as_ref(), waiter.wait()).await;
                    match &outcome {
                        Ok(result) => normalizer.replay(&meta, result),
                        Err(e) => normalizer.fail(e),
                    }
                    self.record(&meta, &outcome, started, true);
                    return outcome;
                }
            },
        };

        let outcome = cancellable(
            options.cancellation.as_ref(),
            self.execute(definition, variables, &options, &mut meta, &mut normalizer, started),
        )
        .await;

        match &outcome {
            Ok(result) => normalizer.complete(result),
            Err(e) => {
                tracing::debug!(
                    request_id = %meta.request_id,
                    error_class = e.class(),
                    error = %e,
                    "run failed"
                );
                normalizer.fail(e);
            }
        }
        settle(guard, &outcome);
        self.record(&meta, &outcome, started, false);
        outcome
    }

    async fn execute(
        &self,
        definition: &AgentDefinition,
        variables: &Variables,
        options: &RunOptions,
        meta: &mut RunMeta,
        normalizer: &mut StreamNormalizer,
        started: Instant,
    ) -> Result<ExecutionResult, AiError> {
        let mut envelope = self.builder.build(definition, variables, options)?;
        envelope.request_id = meta.request_id.clone();
        meta.model = envelope.model.clone();

        let (response, retries) = if options.streaming {
            normalizer.start(meta);
            let Attempted {
                value: mut stream,
                retries,
            } = self.reliability.open_stream(self.backend.as_ref(), &envelope).await?;
            normalizer.consume_stream(&mut stream).await?;
            (normalizer.response(&envelope), retries)
        } else {
            let Attempted { value, retries } =
                self.reliability.execute(self.backend.as_ref(), &envelope).await?;
            (value, retries)
        };

        self.package(&envelope, response, retries, started)
    }

    /// Validate structured output and assemble the result
    fn package(
        &self,
        envelope: &RequestEnvelope,
        response: BackendResponse,
        retries: u32,
        started: Instant,
    ) -> Result<ExecutionResult, AiError> {
        let content = match &envelope.schema {
            Some(directive) => {
                let value = parse_structured(&response.content)?;
                schema::validate(&value, &directive.schema)?;
                Content::Structured(value)
            }
            None => Content::Text(response.content.clone()),
        };

        let usage = response
            .usage
            .unwrap_or_else(|| estimate_usage(envelope, &response.content));
        let model = if response.model.is_empty() {
            envelope.model.clone()
        } else {
            response.model
        };
        let cost = self.pricing.as_ref().and_then(|p| p.cost(&model, &usage));

        Ok(ExecutionResult {
            request_id: envelope.request_id.clone(),
            content,
            usage,
            elapsed: started.elapsed(),
            model,
            cost,
            tool_calls: response.tool_calls,
            retries,
            finish_reason: response.finish_reason,
        })
    }

    fn resolve_key(
        &self,
        definition: &AgentDefinition,
        variables: &Variables,
        options: &RunOptions,
    ) -> Result<Option<String>, AiError> {
        if let Some(key) = &options.idempotency_key {
            return Ok(Some(key.clone()));
        }
        if !options.deterministic || !self.config.derive_idempotency_keys {
            return Ok(None);
        }
        derive_idempotency_key(definition, variables, options).map(Some)
    }

    fn record(
        &self,
        meta: &RunMeta,
        outcome: &Result<ExecutionResult, AiError>,
        started: Instant,
        replayed: bool,
    ) {
        let mut metrics = RunMetrics {
            request_id: meta.request_id.clone(),
            trace_id: meta.trace_id.clone(),
            backend: meta.backend.clone(),
            model: meta.model.clone(),
            latency_ms: started.elapsed().as_millis() as u64,
            replayed,
            ..Default::default()
        };
        match outcome {
            Ok(result) => {
                metrics = metrics.with_usage(&result.usage);
                metrics.model = result.model.clone();
                metrics.retries = result.retries;
                metrics.cost = result.cost;
                metrics.tools_used = result.tool_calls.iter().map(|c| c.name.clone()).collect();
            }
            Err(e) => {
                metrics.retries = e.retries();
                metrics.error_class = Some(e.class().to_string());
            }
        }
        self.metrics.record(&metrics);
    }
}

fn settle(guard: Option<IdempotencyGuard<'_>>, outcome: &Result<ExecutionResult, AiError>) {
    let Some(guard) = guard else {
        return;
    };
    match outcome {
        Ok(result) => guard.complete(result),
        Err(e) => guard.fail(e),
    }
}

/// Race `fut` against the caller's cancellation token
async fn cancellable<T, F>(token: Option<&CancellationToken>, fut: F) -> Result<T, AiError>
where
    F: Future<Output = Result<T, AiError>>,
{
    match token {
        Some(token) => tokio::select! {
            biased;
            _ = token.cancelled() => Err(AiError::cancelled("run cancelled by caller")),
            outcome = fut => outcome,
        },
        None => fut.await,
    }
}

/// Parse model output as JSON, tolerating a surrounding markdown fence
fn parse_structured(content: &str) -> Result<serde_json::Value, AiError> {
    let trimmed = content.trim();
    let body = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .and_then(|rest| rest.trim_end().strip_suffix("```"))
        .unwrap_or(trimmed);

    serde_json::from_str(body.trim()).map_err(|e| AiError::Schema {
        violations: vec![crate::error::SchemaViolation::new(
            "$",
            format!("output is not valid JSON: {e}"),
        )],
    })
}

#[derive(Serialize)]
struct KeyMaterial<'a> {
    definition: &'a AgentDefinition,
    variables: &'a Variables,
    parameters: &'a Parameters,
    streaming: bool,
    responses_use_instructions: bool,
    strict_schema: bool,
}

/// Derive an idempotency key from everything that shapes the request.
///
/// Equal inputs always hash to the same `auto:`-prefixed key.
pub fn derive_idempotency_key(
    definition: &AgentDefinition,
    variables: &Variables,
    options: &RunOptions,
) -> Result<String, AiError> {
    let material = serde_json::to_vec(&KeyMaterial {
        definition,
        variables,
        parameters: &options.parameters,
        streaming: options.streaming,
        responses_use_instructions: options.metadata.responses_use_instructions,
        strict_schema: options.metadata.strict_schema,
    })?;
    Ok(format!("auto:{}", hex::encode(Sha256::digest(&material))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{ModelCapabilities, ParamRule, StructuredOutput};
    use crate::metrics::{InMemoryMetricsSink, ModelPrice, PriceTable};
    use crate::reliability::{CircuitBreakerConfig, CircuitState, RetryPolicy};
    use crate::test_support::{text_events, RecordingHandler, ScriptedBackend};
    use serde_json::json;
    use std::time::Duration;

    fn definition() -> AgentDefinition {
        AgentDefinition::new("greeter", "model-a", "Say hi to {{name}}")
            .with_instructions("Be brief.")
            .with_temperature(0.7)
    }

    fn vars(name: &str) -> Variables {
        Variables::from([("name".to_string(), json!(name))])
    }

    fn config() -> RunnerConfig {
        RunnerConfig::new()
            .with_retry(RetryPolicy::new().with_max_retries(2).with_jitter(false))
            .with_circuit(
                CircuitBreakerConfig::default()
                    .with_failure_threshold(3)
                    .with_cooldown(Duration::from_secs(10)),
            )
    }

    fn runner(backend: Arc<ScriptedBackend>) -> (AgentRunner, InMemoryMetricsSink) {
        let sink = InMemoryMetricsSink::new();
        let runner = AgentRunner::builder(backend)
            .config(config())
            .metrics(sink.clone())
            .finish();
        (runner, sink)
    }

    #[tokio::test]
    async fn test_run_text() {
        let backend = Arc::new(ScriptedBackend::new("mock").respond("hi Ada"));
        let (runner, sink) = runner(backend.clone());

        let result = runner.run(&definition(), &vars("Ada"), RunOptions::new()).await.unwrap();
        assert_eq!(result.content.as_text(), Some("hi Ada"));
        assert_eq!(result.usage, Usage::new(10, 5));
        assert_eq!(result.retries, 0);
        assert_eq!(backend.calls(), 1);

        let records = sink.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].request_id, result.request_id);
        assert_eq!(records[0].input_tokens, 10);
        assert!(!records[0].is_error());
    }

    #[tokio::test]
    async fn test_template_error_never_reaches_backend() {
        let backend = Arc::new(ScriptedBackend::new("mock").always_respond("x"));
        let (runner, sink) = runner(backend.clone());

        let options = RunOptions::new().idempotency_key("k-template");
        let err = runner
            .run(&definition(), &Variables::new(), options.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, AiError::Template { ref missing } if missing == &["name"]));
        assert_eq!(backend.calls(), 0);
        assert_eq!(
            runner.context().idempotency().status("k-template"),
            Some(crate::idempotency::RecordStatus::Failed)
        );
        assert_eq!(sink.records()[0].error_class.as_deref(), Some("template"));

        // A failed key runs again under a fresh record
        let result = runner.run(&definition(), &vars("Ada"), options).await.unwrap();
        assert_eq!(result.content.as_text(), Some("x"));
    }

    #[tokio::test]
    async fn test_idempotent_replay() {
        let backend = Arc::new(ScriptedBackend::new("mock").respond("X").respond("Y"));
        let (runner, sink) = runner(backend.clone());
        let options = RunOptions::new().idempotency_key("k1");

        let first = runner.run(&definition(), &vars("Ada"), options.clone()).await.unwrap();
        let second = runner.run(&definition(), &vars("Ada"), options).await.unwrap();

        assert_eq!(first.content.as_text(), Some("X"));
        assert_eq!(second, first);
        assert_eq!(backend.calls(), 1);
        assert!(sink.records()[1].replayed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_runs_share_one_execution() {
        let backend = Arc::new(
            ScriptedBackend::new("mock")
                .with_latency(Duration::from_millis(100))
                .respond("once"),
        );
        let (runner, _) = runner(backend.clone());
        let runner = Arc::new(runner);

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let runner = runner.clone();
                tokio::spawn(async move {
                    runner
                        .run(&definition(), &vars("Ada"), RunOptions::new().idempotency_key("shared"))
                        .await
                })
            })
            .collect();

        for handle in handles {
            let result = handle.await.unwrap().unwrap();
            assert_eq!(result.content.as_text(), Some("once"));
        }
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_deterministic_run_without_seed_support() {
        let backend = Arc::new(ScriptedBackend::new("mock").always_respond("stable"));
        let policy = CapabilityPolicy::builtin().with_model(
            "model-a",
            ModelCapabilities::new(StructuredOutput::JsonMode)
                .rule(param::TEMPERATURE, ParamRule::Clamp { min: 0.0, max: 2.0 })
                .rule(param::MAX_TOKENS, ParamRule::Passthrough),
        );
        let runner = AgentRunner::builder(backend.clone())
            .capabilities(policy)
            .finish();
        let options = RunOptions::new().deterministic(true);

        let envelope = runner.prepare(&definition(), &vars("Ada"), &options).unwrap();
        assert_eq!(envelope.param(param::TEMPERATURE), Some(&json!(0.0)));
        assert_eq!(envelope.param(param::SEED), None);

        let first = runner.run(&definition(), &vars("Ada"), options.clone()).await.unwrap();
        let second = runner.run(&definition(), &vars("Ada"), options).await.unwrap();
        assert_eq!(first.content, second.content);
        // The derived key replays the second run
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test]
    async fn test_derived_key_disabled() {
        let backend = Arc::new(ScriptedBackend::new("mock").always_respond("fresh"));
        let runner = AgentRunner::builder(backend.clone())
            .config(RunnerConfig::new().with_derived_idempotency_keys(false))
            .finish();
        let options = RunOptions::new().deterministic(true);

        runner.run(&definition(), &vars("Ada"), options.clone()).await.unwrap();
        runner.run(&definition(), &vars("Ada"), options).await.unwrap();
        assert_eq!(backend.calls(), 2);
    }

    #[test]
    fn test_derived_key_is_stable() {
        let options = RunOptions::new().deterministic(true);
        let a = derive_idempotency_key(&definition(), &vars("Ada"), &options).unwrap();
        let b = derive_idempotency_key(&definition(), &vars("Ada"), &options).unwrap();
        let c = derive_idempotency_key(&definition(), &vars("Bob"), &options).unwrap();
        assert!(a.starts_with("auto:"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_surfaces_provider_error() {
        let backend = Arc::new(ScriptedBackend::new("mock").always_fail(AiError::timeout("slow")));
        let (runner, sink) = runner(backend.clone());

        let err = runner.run(&definition(), &vars("Ada"), RunOptions::new()).await.unwrap_err();
        assert!(matches!(err, AiError::Provider(_)));
        assert_eq!(err.retries(), 2);
        assert!(err.is_retryable_by_caller());
        assert_eq!(backend.calls(), 3);

        let record = &sink.records()[0];
        assert_eq!(record.retries, 2);
        assert_eq!(record.error_class.as_deref(), Some("provider_timeout"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_circuit_fails_fast_then_probes_once() {
        let backend = Arc::new(ScriptedBackend::new("mock").always_fail(AiError::timeout("down")));
        let (runner, _) = runner(backend.clone());

        // Three attempts reach the threshold
        let err = runner.run(&definition(), &vars("Ada"), RunOptions::new()).await.unwrap_err();
        assert!(matches!(err, AiError::Provider(_)));
        assert_eq!(runner.context().breakers().state("mock"), CircuitState::Open);
        assert_eq!(backend.calls(), 3);

        let err = runner.run(&definition(), &vars("Ada"), RunOptions::new()).await.unwrap_err();
        assert!(matches!(err, AiError::CircuitOpen { .. }));
        assert_eq!(backend.calls(), 3);

        tokio::time::advance(Duration::from_secs(10)).await;
        let err = runner.run(&definition(), &vars("Ada"), RunOptions::new()).await.unwrap_err();
        // Exactly one probe reaches the backend; its failure is what the caller sees
        assert_eq!(err.class(), "provider_timeout");
        assert_eq!(err.retries(), 0);
        assert_eq!(backend.calls(), 4);
        assert_eq!(runner.context().breakers().state("mock"), CircuitState::Open);

        let err = runner.run(&definition(), &vars("Ada"), RunOptions::new()).await.unwrap_err();
        assert!(matches!(err, AiError::CircuitOpen { .. }));
        assert_eq!(backend.calls(), 4);
    }

    #[tokio::test]
    async fn test_structured_output_validated() {
        let schema = json!({
            "type": "object",
            "properties": {"name": {"type": "string"}, "age": {"type": "integer"}},
            "required": ["name", "age"],
            "additionalProperties": false
        });
        let definition = AgentDefinition::new("person", "gpt-4o", "Describe {{name}}")
            .with_output_schema(schema);
        let backend = Arc::new(
            ScriptedBackend::new("mock")
                .respond(r#"{"name": "Ada", "age": 36}"#)
                .respond("```json\n{\"name\": \"Ada\"}\n```"),
        );
        let (runner, _) = runner(backend.clone());

        let ok = runner.run(&definition, &vars("Ada"), RunOptions::new()).await.unwrap();
        assert_eq!(ok.content.as_structured(), Some(&json!({"name": "Ada", "age": 36})));

        let err = runner.run(&definition, &vars("Ada"), RunOptions::new()).await.unwrap_err();
        match err {
            AiError::Schema { violations } => {
                assert_eq!(violations.len(), 1);
                assert!(violations[0].message.contains("age"));
            }
            other => panic!("Expected Schema error, got {other:?}"),
        }
        assert_eq!(backend.calls(), 2);
    }

    #[tokio::test]
    async fn test_non_json_output_is_schema_error() {
        let definition = AgentDefinition::new("person", "gpt-4o", "Describe {{name}}")
            .with_output_schema(json!({"type": "object", "additionalProperties": false}));
        let backend = Arc::new(ScriptedBackend::new("mock").respond("not json"));
        let (runner, _) = runner(backend);

        let err = runner.run(&definition, &vars("Ada"), RunOptions::new()).await.unwrap_err();
        assert_eq!(err.class(), "schema");
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_keys_are_swept_across_runs() {
        let backend = Arc::new(ScriptedBackend::new("mock").always_respond("ok"));
        let runner = AgentRunner::builder(backend)
            .config(config().with_idempotency(
                crate::idempotency::IdempotencyConfig::default()
                    .with_retention(Duration::from_secs(1)),
            ))
            .finish();

        for i in 0..100 {
            let options = RunOptions::new().idempotency_key(format!("k{i}"));
            runner.run(&definition(), &vars("Ada"), options).await.unwrap();
        }
        assert_eq!(runner.context().idempotency().len(), 100);

        tokio::time::advance(Duration::from_secs(60)).await;
        let options = RunOptions::new().idempotency_key("k-last");
        runner.run(&definition(), &vars("Ada"), options).await.unwrap();
        assert_eq!(runner.context().idempotency().len(), 1);
    }

    #[tokio::test]
    async fn test_streaming_callbacks() {
        let backend = Arc::new(ScriptedBackend::new("mock").stream(text_events(
            "model-a",
            &["hi ", "Ada"],
            Some(Usage::new(7, 2)),
        )));
        let (runner, _) = runner(backend);
        let handler = Arc::new(RecordingHandler::default());

        let result = runner
            .run(&definition(), &vars("Ada"), RunOptions::new().streaming(handler.clone()))
            .await
            .unwrap();

        assert_eq!(result.content.as_text(), Some("hi Ada"));
        assert_eq!(
            handler.events(),
            vec!["start", "delta:hi ", "delta:Ada", "usage:7/2", "complete:hi Ada"]
        );
    }

    #[tokio::test]
    async fn test_early_usage_held_until_last_delta() {
        let events = vec![
            Ok(BackendEvent::Started {
                id: "resp-1".into(),
                model: "model-a".into(),
            }),
            Ok(BackendEvent::Delta { text: "hi ".into() }),
            Ok(BackendEvent::Usage(Usage::new(7, 2))),
            Ok(BackendEvent::Delta { text: "Ada".into() }),
            Ok(BackendEvent::Finished {
                reason: FinishReason::Stop,
            }),
        ];
        let backend = Arc::new(ScriptedBackend::new("mock").stream(events));
        let (runner, _) = runner(backend);
        let handler = Arc::new(RecordingHandler::default());

        let result = runner
            .run(&definition(), &vars("Ada"), RunOptions::new().streaming(handler.clone()))
            .await
            .unwrap();

        assert_eq!(result.usage, Usage::new(7, 2));
        let events = handler.events();
        assert_eq!(events.iter().filter(|e| e.starts_with("usage:")).count(), 1);
        assert_eq!(
            events,
            vec!["start", "delta:hi ", "delta:Ada", "usage:7/2", "complete:hi Ada"]
        );
    }

    #[tokio::test]
    async fn test_streaming_failure_reports_on_error() {
        let mut events = text_events("model-a", &["partial"], None);
        events.insert(2, Err(AiError::stream("reset")));
        let backend = Arc::new(ScriptedBackend::new("mock").stream(events));
        let (runner, _) = runner(backend);
        let handler = Arc::new(RecordingHandler::default());

        let err = runner
            .run(&definition(), &vars("Ada"), RunOptions::new().streaming(handler.clone()))
            .await
            .unwrap_err();
        assert_eq!(err.class(), "stream");
        assert_eq!(handler.events(), vec!["start", "delta:partial", "error:stream"]);
    }

    #[tokio::test]
    async fn test_streaming_replay() {
        let backend = Arc::new(ScriptedBackend::new("mock").respond("X"));
        let (runner, _) = runner(backend.clone());

        runner
            .run(&definition(), &vars("Ada"), RunOptions::new().idempotency_key("k1"))
            .await
            .unwrap();

        let handler = Arc::new(RecordingHandler::default());
        let options = RunOptions::new()
            .idempotency_key("k1")
            .streaming(handler.clone());
        runner.run(&definition(), &vars("Ada"), options).await.unwrap();

        assert_eq!(handler.events(), vec!["start", "delta:X", "usage:10/5", "complete:X"]);
        assert_eq!(backend.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_fails_record_and_releases_waiters() {
        let backend = Arc::new(
            ScriptedBackend::new("mock")
                .with_latency(Duration::from_secs(60))
                .always_respond("late"),
        );
        let (runner, sink) = runner(backend.clone());
        let runner = Arc::new(runner);
        let token = CancellationToken::new();
        let handler = Arc::new(RecordingHandler::default());

        let first = {
            let runner = runner.clone();
            let options = RunOptions::new()
                .idempotency_key("k-cancel")
                .streaming(handler.clone())
                .cancellation(token.clone());
            tokio::spawn(async move { runner.run(&definition(), &vars("Ada"), options).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        let waiter = {
            let runner = runner.clone();
            tokio::spawn(async move {
                runner
                    .run(&definition(), &vars("Ada"), RunOptions::new().idempotency_key("k-cancel"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        assert!(matches!(first.await.unwrap(), Err(AiError::Cancelled(_))));
        assert!(matches!(waiter.await.unwrap(), Err(AiError::Cancelled(_))));
        assert_eq!(handler.events(), vec!["start", "error:cancelled"]);
        assert_eq!(backend.calls(), 1);
        assert_eq!(sink.records().len(), 2);
    }

    #[tokio::test]
    async fn test_cost_and_tool_metrics() {
        let mut response =
            BackendResponse::text("gpt-4o-mini", "calling").with_usage(Usage::new(1_000, 1_000));
        response.tool_calls.push(ToolInvocation {
            id: "call-1".into(),
            name: "lookup".into(),
            arguments: json!({"q": "ada"}),
        });
        response.finish_reason = FinishReason::ToolCalls;
        let backend = ScriptedBackend::new("mock").respond_with(response);

        let sink = InMemoryMetricsSink::new();
        let runner = AgentRunner::builder(backend)
            .metrics(sink.clone())
            .pricing(PriceTable::new().with_price("gpt-4o-mini", ModelPrice::new(1.0, 2.0)))
            .finish();

        let result = runner.run(&definition(), &vars("Ada"), RunOptions::new()).await.unwrap();
        assert_eq!(result.finish_reason, FinishReason::ToolCalls);
        assert!((result.cost.unwrap() - 0.003).abs() < 1e-9);
        assert_eq!(sink.records()[0].tools_used, vec!["lookup"]);
    }

    #[tokio::test]
    async fn test_json_mode_injects_instruction() {
        let policy = CapabilityPolicy::builtin().with_model(
            "local-",
            ModelCapabilities::new(StructuredOutput::JsonMode),
        );
        let definition = AgentDefinition::new("person", "local-llama", "Describe {{name}}")
            .with_instructions("You describe people.")
            .with_output_schema(json!({"type": "object", "additionalProperties": false}));
        let runner = AgentRunner::builder(ScriptedBackend::new("mock"))
            .capabilities(policy)
            .finish();

        let envelope = runner.prepare(&definition, &vars("Ada"), &RunOptions::new()).unwrap();
        assert_eq!(envelope.response_format, Some(ResponseFormat::JsonObject));
        assert!(envelope.input[0].content.starts_with("You describe people."));
    }
}
