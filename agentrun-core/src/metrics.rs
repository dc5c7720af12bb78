//! Run metrics and pricing contracts.
//!
//! The runner records one [`RunMetrics`] per finished run, successful or
//! not, through a pluggable [`MetricsSink`].

use crate::types::Usage;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};

/// Metrics of a single run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub request_id: String,
    pub trace_id: String,
    pub backend: String,
    pub model: String,
    pub latency_ms: u64,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cached_tokens: u32,
    pub retries: u32,
    /// Stable error class when the run failed
    pub error_class: Option<String>,
    /// Names of tools the model asked for
    pub tools_used: Vec<String>,
    pub cost: Option<f64>,
    /// Served from the idempotency table without a backend call
    pub replayed: bool,
}

impl RunMetrics {
    pub fn with_usage(mut self, usage: &Usage) -> Self {
        self.input_tokens = usage.input_tokens;
        self.output_tokens = usage.output_tokens;
        self.cached_tokens = usage.cached_tokens;
        self
    }

    pub fn is_error(&self) -> bool {
        self.error_class.is_some()
    }
}

/// Consumer of run metrics.
///
/// `record` is called on the run's task right before it returns, so
/// implementations must not block; buffer and ship in `flush` or on a
/// background task instead.
pub trait MetricsSink: Send + Sync + Debug {
    fn record(&self, metrics: &RunMetrics);

    fn flush(&self) {}
}

/// Discards everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetricsSink;

impl MetricsSink for NoopMetricsSink {
    fn record(&self, _metrics: &RunMetrics) {}
}

/// Emits one structured `tracing` event per run.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetricsSink;

impl MetricsSink for TracingMetricsSink {
    fn record(&self, m: &RunMetrics) {
        tracing::info!(
            target: "agentrun::metrics",
            request_id = %m.request_id,
            trace_id = %m.trace_id,
            backend = %m.backend,
            model = %m.model,
            latency_ms = m.latency_ms,
            input_tokens = m.input_tokens,
            output_tokens = m.output_tokens,
            cached_tokens = m.cached_tokens,
            retries = m.retries,
            error_class = m.error_class.as_deref().unwrap_or(""),
            tools_used = m.tools_used.len(),
            replayed = m.replayed,
            "run finished"
        );
    }
}

/// Collects records in memory for inspection.
#[derive(Debug, Clone, Default)]
pub struct InMemoryMetricsSink {
    inner: Arc<Mutex<Vec<RunMetrics>>>,
}

impl InMemoryMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far
    pub fn records(&self) -> Vec<RunMetrics> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn clear(&self) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

impl MetricsSink for InMemoryMetricsSink {
    fn record(&self, metrics: &RunMetrics) {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(metrics.clone());
    }
}

/// Source of per-run cost. Prices are supplied by the caller.
pub trait PricingSource: Send + Sync + Debug {
    /// Cost of `usage` on `model`, or `None` when the model is unpriced
    fn cost(&self, model: &str, usage: &Usage) -> Option<f64>;
}

/// Price of one model, per million tokens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
    /// Price of cached input tokens; defaults to the input price
    pub cached_input_per_million: Option<f64>,
}

impl ModelPrice {
    pub fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
            cached_input_per_million: None,
        }
    }

    pub fn with_cached_input(mut self, cached_input_per_million: f64) -> Self {
        self.cached_input_per_million = Some(cached_input_per_million);
        self
    }
}

/// A caller-populated price table keyed by model prefix (longest wins).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PriceTable {
    prices: HashMap<String, ModelPrice>,
}

impl PriceTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_price(mut self, model_prefix: impl Into<String>, price: ModelPrice) -> Self {
        self.prices.insert(model_prefix.into(), price);
        self
    }

    fn lookup(&self, model: &str) -> Option<&ModelPrice> {
        self.prices
            .iter()
            .filter(|(prefix, _)| model.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, price)| price)
    }
}

impl PricingSource for PriceTable {
    fn cost(&self, model: &str, usage: &Usage) -> Option<f64> {
        let price = self.lookup(model)?;
        let cached = usage.cached_tokens.min(usage.input_tokens);
        let uncached = usage.input_tokens - cached;
        let cached_price = price.cached_input_per_million.unwrap_or(price.input_per_million);

        let cost = uncached as f64 * price.input_per_million
            + cached as f64 * cached_price
            + usage.output_tokens as f64 * price.output_per_million;
        Some(cost / 1_000_000.0)
    }
}
