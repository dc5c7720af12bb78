//! Basic usage of the agentrun meta crate against OpenAI.
//!
//! This demonstrates:
//! 1. A plain text agent with timeout and logging layers
//! 2. Structured output with a schema derived by schemars
//! 3. Streaming through a channel handler
//! 4. Idempotent replay of a completed run
//!
//! Run with `OPENAI_API_KEY` set:
//!
//! ```text
//! cargo run -p agentrun --example basic --features schema
//! ```

use agentrun::prelude::*;
use agentrun::schemars::JsonSchema;
use agentrun::StreamEvent;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct PersonInfo {
    /// Full name of the person
    name: String,
    /// Age in years
    age: u32,
    /// Current occupation or job title
    occupation: String,
    /// List of hobbies
    hobbies: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,agentrun=debug".into()),
        )
        .init();

    let api_key = std::env::var("OPENAI_API_KEY")?;
    let backend = OpenAiBackend::builder().api_key(api_key).build()?;

    let runner = AgentRunner::builder(backend)
        .layer(TimeoutLayer::new(Duration::from_secs(60)))
        .layer(LoggingLayer::new())
        .metrics(TracingMetricsSink)
        .config(RunnerConfig::default().with_retry(RetryPolicy::new().with_max_retries(2)))
        .finish();

    // Example 1: plain text
    println!("=== Example 1: Text ===");
    let explainer = AgentDefinition::new(
        "explainer",
        "gpt-4o-mini",
        "Explain {{topic}} in two sentences.",
    )
    .with_instructions("You are a concise technical writer.")
    .with_temperature(0.3);

    let mut vars = Variables::new();
    vars.insert("topic".into(), "Rust ownership".into());

    let result = runner.run(&explainer, &vars, RunOptions::new()).await?;
    println!("{}", result.content.to_text());
    println!(
        "tokens: {} in / {} out, {:?}",
        result.usage.input_tokens, result.usage.output_tokens, result.elapsed
    );

    // Example 2: structured output
    println!("\n=== Example 2: Structured output ===");
    let extractor = AgentDefinition::new(
        "person-extractor",
        "gpt-4o-mini",
        "Extract person information: {{text}}",
    )
    .with_output_schema(schema_of::<PersonInfo>());

    let mut vars = Variables::new();
    vars.insert(
        "text".into(),
        "Sarah Johnson is a 28-year-old data scientist who enjoys rock climbing and piano.".into(),
    );

    let result = runner
        .run(&extractor, &vars, RunOptions::new().strict_schema(true))
        .await?;
    if let Some(value) = result.content.as_structured() {
        let person: PersonInfo = serde_json::from_value(value.clone())?;
        println!("{person:#?}");
    }

    // Example 3: streaming
    println!("\n=== Example 3: Streaming ===");
    let (handler, mut events) = ChannelStreamHandler::channel();
    let printer = tokio::spawn(async move {
        while let Some(event) = events.next().await {
            match event {
                StreamEvent::Delta(text) => print!("{text}"),
                StreamEvent::Usage(usage) => println!("\n[usage: {usage:?}]"),
                StreamEvent::Error(err) => println!("\n[error: {err}]"),
                _ => {}
            }
        }
    });

    let mut vars = Variables::new();
    vars.insert("topic".into(), "async Rust".into());
    runner
        .run(&explainer, &vars, RunOptions::new().streaming(handler))
        .await?;
    printer.await?;

    // Example 4: idempotent replay
    println!("\n=== Example 4: Replay ===");
    let options = RunOptions::new().idempotency_key("basic-example-replay");
    let first = runner.run(&explainer, &vars, options.clone()).await?;
    let second = runner.run(&explainer, &vars, options).await?;
    println!("same request: {}", first.request_id == second.request_id);

    runner.flush_metrics();
    Ok(())
}
