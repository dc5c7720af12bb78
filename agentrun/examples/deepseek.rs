//! DeepSeek through the OpenAI-compatible backend.
//!
//! DeepSeek has no JSON Schema support, so the runner falls back to JSON
//! mode with the schema injected as an instruction, then validates the
//! reply locally.

use agentrun::prelude::*;
use agentrun::schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct ProductAnalysis {
    /// Name of the product
    product_name: String,
    /// Overall rating out of 5
    #[schemars(range(min = 0.0, max = 5.0))]
    rating: f32,
    /// List of advantages
    pros: Vec<String>,
    /// List of disadvantages
    cons: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let api_key = std::env::var("DEEPSEEK_API_KEY")?;
    let backend = agentrun::provider::deepseek(api_key)?;

    let runner = AgentRunner::builder(backend)
        .layer(TimeoutLayer::new(Duration::from_secs(120)))
        .layer(LoggingLayer::new().with_prefix("[deepseek]"))
        .finish();

    let analyst = AgentDefinition::new(
        "product-analyst",
        "deepseek-chat",
        "Analyze this product: {{product}}",
    )
    .with_output_schema(schema_of::<ProductAnalysis>())
    .with_max_tokens(500);

    let mut vars = Variables::new();
    vars.insert(
        "product".into(),
        "A mechanical keyboard with hot-swappable switches, RGB lighting and a $180 price tag"
            .into(),
    );

    // Deterministic runs pin temperature; deepseek-chat has no seed support
    match runner
        .run(&analyst, &vars, RunOptions::new().deterministic(true))
        .await
    {
        Ok(result) => {
            let analysis: ProductAnalysis =
                serde_json::from_value(result.content.as_structured().cloned().unwrap_or_default())?;
            println!("{analysis:#?}");
            println!("retries: {}, elapsed: {:?}", result.retries, result.elapsed);
        }
        Err(AiError::Schema { violations }) => {
            for violation in violations {
                eprintln!("{}: {}", violation.path, violation.message);
            }
        }
        Err(err) => return Err(err.into()),
    }

    Ok(())
}
