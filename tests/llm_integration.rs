//! Integration tests against a live OpenAI-compatible endpoint.
//!
//! These tests make real API calls.
//! Run with: EVALFORGE_API_KEY=your_key cargo test --test llm_integration -- --ignored
//! Set EVALFORGE_BASE_URL to target another compatible endpoint and
//! EVALFORGE_TEST_MODEL to pick the model (default: openai:gpt-4o-mini).

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use evalforge::config::OrchestratorSettings;
use evalforge::llm::{InvokeRequest, ProviderRegistry};

fn test_model() -> String {
    std::env::var("EVALFORGE_TEST_MODEL").unwrap_or_else(|_| "openai:gpt-4o-mini".to_string())
}

fn create_registry() -> ProviderRegistry {
    let settings = OrchestratorSettings::from_env().expect("settings from environment");
    assert!(
        settings.api_key.is_some(),
        "EVALFORGE_API_KEY or OPENAI_API_KEY must be set for integration tests"
    );
    ProviderRegistry::from_settings(&settings).expect("HTTP client")
}

#[tokio::test]
#[ignore] // Run with: cargo test --test llm_integration -- --ignored
async fn test_simple_generation() {
    let registry = create_registry();
    let model = test_model();
    let adapter = registry.resolve(&model).expect("adapter for model");

    let request = InvokeRequest::new(
        &model,
        "What is 2 + 2? Reply with just the number.",
        Duration::from_secs(60),
    )
    .with_system("You are a helpful assistant. Reply concisely.")
    .with_max_output_tokens(10)
    .with_temperature(0.0);

    let output = adapter.invoke(&request, &CancellationToken::new()).await;
    assert!(output.is_ok(), "Generation failed: {:?}", output.err());

    let output = output.expect("Should have output");
    assert!(
        output.output.contains('4'),
        "Response should contain '4', got: {}",
        output.output
    );
    if let Some(usage) = output.usage {
        assert!(usage.completion_tokens > 0, "Should have token usage");
    }
}

#[tokio::test]
#[ignore]
async fn test_json_mode_judge_reply() {
    let registry = create_registry();
    let model = test_model();
    let adapter = registry.resolve(&model).expect("adapter for model");

    let request = InvokeRequest::new(
        &model,
        "Rate the sentence 'The sky is blue.' for clarity from 1 to 10. \
         Respond with a JSON object {\"score\": <number>, \"reason\": <string>}.",
        Duration::from_secs(60),
    )
    .with_max_output_tokens(100)
    .with_temperature(0.0)
    .with_json_mode(true);

    let output = adapter
        .invoke(&request, &CancellationToken::new())
        .await
        .expect("judge call");
    let value = evalforge::utils::extract_json_object(&output.output, true)
        .expect("JSON object in reply");
    assert!(value.get("score").is_some(), "got: {}", output.output);
}

#[tokio::test]
#[ignore]
async fn test_invalid_key_is_permanent() {
    let settings = OrchestratorSettings::from_env()
        .expect("settings from environment")
        .with_api_key("sk-invalid");
    let registry = ProviderRegistry::from_settings(&settings).expect("HTTP client");
    let model = test_model();
    let adapter = registry.resolve(&model).expect("adapter for model");

    let request = InvokeRequest::new(&model, "Hello", Duration::from_secs(30));
    let err = adapter
        .invoke(&request, &CancellationToken::new())
        .await
        .expect_err("invalid key must fail");
    assert!(!err.is_retryable(), "401 should not be retried: {}", err);
}
