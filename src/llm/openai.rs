//! OpenAI-compatible chat completions adapter.
//!
//! Works against any endpoint speaking the `/chat/completions` dialect
//! (OpenAI, OpenRouter, LiteLLM proxies, local servers).

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::llm::adapter::{InvokeOutput, InvokeRequest, Message, ProviderAdapter, Usage};

/// Adapter for one OpenAI-compatible endpoint.
pub struct OpenAiCompatibleAdapter {
    client: Client,
    api_key: Option<String>,
    base_url: String,
}

impl OpenAiCompatibleAdapter {
    /// # Errors
    ///
    /// Returns a permanent `ProviderError` if the HTTP client cannot be built.
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        connect_timeout: Duration,
    ) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .map_err(|e| ProviderError::permanent(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Get the API key (for debugging, returns masked value).
    pub fn api_key_masked(&self) -> String {
        let Some(key) = &self.api_key else {
            return "<none>".to_string();
        };
        if key.len() <= 8 {
            "*".repeat(key.len())
        } else {
            format!("{}...{}", &key[..4], &key[key.len() - 4..])
        }
    }

    async fn execute_request(&self, request: &ApiRequest) -> Result<InvokeOutput, ProviderError> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(request);
        if let Some(key) = &self.api_key {
            builder = builder.header("Authorization", format!("Bearer {}", key));
        }

        let http_response = builder.send().await.map_err(classify_request_error)?;
        let status = http_response.status();

        if !status.is_success() {
            let error_text = http_response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error response".to_string());
            let message = serde_json::from_str::<ApiErrorResponse>(&error_text)
                .map(|r| r.error.message)
                .unwrap_or(error_text);
            return Err(ProviderError::from_status(status.as_u16(), message));
        }

        let api_response: ApiResponse = http_response.json().await.map_err(|e| {
            ProviderError::transient(format!("Failed to parse API response: {}", e))
        })?;

        let output = api_response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ProviderError::transient("Response contained no choices"))?;

        Ok(InvokeOutput {
            output,
            usage: api_response.usage.map(|u| Usage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
            }),
        })
    }
}

/// Maps a transport-level failure onto the retry taxonomy.
fn classify_request_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::timeout(err.to_string())
    } else if err.is_builder() {
        ProviderError::permanent(err.to_string())
    } else {
        ProviderError::transient(err.to_string())
    }
}

#[async_trait]
impl ProviderAdapter for OpenAiCompatibleAdapter {
    async fn invoke(
        &self,
        request: &InvokeRequest,
        cancel: &CancellationToken,
    ) -> Result<InvokeOutput, ProviderError> {
        let api_request = ApiRequest {
            model: request.model_name().to_string(),
            messages: request.messages(),
            temperature: request.params.temperature,
            max_tokens: request.params.max_output_tokens,
            response_format: request
                .params
                .json_mode
                .then(|| ResponseFormat {
                    kind: "json_object".to_string(),
                }),
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProviderError::cancelled("call cancelled")),
            result = tokio::time::timeout(request.timeout, self.execute_request(&api_request)) => {
                match result {
                    Ok(inner) => inner,
                    Err(_) => Err(ProviderError::timeout(format!(
                        "no response within {:?}",
                        request.timeout
                    ))),
                }
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ApiRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Clone, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    choices: Vec<ApiChoice>,
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiMessage,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ApiErrorResponse {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}
