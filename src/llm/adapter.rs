//! Provider adapter contract.
//!
//! Every stage talks to models through [`ProviderAdapter::invoke`]. Adapters
//! make exactly one attempt per call and classify failures through
//! [`ProviderError`]; retry, pacing and rate limiting belong to the
//! scheduler.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;

/// A message in a conversation with a model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Sampling parameters for one call.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InvokeParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    /// Ask the provider for a JSON object response.
    #[serde(default)]
    pub json_mode: bool,
}

/// One provider call.
#[derive(Debug, Clone, PartialEq)]
pub struct InvokeRequest {
    /// Full `provider:model` id.
    pub model: String,
    pub system: Option<String>,
    pub user: String,
    pub params: InvokeParams,
    pub timeout: Duration,
}

impl InvokeRequest {
    pub fn new(model: impl Into<String>, user: impl Into<String>, timeout: Duration) -> Self {
        Self {
            model: model.into(),
            system: None,
            user: user.into(),
            params: InvokeParams::default(),
            timeout,
        }
    }

    pub fn with_system(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.params.temperature = Some(temperature);
        self
    }

    pub fn with_max_output_tokens(mut self, max: u32) -> Self {
        self.params.max_output_tokens = Some(max);
        self
    }

    pub fn with_json_mode(mut self, json_mode: bool) -> Self {
        self.params.json_mode = json_mode;
        self
    }

    /// Provider prefix of the model id.
    pub fn provider(&self) -> &str {
        split_model(&self.model).0
    }

    /// Model id without the provider prefix.
    pub fn model_name(&self) -> &str {
        split_model(&self.model).1
    }

    pub fn messages(&self) -> Vec<Message> {
        let mut messages = Vec::with_capacity(2);
        if let Some(system) = &self.system {
            messages.push(Message::system(system.clone()));
        }
        messages.push(Message::user(self.user.clone()));
        messages
    }
}

/// Token usage reported by the provider, when available.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvokeOutput {
    pub output: String,
    pub usage: Option<Usage>,
}

impl InvokeOutput {
    pub fn text(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            usage: None,
        }
    }
}

/// A model backend.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Makes one call. Implementations should return promptly once `cancel`
    /// fires; the result of a cancelled call is discarded anyway.
    async fn invoke(
        &self,
        request: &InvokeRequest,
        cancel: &CancellationToken,
    ) -> Result<InvokeOutput, ProviderError>;
}

/// Splits `provider:model`. Ids without a prefix belong to the `default`
/// provider.
pub fn split_model(model: &str) -> (&str, &str) {
    match model.split_once(':') {
        Some((provider, name)) if !provider.is_empty() => (provider, name),
        _ => ("default", model),
    }
}

/// Rough token count (about 4 characters per token).
pub fn estimate_tokens(text: &str) -> u32 {
    (text.len() as f32 / 4.0).ceil() as u32
}
