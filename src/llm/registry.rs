//! Routes model ids to adapters.

use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{GeneratorKind, OrchestratorSettings, PipelineConfig};
use crate::error::{ProviderError, StageError};
use crate::llm::adapter::{split_model, ProviderAdapter};
use crate::llm::openai::OpenAiCompatibleAdapter;
use crate::llm::subprocess::SubprocessAdapter;

/// Adapter lookup by provider prefix, with per-generator overrides.
///
/// Subprocess generators are registered by generator name; every other
/// call is routed by the `provider` part of `provider:model`, falling back
/// to the default adapter when one is set.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn ProviderAdapter>>,
    generators: HashMap<String, Arc<dyn ProviderAdapter>>,
    fallback: Option<Arc<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with one OpenAI-compatible adapter as fallback.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn from_settings(settings: &OrchestratorSettings) -> Result<Self, ProviderError> {
        let http = OpenAiCompatibleAdapter::new(
            settings.provider_base_url.clone(),
            settings.api_key.clone(),
            settings.connect_timeout,
        )?;
        Ok(Self::new().with_fallback(Arc::new(http)))
    }

    /// Registers a subprocess adapter for every subprocess generator of
    /// `config`, replacing earlier overrides with the same name.
    pub fn with_subprocess_generators(mut self, config: &PipelineConfig) -> Self {
        for generator in &config.generators {
            if let (GeneratorKind::Subprocess, Some(policy)) = (generator.kind, &generator.subprocess)
            {
                self.register_generator(
                    generator.name.clone(),
                    Arc::new(SubprocessAdapter::from_policy(policy)),
                );
            }
        }
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.register(provider, adapter);
        self
    }

    pub fn with_fallback(mut self, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.fallback = Some(adapter);
        self
    }

    pub fn register(&mut self, provider: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) {
        self.providers.insert(provider.into(), adapter);
    }

    pub fn register_generator(&mut self, generator: impl Into<String>, adapter: Arc<dyn ProviderAdapter>) {
        self.generators.insert(generator.into(), adapter);
    }

    /// Adapter for a model id.
    ///
    /// # Errors
    ///
    /// `StageError::UnknownProvider` when neither the provider nor a
    /// fallback is registered.
    pub fn resolve(&self, model: &str) -> Result<Arc<dyn ProviderAdapter>, StageError> {
        let (provider, _) = split_model(model);
        self.providers
            .get(provider)
            .or(self.fallback.as_ref())
            .cloned()
            .ok_or_else(|| StageError::UnknownProvider(model.to_string()))
    }

    /// Adapter for a generation call, honouring generator overrides.
    pub fn for_generator(
        &self,
        generator: &str,
        model: &str,
    ) -> Result<Arc<dyn ProviderAdapter>, StageError> {
        match self.generators.get(generator) {
            Some(adapter) => Ok(adapter.clone()),
            None => self.resolve(model),
        }
    }
}
