//! Stage executors.
//!
//! Each executor runs the units of one stage for one source document,
//! dispatching every provider call through the run's concurrency controller
//! and reporting results through the run state machine:
//!
//! - [`generation`]: one call per generation task
//! - [`single_eval`]: every judge scores every candidate, per eval round
//! - [`pairwise`]: judges compare the top candidates, Elo re-ranks them
//! - [`combine`]: each combine model merges the top candidates
//! - [`post_combine`]: combined documents are scored and optionally compared
//!   against the originals

pub mod combine;
pub mod generation;
pub mod judge;
pub mod pairwise;
pub mod post_combine;
pub mod prompts;
pub mod single_eval;

use std::sync::Arc;

use crate::config::PipelineConfig;
use crate::llm::ProviderRegistry;
use crate::metrics::MetricsCollector;
use crate::run::RunHandle;
use crate::scheduler::RetryPolicy;

pub use combine::{run_combine, select_sources};
pub use generation::run_generation;
pub use pairwise::{apply_elo, expected_score, run_pairwise, unordered_pairs, ELO_BASE, ELO_K};
pub use post_combine::run_post_combine;
pub use single_eval::{rank_candidates, run_single_eval};

/// Everything an executor needs for one run.
#[derive(Clone)]
pub struct StageContext {
    pub run: Arc<RunHandle>,
    pub registry: Arc<ProviderRegistry>,
    /// Call-level retry policy derived from the run's concurrency settings.
    pub retry: RetryPolicy,
    pub metrics: MetricsCollector,
}

impl StageContext {
    pub fn new(run: Arc<RunHandle>, registry: Arc<ProviderRegistry>) -> Self {
        let retry = RetryPolicy::from_concurrency(&run.config().concurrency);
        Self {
            run,
            registry,
            retry,
            metrics: MetricsCollector::new(),
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        self.run.config()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    use super::StageContext;
    use crate::config::PipelineConfig;
    use crate::error::ProviderError;
    use crate::llm::{InvokeOutput, InvokeRequest, ProviderAdapter, ProviderRegistry};
    use crate::run::RunHandle;
    use crate::scheduler::RateLimiter;

    type Responder = dyn Fn(&InvokeRequest) -> Result<String, ProviderError> + Send + Sync;

    /// Adapter answering every call through a closure.
    pub struct ScriptedAdapter {
        respond: Box<Responder>,
        delay: Duration,
        calls: AtomicU32,
    }

    impl ScriptedAdapter {
        pub fn new(
            respond: impl Fn(&InvokeRequest) -> Result<String, ProviderError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                respond: Box::new(respond),
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        async fn invoke(
            &self,
            request: &InvokeRequest,
            _cancel: &CancellationToken,
        ) -> Result<InvokeOutput, ProviderError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            (self.respond)(request).map(InvokeOutput::text)
        }
    }

    /// Started run over `config` whose every model is served by `adapter`.
    pub async fn context(config: PipelineConfig, adapter: Arc<dyn ProviderAdapter>) -> StageContext {
        context_with_registry(config, ProviderRegistry::new().with_fallback(adapter)).await
    }

    /// Started run over `config` routed through `registry`.
    pub async fn context_with_registry(
        config: PipelineConfig,
        registry: ProviderRegistry,
    ) -> StageContext {
        let documents: HashMap<String, String> = config
            .documents
            .iter()
            .map(|d| (d.clone(), format!("content of {}", d)))
            .collect();
        let run = Arc::new(RunHandle::new(
            "test-run",
            Arc::new(config),
            documents,
            Arc::new(RateLimiter::new(100, 100.0)),
            1024,
        ));
        run.start().await.expect("fresh run starts");
        StageContext::new(run, Arc::new(registry))
    }
}
