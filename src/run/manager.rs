//! Registry of runs and the submission contract.
//!
//! `submit` validates the supplied documents, registers a pending run and
//! spawns its driver; it returns the run id immediately. Runs stay in the
//! registry until explicitly deleted.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::stream::BoxStream;
use futures::StreamExt;
use uuid::Uuid;

use crate::config::{OrchestratorSettings, PipelineConfig};
use crate::error::{ProviderError, RunError};
use crate::events::{event_stream, RunEvent};
use crate::llm::ProviderRegistry;
use crate::pipeline::{Run, RunStatus};
use crate::scheduler::RateLimiter;

use super::driver::drive;
use super::state::RunHandle;

/// Default capacity of each run's event channel.
const DEFAULT_EVENT_BUFFER: usize = 256;

pub struct RunManager {
    runs: RwLock<HashMap<String, Arc<RunHandle>>>,
    registry: ProviderRegistry,
    rate_limiter: Arc<RateLimiter>,
    event_buffer: usize,
}

impl RunManager {
    /// Creates a manager whose runs share `rate_limiter`.
    pub fn new(registry: ProviderRegistry, rate_limiter: Arc<RateLimiter>) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            registry,
            rate_limiter,
            event_buffer: DEFAULT_EVENT_BUFFER,
        }
    }

    /// Manager backed by the OpenAI-compatible adapter and a rate limiter
    /// sized from `settings`.
    ///
    /// # Errors
    ///
    /// Fails if the HTTP client cannot be built.
    pub fn from_settings(settings: &OrchestratorSettings) -> Result<Self, ProviderError> {
        let registry = ProviderRegistry::from_settings(settings)?;
        let limiter = Arc::new(RateLimiter::from_settings(settings));
        Ok(Self::new(registry, limiter).with_event_buffer(settings.event_buffer))
    }

    pub fn with_event_buffer(mut self, size: usize) -> Self {
        self.event_buffer = size.max(1);
        self
    }

    pub fn rate_limiter(&self) -> &Arc<RateLimiter> {
        &self.rate_limiter
    }

    /// Registers a run for `config` and starts executing it in the
    /// background. `documents` maps every document id of the config to its
    /// text.
    ///
    /// # Errors
    ///
    /// `RunError::MissingDocument` if a document id has no content; no run
    /// is created in that case.
    pub fn submit(
        &self,
        config: PipelineConfig,
        documents: HashMap<String, String>,
    ) -> Result<String, RunError> {
        if let Some(missing) = config
            .documents
            .iter()
            .find(|id| !documents.contains_key(id.as_str()))
        {
            return Err(RunError::MissingDocument(missing.clone()));
        }

        let run_id = Uuid::new_v4().to_string();
        let registry = Arc::new(self.registry.clone().with_subprocess_generators(&config));
        let handle = Arc::new(RunHandle::new(
            run_id.clone(),
            Arc::new(config),
            documents,
            self.rate_limiter.clone(),
            self.event_buffer,
        ));

        self.write_runs().insert(run_id.clone(), handle.clone());
        tracing::info!(
            run_id = %run_id,
            config = %handle.config().name,
            tasks = handle.config().generation_task_count(),
            "Run submitted"
        );

        let driver_run_id = run_id.clone();
        tokio::spawn(async move {
            let status = drive(handle, registry).await;
            tracing::debug!(run_id = %driver_run_id, status = %status, "Run driver finished");
        });
        Ok(run_id)
    }

    fn read_runs(&self) -> std::sync::RwLockReadGuard<'_, HashMap<String, Arc<RunHandle>>> {
        self.runs.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_runs(&self) -> std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<RunHandle>>> {
        self.runs.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// # Errors
    ///
    /// `RunError::NotFound` for an unknown id.
    pub fn handle(&self, run_id: &str) -> Result<Arc<RunHandle>, RunError> {
        self.read_runs()
            .get(run_id)
            .cloned()
            .ok_or_else(|| RunError::NotFound(run_id.to_string()))
    }

    /// Current snapshot of a run.
    ///
    /// # Errors
    ///
    /// `RunError::NotFound` for an unknown id.
    pub async fn get(&self, run_id: &str) -> Result<Run, RunError> {
        Ok(self.handle(run_id)?.snapshot().await)
    }

    /// Ids and statuses of every registered run.
    pub async fn list(&self) -> Vec<(String, RunStatus)> {
        let handles: Vec<Arc<RunHandle>> = self.read_runs().values().cloned().collect();
        let mut out = Vec::with_capacity(handles.len());
        for handle in handles {
            out.push((handle.id().to_string(), handle.status().await));
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub async fn pause(&self, run_id: &str) -> Result<(), RunError> {
        self.handle(run_id)?.pause().await
    }

    pub async fn resume(&self, run_id: &str) -> Result<(), RunError> {
        self.handle(run_id)?.resume().await
    }

    pub async fn cancel(&self, run_id: &str) -> Result<(), RunError> {
        self.handle(run_id)?.cancel().await
    }

    /// Removes a terminal run from the registry.
    ///
    /// # Errors
    ///
    /// `RunError::StillActive` unless the run is terminal.
    pub async fn delete(&self, run_id: &str) -> Result<Run, RunError> {
        let handle = self.handle(run_id)?;
        let run = handle.snapshot().await;
        if !run.status.is_terminal() {
            return Err(RunError::StillActive(run_id.to_string()));
        }
        self.write_runs().remove(run_id);
        Ok(run)
    }

    /// Event stream of a run: a snapshot first, then live deltas until the
    /// run reaches a terminal status.
    ///
    /// # Errors
    ///
    /// `RunError::NotFound` for an unknown id.
    pub async fn subscribe(&self, run_id: &str) -> Result<BoxStream<'static, RunEvent>, RunError> {
        let handle = self.handle(run_id)?;
        let (initial, receiver) = handle.subscribe().await;
        let stream = event_stream(initial, receiver, move || {
            let handle = handle.clone();
            async move { handle.snapshot_event().await }
        });
        Ok(stream.boxed())
    }

    /// Waits for a run to reach a terminal status and returns its final
    /// snapshot.
    ///
    /// # Errors
    ///
    /// `RunError::NotFound` for an unknown id.
    pub async fn wait(&self, run_id: &str) -> Result<Run, RunError> {
        let handle = self.handle(run_id)?;
        handle.wait_terminal().await;
        Ok(handle.snapshot().await)
    }
}
