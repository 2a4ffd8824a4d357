//! evalforge: multi-model generation, evaluation and combination pipelines.
//!
//! A preset is resolved against a content library into an immutable
//! [`config::PipelineConfig`], expanded into generation tasks and executed
//! as a run: candidates are generated per document, scored by judge models,
//! re-ranked with pairwise Elo comparisons and merged by combine models.
//! Subscribers follow a run through a snapshot-then-delta event stream.

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod llm;
pub mod metrics;
pub mod pipeline;
pub mod run;
pub mod scheduler;
pub mod stages;
pub mod utils;

// Re-export commonly used types
pub use config::{resolve, OrchestratorSettings, PipelineConfig, Preset};
pub use error::{ConfigurationError, ProviderError, RunError, StageError};
pub use events::{EventPayload, RunEvent};
pub use pipeline::{Run, RunStatus};
pub use run::RunManager;
