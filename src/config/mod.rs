//! Pipeline configuration.
//!
//! A user-facing [`Preset`] is resolved against a [`ContentLibrary`] into an
//! immutable [`PipelineConfig`]. Every run holds its config behind an `Arc`
//! and never mutates it.
//!
//! Process-wide knobs that are not part of a preset (provider endpoint,
//! rate-limit bucket sizes, event buffer) live in [`OrchestratorSettings`].

pub mod content;
pub mod preset;
pub mod resolver;
pub mod settings;

use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use content::{ContentKind, ContentLibrary, DirectoryLibrary, InMemoryLibrary};
pub use preset::{Preset, PresetError};
pub use resolver::resolve;
pub use settings::{OrchestratorSettings, SettingsError};

/// How a generator produces content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GeneratorKind {
    /// Calls a model through a provider adapter.
    Llm,
    /// Runs an external command per task.
    Subprocess,
}

/// Outer timeout and retry budget for subprocess-backed generators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubprocessPolicy {
    pub command: String,
    pub args: Vec<String>,
    /// Wall-clock limit for one subprocess invocation.
    pub timeout: Duration,
    /// Extra outer attempts after a timed-out invocation.
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub name: String,
    pub kind: GeneratorKind,
    pub models: Vec<String>,
    /// Resolved generation instructions, if any.
    pub instructions: Option<String>,
    pub subprocess: Option<SubprocessPolicy>,
}

/// Evaluation settings. Present only when evaluation is enabled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalPolicy {
    pub judge_models: Vec<String>,
    /// Number of single-eval rounds per document.
    pub iterations: u32,
    /// Candidates entering pairwise comparison. Below 2 disables pairwise.
    pub pairwise_top_n: usize,
    /// Run a second pairwise round with positions swapped.
    pub swap_positions: bool,
    pub timeout: Duration,
    /// Re-asks allowed when a judge returns malformed output.
    pub retries: u32,
    pub temperature: f64,
    pub max_output_tokens: u32,
    pub strict_json: bool,
    pub single_instructions: String,
    pub pairwise_instructions: Option<String>,
    pub criteria: String,
}

impl EvalPolicy {
    pub fn pairwise_enabled(&self) -> bool {
        self.pairwise_top_n >= 2
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinePolicy {
    pub models: Vec<String>,
    pub instructions: String,
    pub max_output_tokens: u32,
    pub top_n: usize,
    /// When set, each combined document is also compared against this many
    /// top-ranked originals.
    pub post_combine_top_n: Option<usize>,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Fixed,
    #[default]
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyPolicy {
    pub max_concurrent: usize,
    /// Minimum spacing between successive dispatches.
    pub launch_delay: Duration,
    pub rate_limiting: bool,
    pub max_retries: u32,
    pub retry_delay: Duration,
    pub backoff: Backoff,
    /// Per-call timeout for generation calls.
    pub call_timeout: Duration,
}

impl Default for ConcurrencyPolicy {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            launch_delay: Duration::ZERO,
            rate_limiting: true,
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
            backoff: Backoff::Exponential,
            call_timeout: Duration::from_secs(300),
        }
    }
}

/// Resolved, immutable description of one pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub name: String,
    /// Source document ids, in preset order.
    pub documents: Vec<String>,
    /// Enabled generators only.
    pub generators: Vec<GeneratorConfig>,
    pub iterations: u32,
    pub eval: Option<EvalPolicy>,
    pub combine: Option<CombinePolicy>,
    pub concurrency: ConcurrencyPolicy,
}

impl PipelineConfig {
    /// Number of generation tasks this config expands into.
    pub fn generation_task_count(&self) -> usize {
        let models: usize = self.generators.iter().map(|g| g.models.len()).sum();
        self.documents.len() * models * self.iterations as usize
    }

    pub fn generator(&self, name: &str) -> Option<&GeneratorConfig> {
        self.generators.iter().find(|g| g.name == name)
    }

    /// Number of candidates a combine call may consume.
    pub fn effective_combine_top_n(&self) -> Option<usize> {
        let combine = self.combine.as_ref()?;
        let n = match &self.eval {
            Some(eval) => combine.top_n.min(eval.pairwise_top_n),
            None => combine.top_n,
        };
        Some(n.max(1))
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Two documents, one generator with two models, all stages enabled.
    pub fn sample_config() -> PipelineConfig {
        PipelineConfig {
            name: "sample".to_string(),
            documents: vec!["doc-1".to_string(), "doc-2".to_string()],
            generators: vec![GeneratorConfig {
                name: "writer".to_string(),
                kind: GeneratorKind::Llm,
                models: vec!["mock:alpha".to_string(), "mock:beta".to_string()],
                instructions: Some("Rewrite the document.".to_string()),
                subprocess: None,
            }],
            iterations: 1,
            eval: Some(EvalPolicy {
                judge_models: vec!["mock:judge".to_string()],
                iterations: 1,
                pairwise_top_n: 2,
                swap_positions: true,
                timeout: Duration::from_secs(30),
                retries: 1,
                temperature: 0.0,
                max_output_tokens: 512,
                strict_json: true,
                single_instructions: "Score the document.".to_string(),
                pairwise_instructions: Some("Pick the better document.".to_string()),
                criteria: "clarity".to_string(),
            }),
            combine: Some(CombinePolicy {
                models: vec!["mock:combiner".to_string()],
                instructions: "Merge the best parts.".to_string(),
                max_output_tokens: 4096,
                top_n: 2,
                post_combine_top_n: None,
                timeout: Duration::from_secs(60),
            }),
            concurrency: ConcurrencyPolicy {
                rate_limiting: false,
                retry_delay: Duration::from_millis(10),
                ..ConcurrencyPolicy::default()
            },
        }
    }
}
