//! User-facing preset records.
//!
//! A preset is what a user edits: content is referenced by id, durations are
//! plain numbers and disabled sections may still carry values. Nothing here
//! is validated; see [`super::resolver`].

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::{Backoff, GeneratorKind};

#[derive(Debug, Error)]
pub enum PresetError {
    #[error("Failed to read preset {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid YAML preset: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Invalid JSON preset: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub name: String,
    #[serde(default)]
    pub documents: Vec<String>,
    #[serde(default)]
    pub generators: Vec<GeneratorPreset>,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default)]
    pub evaluation: EvaluationPreset,
    #[serde(default)]
    pub combine: CombinePreset,
    #[serde(default)]
    pub concurrency: ConcurrencyPreset,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorPreset {
    pub name: String,
    #[serde(default = "default_generator_kind")]
    pub kind: GeneratorKind,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub models: Vec<String>,
    /// Content id of the generation instructions.
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_subprocess_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_subprocess_retries")]
    pub max_retries: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationPreset {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub judge_models: Vec<String>,
    #[serde(default = "default_iterations")]
    pub iterations: u32,
    #[serde(default = "default_pairwise_top_n")]
    pub pairwise_top_n: usize,
    #[serde(default = "default_true")]
    pub swap_positions: bool,
    #[serde(default = "default_eval_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_eval_retries")]
    pub retries: u32,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_eval_max_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_true")]
    pub strict_json: bool,
    /// Content ids.
    #[serde(default)]
    pub single_instructions: Option<String>,
    #[serde(default)]
    pub pairwise_instructions: Option<String>,
    #[serde(default)]
    pub criteria: Option<String>,
}

impl Default for EvaluationPreset {
    fn default() -> Self {
        Self {
            enabled: false,
            judge_models: Vec::new(),
            iterations: default_iterations(),
            pairwise_top_n: default_pairwise_top_n(),
            swap_positions: true,
            timeout_secs: default_eval_timeout_secs(),
            retries: default_eval_retries(),
            temperature: 0.0,
            max_output_tokens: default_eval_max_tokens(),
            strict_json: true,
            single_instructions: None,
            pairwise_instructions: None,
            criteria: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinePreset {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default = "default_combine_max_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_pairwise_top_n")]
    pub top_n: usize,
    #[serde(default)]
    pub post_combine_top_n: Option<usize>,
    #[serde(default = "default_combine_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CombinePreset {
    fn default() -> Self {
        Self {
            enabled: false,
            models: Vec::new(),
            instructions: None,
            max_output_tokens: default_combine_max_tokens(),
            top_n: default_pairwise_top_n(),
            post_combine_top_n: None,
            timeout_secs: default_combine_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConcurrencyPreset {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub launch_delay_ms: u64,
    #[serde(default = "default_true")]
    pub rate_limiting: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
    #[serde(default = "default_call_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ConcurrencyPreset {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            launch_delay_ms: 0,
            rate_limiting: true,
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            backoff: Backoff::default(),
            timeout_secs: default_call_timeout_secs(),
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_iterations() -> u32 {
    1
}
fn default_generator_kind() -> GeneratorKind {
    GeneratorKind::Llm
}
fn default_subprocess_timeout_secs() -> u64 {
    600
}
fn default_subprocess_retries() -> u32 {
    1
}
fn default_pairwise_top_n() -> usize {
    3
}
fn default_eval_timeout_secs() -> u64 {
    120
}
fn default_eval_retries() -> u32 {
    2
}
fn default_eval_max_tokens() -> u32 {
    1024
}
fn default_combine_max_tokens() -> u32 {
    8192
}
fn default_combine_timeout_secs() -> u64 {
    300
}
fn default_max_concurrent() -> usize {
    4
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}
fn default_call_timeout_secs() -> u64 {
    300
}

impl Preset {
    pub fn from_yaml(text: &str) -> Result<Self, PresetError> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn from_json(text: &str) -> Result<Self, PresetError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Loads a preset file. `.json` files are parsed as JSON, anything else as YAML.
    pub fn load(path: &Path) -> Result<Self, PresetError> {
        let text = std::fs::read_to_string(path).map_err(|source| PresetError::Io {
            path: path.display().to_string(),
            source,
        })?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json(&text),
            _ => Self::from_yaml(&text),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let preset = Preset::from_yaml(
            r#"
name: quick
documents: [intro]
generators:
  - name: writer
    models: ["openai:gpt-4o-mini"]
"#,
        )
        .unwrap();

        assert_eq!(preset.iterations, 1);
        assert_eq!(preset.generators[0].kind, GeneratorKind::Llm);
        assert!(preset.generators[0].enabled);
        assert!(!preset.evaluation.enabled);
        assert_eq!(preset.evaluation.pairwise_top_n, 3);
        assert!(!preset.combine.enabled);
        assert_eq!(preset.concurrency.max_concurrent, 4);
        assert_eq!(preset.concurrency.backoff, Backoff::Exponential);
    }

    #[test]
    fn test_full_json_preset() {
        let preset = Preset::from_json(
            r#"{
                "name": "full",
                "documents": ["a", "b"],
                "iterations": 2,
                "generators": [
                    {"name": "script", "kind": "subprocess", "models": ["local:x"],
                     "command": "./gen.sh", "args": ["--fast"], "timeout_secs": 30}
                ],
                "evaluation": {"enabled": true, "judge_models": ["openai:judge"],
                               "single_instructions": "single", "criteria": "crit",
                               "pairwise_top_n": 1},
                "combine": {"enabled": true, "models": ["openai:c"], "instructions": "merge",
                            "top_n": 2, "post_combine_top_n": 1},
                "concurrency": {"max_concurrent": 8, "backoff": "fixed", "launch_delay_ms": 250}
            }"#,
        )
        .unwrap();

        assert_eq!(preset.generators[0].kind, GeneratorKind::Subprocess);
        assert_eq!(preset.generators[0].command.as_deref(), Some("./gen.sh"));
        assert_eq!(preset.evaluation.pairwise_top_n, 1);
        assert_eq!(preset.combine.post_combine_top_n, Some(1));
        assert_eq!(preset.concurrency.backoff, Backoff::Fixed);
        assert_eq!(preset.concurrency.launch_delay_ms, 250);
    }

    #[test]
    fn test_load_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p.json");
        std::fs::write(&path, r#"{"name": "j"}"#).unwrap();
        assert_eq!(Preset::load(&path).unwrap().name, "j");

        let missing = dir.path().join("missing.yaml");
        let err = Preset::load(&missing).unwrap_err();
        assert!(err.to_string().contains("missing.yaml"));
    }
}
