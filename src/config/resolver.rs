//! Preset validation and resolution.
//!
//! [`resolve`] is pure: it reads content through the library, never writes,
//! and reports every violated constraint at once.

use std::collections::HashSet;
use std::time::Duration;

use crate::error::{ConfigViolation, ConfigurationError};

use super::content::{ContentKind, ContentLibrary};
use super::preset::{CombinePreset, EvaluationPreset, GeneratorPreset, Preset};
use super::{
    CombinePolicy, ConcurrencyPolicy, EvalPolicy, GeneratorConfig, GeneratorKind, PipelineConfig,
    SubprocessPolicy,
};

/// Accumulates violations while resolving.
struct Violations(Vec<ConfigViolation>);

impl Violations {
    fn push(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.0.push(ConfigViolation::new(field, message));
    }

    fn check(&mut self, ok: bool, field: &str, message: &str) {
        if !ok {
            self.push(field, message);
        }
    }
}

/// Looks up a required content id, recording a violation when it is absent
/// or does not resolve.
fn require_content(
    library: &dyn ContentLibrary,
    violations: &mut Violations,
    kind: ContentKind,
    field: &str,
    id: Option<&str>,
) -> Option<String> {
    match id.map(str::trim).filter(|s| !s.is_empty()) {
        None => {
            violations.push(field, "is required");
            None
        }
        Some(id) => optional_content(library, violations, kind, field, Some(id)),
    }
}

fn optional_content(
    library: &dyn ContentLibrary,
    violations: &mut Violations,
    kind: ContentKind,
    field: &str,
    id: Option<&str>,
) -> Option<String> {
    let id = id.map(str::trim).filter(|s| !s.is_empty())?;
    match library.resolve(kind, id) {
        Some(text) if !text.trim().is_empty() => Some(text),
        Some(_) => {
            violations.push(field, format!("content '{}' is empty", id));
            None
        }
        None => {
            violations.push(field, format!("content '{}' not found", id));
            None
        }
    }
}

/// Validates a preset and resolves its content references.
///
/// # Errors
///
/// Returns a `ConfigurationError` listing every violated constraint.
pub fn resolve(
    preset: &Preset,
    library: &dyn ContentLibrary,
) -> Result<PipelineConfig, ConfigurationError> {
    let mut v = Violations(Vec::new());

    v.check(!preset.name.trim().is_empty(), "name", "must not be empty");
    v.check(preset.iterations >= 1, "iterations", "must be at least 1");

    // Documents
    if preset.documents.is_empty() {
        v.push("documents", "at least one document is required");
    }
    let mut seen = HashSet::new();
    for doc in &preset.documents {
        if !seen.insert(doc.as_str()) {
            v.push("documents", format!("duplicate document '{}'", doc));
        } else if library.resolve(ContentKind::Document, doc).is_none() {
            v.push("documents", format!("content '{}' not found", doc));
        }
    }

    let generators = resolve_generators(&preset.generators, library, &mut v);
    let eval = resolve_eval(&preset.evaluation, library, &mut v);
    let combine = resolve_combine(&preset.combine, library, &mut v);

    let c = &preset.concurrency;
    v.check(
        c.max_concurrent >= 1,
        "concurrency.max_concurrent",
        "must be at least 1",
    );
    v.check(
        c.timeout_secs > 0,
        "concurrency.timeout_secs",
        "must be greater than 0",
    );
    let concurrency = ConcurrencyPolicy {
        max_concurrent: c.max_concurrent,
        launch_delay: Duration::from_millis(c.launch_delay_ms),
        rate_limiting: c.rate_limiting,
        max_retries: c.max_retries,
        retry_delay: Duration::from_millis(c.retry_delay_ms),
        backoff: c.backoff,
        call_timeout: Duration::from_secs(c.timeout_secs),
    };

    if !v.0.is_empty() {
        return Err(ConfigurationError::new(v.0));
    }

    Ok(PipelineConfig {
        name: preset.name.trim().to_string(),
        documents: preset.documents.clone(),
        generators,
        iterations: preset.iterations,
        eval,
        combine,
        concurrency,
    })
}

fn resolve_generators(
    presets: &[GeneratorPreset],
    library: &dyn ContentLibrary,
    v: &mut Violations,
) -> Vec<GeneratorConfig> {
    let mut generators = Vec::new();
    let mut names = HashSet::new();

    for (i, g) in presets.iter().enumerate() {
        if !g.enabled {
            continue;
        }
        let field = format!("generators[{}]", i);
        if !names.insert(g.name.as_str()) {
            v.push(format!("{}.name", field), format!("duplicate generator '{}'", g.name));
        }
        if g.models.is_empty() {
            v.push(format!("{}.models", field), "at least one model is required");
        }
        let mut models = HashSet::new();
        for model in &g.models {
            if !models.insert(model.as_str()) {
                v.push(
                    format!("{}.models", field),
                    format!("duplicate model '{}'", model),
                );
            }
        }
        let instructions = optional_content(
            library,
            v,
            ContentKind::Instructions,
            &format!("{}.instructions", field),
            g.instructions.as_deref(),
        );

        let subprocess = match g.kind {
            GeneratorKind::Llm => None,
            GeneratorKind::Subprocess => {
                let command = g.command.as_deref().map(str::trim).unwrap_or_default();
                if command.is_empty() {
                    v.push(
                        format!("{}.command", field),
                        "subprocess generators need a command",
                    );
                }
                if g.timeout_secs == 0 {
                    v.push(format!("{}.timeout_secs", field), "must be greater than 0");
                }
                Some(SubprocessPolicy {
                    command: command.to_string(),
                    args: g.args.clone(),
                    timeout: Duration::from_secs(g.timeout_secs),
                    max_retries: g.max_retries,
                })
            }
        };

        generators.push(GeneratorConfig {
            name: g.name.clone(),
            kind: g.kind,
            models: g.models.clone(),
            instructions,
            subprocess,
        });
    }

    if generators.is_empty() {
        v.push("generators", "at least one generator must be enabled");
    }
    generators
}

fn resolve_eval(
    e: &EvaluationPreset,
    library: &dyn ContentLibrary,
    v: &mut Violations,
) -> Option<EvalPolicy> {
    if !e.enabled {
        return None;
    }

    if e.judge_models.is_empty() {
        v.push("evaluation.judge_models", "must not be empty when evaluation is enabled");
    }
    v.check(e.iterations >= 1, "evaluation.iterations", "must be at least 1");
    v.check(
        (0.0..=2.0).contains(&e.temperature),
        "evaluation.temperature",
        "must be between 0.0 and 2.0",
    );
    v.check(e.timeout_secs > 0, "evaluation.timeout_secs", "must be greater than 0");

    let single = require_content(
        library,
        v,
        ContentKind::Instructions,
        "evaluation.single_instructions",
        e.single_instructions.as_deref(),
    );
    let criteria = require_content(
        library,
        v,
        ContentKind::Criteria,
        "evaluation.criteria",
        e.criteria.as_deref(),
    );
    let pairwise = if e.pairwise_top_n >= 2 {
        require_content(
            library,
            v,
            ContentKind::Instructions,
            "evaluation.pairwise_instructions",
            e.pairwise_instructions.as_deref(),
        )
    } else {
        None
    };

    Some(EvalPolicy {
        judge_models: e.judge_models.clone(),
        iterations: e.iterations,
        pairwise_top_n: e.pairwise_top_n,
        swap_positions: e.swap_positions,
        timeout: Duration::from_secs(e.timeout_secs),
        retries: e.retries,
        temperature: e.temperature,
        max_output_tokens: e.max_output_tokens,
        strict_json: e.strict_json,
        single_instructions: single.unwrap_or_default(),
        pairwise_instructions: pairwise,
        criteria: criteria.unwrap_or_default(),
    })
}

fn resolve_combine(
    c: &CombinePreset,
    library: &dyn ContentLibrary,
    v: &mut Violations,
) -> Option<CombinePolicy> {
    if !c.enabled {
        return None;
    }

    if c.models.is_empty() {
        v.push("combine.models", "must not be empty when combine is enabled");
    }
    v.check(c.max_output_tokens > 0, "combine.max_output_tokens", "must be greater than 0");
    v.check(c.top_n >= 1, "combine.top_n", "must be at least 1");
    v.check(c.timeout_secs > 0, "combine.timeout_secs", "must be greater than 0");
    if c.post_combine_top_n == Some(0) {
        v.push("combine.post_combine_top_n", "must be at least 1 when set");
    }
    let instructions = require_content(
        library,
        v,
        ContentKind::Instructions,
        "combine.instructions",
        c.instructions.as_deref(),
    );

    Some(CombinePolicy {
        models: c.models.clone(),
        instructions: instructions.unwrap_or_default(),
        max_output_tokens: c.max_output_tokens,
        top_n: c.top_n,
        post_combine_top_n: c.post_combine_top_n,
        timeout: Duration::from_secs(c.timeout_secs),
    })
}
