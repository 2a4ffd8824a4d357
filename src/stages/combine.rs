//! Combine stage: merge the top candidates of a document.

use chrono::Utc;
use futures::future::join_all;
use uuid::Uuid;

use crate::config::CombinePolicy;
use crate::events::StageRecord;
use crate::llm::{estimate_tokens, InvokeRequest};
use crate::pipeline::{content_ref, CombinedDocument, GeneratedDocument, StageKind};
use crate::scheduler::NoopObserver;

use super::prompts::{build_combine_prompt, COMBINE_SYSTEM_PROMPT};
use super::StageContext;

/// Picks combine sources from `ranking` (best first).
///
/// Takes the first `top_n` ranked candidates, then drops the lowest-ranked
/// ones while their estimated size exceeds `max_output_tokens`. At least one
/// source is always kept. Returns `(sources, truncated)`, with `truncated`
/// listing dropped ids lowest rank first.
pub fn select_sources(
    ranking: &[String],
    candidates: &[GeneratedDocument],
    top_n: usize,
    max_output_tokens: u32,
) -> (Vec<String>, Vec<String>) {
    let mut selected: Vec<&GeneratedDocument> = ranking
        .iter()
        .filter_map(|id| candidates.iter().find(|c| &c.id == id))
        .take(top_n.max(1))
        .collect();

    let size = |docs: &[&GeneratedDocument]| -> u64 {
        docs.iter().map(|d| estimate_tokens(&d.content) as u64).sum()
    };

    let mut truncated = Vec::new();
    while selected.len() > 1 && size(&selected) > max_output_tokens as u64 {
        if let Some(dropped) = selected.pop() {
            truncated.push(dropped.id.clone());
        }
    }

    (selected.iter().map(|d| d.id.clone()).collect(), truncated)
}

/// Runs every combine model once over the selected sources and returns how
/// many combined documents were produced.
pub async fn run_combine(
    ctx: &StageContext,
    policy: &CombinePolicy,
    document_id: &str,
    ranking: &[String],
    candidates: &[GeneratedDocument],
) -> usize {
    let stage = StageKind::Combine.as_str();
    let top_n = ctx.config().effective_combine_top_n().unwrap_or(policy.top_n);
    let (sources, truncated) = select_sources(ranking, candidates, top_n, policy.max_output_tokens);
    if sources.is_empty() {
        return 0;
    }
    if !truncated.is_empty() {
        tracing::info!(
            document_id = %document_id,
            dropped = truncated.len(),
            "Dropped lowest-ranked combine sources to fit the output budget"
        );
    }

    let source_docs: Vec<&GeneratedDocument> = sources
        .iter()
        .filter_map(|id| candidates.iter().find(|c| &c.id == id))
        .collect();
    let source_text = ctx.run.document_content(document_id).unwrap_or_default();
    let prompt = build_combine_prompt(&policy.instructions, source_text, &source_docs);
    ctx.run.plan_units(policy.models.len() as u64).await;

    let produced = join_all(policy.models.iter().map(|model| {
        let request = InvokeRequest::new(model, prompt.clone(), policy.timeout)
            .with_system(COMBINE_SYSTEM_PROMPT)
            .with_max_output_tokens(policy.max_output_tokens);
        let sources = sources.clone();
        let truncated = truncated.clone();
        async move {
            let result = match ctx.registry.resolve(model) {
                Ok(adapter) => {
                    ctx.run
                        .controller()
                        .call(adapter.as_ref(), &request, &ctx.retry, &NoopObserver)
                        .await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(output) => {
                    let content = output.output;
                    let combined = CombinedDocument {
                        id: Uuid::new_v4().to_string(),
                        document_id: document_id.to_string(),
                        model: model.clone(),
                        sources,
                        truncated_sources: truncated,
                        content_ref: content_ref(&content),
                        content,
                        created_at: Utc::now(),
                    };
                    ctx.metrics.record_stage_unit(stage, "completed");
                    ctx.run.record(StageRecord::Combine(combined)).await
                }
                Err(e) => {
                    tracing::warn!(
                        run_id = %ctx.run.id(),
                        document_id = %document_id,
                        model = %model,
                        error = %e,
                        "Combine call failed"
                    );
                    ctx.metrics
                        .record_stage_unit(stage, &e.failure_kind().to_string());
                    ctx.run.advance_units(1).await;
                    false
                }
            }
        }
    }))
    .await;

    produced.into_iter().filter(|ok| *ok).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::sample_config;
    use crate::error::ProviderError;
    use crate::stages::testing::{context, ScriptedAdapter};
    use std::sync::Arc;

    fn candidate(id: &str, chars: usize) -> GeneratedDocument {
        GeneratedDocument {
            id: id.to_string(),
            document_id: "doc-1".to_string(),
            generator: "writer".to_string(),
            model: "mock:alpha".to_string(),
            iteration: 1,
            content_ref: String::new(),
            content: "x".repeat(chars),
            created_at: Utc::now(),
        }
    }

    fn ids(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_select_sources_respects_top_n() {
        let docs = vec![candidate("a", 40), candidate("b", 40), candidate("c", 40)];
        let (sources, truncated) = select_sources(&ids(&["c", "a", "b"]), &docs, 2, 1000);
        assert_eq!(sources, ids(&["c", "a"]));
        assert!(truncated.is_empty());
    }

    #[test]
    fn test_select_sources_drops_lowest_rank_first() {
        // 100 tokens each.
        let docs = vec![candidate("a", 400), candidate("b", 400), candidate("c", 400)];
        let (sources, truncated) = select_sources(&ids(&["a", "b", "c"]), &docs, 3, 150);
        assert_eq!(sources, ids(&["a"]));
        assert_eq!(truncated, ids(&["c", "b"]));
    }

    #[test]
    fn test_select_sources_keeps_one_oversized_source() {
        let docs = vec![candidate("a", 4000)];
        let (sources, truncated) = select_sources(&ids(&["a"]), &docs, 3, 10);
        assert_eq!(sources, ids(&["a"]));
        assert!(truncated.is_empty());
    }

    #[tokio::test]
    async fn test_one_combined_document_per_model() {
        let adapter = Arc::new(ScriptedAdapter::new(|req| {
            if req.model == "mock:flaky" {
                Err(ProviderError::permanent("rejected"))
            } else {
                Ok(format!("merged by {}", req.model))
            }
        }));
        let mut config = sample_config();
        config.combine.as_mut().unwrap().models =
            vec!["mock:combiner".to_string(), "mock:flaky".to_string()];
        let ctx = context(config, adapter).await;
        let policy = ctx.config().combine.clone().unwrap();
        let docs = vec![candidate("a", 40), candidate("b", 40), candidate("c", 40)];

        let produced = run_combine(&ctx, &policy, "doc-1", &ids(&["b", "a", "c"]), &docs).await;
        assert_eq!(produced, 1);

        let run = ctx.run.snapshot().await;
        assert_eq!(run.combined_docs.len(), 1);
        let combined = &run.combined_docs[0];
        assert_eq!(combined.model, "mock:combiner");
        // Capped by the pairwise top-N of 2.
        assert_eq!(combined.sources, ids(&["b", "a"]));
        assert_eq!(combined.content, "merged by mock:combiner");
        assert!(combined.content_ref.starts_with("sha256:"));
    }
}
