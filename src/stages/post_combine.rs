//! Post-combine evaluation.
//!
//! Scores every combined document the way candidates are scored. When
//! `post_combine_top_n` is set, each combined document is also compared
//! against that many top-ranked originals, one panel verdict per pair; these
//! comparisons carry no rating change and never feed back into the ranking.

use futures::future::join_all;

use crate::config::{CombinePolicy, EvalPolicy};
use crate::events::StageRecord;
use crate::pipeline::{CombinedDocument, EvalTarget, GeneratedDocument, PairwiseResult, StageKind};

use super::judge::ask_judge;
use super::pairwise::{decide_panel, parse_winner};
use super::prompts::{build_pairwise_prompt, PAIRWISE_SYSTEM_PROMPT};
use super::single_eval::{all_cancelled, evaluate_document};
use super::StageContext;

pub async fn run_post_combine(
    ctx: &StageContext,
    eval: &EvalPolicy,
    combine: &CombinePolicy,
    document_id: &str,
    ranking: &[String],
    candidates: &[GeneratedDocument],
) {
    let combined = ctx.run.combined_for(document_id).await;
    if combined.is_empty() {
        return;
    }

    evaluate_combined(ctx, eval, &combined).await;

    if let Some(k) = combine.post_combine_top_n.filter(|k| *k > 0) {
        let originals: Vec<&GeneratedDocument> = ranking
            .iter()
            .filter_map(|id| candidates.iter().find(|c| &c.id == id))
            .take(k)
            .collect();
        compare_with_originals(ctx, eval, document_id, &combined, &originals).await;
    }

    tracing::info!(
        run_id = %ctx.run.id(),
        document_id = %document_id,
        stage = StageKind::PostCombineEval.as_str(),
        combined = combined.len(),
        "Post-combine evaluation complete"
    );
}

async fn evaluate_combined(ctx: &StageContext, eval: &EvalPolicy, combined: &[CombinedDocument]) {
    let stage = StageKind::PostCombineEval.as_str();
    let rounds = eval.iterations.max(1);
    ctx.run.plan_units(combined.len() as u64 * rounds as u64).await;

    let units = combined
        .iter()
        .flat_map(|doc| (1..=rounds).map(move |round| (doc, round)));
    join_all(units.map(|(doc, round)| async move {
        let result = evaluate_document(
            ctx,
            eval,
            &doc.id,
            &doc.document_id,
            &doc.content,
            EvalTarget::Combined,
            round,
        )
        .await;
        if all_cancelled(&result) {
            ctx.run.advance_units(1).await;
            ctx.metrics.record_stage_unit(stage, "cancelled");
            return;
        }
        ctx.metrics.record_stage_unit(stage, "completed");
        ctx.run.record(StageRecord::PostCombineEval(result)).await;
    }))
    .await;
}

async fn compare_with_originals(
    ctx: &StageContext,
    eval: &EvalPolicy,
    document_id: &str,
    combined: &[CombinedDocument],
    originals: &[&GeneratedDocument],
) {
    let stage = StageKind::PostCombineEval.as_str();
    let instructions = eval
        .pairwise_instructions
        .as_deref()
        .unwrap_or(&eval.single_instructions);

    let comparisons: Vec<(&CombinedDocument, &GeneratedDocument)> = combined
        .iter()
        .flat_map(|doc| originals.iter().map(move |original| (doc, *original)))
        .collect();
    ctx.run.plan_units(comparisons.len() as u64).await;

    join_all(comparisons.into_iter().map(|(doc, original)| async move {
        let prompt =
            build_pairwise_prompt(instructions, &eval.criteria, &doc.content, &original.content);
        let outcomes = join_all(eval.judge_models.iter().map(|judge| {
            let prompt = prompt.as_str();
            async move {
                let outcome =
                    ask_judge(ctx, eval, judge, PAIRWISE_SYSTEM_PROMPT, prompt, parse_winner)
                        .await;
                (judge.as_str(), outcome)
            }
        }))
        .await;

        let Some(panel) = decide_panel(ctx, stage, document_id, outcomes) else {
            ctx.run.advance_units(1).await;
            return;
        };
        ctx.metrics.record_stage_unit(stage, "completed");
        ctx.run
            .record(StageRecord::PostCombinePairwise(PairwiseResult {
                document_id: document_id.to_string(),
                round: 0,
                judge_model: panel.judges,
                doc_a: doc.id.clone(),
                doc_b: original.id.clone(),
                winner: panel.winner,
                rating_delta: 0.0,
                reason: panel.reason,
            }))
            .await;
    }))
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::test_support::sample_config;
    use crate::pipeline::{content_ref, Winner};
    use crate::stages::testing::{context, ScriptedAdapter};
    use chrono::Utc;
    use std::sync::Arc;

    fn original(id: &str) -> GeneratedDocument {
        GeneratedDocument {
            id: id.to_string(),
            document_id: "doc-1".to_string(),
            generator: "writer".to_string(),
            model: "mock:alpha".to_string(),
            iteration: 1,
            content_ref: String::new(),
            content: format!("original {}", id),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_scores_combined_and_compares_with_top_originals() {
        let adapter = Arc::new(ScriptedAdapter::new(|req| {
            if req.system.as_deref() == Some(PAIRWISE_SYSTEM_PROMPT) {
                Ok(r#"{"winner": "A"}"#.to_string())
            } else {
                Ok(r#"{"score": 8}"#.to_string())
            }
        }));
        let mut config = sample_config();
        config.combine.as_mut().unwrap().post_combine_top_n = Some(1);
        let ctx = context(config, adapter).await;
        let eval = ctx.config().eval.clone().unwrap();
        let combine = ctx.config().combine.clone().unwrap();

        ctx.run
            .record(StageRecord::Combine(CombinedDocument {
                id: "combined-1".to_string(),
                document_id: "doc-1".to_string(),
                model: "mock:combiner".to_string(),
                sources: vec!["a".to_string(), "b".to_string()],
                truncated_sources: vec![],
                content_ref: content_ref("merged"),
                content: "merged".to_string(),
                created_at: Utc::now(),
            }))
            .await;
        let candidates = vec![original("a"), original("b")];
        let ranking = vec!["b".to_string(), "a".to_string()];

        run_post_combine(&ctx, &eval, &combine, "doc-1", &ranking, &candidates).await;

        let run = ctx.run.snapshot().await;
        assert_eq!(run.post_combine_evals.len(), 1);
        assert_eq!(run.post_combine_evals[0].target, EvalTarget::Combined);
        assert_eq!(run.post_combine_evals[0].average_score, Some(8.0));
        assert_eq!(run.post_combine_pairwise.len(), 1);
        let comparison = &run.post_combine_pairwise[0];
        assert_eq!(comparison.doc_a, "combined-1");
        assert_eq!(comparison.doc_b, "b");
        assert_eq!(comparison.winner, Winner::A);
        assert_eq!(comparison.rating_delta, 0.0);
        // Post-combine results never touch the candidate evaluations.
        assert!(run.eval_results.is_empty());
        assert!(run.pairwise_results.is_empty());
    }

    #[tokio::test]
    async fn test_each_original_compared_once_across_judges() {
        let adapter = Arc::new(ScriptedAdapter::new(|req| {
            if req.system.as_deref() != Some(PAIRWISE_SYSTEM_PROMPT) {
                return Ok(r#"{"score": 6}"#.to_string());
            }
            let winner = if req.model == "mock:j1" { "B" } else { "A" };
            Ok(format!(r#"{{"winner": "{}"}}"#, winner))
        }));
        let mut config = sample_config();
        config.eval.as_mut().unwrap().judge_models = vec![
            "mock:j1".to_string(),
            "mock:j2".to_string(),
            "mock:j3".to_string(),
        ];
        config.combine.as_mut().unwrap().post_combine_top_n = Some(2);
        let ctx = context(config, adapter).await;
        let eval = ctx.config().eval.clone().unwrap();
        let combine = ctx.config().combine.clone().unwrap();

        ctx.run
            .record(StageRecord::Combine(CombinedDocument {
                id: "combined-1".to_string(),
                document_id: "doc-1".to_string(),
                model: "mock:combiner".to_string(),
                sources: vec!["a".to_string(), "b".to_string()],
                truncated_sources: vec![],
                content_ref: content_ref("merged"),
                content: "merged".to_string(),
                created_at: Utc::now(),
            }))
            .await;
        let candidates = vec![original("a"), original("b")];
        let ranking = vec!["a".to_string(), "b".to_string()];

        run_post_combine(&ctx, &eval, &combine, "doc-1", &ranking, &candidates).await;

        let run = ctx.run.snapshot().await;
        let mut compared: Vec<_> = run
            .post_combine_pairwise
            .iter()
            .map(|r| (r.doc_a.as_str(), r.doc_b.as_str(), r.winner))
            .collect();
        compared.sort_by_key(|(_, original, _)| *original);
        assert_eq!(
            compared,
            vec![("combined-1", "a", Winner::A), ("combined-1", "b", Winner::A)]
        );
        assert!(run
            .post_combine_pairwise
            .iter()
            .all(|r| r.judge_model == "mock:j1,mock:j2,mock:j3"));
    }
}
