//! Single-document evaluation and ranking.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::time::Instant;

use futures::future::join_all;
use serde_json::Value;

use crate::config::EvalPolicy;
use crate::error::FailureKind;
use crate::events::StageRecord;
use crate::pipeline::{EvalResult, EvalTarget, GeneratedDocument, StageKind, TaskError};

use super::judge::{as_number, ask_judge, JudgeOutcome};
use super::prompts::{build_single_eval_prompt, SINGLE_EVAL_SYSTEM_PROMPT};
use super::StageContext;

/// Reads a judge score: either `{"score": n}` or the mean of
/// `{"evaluations": [{"score": n}, ...]}`.
pub fn parse_score(value: &Value) -> Option<f64> {
    if let Some(score) = value.get("score").and_then(as_number) {
        return Some(score);
    }
    let scores: Vec<f64> = value
        .get("evaluations")?
        .as_array()?
        .iter()
        .filter_map(|e| e.get("score").and_then(as_number))
        .collect();
    mean(&scores)
}

fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        None
    } else {
        Some(values.iter().sum::<f64>() / values.len() as f64)
    }
}

/// Scores one document in one round with every judge.
pub async fn evaluate_document(
    ctx: &StageContext,
    eval: &EvalPolicy,
    doc_id: &str,
    document_id: &str,
    content: &str,
    target: EvalTarget,
    round: u32,
) -> EvalResult {
    let started = Instant::now();
    let prompt = build_single_eval_prompt(&eval.single_instructions, &eval.criteria, content);

    let outcomes = join_all(eval.judge_models.iter().map(|judge| {
        ask_judge(
            ctx,
            eval,
            judge,
            SINGLE_EVAL_SYSTEM_PROMPT,
            &prompt,
            parse_score,
        )
    }))
    .await;

    let mut scores_by_model = BTreeMap::new();
    let mut parse_failures = Vec::new();
    let mut errors = BTreeMap::new();
    for (judge, outcome) in eval.judge_models.iter().zip(outcomes) {
        match outcome {
            JudgeOutcome::Parsed { value, .. } => {
                scores_by_model.insert(judge.clone(), value);
            }
            JudgeOutcome::Unparseable(problem) => {
                tracing::warn!(
                    doc_id = %doc_id,
                    judge = %judge,
                    problem = %problem,
                    "Judge output unparseable after retries"
                );
                parse_failures.push(judge.clone());
            }
            JudgeOutcome::Failed(e) => {
                errors.insert(judge.clone(), TaskError::from(&e));
            }
        }
    }

    let scores: Vec<f64> = scores_by_model.values().copied().collect();
    EvalResult {
        doc_id: doc_id.to_string(),
        document_id: document_id.to_string(),
        target,
        round,
        judge_models: eval.judge_models.clone(),
        average_score: mean(&scores),
        scores_by_model,
        parse_failures,
        errors,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

pub(crate) fn all_cancelled(result: &EvalResult) -> bool {
    result.scores_by_model.is_empty()
        && result.parse_failures.is_empty()
        && !result.errors.is_empty()
        && result
            .errors
            .values()
            .all(|e| e.kind == FailureKind::Cancelled)
}

/// Evaluates every candidate of a document and returns their ranking.
pub async fn run_single_eval(
    ctx: &StageContext,
    eval: &EvalPolicy,
    document_id: &str,
    candidates: &[GeneratedDocument],
) -> Vec<String> {
    let stage = StageKind::SingleEval.as_str();
    let rounds = eval.iterations.max(1);
    ctx.run
        .plan_units(candidates.len() as u64 * rounds as u64)
        .await;

    let units = candidates
        .iter()
        .flat_map(|doc| (1..=rounds).map(move |round| (doc, round)));
    let results = join_all(units.map(|(doc, round)| async move {
        let result = evaluate_document(
            ctx,
            eval,
            &doc.id,
            document_id,
            &doc.content,
            EvalTarget::Generated,
            round,
        )
        .await;
        if all_cancelled(&result) {
            ctx.run.advance_units(1).await;
            ctx.metrics.record_stage_unit(stage, "cancelled");
            return None;
        }
        let status = if result.average_score.is_some() {
            "completed"
        } else {
            "unscored"
        };
        ctx.metrics.record_stage_unit(stage, status);
        if ctx.run.record(StageRecord::Eval(result.clone())).await {
            Some(result)
        } else {
            None
        }
    }))
    .await;

    let results: Vec<EvalResult> = results.into_iter().flatten().collect();
    let ranking = rank_candidates(candidates, &results);
    tracing::info!(
        run_id = %ctx.run.id(),
        document_id = %document_id,
        stage = stage,
        candidates = candidates.len(),
        best = ranking.first().map(String::as_str).unwrap_or("-"),
        "Single evaluation complete"
    );
    ranking
}

/// Orders candidates best first: mean of round averages descending, then
/// candidates without any score, ties broken by earliest creation then id.
pub fn rank_candidates(candidates: &[GeneratedDocument], results: &[EvalResult]) -> Vec<String> {
    let mut round_scores: HashMap<&str, Vec<f64>> = HashMap::new();
    for result in results {
        if let Some(score) = result.average_score {
            round_scores.entry(result.doc_id.as_str()).or_default().push(score);
        }
    }

    let mut ranked: Vec<(&GeneratedDocument, Option<f64>)> = candidates
        .iter()
        .map(|doc| {
            let score = round_scores.get(doc.id.as_str()).and_then(|s| mean(s));
            (doc, score)
        })
        .collect();

    ranked.sort_by(|(a, sa), (b, sb)| {
        let by_score = match (sa, sb) {
            (Some(x), Some(y)) => y.total_cmp(x),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_score
            .then_with(|| a.created_at.cmp(&b.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });

    ranked.into_iter().map(|(doc, _)| doc.id.clone()).collect()
}
