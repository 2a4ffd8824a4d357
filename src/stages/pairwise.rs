//! Pairwise evaluation with Elo re-ranking.
//!
//! Every unordered pair of the top-N candidates is judged once per round.
//! Round 0 presents `(a, b)`; when positions are swapped, round 1 presents
//! `(b, a)`. Each judge is asked, and the panel's majority becomes the one
//! [`PairwiseResult`] of that pair and round (an even split is a tie).
//! Ratings start at [`ELO_BASE`] and are updated only after every verdict is
//! in, in (round, pair) order, so the outcome does not depend on which call
//! finished first.

use std::cmp::Ordering;
use std::collections::HashMap;

use futures::future::join_all;
use serde_json::Value;

use crate::config::EvalPolicy;
use crate::events::StageRecord;
use crate::pipeline::{GeneratedDocument, PairwiseResult, StageKind, Winner};

use super::judge::{ask_judge, JudgeOutcome};
use super::prompts::{build_pairwise_prompt, PAIRWISE_SYSTEM_PROMPT};
use super::StageContext;

pub const ELO_BASE: f64 = 1500.0;
pub const ELO_K: f64 = 32.0;

/// Expected score of a player rated `ra` against one rated `rb`.
pub fn expected_score(ra: f64, rb: f64) -> f64 {
    1.0 / (1.0 + 10f64.powf((rb - ra) / 400.0))
}

/// Applies one verdict and returns the change of `a`'s rating.
pub fn apply_elo(ratings: &mut HashMap<String, f64>, a: &str, b: &str, winner: Winner) -> f64 {
    let ra = ratings.get(a).copied().unwrap_or(ELO_BASE);
    let rb = ratings.get(b).copied().unwrap_or(ELO_BASE);
    let actual = match winner {
        Winner::A => 1.0,
        Winner::B => 0.0,
        Winner::Tie => 0.5,
    };
    let delta = ELO_K * (actual - expected_score(ra, rb));
    ratings.insert(a.to_string(), ra + delta);
    ratings.insert(b.to_string(), rb - delta);
    delta
}

/// Index pairs `(i, j)` with `i < j`, each unordered pair exactly once.
pub fn unordered_pairs(n: usize) -> Vec<(usize, usize)> {
    (0..n)
        .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
        .collect()
}

/// Majority of `votes`; ties abstain, an even split is a tie. `None` when
/// nobody voted.
pub fn majority(votes: &[Winner]) -> Option<Winner> {
    if votes.is_empty() {
        return None;
    }
    let a = votes.iter().filter(|w| **w == Winner::A).count();
    let b = votes.iter().filter(|w| **w == Winner::B).count();
    Some(match a.cmp(&b) {
        Ordering::Greater => Winner::A,
        Ordering::Less => Winner::B,
        Ordering::Equal => Winner::Tie,
    })
}

/// Decision of a judge panel on one presented pair.
pub(crate) struct PanelVerdict {
    pub winner: Winner,
    /// Judges whose verdict counted, comma separated.
    pub judges: String,
    pub reason: Option<String>,
}

/// Folds every judge's answer on one pair into a single verdict.
///
/// Unparseable answers and failed calls are logged and counted on `stage`
/// but do not vote. Returns `None` when no judge produced a verdict.
pub(crate) fn decide_panel(
    ctx: &StageContext,
    stage: &str,
    document_id: &str,
    outcomes: Vec<(&str, JudgeOutcome<Winner>)>,
) -> Option<PanelVerdict> {
    let mut votes = Vec::new();
    let mut judges = Vec::new();
    let mut reasons = Vec::new();
    for (judge, outcome) in outcomes {
        match outcome {
            JudgeOutcome::Parsed { value, reason } => {
                votes.push(value);
                judges.push(judge);
                if let Some(reason) = reason {
                    reasons.push((judge, reason));
                }
            }
            JudgeOutcome::Unparseable(problem) => {
                tracing::warn!(
                    document_id = %document_id,
                    judge = %judge,
                    problem = %problem,
                    "Pairwise verdict unparseable, counted as no comparison"
                );
                ctx.metrics.record_stage_unit(stage, "unparseable");
            }
            JudgeOutcome::Failed(e) => {
                tracing::warn!(
                    document_id = %document_id,
                    judge = %judge,
                    error = %e,
                    "Pairwise comparison failed"
                );
                ctx.metrics.record_stage_unit(stage, &e.failure_kind().to_string());
            }
        }
    }

    let winner = majority(&votes)?;
    let reason = match reasons.len() {
        0 => None,
        1 if judges.len() == 1 => reasons.pop().map(|(_, reason)| reason),
        _ => Some(
            reasons
                .iter()
                .map(|(judge, reason)| format!("{}: {}", judge, reason))
                .collect::<Vec<_>>()
                .join("; "),
        ),
    };
    Some(PanelVerdict {
        winner,
        judges: judges.join(","),
        reason,
    })
}

pub fn parse_winner(value: &Value) -> Option<Winner> {
    let raw = value.get("winner")?.as_str()?.trim().to_ascii_lowercase();
    match raw.trim_start_matches("document").trim() {
        "a" => Some(Winner::A),
        "b" => Some(Winner::B),
        "tie" | "draw" => Some(Winner::Tie),
        _ => None,
    }
}

struct Comparison<'a> {
    round: u32,
    doc_a: &'a GeneratedDocument,
    doc_b: &'a GeneratedDocument,
}

/// Compares the top candidates and returns the new ordering: compared
/// candidates by rating (ties keep single-eval order), then the rest.
pub async fn run_pairwise(
    ctx: &StageContext,
    eval: &EvalPolicy,
    document_id: &str,
    ranking: &[String],
    candidates: &[GeneratedDocument],
) -> Vec<String> {
    let stage = StageKind::Pairwise.as_str();
    let top: Vec<&GeneratedDocument> = ranking
        .iter()
        .take(eval.pairwise_top_n)
        .filter_map(|id| candidates.iter().find(|c| &c.id == id))
        .collect();
    if top.len() < 2 {
        return ranking.to_vec();
    }

    let rounds: u32 = if eval.swap_positions { 2 } else { 1 };
    let pairs = unordered_pairs(top.len());
    let mut comparisons = Vec::new();
    for round in 0..rounds {
        for &(i, j) in &pairs {
            let (doc_a, doc_b) = if round == 0 { (top[i], top[j]) } else { (top[j], top[i]) };
            comparisons.push(Comparison {
                round,
                doc_a,
                doc_b,
            });
        }
    }
    ctx.run.plan_units(comparisons.len() as u64).await;

    let instructions = eval
        .pairwise_instructions
        .as_deref()
        .unwrap_or(&eval.single_instructions);
    let panels = join_all(comparisons.iter().map(|c| {
        let prompt =
            build_pairwise_prompt(instructions, &eval.criteria, &c.doc_a.content, &c.doc_b.content);
        async move {
            let prompt = prompt.as_str();
            join_all(eval.judge_models.iter().map(|judge| async move {
                let outcome =
                    ask_judge(ctx, eval, judge, PAIRWISE_SYSTEM_PROMPT, prompt, parse_winner)
                        .await;
                (judge.as_str(), outcome)
            }))
            .await
        }
    }))
    .await;

    let mut ratings: HashMap<String, f64> =
        top.iter().map(|d| (d.id.clone(), ELO_BASE)).collect();
    for (comparison, outcomes) in comparisons.iter().zip(panels) {
        let Some(panel) = decide_panel(ctx, stage, document_id, outcomes) else {
            ctx.run.advance_units(1).await;
            continue;
        };

        let rating_delta = apply_elo(
            &mut ratings,
            &comparison.doc_a.id,
            &comparison.doc_b.id,
            panel.winner,
        );
        ctx.metrics.record_stage_unit(stage, "completed");
        ctx.run
            .record(StageRecord::Pairwise(PairwiseResult {
                document_id: document_id.to_string(),
                round: comparison.round,
                judge_model: panel.judges,
                doc_a: comparison.doc_a.id.clone(),
                doc_b: comparison.doc_b.id.clone(),
                winner: panel.winner,
                rating_delta,
                reason: panel.reason,
            }))
            .await;
    }

    let ordering = order_by_rating(ranking, top.len(), &ratings);
    tracing::info!(
        run_id = %ctx.run.id(),
        document_id = %document_id,
        stage = stage,
        comparisons = comparisons.len(),
        best = ordering.first().map(String::as_str).unwrap_or("-"),
        "Pairwise evaluation complete"
    );
    ordering
}

/// The first `compared` entries of `ranking` sorted by rating descending
/// (stable, so equal ratings keep their single-eval order), followed by the
/// remainder unchanged.
fn order_by_rating(
    ranking: &[String],
    compared: usize,
    ratings: &HashMap<String, f64>,
) -> Vec<String> {
    let split = compared.min(ranking.len());
    let mut head: Vec<String> = ranking[..split].to_vec();
    head.sort_by(|a, b| {
        let ra = ratings.get(a).copied().unwrap_or(ELO_BASE);
        let rb = ratings.get(b).copied().unwrap_or(ELO_BASE);
        rb.total_cmp(&ra)
    });
    head.extend(ranking[split..].iter().cloned());
    head
}
