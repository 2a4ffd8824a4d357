//! Drives one run from start to its terminal status.
//!
//! Documents progress independently: each walks its own stage graph, and a
//! stage is dispatched only once its upstream stages are terminal. The run
//! is finalized after every document has finished.

use std::sync::Arc;

use futures::future::join_all;

use crate::llm::ProviderRegistry;
use crate::pipeline::{DocumentStatus, RunStatus, StageKind};
use crate::stages::{
    run_combine, run_generation, run_pairwise, run_post_combine, run_single_eval, StageContext,
};

use super::state::RunHandle;

/// Why a stage ended early.
enum StageOutcome {
    Completed,
    Failed(String),
    /// Nothing left to do for this document.
    NoCandidates,
}

pub async fn drive(run: Arc<RunHandle>, registry: Arc<ProviderRegistry>) -> RunStatus {
    if let Err(e) = run.start().await {
        tracing::debug!(run_id = %run.id(), error = %e, "Run not started");
        return run.finalize().await;
    }

    let ctx = StageContext::new(run.clone(), registry);
    let documents = run.config().documents.clone();
    join_all(documents.iter().map(|document_id| drive_document(&ctx, document_id))).await;

    run.finalize().await
}

async fn drive_document(ctx: &StageContext, document_id: &str) {
    let run = &ctx.run;
    let mut ranking: Vec<String> = Vec::new();

    loop {
        if run.controller().is_cancelled() {
            run.update_document(document_id, |d| {
                d.status = DocumentStatus::Cancelled;
                d.graph.skip_remaining("run cancelled");
            })
            .await;
            return;
        }

        let next = run
            .update_document(document_id, |d| {
                let kind = d.graph.next_ready()?;
                d.graph.start(kind).ok().map(|_| kind)
            })
            .await
            .flatten();
        let Some(kind) = next else {
            break;
        };

        tracing::debug!(
            run_id = %run.id(),
            document_id = %document_id,
            stage = kind.as_str(),
            "Stage started"
        );
        let outcome = run_stage(ctx, document_id, kind, &mut ranking).await;

        match outcome {
            StageOutcome::Completed => {
                run.update_document(document_id, |d| {
                    d.graph.complete(kind);
                    if kind == StageKind::SingleEval && d.ranking.len() < 2 {
                        d.graph.skip(StageKind::Pairwise, "fewer than 2 candidates");
                    }
                })
                .await;
            }
            StageOutcome::Failed(reason) => {
                tracing::warn!(
                    run_id = %run.id(),
                    document_id = %document_id,
                    stage = kind.as_str(),
                    reason = %reason,
                    "Stage failed"
                );
                run.update_document(document_id, |d| {
                    d.graph.fail(kind, reason.clone());
                    if kind == StageKind::Combine {
                        d.graph.skip(StageKind::PostCombineEval, "combine failed");
                    }
                })
                .await;
            }
            StageOutcome::NoCandidates => {
                let cancelled = run.controller().is_cancelled();
                let reason = "no generation task produced output";
                run.update_document(document_id, |d| {
                    if cancelled {
                        d.status = DocumentStatus::Cancelled;
                        d.graph.fail(kind, "run cancelled");
                        d.graph.skip_remaining("run cancelled");
                    } else {
                        d.status = DocumentStatus::Error;
                        d.error = Some(reason.to_string());
                        d.graph.fail(kind, reason);
                        d.graph.skip_remaining(reason);
                    }
                })
                .await;
                return;
            }
        }
    }

    run.update_document(document_id, |d| {
        if d.status == DocumentStatus::Active {
            d.status = DocumentStatus::Completed;
        }
    })
    .await;
}

async fn run_stage(
    ctx: &StageContext,
    document_id: &str,
    kind: StageKind,
    ranking: &mut Vec<String>,
) -> StageOutcome {
    let config = ctx.config();
    let run = &ctx.run;

    match kind {
        StageKind::Generation => {
            if run_generation(ctx, document_id).await == 0 {
                return StageOutcome::NoCandidates;
            }
            // Without evaluation the ranking is expansion order.
            *ranking = run
                .generated_for(document_id)
                .await
                .into_iter()
                .map(|d| d.id)
                .collect();
            publish_ranking(ctx, document_id, ranking).await;
            StageOutcome::Completed
        }
        StageKind::SingleEval => {
            let Some(eval) = &config.eval else {
                return StageOutcome::Completed;
            };
            let candidates = run.generated_for(document_id).await;
            *ranking = run_single_eval(ctx, eval, document_id, &candidates).await;
            publish_ranking(ctx, document_id, ranking).await;
            StageOutcome::Completed
        }
        StageKind::Pairwise => {
            let Some(eval) = &config.eval else {
                return StageOutcome::Completed;
            };
            let candidates = run.generated_for(document_id).await;
            *ranking = run_pairwise(ctx, eval, document_id, ranking, &candidates).await;
            publish_ranking(ctx, document_id, ranking).await;
            StageOutcome::Completed
        }
        StageKind::Combine => {
            let Some(combine) = &config.combine else {
                return StageOutcome::Completed;
            };
            let candidates = run.generated_for(document_id).await;
            let produced = run_combine(ctx, combine, document_id, ranking, &candidates).await;
            if produced == 0 {
                StageOutcome::Failed("no combine model produced output".to_string())
            } else {
                StageOutcome::Completed
            }
        }
        StageKind::PostCombineEval => {
            let (Some(eval), Some(combine)) = (&config.eval, &config.combine) else {
                return StageOutcome::Completed;
            };
            let candidates = run.generated_for(document_id).await;
            run_post_combine(ctx, eval, combine, document_id, ranking, &candidates).await;
            StageOutcome::Completed
        }
    }
}

async fn publish_ranking(ctx: &StageContext, document_id: &str, ranking: &[String]) {
    ctx.run
        .update_document(document_id, |d| d.ranking = ranking.to_vec())
        .await;
}
