//! Generation stage: one provider call per task.
//!
//! LLM generators get the run's call-level retry policy. Subprocess
//! generators carry a second, outer budget: every invocation is bounded by
//! the generator's wall-clock timeout, and a timed-out invocation is retried
//! up to the generator's own `max_retries`, independent of the call-level
//! budget (which still covers transient failures).

use async_trait::async_trait;
use futures::future::join_all;

use crate::config::GeneratorKind;
use crate::error::{ErrorKind, StageError};
use crate::llm::{InvokeOutput, InvokeRequest};
use crate::pipeline::{StageKind, Task, TaskStatus};
use crate::run::RunHandle;
use crate::scheduler::AttemptObserver;

use super::prompts::{build_generation_prompt, GENERATION_SYSTEM_PROMPT};
use super::StageContext;

/// Counts attempts on the task's record.
struct TaskAttempts<'a> {
    run: &'a RunHandle,
    task_id: &'a str,
}

#[async_trait]
impl AttemptObserver for TaskAttempts<'_> {
    async fn on_attempt(&self, attempt: u32) {
        tracing::debug!(task_id = %self.task_id, attempt = attempt, "Generation attempt");
        self.run.record_attempt(self.task_id).await;
    }
}

/// Runs every pending generation task of one document and returns how many
/// produced a document.
pub async fn run_generation(ctx: &StageContext, document_id: &str) -> usize {
    let tasks: Vec<Task> = ctx
        .run
        .snapshot()
        .await
        .tasks
        .into_iter()
        .filter(|t| t.document_id == document_id && t.status == TaskStatus::Pending)
        .collect();

    tracing::info!(
        run_id = %ctx.run.id(),
        document_id = %document_id,
        tasks = tasks.len(),
        stage = StageKind::Generation.as_str(),
        "Dispatching generation tasks"
    );

    join_all(tasks.iter().map(|task| execute_task(ctx, task))).await;
    ctx.run.generated_for(document_id).await.len()
}

async fn execute_task(ctx: &StageContext, task: &Task) {
    let stage = StageKind::Generation.as_str();
    match generate(ctx, task).await {
        Ok(output) => {
            if ctx.run.complete_task(&task.id, output.output).await.is_some() {
                ctx.metrics.record_stage_unit(stage, "completed");
            } else {
                ctx.metrics.record_stage_unit(stage, "cancelled");
            }
        }
        Err(e) => {
            let kind = e.failure_kind();
            if !matches!(e, StageError::Cancelled) {
                tracing::warn!(
                    run_id = %ctx.run.id(),
                    task_id = %task.id,
                    model = %task.model,
                    error = %e,
                    "Generation task failed"
                );
            }
            ctx.run.fail_task(&task.id, &e).await;
            ctx.metrics.record_stage_unit(stage, &kind.to_string());
        }
    }
}

async fn generate(ctx: &StageContext, task: &Task) -> Result<InvokeOutput, StageError> {
    let config = ctx.config();
    let generator = config
        .generator(&task.generator)
        .ok_or_else(|| StageError::UnknownProvider(task.generator.clone()))?;
    let source = ctx.run.document_content(&task.document_id).unwrap_or_default();
    let adapter = ctx.registry.for_generator(&task.generator, &task.model)?;
    let observer = TaskAttempts {
        run: &ctx.run,
        task_id: &task.id,
    };
    let prompt = build_generation_prompt(source, generator.instructions.as_deref());

    match (generator.kind, &generator.subprocess) {
        (GeneratorKind::Subprocess, Some(policy)) => {
            let request = InvokeRequest::new(&task.model, prompt, policy.timeout)
                .with_system(GENERATION_SYSTEM_PROMPT);
            let inner = ctx.retry.clone().without_timeout_retries();
            let controller = ctx.run.controller();
            // Held across timeout retries; the task stays in flight until it ends.
            let slot = controller.dispatch().await?;

            for outer in 0..=policy.max_retries {
                match controller
                    .call_with_permit(&slot, adapter.as_ref(), &request, &inner, &observer)
                    .await
                {
                    Err(StageError::Provider(e)) if e.kind == ErrorKind::Timeout => {
                        tracing::warn!(
                            task_id = %task.id,
                            command = %policy.command,
                            attempt = outer + 1,
                            max_attempts = policy.max_retries + 1,
                            "Subprocess timed out"
                        );
                    }
                    result => return result,
                }
            }
            Err(StageError::SubprocessTimeout {
                timeout: policy.timeout,
            })
        }
        _ => {
            let request = InvokeRequest::new(&task.model, prompt, config.concurrency.call_timeout)
                .with_system(GENERATION_SYSTEM_PROMPT);
            ctx.run
                .controller()
                .call(adapter.as_ref(), &request, &ctx.retry, &observer)
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::config::test_support::sample_config;
    use crate::config::{PipelineConfig, SubprocessPolicy};
    use crate::error::{FailureKind, ProviderError};
    use crate::llm::ProviderRegistry;
    use crate::stages::testing::{context_with_registry, ScriptedAdapter};

    /// One document, subprocess writer with a 1s wall clock.
    fn subprocess_config(models: usize, max_retries: u32, max_concurrent: usize) -> PipelineConfig {
        let mut config = sample_config();
        config.documents.truncate(1);
        config.eval = None;
        config.combine = None;
        config.concurrency.max_concurrent = max_concurrent;
        let writer = &mut config.generators[0];
        writer.kind = GeneratorKind::Subprocess;
        writer.models.truncate(models);
        writer.subprocess = Some(SubprocessPolicy {
            command: "./generate.sh".to_string(),
            args: vec![],
            timeout: Duration::from_secs(1),
            max_retries,
        });
        config
    }

    async fn context(config: PipelineConfig, adapter: Arc<ScriptedAdapter>) -> StageContext {
        let mut registry = ProviderRegistry::new();
        registry.register_generator("writer", adapter);
        context_with_registry(config, registry).await
    }

    #[tokio::test(start_paused = true)]
    async fn test_subprocess_timeout_retried_by_generator_budget() {
        let calls = AtomicU32::new(0);
        let adapter = Arc::new(ScriptedAdapter::new(move |_| {
            match calls.fetch_add(1, Ordering::SeqCst) {
                0 => Err(ProviderError::transient("pipe closed")),
                1 => Err(ProviderError::timeout("exceeded 1s")),
                _ => Ok("generated".to_string()),
            }
        }));
        let ctx = context(subprocess_config(1, 1, 4), adapter.clone()).await;

        assert_eq!(run_generation(&ctx, "doc-1").await, 1);

        // Transient failure retried by the call policy, timeout by the generator.
        assert_eq!(adapter.calls(), 3);
        let run = ctx.run.snapshot().await;
        let task = &run.tasks[0];
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.attempt_count, 3);
        assert!(task.last_error.is_none());
        assert_eq!(run.generated_docs[0].content, "generated");
    }

    #[tokio::test(start_paused = true)]
    async fn test_subprocess_timeouts_exhaust_into_subprocess_timeout() {
        let adapter = Arc::new(ScriptedAdapter::new(|_| {
            Err(ProviderError::timeout("exceeded 1s"))
        }));
        let ctx = context(subprocess_config(1, 2, 4), adapter.clone()).await;

        assert_eq!(run_generation(&ctx, "doc-1").await, 0);

        // Call-level max_retries is 3 but never spent on timeouts.
        assert_eq!(adapter.calls(), 3);
        let run = ctx.run.snapshot().await;
        let task = &run.tasks[0];
        assert_eq!(task.status, TaskStatus::Error);
        assert_eq!(task.attempt_count, 3);
        let error = task.last_error.as_ref().unwrap();
        assert_eq!(error.kind, FailureKind::SubprocessTimeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_subprocess_keeps_its_slot() {
        let adapter = Arc::new(
            ScriptedAdapter::new(|_| Err(ProviderError::timeout("exceeded 1s")))
                .with_delay(Duration::from_secs(1)),
        );
        let ctx = context(subprocess_config(2, 2, 1), adapter.clone()).await;
        let done = AtomicBool::new(false);

        let generation = async {
            let produced = run_generation(&ctx, "doc-1").await;
            done.store(true, Ordering::SeqCst);
            produced
        };
        let sampler = async {
            let mut most_running = 0;
            tokio::time::sleep(Duration::from_millis(100)).await;
            while !done.load(Ordering::SeqCst) {
                let running = ctx.run.snapshot().await.count_tasks(TaskStatus::Running);
                most_running = most_running.max(running);
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
            most_running
        };
        let (produced, most_running) = tokio::join!(generation, sampler);

        assert_eq!(produced, 0);
        assert_eq!(most_running, 1);
        assert_eq!(adapter.calls(), 6);
        assert_eq!(ctx.run.controller().peak(), 1);
        let run = ctx.run.snapshot().await;
        assert!(run
            .tasks
            .iter()
            .all(|t| t.status == TaskStatus::Error && t.attempt_count == 3));
    }
}
