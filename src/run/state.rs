//! Run state machine.
//!
//! [`RunHandle`] owns the authoritative [`Run`] behind one async mutex. Every
//! mutation goes through a method here, and every method publishes its
//! event while still holding the lock, so subscribers observe changes in
//! exactly the order they were applied.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, watch, Mutex};
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::error::{RunError, StageError};
use crate::events::{EventBroadcaster, EventPayload, RunEvent, StageRecord};
use crate::metrics::MetricsCollector;
use crate::pipeline::{
    content_ref, expand, CombinedDocument, DocumentProgress, DocumentStatus, EvalResult,
    GeneratedDocument, Progress, Run, RunStatus, StageGraph, TaskError, TaskStatus,
};
use crate::scheduler::{ConcurrencyController, RateLimiter};

pub struct RunHandle {
    id: String,
    config: Arc<PipelineConfig>,
    documents: HashMap<String, String>,
    state: Mutex<Run>,
    events: EventBroadcaster,
    controller: ConcurrencyController,
    terminal: watch::Sender<Option<RunStatus>>,
    metrics: MetricsCollector,
}

impl RunHandle {
    /// Creates a pending run with its generation tasks already expanded.
    pub fn new(
        id: impl Into<String>,
        config: Arc<PipelineConfig>,
        documents: HashMap<String, String>,
        rate_limiter: Arc<RateLimiter>,
        event_buffer: usize,
    ) -> Self {
        let id = id.into();
        let tasks = expand(&config);
        let now = Utc::now();
        let mut progress = Progress::default();
        progress.plan(tasks.len() as u64);

        let graph = StageGraph::for_config(&config);
        let document_entries = config
            .documents
            .iter()
            .map(|document_id| DocumentProgress {
                document_id: document_id.clone(),
                status: DocumentStatus::Active,
                graph: graph.clone(),
                error: None,
                ranking: Vec::new(),
            })
            .collect();

        let run = Run {
            id: id.clone(),
            config_name: config.name.clone(),
            config: config.clone(),
            status: RunStatus::Pending,
            progress,
            tasks,
            generated_docs: Vec::new(),
            eval_results: Vec::new(),
            pairwise_results: Vec::new(),
            combined_docs: Vec::new(),
            post_combine_evals: Vec::new(),
            post_combine_pairwise: Vec::new(),
            documents: document_entries,
            cancel_requested: false,
            created_at: now,
            updated_at: now,
            finished_at: None,
        };

        let controller =
            ConcurrencyController::new(&config.concurrency, Some(rate_limiter), CancellationToken::new());
        let (terminal, _) = watch::channel(None);
        let metrics = MetricsCollector::new();
        metrics.run_started();

        Self {
            events: EventBroadcaster::new(id.clone(), event_buffer),
            id,
            config,
            documents,
            state: Mutex::new(run),
            controller,
            terminal,
            metrics,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &Arc<PipelineConfig> {
        &self.config
    }

    pub fn controller(&self) -> &ConcurrencyController {
        &self.controller
    }

    /// Source text of a document.
    pub fn document_content(&self, document_id: &str) -> Option<&str> {
        self.documents.get(document_id).map(String::as_str)
    }

    pub async fn snapshot(&self) -> Run {
        self.state.lock().await.clone()
    }

    pub async fn status(&self) -> RunStatus {
        self.state.lock().await.status
    }

    pub async fn is_cancel_requested(&self) -> bool {
        self.state.lock().await.cancel_requested
    }

    /// Snapshot event plus a receiver positioned right after it.
    pub async fn subscribe(&self) -> (RunEvent, broadcast::Receiver<RunEvent>) {
        let run = self.state.lock().await;
        let receiver = self.events.subscribe();
        (self.events.snapshot(&run), receiver)
    }

    /// Fresh snapshot event for a subscriber that fell behind.
    pub async fn snapshot_event(&self) -> RunEvent {
        let run = self.state.lock().await;
        self.events.snapshot(&run)
    }

    /// Moves the run from pending to running and announces the task list.
    ///
    /// # Errors
    ///
    /// `RunError::InvalidTransition` if the run already left `pending`
    /// (typically cancelled before the driver started).
    pub async fn start(&self) -> Result<(), RunError> {
        let mut run = self.state.lock().await;
        self.set_status(&mut run, RunStatus::Running)?;
        let tasks = run.tasks.clone();
        self.events
            .publish(run.progress, EventPayload::TaskList { tasks });
        tracing::info!(
            run_id = %self.id,
            tasks = run.tasks.len(),
            documents = run.documents.len(),
            "Run started"
        );
        Ok(())
    }

    /// Records a provider attempt for a generation task. The first attempt
    /// moves the task to running.
    pub async fn record_attempt(&self, task_id: &str) {
        let mut run = self.state.lock().await;
        let progress = run.progress;
        let Some(task) = run.tasks.iter_mut().find(|t| t.id == task_id) else {
            return;
        };
        if task.status.is_terminal() {
            return;
        }
        if task.status == TaskStatus::Pending {
            task.status = TaskStatus::Running;
            task.started_at = Some(Utc::now());
        }
        task.attempt_count += 1;
        let task = task.clone();
        run.updated_at = Utc::now();
        self.events.publish(progress, EventPayload::TaskPatch { task });
    }

    /// Stores the output of a generation task.
    ///
    /// Returns `None` when the task is already terminal or the run was
    /// cancelled meanwhile; the late output is then discarded and the task
    /// is marked cancelled.
    pub async fn complete_task(&self, task_id: &str, content: String) -> Option<GeneratedDocument> {
        let mut run = self.state.lock().await;
        let cancel_requested = run.cancel_requested;
        let now = Utc::now();
        let task = run.tasks.iter_mut().find(|t| t.id == task_id)?;
        if task.status.is_terminal() {
            return None;
        }
        task.ended_at = Some(now);

        let generated = if cancel_requested {
            task.status = TaskStatus::Cancelled;
            task.last_error = Some(TaskError::from(&StageError::Cancelled));
            None
        } else {
            task.status = TaskStatus::Completed;
            task.result_ref = Some(task.id.clone());
            task.last_error = None;
            Some(GeneratedDocument {
                id: task.id.clone(),
                document_id: task.document_id.clone(),
                generator: task.generator.clone(),
                model: task.model.clone(),
                iteration: task.iteration,
                content_ref: content_ref(&content),
                content,
                created_at: now,
            })
        };
        let task = task.clone();

        run.progress.advance(1);
        run.updated_at = now;
        self.events
            .publish(run.progress, EventPayload::TaskPatch { task });
        if let Some(doc) = &generated {
            run.generated_docs.push(doc.clone());
            self.events.publish(
                run.progress,
                EventPayload::StageComplete {
                    record: StageRecord::Generation(doc.clone()),
                },
            );
        }
        self.settle_cancellation(&mut run);
        generated
    }

    /// Marks a generation task failed (or cancelled, for `StageError::Cancelled`).
    pub async fn fail_task(&self, task_id: &str, err: &StageError) {
        let mut run = self.state.lock().await;
        let cancel_requested = run.cancel_requested;
        let now = Utc::now();
        let Some(task) = run.tasks.iter_mut().find(|t| t.id == task_id) else {
            return;
        };
        if task.status.is_terminal() {
            return;
        }
        task.status = if cancel_requested || matches!(err, StageError::Cancelled) {
            TaskStatus::Cancelled
        } else {
            TaskStatus::Error
        };
        task.last_error = Some(TaskError::from(err));
        task.ended_at = Some(now);
        let task = task.clone();

        run.progress.advance(1);
        run.updated_at = now;
        self.events
            .publish(run.progress, EventPayload::TaskPatch { task });
        self.settle_cancellation(&mut run);
    }

    /// Adds planned units of stage work to the progress total.
    pub async fn plan_units(&self, units: u64) {
        let mut run = self.state.lock().await;
        run.progress.plan(units);
    }

    /// Completes units of stage work that produced no record.
    pub async fn advance_units(&self, units: u64) {
        let mut run = self.state.lock().await;
        run.progress.advance(units);
    }

    /// Attaches a stage record to the run and completes one unit of work.
    ///
    /// Returns `false` (and stores nothing) once cancellation was requested.
    pub async fn record(&self, record: StageRecord) -> bool {
        let mut run = self.state.lock().await;
        if run.cancel_requested {
            return false;
        }
        match &record {
            StageRecord::Generation(doc) => run.generated_docs.push(doc.clone()),
            StageRecord::Eval(result) => run.eval_results.push(result.clone()),
            StageRecord::Pairwise(result) => run.pairwise_results.push(result.clone()),
            StageRecord::Combine(doc) => run.combined_docs.push(doc.clone()),
            StageRecord::PostCombineEval(result) => run.post_combine_evals.push(result.clone()),
            StageRecord::PostCombinePairwise(result) => {
                run.post_combine_pairwise.push(result.clone())
            }
        }
        run.progress.advance(1);
        run.updated_at = Utc::now();
        self.events
            .publish(run.progress, EventPayload::StageComplete { record });
        true
    }

    /// Generated documents of one source document, in task expansion order.
    pub async fn generated_for(&self, document_id: &str) -> Vec<GeneratedDocument> {
        let run = self.state.lock().await;
        run.tasks
            .iter()
            .filter(|t| t.document_id == document_id)
            .filter_map(|t| t.result_ref.as_deref())
            .filter_map(|id| run.generated_docs.iter().find(|d| d.id == id))
            .cloned()
            .collect()
    }

    pub async fn combined_for(&self, document_id: &str) -> Vec<CombinedDocument> {
        let run = self.state.lock().await;
        run.combined_docs
            .iter()
            .filter(|d| d.document_id == document_id)
            .cloned()
            .collect()
    }

    /// Single-eval results of generated documents of one source document.
    pub async fn evals_for(&self, document_id: &str) -> Vec<EvalResult> {
        let run = self.state.lock().await;
        run.eval_results
            .iter()
            .filter(|r| r.document_id == document_id)
            .cloned()
            .collect()
    }

    /// Applies `f` to one document's progress entry and publishes the
    /// updated entry.
    pub async fn update_document<R>(
        &self,
        document_id: &str,
        f: impl FnOnce(&mut DocumentProgress) -> R,
    ) -> Option<R> {
        let mut run = self.state.lock().await;
        let entry = run
            .documents
            .iter_mut()
            .find(|d| d.document_id == document_id)?;
        let out = f(entry);
        let document = entry.clone();
        run.updated_at = Utc::now();
        self.events
            .publish(run.progress, EventPayload::DocumentPatch { document });
        Some(out)
    }

    /// # Errors
    ///
    /// `RunError::InvalidTransition` unless the run is running.
    pub async fn pause(&self) -> Result<(), RunError> {
        let mut run = self.state.lock().await;
        self.set_status(&mut run, RunStatus::Paused)?;
        self.controller.pause();
        tracing::info!(run_id = %self.id, "Run paused");
        Ok(())
    }

    /// # Errors
    ///
    /// `RunError::InvalidTransition` unless the run is paused.
    pub async fn resume(&self) -> Result<(), RunError> {
        let mut run = self.state.lock().await;
        if run.status != RunStatus::Paused {
            return Err(RunError::InvalidTransition {
                from: run.status,
                to: RunStatus::Running,
            });
        }
        self.set_status(&mut run, RunStatus::Running)?;
        self.controller.resume();
        tracing::info!(run_id = %self.id, "Run resumed");
        Ok(())
    }

    /// Requests cancellation.
    ///
    /// Pending tasks become cancelled at once and the run's token fires.
    /// In-flight tasks become cancelled when their call returns; the run
    /// itself becomes cancelled as soon as no task is left non-terminal.
    ///
    /// # Errors
    ///
    /// `RunError::InvalidTransition` if the run is already terminal.
    pub async fn cancel(&self) -> Result<(), RunError> {
        let mut run = self.state.lock().await;
        if run.status.is_terminal() {
            return Err(RunError::InvalidTransition {
                from: run.status,
                to: RunStatus::Cancelled,
            });
        }
        run.cancel_requested = true;
        let now = Utc::now();
        let mut cancelled = Vec::new();
        for task in run.tasks.iter_mut().filter(|t| t.status == TaskStatus::Pending) {
            task.status = TaskStatus::Cancelled;
            task.last_error = Some(TaskError::from(&StageError::Cancelled));
            task.ended_at = Some(now);
            cancelled.push(task.clone());
        }
        run.progress.advance(cancelled.len() as u64);
        run.updated_at = now;
        for task in cancelled {
            self.events
                .publish(run.progress, EventPayload::TaskPatch { task });
        }

        self.controller.cancel_token().cancel();
        tracing::info!(run_id = %self.id, "Run cancellation requested");
        self.settle_cancellation(&mut run);
        Ok(())
    }

    /// Ends the run once every stage has finished.
    ///
    /// Waits while the run is paused, so `completed` and `failed` are only
    /// ever entered from `running`. Returns the terminal status.
    pub async fn finalize(&self) -> RunStatus {
        loop {
            {
                let mut run = self.state.lock().await;
                if run.status.is_terminal() {
                    return run.status;
                }
                if run.status != RunStatus::Paused || run.cancel_requested {
                    let to = if run.cancel_requested {
                        RunStatus::Cancelled
                    } else if run.generated_docs.is_empty() {
                        RunStatus::Failed
                    } else {
                        RunStatus::Completed
                    };
                    if let Err(e) = self.set_status(&mut run, to) {
                        tracing::warn!(run_id = %self.id, error = %e, "Could not finalize run");
                    }
                    return run.status;
                }
            }
            // Cancellation while paused also wakes this up.
            let _ = self.controller.wait_unpaused().await;
        }
    }

    /// Waits until the run reaches a terminal status.
    pub async fn wait_terminal(&self) -> RunStatus {
        let mut rx = self.terminal.subscribe();
        let reached = rx.wait_for(Option::is_some).await.map(|status| *status);
        match reached {
            Ok(Some(status)) => status,
            _ => self.status().await,
        }
    }

    fn settle_cancellation(&self, run: &mut Run) {
        if run.cancel_requested && !run.status.is_terminal() && !run.has_non_terminal_tasks() {
            if let Err(e) = self.set_status(run, RunStatus::Cancelled) {
                tracing::warn!(run_id = %self.id, error = %e, "Could not cancel run");
            }
        }
    }

    fn set_status(&self, run: &mut Run, to: RunStatus) -> Result<(), RunError> {
        if !run.status.can_transition_to(to) {
            return Err(RunError::InvalidTransition {
                from: run.status,
                to,
            });
        }
        let now = Utc::now();
        run.status = to;
        run.updated_at = now;
        if to.is_terminal() {
            run.finished_at = Some(now);
        }
        self.events
            .publish(run.progress, EventPayload::RunStatus { status: to });

        if to.is_terminal() {
            self.metrics.run_finished(&to.to_string());
            self.terminal.send_replace(Some(to));
            tracing::info!(
                run_id = %self.id,
                status = %to,
                generated = run.generated_docs.len(),
                completed = run.progress.completed,
                total = run.progress.total,
                "Run finished"
            );
        }
        Ok(())
    }
}
