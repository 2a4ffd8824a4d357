//! Records owned by a run: tasks, generated and combined documents, and
//! evaluation results.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::config::PipelineConfig;
use crate::error::{FailureKind, StageError};

use super::stage_graph::StageGraph;

/// Status of a generation task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Error,
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Error | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Error => write!(f, "error"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Last failure observed on a task or stage unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: FailureKind,
    pub message: String,
}

impl From<&StageError> for TaskError {
    fn from(err: &StageError) -> Self {
        Self {
            kind: err.failure_kind(),
            message: err.to_string(),
        }
    }
}

/// One (document, generator, model, iteration) unit of generation work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Content-addressed id, stable across re-expansion of the same config.
    pub id: String,
    pub document_id: String,
    pub generator: String,
    pub model: String,
    pub iteration: u32,
    pub status: TaskStatus,
    /// Number of provider attempts made so far, across retry layers.
    pub attempt_count: u32,
    /// Id of the `GeneratedDocument` produced on success.
    pub result_ref: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub last_error: Option<TaskError>,
}

impl Task {
    pub fn new(
        id: impl Into<String>,
        document_id: impl Into<String>,
        generator: impl Into<String>,
        model: impl Into<String>,
        iteration: u32,
    ) -> Self {
        Self {
            id: id.into(),
            document_id: document_id.into(),
            generator: generator.into(),
            model: model.into(),
            iteration,
            status: TaskStatus::Pending,
            attempt_count: 0,
            result_ref: None,
            started_at: None,
            ended_at: None,
            last_error: None,
        }
    }
}

/// Returns `sha256:<hex>` of the content.
pub fn content_ref(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    format!("sha256:{}", hex::encode(digest))
}

/// Output of a completed generation task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedDocument {
    /// Same as the producing task's id.
    pub id: String,
    pub document_id: String,
    pub generator: String,
    pub model: String,
    pub iteration: u32,
    pub content_ref: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// What an `EvalResult` judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvalTarget {
    Generated,
    Combined,
}

/// Single-document judgment for one eval round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvalResult {
    pub doc_id: String,
    pub document_id: String,
    pub target: EvalTarget,
    pub round: u32,
    pub judge_models: Vec<String>,
    /// Mean of the judges that produced a score; `None` when none did.
    pub average_score: Option<f64>,
    pub scores_by_model: BTreeMap<String, f64>,
    /// Judges whose output stayed unparseable after the eval retry budget.
    pub parse_failures: Vec<String>,
    /// Judges whose provider call failed outright.
    pub errors: BTreeMap<String, TaskError>,
    pub duration_ms: u64,
}

/// Pairwise verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Winner {
    A,
    B,
    Tie,
}

/// Comparison between two distinct generated documents of one source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PairwiseResult {
    pub document_id: String,
    pub round: u32,
    pub judge_model: String,
    pub doc_a: String,
    pub doc_b: String,
    pub winner: Winner,
    /// Rating change applied to `doc_a` (the opposite applies to `doc_b`).
    pub rating_delta: f64,
    pub reason: Option<String>,
}

/// Synthesis of the top-ranked candidates of one source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CombinedDocument {
    pub id: String,
    pub document_id: String,
    pub model: String,
    /// Candidates actually fed to the combine model, best first.
    pub sources: Vec<String>,
    /// Candidates dropped to fit the output budget, lowest rank first.
    pub truncated_sources: Vec<String>,
    pub content_ref: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

impl CombinedDocument {
    pub fn was_truncated(&self) -> bool {
        !self.truncated_sources.is_empty()
    }
}

/// Lifecycle status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Failed | RunStatus::Cancelled
        )
    }

    /// Whether the state machine permits moving from `self` to `to`.
    pub fn can_transition_to(self, to: RunStatus) -> bool {
        use RunStatus::*;
        match (self, to) {
            (from, _) if from.is_terminal() => false,
            (Pending, Running) => true,
            (Running, Paused) | (Paused, Running) => true,
            (Running, Completed) | (Running, Failed) => true,
            (_, Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Run-wide progress over all planned units of stage work.
///
/// `total` grows as later stages are planned; `completed` never decreases.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub total: u64,
    pub completed: u64,
}

impl Progress {
    pub fn plan(&mut self, units: u64) {
        self.total += units;
    }

    pub fn advance(&mut self, units: u64) {
        self.completed = (self.completed + units).min(self.total);
    }

    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.completed as f64 / self.total as f64
    }
}

/// Outcome of one source document across all stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Active,
    Completed,
    /// No generation task produced usable output.
    Error,
    Cancelled,
}

/// Per-document report entry: stage graph plus outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentProgress {
    pub document_id: String,
    pub status: DocumentStatus,
    pub graph: StageGraph,
    pub error: Option<String>,
    /// Final candidate ordering (best first) after ranking.
    pub ranking: Vec<String>,
}

/// Aggregate root for one execution of a resolved pipeline.
#[derive(Debug, Clone, Serialize)]
pub struct Run {
    pub id: String,
    pub config_name: String,
    #[serde(skip)]
    pub config: Arc<PipelineConfig>,
    pub status: RunStatus,
    pub progress: Progress,
    pub tasks: Vec<Task>,
    pub generated_docs: Vec<GeneratedDocument>,
    pub eval_results: Vec<EvalResult>,
    pub pairwise_results: Vec<PairwiseResult>,
    pub combined_docs: Vec<CombinedDocument>,
    pub post_combine_evals: Vec<EvalResult>,
    pub post_combine_pairwise: Vec<PairwiseResult>,
    pub documents: Vec<DocumentProgress>,
    pub cancel_requested: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn task(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    pub fn document(&self, document_id: &str) -> Option<&DocumentProgress> {
        self.documents.iter().find(|d| d.document_id == document_id)
    }

    pub fn generated_for<'a>(
        &'a self,
        document_id: &'a str,
    ) -> impl Iterator<Item = &'a GeneratedDocument> + 'a {
        self.generated_docs
            .iter()
            .filter(move |d| d.document_id == document_id)
    }

    pub fn count_tasks(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn has_non_terminal_tasks(&self) -> bool {
        self.tasks.iter().any(|t| !t.status.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_transitions() {
        use RunStatus::*;
        assert!(Pending.can_transition_to(Running));
        assert!(Running.can_transition_to(Paused));
        assert!(Paused.can_transition_to(Running));
        assert!(Running.can_transition_to(Completed));
        assert!(Running.can_transition_to(Failed));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Paused.can_transition_to(Cancelled));

        assert!(!Pending.can_transition_to(Paused));
        assert!(!Paused.can_transition_to(Paused));
        assert!(!Paused.can_transition_to(Completed));
        assert!(!Running.can_transition_to(Pending));
        for terminal in [Completed, Failed, Cancelled] {
            for to in [Pending, Running, Paused, Completed, Failed, Cancelled] {
                assert!(!terminal.can_transition_to(to));
            }
        }
    }

    #[test]
    fn test_progress_monotonic() {
        let mut progress = Progress::default();
        progress.plan(4);
        progress.advance(1);
        progress.advance(1);
        assert_eq!(progress.completed, 2);
        progress.plan(2);
        assert_eq!(progress.total, 6);
        assert_eq!(progress.completed, 2);
        progress.advance(10);
        assert_eq!(progress.completed, 6);
        assert!((progress.fraction() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_task_status_display_and_terminal() {
        assert_eq!(TaskStatus::Error.to_string(), "error");
        assert!(!TaskStatus::Running.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
    }

    #[test]
    fn test_content_ref_is_stable() {
        let a = content_ref("hello");
        assert!(a.starts_with("sha256:"));
        assert_eq!(a, content_ref("hello"));
        assert_ne!(a, content_ref("hello!"));
    }

    #[test]
    fn test_winner_serialization() {
        assert_eq!(serde_json::to_string(&Winner::Tie).unwrap(), "\"tie\"");
        assert_eq!(serde_json::to_string(&Winner::A).unwrap(), "\"a\"");
    }
}
