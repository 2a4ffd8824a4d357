//! Run events delivered to subscribers.
//!
//! Every event carries the run id, a per-run sequence number and the run's
//! progress at the time it was published. A subscriber always starts with a
//! `snapshot`; afterwards it can rebuild the run by merging `task_patch` and
//! `document_patch` by id and appending `stage_complete` records.

pub mod broadcaster;
pub mod server;

use serde::Serialize;

use crate::pipeline::{
    CombinedDocument, DocumentProgress, EvalResult, GeneratedDocument, PairwiseResult, Progress,
    Run, RunStatus, Task,
};

pub use broadcaster::{event_stream, EventBroadcaster};
pub use server::EventServer;

#[derive(Debug, Clone, Serialize)]
pub struct RunEvent {
    pub run_id: String,
    pub seq: u64,
    pub progress: Progress,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl RunEvent {
    /// Whether this event announces a terminal run status.
    pub fn is_terminal(&self) -> bool {
        match &self.payload {
            EventPayload::Snapshot { run } => run.status.is_terminal(),
            EventPayload::RunStatus { status } => status.is_terminal(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    /// Full run state; sent first and after a subscriber lags.
    Snapshot { run: Box<Run> },
    /// Initial generation task list.
    TaskList { tasks: Vec<Task> },
    /// One task changed; merge by id.
    TaskPatch { task: Task },
    /// One document's stage state changed; merge by document id.
    DocumentPatch { document: DocumentProgress },
    /// A stage produced a new record.
    StageComplete {
        #[serde(flatten)]
        record: StageRecord,
    },
    RunStatus { status: RunStatus },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "record")]
pub enum StageRecord {
    #[serde(rename = "generation_complete")]
    Generation(GeneratedDocument),
    #[serde(rename = "eval_complete")]
    Eval(EvalResult),
    #[serde(rename = "pairwise_complete")]
    Pairwise(PairwiseResult),
    #[serde(rename = "combine_complete")]
    Combine(CombinedDocument),
    #[serde(rename = "post_combine_eval_complete")]
    PostCombineEval(EvalResult),
    #[serde(rename = "post_combine_pairwise_complete")]
    PostCombinePairwise(PairwiseResult),
}
