//! Run data model and planning.
//!
//! - **types**: records owned by a run (tasks, generated and combined
//!   documents, eval and pairwise results) and the run aggregate itself
//! - **expander**: deterministic expansion of a `PipelineConfig` into
//!   generation tasks
//! - **stage_graph**: per-document stage DAG that gates dispatch
//!
//! # Example
//!
//! ```rust,ignore
//! use evalforge::pipeline::{expand, StageGraph};
//!
//! let tasks = expand(&config);
//! println!("{} generation tasks", tasks.len());
//!
//! let graph = StageGraph::for_config(&config);
//! assert_eq!(graph.next_ready(), Some(StageKind::Generation));
//! ```

pub mod expander;
pub mod stage_graph;
pub mod types;

pub use expander::{expand, task_id};
pub use stage_graph::{StageGateError, StageGraph, StageKind, StageNode, StageState};
pub use types::{
    content_ref, CombinedDocument, DocumentProgress, DocumentStatus, EvalResult, EvalTarget,
    GeneratedDocument, PairwiseResult, Progress, Run, RunStatus, Task, TaskError, TaskStatus,
    Winner,
};
