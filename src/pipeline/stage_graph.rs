//! Per-document stage graph.
//!
//! Each source document moves through a small DAG:
//!
//! ```text
//! generation ──► single_eval ──► pairwise ──► combine ──► post_combine_eval
//!      │               └─────────────────────────▲
//!      └─────────────────────────────────────────┘
//! ```
//!
//! A node is dispatchable once every upstream node is terminal (completed,
//! skipped or failed). Disabled stages start out skipped, so combine runs
//! straight after single-eval when pairwise is off, or straight after
//! generation when evaluation is off.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::PipelineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Generation,
    SingleEval,
    Pairwise,
    Combine,
    PostCombineEval,
}

impl StageKind {
    pub const ALL: [StageKind; 5] = [
        StageKind::Generation,
        StageKind::SingleEval,
        StageKind::Pairwise,
        StageKind::Combine,
        StageKind::PostCombineEval,
    ];

    /// Upstream nodes this stage is gated on.
    pub fn upstream(self) -> &'static [StageKind] {
        match self {
            StageKind::Generation => &[],
            StageKind::SingleEval => &[StageKind::Generation],
            StageKind::Pairwise => &[StageKind::SingleEval],
            StageKind::Combine => &[
                StageKind::Generation,
                StageKind::SingleEval,
                StageKind::Pairwise,
            ],
            StageKind::PostCombineEval => &[StageKind::Combine],
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            StageKind::Generation => "generation",
            StageKind::SingleEval => "single_eval",
            StageKind::Pairwise => "pairwise",
            StageKind::Combine => "combine",
            StageKind::PostCombineEval => "post_combine_eval",
        }
    }
}

impl std::fmt::Display for StageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageState {
    Pending,
    Running,
    Completed,
    Skipped,
    Failed,
}

impl StageState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            StageState::Completed | StageState::Skipped | StageState::Failed
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StageGateError {
    #[error("Stage '{stage}' is not ready: upstream '{blocked_by}' has not finished")]
    NotReady {
        stage: StageKind,
        blocked_by: StageKind,
    },

    #[error("Stage '{stage}' cannot start from state {state:?}")]
    NotPending { stage: StageKind, state: StageState },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageNode {
    pub kind: StageKind,
    pub state: StageState,
    /// Why the stage was skipped or failed.
    pub note: Option<String>,
}

/// Stage DAG for one source document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageGraph {
    nodes: Vec<StageNode>,
}

impl StageGraph {
    /// Builds the graph with every stage the config disables already skipped.
    pub fn for_config(config: &PipelineConfig) -> Self {
        let mut graph = Self {
            nodes: StageKind::ALL
                .iter()
                .map(|&kind| StageNode {
                    kind,
                    state: StageState::Pending,
                    note: None,
                })
                .collect(),
        };

        match &config.eval {
            None => {
                graph.mark(StageKind::SingleEval, StageState::Skipped, "evaluation disabled");
                graph.mark(StageKind::Pairwise, StageState::Skipped, "evaluation disabled");
                graph.mark(
                    StageKind::PostCombineEval,
                    StageState::Skipped,
                    "evaluation disabled",
                );
            }
            Some(eval) if eval.pairwise_top_n < 2 => {
                graph.mark(StageKind::Pairwise, StageState::Skipped, "pairwise top-N below 2");
            }
            Some(_) => {}
        }

        if config.combine.is_none() {
            graph.mark(StageKind::Combine, StageState::Skipped, "combine disabled");
            graph.mark(StageKind::PostCombineEval, StageState::Skipped, "combine disabled");
        }

        graph
    }

    pub fn nodes(&self) -> &[StageNode] {
        &self.nodes
    }

    pub fn state(&self, kind: StageKind) -> StageState {
        self.node(kind).state
    }

    fn node(&self, kind: StageKind) -> &StageNode {
        &self.nodes[kind as usize]
    }

    fn node_mut(&mut self, kind: StageKind) -> &mut StageNode {
        &mut self.nodes[kind as usize]
    }

    fn mark(&mut self, kind: StageKind, state: StageState, note: &str) {
        let node = self.node_mut(kind);
        node.state = state;
        node.note = Some(note.to_string());
    }

    fn blocked_by(&self, kind: StageKind) -> Option<StageKind> {
        kind.upstream()
            .iter()
            .copied()
            .find(|up| !self.state(*up).is_terminal())
    }

    pub fn is_ready(&self, kind: StageKind) -> bool {
        self.state(kind) == StageState::Pending && self.blocked_by(kind).is_none()
    }

    /// First dispatchable stage in pipeline order.
    pub fn next_ready(&self) -> Option<StageKind> {
        StageKind::ALL.iter().copied().find(|&k| self.is_ready(k))
    }

    pub fn start(&mut self, kind: StageKind) -> Result<(), StageGateError> {
        let state = self.state(kind);
        if state != StageState::Pending {
            return Err(StageGateError::NotPending { stage: kind, state });
        }
        if let Some(blocked_by) = self.blocked_by(kind) {
            return Err(StageGateError::NotReady {
                stage: kind,
                blocked_by,
            });
        }
        self.node_mut(kind).state = StageState::Running;
        Ok(())
    }

    pub fn complete(&mut self, kind: StageKind) {
        self.node_mut(kind).state = StageState::Completed;
    }

    pub fn fail(&mut self, kind: StageKind, reason: impl Into<String>) {
        let node = self.node_mut(kind);
        node.state = StageState::Failed;
        node.note = Some(reason.into());
    }

    /// Skips one pending stage.
    pub fn skip(&mut self, kind: StageKind, reason: impl Into<String>) {
        if self.state(kind) == StageState::Pending {
            let node = self.node_mut(kind);
            node.state = StageState::Skipped;
            node.note = Some(reason.into());
        }
    }

    /// Skips every stage that is still pending.
    pub fn skip_remaining(&mut self, reason: &str) {
        for kind in StageKind::ALL {
            self.skip(kind, reason);
        }
    }

    pub fn is_complete(&self) -> bool {
        self.nodes.iter().all(|n| n.state.is_terminal())
    }
}
