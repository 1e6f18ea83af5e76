use crate::{Context, NodeOutcome};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Running,
    Retrying,
    Rerouting,
    Paused,
    Completed,
    Failed,
}

impl PipelineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Retrying => "retrying",
            Self::Rerouting => "rerouting",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Why a run ended in `PipelineStatus::Fail`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PipelineFailure {
    PipelineTermination {
        node_id: String,
        reason: String,
    },
    GoalGateUnsatisfied {
        gates: Vec<String>,
    },
    RerouteLimitExceeded {
        limit: u32,
        trail: Vec<String>,
    },
    /// A fan-out's join policy could no longer be met and nothing routed
    /// the failure elsewhere.
    JoinUnsatisfiable {
        node_id: String,
        policy: String,
        succeeded: usize,
        required: usize,
    },
}

impl fmt::Display for PipelineFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PipelineTermination { node_id, reason } => {
                write!(f, "stage '{node_id}' failed with no failure route: {reason}")
            }
            Self::GoalGateUnsatisfied { gates } => {
                write!(f, "goal gates unsatisfied: {}", gates.join(", "))
            }
            Self::RerouteLimitExceeded { limit, trail } => write!(
                f,
                "reroute limit {limit} exceeded; trail: {}",
                trail.join(" -> ")
            ),
            Self::JoinUnsatisfiable {
                node_id,
                policy,
                succeeded,
                required,
            } => write!(
                f,
                "fan-out '{node_id}' join {policy} unsatisfiable: {succeeded} of {required} required successes"
            ),
        }
    }
}

/// Mutable state of one run, owned by the runner.
#[derive(Clone, Debug, PartialEq)]
pub struct RunState {
    pub current_node: String,
    /// Node ids in the order they were reached.
    pub visited: Vec<String>,
    pub node_outcomes: BTreeMap<String, NodeOutcome>,
    pub node_retries: BTreeMap<String, u32>,
    pub reroute_count: u32,
    pub reroute_trail: Vec<String>,
    pub context: Context,
}

impl RunState {
    pub fn new(start_node: impl Into<String>, context: Context) -> Self {
        Self {
            current_node: start_node.into(),
            visited: Vec::new(),
            node_outcomes: BTreeMap::new(),
            node_retries: BTreeMap::new(),
            reroute_count: 0,
            reroute_trail: Vec::new(),
            context,
        }
    }

    pub fn record_outcome(&mut self, node_id: &str, outcome: NodeOutcome, retries: u32) {
        self.visited.push(node_id.to_string());
        self.node_outcomes.insert(node_id.to_string(), outcome);
        self.node_retries.insert(node_id.to_string(), retries);
    }

    /// Counts a loop-back to `target`. Returns false once `limit` is passed.
    pub fn record_reroute(&mut self, target: &str, limit: u32) -> bool {
        self.reroute_count += 1;
        self.reroute_trail.push(target.to_string());
        self.reroute_count <= limit
    }

    pub fn last_outcome(&self) -> Option<&NodeOutcome> {
        self.visited
            .last()
            .and_then(|node_id| self.node_outcomes.get(node_id))
    }
}
