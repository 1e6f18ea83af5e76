use crate::{
    Context, EngineError, NodeOutcome, NodeStatus, PipelineFailure, PipelineStatus, RunState,
    RuntimeContext,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const CHECKPOINT_SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    pub schema_version: u32,
    pub run_id: String,
    pub checkpoint_id: String,
    pub sequence_no: u64,
    pub timestamp: String,
}

impl CheckpointMetadata {
    pub fn new(run_id: impl Into<String>, sequence_no: u64, timestamp: impl Into<String>) -> Self {
        Self {
            schema_version: CHECKPOINT_SCHEMA_VERSION,
            run_id: run_id.into(),
            checkpoint_id: format!("cp-{sequence_no}"),
            sequence_no,
            timestamp: timestamp.into(),
        }
    }
}

/// Outcome as persisted. Context updates are already folded into
/// `context_values`, so they are not repeated here.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointNodeOutcome {
    pub status: String,
    pub preferred_label: Option<String>,
    pub suggested_next_ids: Vec<String>,
    pub failure_reason: Option<String>,
    pub notes: Option<String>,
}

impl CheckpointNodeOutcome {
    pub fn from_runtime(outcome: &NodeOutcome) -> Self {
        Self {
            status: outcome.status.as_str().to_string(),
            preferred_label: outcome.preferred_label.clone(),
            suggested_next_ids: outcome.suggested_next_ids.clone(),
            failure_reason: outcome.failure_reason.clone(),
            notes: outcome.notes.clone(),
        }
    }

    pub fn to_runtime(&self) -> Result<NodeOutcome, EngineError> {
        let status = NodeStatus::try_from(self.status.as_str())
            .map_err(|error| EngineError::Checkpoint(format!("{error} in checkpoint")))?;
        Ok(NodeOutcome {
            status,
            preferred_label: self.preferred_label.clone(),
            suggested_next_ids: self.suggested_next_ids.clone(),
            context_updates: RuntimeContext::new(),
            failure_reason: self.failure_reason.clone(),
            notes: self.notes.clone(),
        })
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CheckpointState {
    pub metadata: CheckpointMetadata,
    pub current_node: String,
    pub next_node: Option<String>,
    pub visited: Vec<String>,
    pub node_retries: BTreeMap<String, u32>,
    pub node_outcomes: BTreeMap<String, CheckpointNodeOutcome>,
    pub context_values: RuntimeContext,
    pub reroute_count: u32,
    pub reroute_trail: Vec<String>,
    pub terminal_status: Option<String>,
    pub terminal_failure: Option<PipelineFailure>,
}

impl CheckpointState {
    pub fn capture(
        metadata: CheckpointMetadata,
        state: &RunState,
        next_node: Option<String>,
    ) -> Self {
        Self {
            metadata,
            current_node: state.current_node.clone(),
            next_node,
            visited: state.visited.clone(),
            node_retries: state.node_retries.clone(),
            node_outcomes: state
                .node_outcomes
                .iter()
                .map(|(node_id, outcome)| {
                    (node_id.clone(), CheckpointNodeOutcome::from_runtime(outcome))
                })
                .collect(),
            context_values: state.context.values().clone(),
            reroute_count: state.reroute_count,
            reroute_trail: state.reroute_trail.clone(),
            terminal_status: None,
            terminal_failure: None,
        }
    }

    pub fn with_terminal(
        mut self,
        status: PipelineStatus,
        failure: Option<PipelineFailure>,
    ) -> Self {
        self.terminal_status = Some(status.as_str().to_string());
        self.terminal_failure = failure;
        self
    }

    /// Rebuilds the run state positioned at `next_node` (or the recorded
    /// current node when there is none).
    pub fn restore_run_state(&self) -> Result<RunState, EngineError> {
        let node_outcomes = self
            .node_outcomes
            .iter()
            .map(|(node_id, outcome)| Ok((node_id.clone(), outcome.to_runtime()?)))
            .collect::<Result<BTreeMap<_, _>, EngineError>>()?;

        Ok(RunState {
            current_node: self
                .next_node
                .clone()
                .unwrap_or_else(|| self.current_node.clone()),
            visited: self.visited.clone(),
            node_outcomes,
            node_retries: self.node_retries.clone(),
            reroute_count: self.reroute_count,
            reroute_trail: self.reroute_trail.clone(),
            context: Context::from_values(self.context_values.clone()),
        })
    }

    pub fn terminal_pipeline_status(&self) -> Result<Option<PipelineStatus>, EngineError> {
        match self.terminal_status.as_deref() {
            None => Ok(None),
            Some("paused") => Err(EngineError::Checkpoint(
                "paused is not a terminal checkpoint status".to_string(),
            )),
            Some(other) => PipelineStatus::try_from(other)
                .map(Some)
                .map_err(EngineError::Checkpoint),
        }
    }

    pub fn to_json(&self) -> Result<String, EngineError> {
        serde_json::to_string(self).map_err(|error| {
            EngineError::Checkpoint(format!("failed to serialize checkpoint: {error}"))
        })
    }

    pub fn from_json(raw: &str) -> Result<Self, EngineError> {
        let state: Self = serde_json::from_str(raw).map_err(|error| {
            EngineError::Checkpoint(format!("failed to deserialize checkpoint: {error}"))
        })?;
        if state.metadata.schema_version != CHECKPOINT_SCHEMA_VERSION {
            return Err(EngineError::Checkpoint(format!(
                "unsupported checkpoint schema version {}",
                state.metadata.schema_version
            )));
        }
        Ok(state)
    }
}

pub fn checkpoint_hash(serialized: &str) -> String {
    blake3::hash(serialized.as_bytes()).to_hex().to_string()
}
