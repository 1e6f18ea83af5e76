use crate::storage::SharedPipelineStorageWriter;
use crate::{PipelineFailure, RuntimeContext, RuntimeEventSink};
use conduit_turnstore::ContextId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Success,
    PartialSuccess,
    Retry,
    Fail,
}

impl NodeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::PartialSuccess => "partial_success",
            Self::Retry => "retry",
            Self::Fail => "fail",
        }
    }

    pub fn is_success_like(self) -> bool {
        matches!(self, Self::Success | Self::PartialSuccess)
    }

    /// Consolidation rank, higher is better.
    pub fn rank(self) -> u8 {
        match self {
            Self::Success => 3,
            Self::PartialSuccess => 2,
            Self::Retry => 1,
            Self::Fail => 0,
        }
    }
}

impl TryFrom<&str> for NodeStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value.trim().to_ascii_lowercase().as_str() {
            "success" => Ok(Self::Success),
            "partial_success" => Ok(Self::PartialSuccess),
            "retry" => Ok(Self::Retry),
            "fail" => Ok(Self::Fail),
            other => Err(format!("unknown node status '{other}'")),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct NodeOutcome {
    pub status: NodeStatus,
    #[serde(default)]
    pub preferred_label: Option<String>,
    #[serde(default)]
    pub suggested_next_ids: Vec<String>,
    #[serde(default)]
    pub context_updates: RuntimeContext,
    #[serde(default)]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl NodeOutcome {
    pub fn with_status(status: NodeStatus) -> Self {
        Self {
            status,
            preferred_label: None,
            suggested_next_ids: Vec::new(),
            context_updates: RuntimeContext::new(),
            failure_reason: None,
            notes: None,
        }
    }

    pub fn success() -> Self {
        Self::with_status(NodeStatus::Success)
    }

    pub fn partial_success() -> Self {
        Self::with_status(NodeStatus::PartialSuccess)
    }

    pub fn failure(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::with_status(NodeStatus::Fail)
        }
    }

    pub fn retry(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::with_status(NodeStatus::Retry)
        }
    }

    pub fn with_update(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context_updates.insert(key.into(), value);
        self
    }

    pub fn with_preferred_label(mut self, label: impl Into<String>) -> Self {
        self.preferred_label = Some(label.into());
        self
    }

    pub fn with_suggested_next_ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.suggested_next_ids = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_notes(mut self, notes: impl Into<String>) -> Self {
        self.notes = Some(notes.into());
        self
    }
}

/// Per-run inputs. The runner itself only carries the immutable engine
/// configuration and the handler registry.
#[derive(Clone, Default)]
pub struct RunConfig {
    pub run_id: Option<String>,
    pub storage: Option<SharedPipelineStorageWriter>,
    pub resume_session: Option<ContextId>,
    pub events: RuntimeEventSink,
    pub cancel: CancellationToken,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Success,
    Fail,
    Paused,
}

impl PipelineStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Fail => "fail",
            Self::Paused => "paused",
        }
    }
}

impl TryFrom<&str> for PipelineStatus {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "success" => Ok(Self::Success),
            "fail" => Ok(Self::Fail),
            "paused" => Ok(Self::Paused),
            other => Err(format!("unknown pipeline status '{other}'")),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct PipelineRunResult {
    pub run_id: String,
    /// Turn store context holding this run's records, when storage is enabled.
    pub session_id: Option<ContextId>,
    pub status: PipelineStatus,
    pub failure: Option<PipelineFailure>,
    pub failure_reason: Option<String>,
    pub completed_nodes: Vec<String>,
    pub node_outcomes: BTreeMap<String, NodeOutcome>,
    pub node_retries: BTreeMap<String, u32>,
    pub reroute_count: u32,
    pub context: RuntimeContext,
}
