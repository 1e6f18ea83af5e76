use crate::{CheckpointState, EngineError, checkpoint_hash};
use conduit_turnstore::{BlobHash, ContextId, CorrelationMetadata, StoredTurn, StoredTurnEnvelope};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const RUN_EVENT_TYPE_ID: &str = "conduit.engine.run_event";
pub const STAGE_EVENT_TYPE_ID: &str = "conduit.engine.stage_event";
pub const CHECKPOINT_TYPE_ID: &str = "conduit.engine.checkpoint";
pub const RETRYING_TYPE_ID: &str = "conduit.engine.retrying";
pub const ENVELOPE_SCHEMA_VERSION: u32 = 1;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineCorrelation {
    pub run_id: String,
    pub pipeline_context_id: Option<ContextId>,
    pub node_id: Option<String>,
    pub stage_attempt_id: Option<String>,
    pub branch_id: Option<String>,
    pub sequence_no: u64,
}

impl PipelineCorrelation {
    pub fn to_store_correlation(&self) -> CorrelationMetadata {
        CorrelationMetadata {
            run_id: Some(self.run_id.clone()),
            pipeline_context_id: self.pipeline_context_id.clone(),
            node_id: self.node_id.clone(),
            stage_attempt_id: self.stage_attempt_id.clone(),
            branch_id: self.branch_id.clone(),
            sequence_no: Some(self.sequence_no),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunEventRecord {
    pub event_kind: String,
    pub timestamp: String,
    pub payload: Value,
    pub correlation: PipelineCorrelation,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StageEventRecord {
    pub event_kind: String,
    pub timestamp: String,
    pub payload: Value,
    pub correlation: PipelineCorrelation,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryingRecord {
    pub timestamp: String,
    pub node_id: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub delay_ms: u64,
    pub status: String,
    pub failure_reason: Option<String>,
    pub correlation: PipelineCorrelation,
}

/// `state_json` is the exact text `checkpoint_hash` was computed over.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub checkpoint_id: String,
    pub timestamp: String,
    pub state_json: String,
    pub checkpoint_hash: BlobHash,
    pub correlation: PipelineCorrelation,
}

impl CheckpointRecord {
    pub fn from_state(
        checkpoint: &CheckpointState,
        correlation: PipelineCorrelation,
    ) -> Result<Self, EngineError> {
        let state_json = checkpoint.to_json()?;
        Ok(Self {
            checkpoint_id: checkpoint.metadata.checkpoint_id.clone(),
            timestamp: checkpoint.metadata.timestamp.clone(),
            checkpoint_hash: checkpoint_hash(&state_json),
            state_json,
            correlation,
        })
    }
}

fn envelope(
    correlation: &PipelineCorrelation,
    event_kind: String,
    timestamp: String,
    payload: Value,
) -> StoredTurnEnvelope {
    StoredTurnEnvelope {
        schema_version: ENVELOPE_SCHEMA_VERSION,
        run_id: Some(correlation.run_id.clone()),
        node_id: correlation.node_id.clone(),
        stage_attempt_id: correlation.stage_attempt_id.clone(),
        event_kind,
        timestamp,
        payload,
        correlation: correlation.to_store_correlation(),
    }
}

pub fn run_event_envelope(record: RunEventRecord) -> StoredTurnEnvelope {
    envelope(
        &record.correlation,
        record.event_kind,
        record.timestamp,
        record.payload,
    )
}

pub fn stage_event_envelope(record: StageEventRecord) -> StoredTurnEnvelope {
    envelope(
        &record.correlation,
        record.event_kind,
        record.timestamp,
        record.payload,
    )
}

pub fn retrying_envelope(record: RetryingRecord) -> StoredTurnEnvelope {
    envelope(
        &record.correlation,
        "stage_retrying".to_string(),
        record.timestamp,
        serde_json::json!({
            "node_id": record.node_id,
            "attempt": record.attempt,
            "max_attempts": record.max_attempts,
            "delay_ms": record.delay_ms,
            "status": record.status,
            "failure_reason": record.failure_reason,
        }),
    )
}

pub fn checkpoint_envelope(record: CheckpointRecord) -> StoredTurnEnvelope {
    envelope(
        &record.correlation,
        "checkpoint_saved".to_string(),
        record.timestamp,
        serde_json::json!({
            "checkpoint_id": record.checkpoint_id,
            "checkpoint_hash": record.checkpoint_hash,
            "state_json": record.state_json,
        }),
    )
}

pub fn decode_envelope(turn: &StoredTurn) -> Result<StoredTurnEnvelope, EngineError> {
    serde_json::from_slice(&turn.payload).map_err(|error| {
        EngineError::Checkpoint(format!(
            "turn {} ({}) is not a valid engine envelope: {error}",
            turn.turn_id, turn.type_id
        ))
    })
}

/// Decodes a checkpoint turn and verifies its content hash.
pub fn decode_checkpoint(envelope: &StoredTurnEnvelope) -> Result<CheckpointState, EngineError> {
    let field = |name: &str| {
        envelope
            .payload
            .get(name)
            .and_then(Value::as_str)
            .ok_or_else(|| EngineError::Checkpoint(format!("checkpoint turn is missing '{name}'")))
    };
    let state_json = field("state_json")?;
    let expected_hash = field("checkpoint_hash")?;
    let actual_hash = checkpoint_hash(state_json);
    if actual_hash != expected_hash {
        return Err(EngineError::Checkpoint(format!(
            "checkpoint hash mismatch: expected {expected_hash}, found {actual_hash}"
        )));
    }
    CheckpointState::from_json(state_json)
}
