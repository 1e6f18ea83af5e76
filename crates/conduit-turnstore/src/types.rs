use serde::{Deserialize, Serialize};
use serde_json::Value;

pub type ContextId = String;
pub type TurnId = String;
pub type BlobHash = String;

/// Parent id of the first turn in every chain.
pub const ROOT_TURN_ID: &str = "0";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreContext {
    pub context_id: ContextId,
    pub head_turn_id: TurnId,
    pub head_depth: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTurnRef {
    pub context_id: ContextId,
    pub turn_id: TurnId,
    pub depth: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendTurnRequest {
    pub context_id: ContextId,
    pub parent_turn_id: Option<TurnId>,
    pub type_id: String,
    pub type_version: u32,
    pub payload: Vec<u8>,
    pub idempotency_key: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTurn {
    pub context_id: ContextId,
    pub turn_id: TurnId,
    pub parent_turn_id: TurnId,
    pub depth: u32,
    pub type_id: String,
    pub type_version: u32,
    pub payload: Vec<u8>,
    pub idempotency_key: Option<String>,
    pub content_hash: Option<BlobHash>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CorrelationMetadata {
    pub run_id: Option<String>,
    pub pipeline_context_id: Option<String>,
    pub node_id: Option<String>,
    pub stage_attempt_id: Option<String>,
    pub branch_id: Option<String>,
    pub sequence_no: Option<u64>,
}

/// JSON body written as the payload of every engine turn.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StoredTurnEnvelope {
    pub schema_version: u32,
    pub run_id: Option<String>,
    pub node_id: Option<String>,
    pub stage_attempt_id: Option<String>,
    pub event_kind: String,
    pub timestamp: String,
    pub payload: Value,
    pub correlation: CorrelationMetadata,
}

fn encode_part(part: &str) -> String {
    format!("{}:{}", part.len(), part)
}

pub fn pipeline_idempotency_key(
    run_id: &str,
    node_id: &str,
    stage_attempt_id: &str,
    event_kind: &str,
    sequence_no: u64,
) -> String {
    format!(
        "conduit-engine:v1|{}|{}|{}|{}|{}",
        encode_part(run_id),
        encode_part(node_id),
        encode_part(stage_attempt_id),
        encode_part(event_kind),
        sequence_no
    )
}
