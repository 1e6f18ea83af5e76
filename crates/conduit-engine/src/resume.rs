use crate::storage::types::{CHECKPOINT_TYPE_ID, decode_checkpoint, decode_envelope};
use crate::{
    CheckpointState, EngineError, Graph, PipelineStatus, PipelineStorageWriter, RunState,
    select_next_edge,
};
use conduit_turnstore::ContextId;

#[derive(Clone, Debug)]
pub struct ResumeState {
    pub checkpoint: CheckpointState,
    pub state: RunState,
    pub next_node: Option<String>,
    pub terminal_status: Option<PipelineStatus>,
    /// Highest sequence number already written to the session.
    pub last_sequence_no: u64,
}

/// Loads the latest checkpoint of `session` and positions a run state at
/// its next-node pointer. Nothing recorded before the checkpoint is replayed.
pub async fn resolve_resume_state(
    graph: &Graph,
    writer: &dyn PipelineStorageWriter,
    session: &ContextId,
) -> Result<ResumeState, EngineError> {
    let turns = writer.read_run_turns(session, None).await?;

    let mut last_sequence_no = 0;
    let mut latest = None;
    for turn in &turns {
        let envelope = decode_envelope(turn)?;
        if let Some(sequence_no) = envelope.correlation.sequence_no {
            last_sequence_no = last_sequence_no.max(sequence_no);
        }
        if turn.type_id == CHECKPOINT_TYPE_ID {
            latest = Some(envelope);
        }
    }

    let envelope = latest.ok_or_else(|| EngineError::NotFound {
        resource: "checkpoint",
        id: session.clone(),
    })?;
    let checkpoint = decode_checkpoint(&envelope)?;
    let terminal_status = checkpoint.terminal_pipeline_status()?;

    let next_node = if terminal_status.is_some() {
        None
    } else {
        match checkpoint.next_node.clone() {
            Some(next) => Some(next),
            None => infer_next_node(graph, &checkpoint)?,
        }
    };
    if let Some(next) = next_node.as_deref() {
        if !graph.contains_node(next) {
            return Err(EngineError::Checkpoint(format!(
                "resume checkpoint points to unknown next node '{next}'"
            )));
        }
    }

    let mut state = checkpoint.restore_run_state()?;
    if let Some(next) = next_node.as_ref() {
        state.current_node = next.clone();
    }

    Ok(ResumeState {
        checkpoint,
        state,
        next_node,
        terminal_status,
        last_sequence_no,
    })
}

/// Re-runs edge selection from the last visited node when a checkpoint was
/// written without a next-node pointer.
pub fn infer_next_node(
    graph: &Graph,
    checkpoint: &CheckpointState,
) -> Result<Option<String>, EngineError> {
    let Some(last) = checkpoint.visited.last() else {
        return Ok(Some(checkpoint.current_node.clone()));
    };
    let Some(stored) = checkpoint.node_outcomes.get(last) else {
        return Ok(None);
    };
    let outcome = stored.to_runtime()?;
    let context = crate::Context::from_values(checkpoint.context_values.clone());

    Ok(select_next_edge(graph, last, &outcome, &context)?
        .map(|selection| selection.edge.to.clone()))
}
