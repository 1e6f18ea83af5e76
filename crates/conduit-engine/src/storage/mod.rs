use crate::events::timestamp_now;
use crate::storage::types::{
    CHECKPOINT_TYPE_ID, RETRYING_TYPE_ID, RUN_EVENT_TYPE_ID, STAGE_EVENT_TYPE_ID,
    checkpoint_envelope, retrying_envelope, run_event_envelope, stage_event_envelope,
};
use crate::{CheckpointState, EngineError, RetrySignal};
use conduit_turnstore::{
    AppendTurnRequest, ContextId, StoreContext, StoredTurn, StoredTurnEnvelope, TurnId, TurnStore,
    TurnStoreError, pipeline_idempotency_key,
};
use serde_json::Value;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

pub mod types;

pub use types::{
    CheckpointRecord, PipelineCorrelation, RetryingRecord, RunEventRecord, StageEventRecord,
};

pub type SharedPipelineStorageWriter = Arc<dyn PipelineStorageWriter>;

/// Engine records on top of a turn store. Any `TurnStore` is a writer.
#[async_trait::async_trait]
pub trait PipelineStorageWriter: Send + Sync {
    async fn create_run_context(
        &self,
        base_turn_id: Option<TurnId>,
    ) -> Result<StoreContext, TurnStoreError>;

    async fn append_run_event(
        &self,
        context_id: &ContextId,
        record: RunEventRecord,
        idempotency_key: String,
    ) -> Result<StoredTurn, TurnStoreError>;

    async fn append_stage_event(
        &self,
        context_id: &ContextId,
        record: StageEventRecord,
        idempotency_key: String,
    ) -> Result<StoredTurn, TurnStoreError>;

    async fn append_retrying(
        &self,
        context_id: &ContextId,
        record: RetryingRecord,
        idempotency_key: String,
    ) -> Result<StoredTurn, TurnStoreError>;

    async fn append_checkpoint(
        &self,
        context_id: &ContextId,
        record: CheckpointRecord,
        idempotency_key: String,
    ) -> Result<StoredTurn, TurnStoreError>;

    async fn read_run_turns(
        &self,
        context_id: &ContextId,
        cursor: Option<&TurnId>,
    ) -> Result<Vec<StoredTurn>, TurnStoreError>;
}

async fn append_envelope<T>(
    store: &T,
    context_id: &ContextId,
    type_id: &str,
    envelope: StoredTurnEnvelope,
    idempotency_key: String,
) -> Result<StoredTurn, TurnStoreError>
where
    T: TurnStore + ?Sized,
{
    let payload = serde_json::to_vec(&envelope)
        .map_err(|err| TurnStoreError::Serialization(err.to_string()))?;
    store
        .append_turn(AppendTurnRequest {
            context_id: context_id.clone(),
            parent_turn_id: None,
            type_id: type_id.to_string(),
            type_version: 1,
            payload,
            idempotency_key,
        })
        .await
}

#[async_trait::async_trait]
impl<T> PipelineStorageWriter for T
where
    T: TurnStore + Send + Sync,
{
    async fn create_run_context(
        &self,
        base_turn_id: Option<TurnId>,
    ) -> Result<StoreContext, TurnStoreError> {
        self.create_context(base_turn_id).await
    }

    async fn append_run_event(
        &self,
        context_id: &ContextId,
        record: RunEventRecord,
        idempotency_key: String,
    ) -> Result<StoredTurn, TurnStoreError> {
        append_envelope(
            self,
            context_id,
            RUN_EVENT_TYPE_ID,
            run_event_envelope(record),
            idempotency_key,
        )
        .await
    }

    async fn append_stage_event(
        &self,
        context_id: &ContextId,
        record: StageEventRecord,
        idempotency_key: String,
    ) -> Result<StoredTurn, TurnStoreError> {
        append_envelope(
            self,
            context_id,
            STAGE_EVENT_TYPE_ID,
            stage_event_envelope(record),
            idempotency_key,
        )
        .await
    }

    async fn append_retrying(
        &self,
        context_id: &ContextId,
        record: RetryingRecord,
        idempotency_key: String,
    ) -> Result<StoredTurn, TurnStoreError> {
        append_envelope(
            self,
            context_id,
            RETRYING_TYPE_ID,
            retrying_envelope(record),
            idempotency_key,
        )
        .await
    }

    async fn append_checkpoint(
        &self,
        context_id: &ContextId,
        record: CheckpointRecord,
        idempotency_key: String,
    ) -> Result<StoredTurn, TurnStoreError> {
        append_envelope(
            self,
            context_id,
            CHECKPOINT_TYPE_ID,
            checkpoint_envelope(record),
            idempotency_key,
        )
        .await
    }

    async fn read_run_turns(
        &self,
        context_id: &ContextId,
        cursor: Option<&TurnId>,
    ) -> Result<Vec<StoredTurn>, TurnStoreError> {
        self.read_turns_since(context_id, cursor).await
    }
}

const RUN_SCOPE: &str = "__run__";

/// Per-run handle used by the runner and its branches. Clones share the
/// sequence counter. Without a writer every append is a no-op.
#[derive(Clone)]
pub(crate) struct RunStorage {
    writer: Option<SharedPipelineStorageWriter>,
    run_id: String,
    context_id: Option<ContextId>,
    sequence_no: Arc<AtomicU64>,
}

impl RunStorage {
    pub(crate) async fn open(
        writer: Option<SharedPipelineStorageWriter>,
        run_id: String,
    ) -> Result<Self, EngineError> {
        let context_id = match writer.as_ref() {
            Some(writer) => Some(writer.create_run_context(None).await?.context_id),
            None => None,
        };
        Ok(Self {
            writer,
            run_id,
            context_id,
            sequence_no: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Continues an existing session after the highest sequence number seen.
    pub(crate) fn attach(
        writer: SharedPipelineStorageWriter,
        run_id: String,
        context_id: ContextId,
        last_sequence_no: u64,
    ) -> Self {
        Self {
            writer: Some(writer),
            run_id,
            context_id: Some(context_id),
            sequence_no: Arc::new(AtomicU64::new(last_sequence_no)),
        }
    }

    pub(crate) fn run_id(&self) -> &str {
        &self.run_id
    }

    pub(crate) fn context_id(&self) -> Option<&ContextId> {
        self.context_id.as_ref()
    }

    pub(crate) fn next_sequence_no(&self) -> u64 {
        self.sequence_no.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn target(&self) -> Option<(&SharedPipelineStorageWriter, &ContextId)> {
        self.writer.as_ref().zip(self.context_id.as_ref())
    }

    fn correlation(
        &self,
        node_id: Option<&str>,
        stage_attempt_id: Option<&str>,
        branch_id: Option<&str>,
        sequence_no: u64,
    ) -> PipelineCorrelation {
        PipelineCorrelation {
            run_id: self.run_id.clone(),
            pipeline_context_id: self.context_id.clone(),
            node_id: node_id.map(str::to_string),
            stage_attempt_id: stage_attempt_id.map(str::to_string),
            branch_id: branch_id.map(str::to_string),
            sequence_no,
        }
    }

    pub(crate) async fn append_run_event(
        &self,
        event_kind: &str,
        payload: Value,
    ) -> Result<(), EngineError> {
        let sequence_no = self.next_sequence_no();
        let Some((writer, context_id)) = self.target() else {
            return Ok(());
        };
        let idempotency_key =
            pipeline_idempotency_key(&self.run_id, RUN_SCOPE, RUN_SCOPE, event_kind, sequence_no);
        writer
            .append_run_event(
                context_id,
                RunEventRecord {
                    event_kind: event_kind.to_string(),
                    timestamp: timestamp_now(),
                    payload,
                    correlation: self.correlation(None, None, None, sequence_no),
                },
                idempotency_key,
            )
            .await?;
        Ok(())
    }

    pub(crate) async fn append_stage_event(
        &self,
        node_id: &str,
        stage_attempt_id: &str,
        branch_id: Option<&str>,
        event_kind: &str,
        payload: Value,
    ) -> Result<(), EngineError> {
        let sequence_no = self.next_sequence_no();
        let Some((writer, context_id)) = self.target() else {
            return Ok(());
        };
        let idempotency_key = pipeline_idempotency_key(
            &self.run_id,
            node_id,
            stage_attempt_id,
            event_kind,
            sequence_no,
        );
        writer
            .append_stage_event(
                context_id,
                StageEventRecord {
                    event_kind: event_kind.to_string(),
                    timestamp: timestamp_now(),
                    payload,
                    correlation: self.correlation(
                        Some(node_id),
                        Some(stage_attempt_id),
                        branch_id,
                        sequence_no,
                    ),
                },
                idempotency_key,
            )
            .await?;
        Ok(())
    }

    pub(crate) async fn append_retrying(
        &self,
        stage_attempt_id: &str,
        branch_id: Option<&str>,
        signal: &RetrySignal,
    ) -> Result<(), EngineError> {
        let sequence_no = self.next_sequence_no();
        let Some((writer, context_id)) = self.target() else {
            return Ok(());
        };
        let idempotency_key = pipeline_idempotency_key(
            &self.run_id,
            &signal.node_id,
            stage_attempt_id,
            "stage_retrying",
            sequence_no,
        );
        writer
            .append_retrying(
                context_id,
                RetryingRecord {
                    timestamp: timestamp_now(),
                    node_id: signal.node_id.clone(),
                    attempt: signal.attempt,
                    max_attempts: signal.max_attempts,
                    delay_ms: signal.delay.as_millis() as u64,
                    status: signal.status.as_str().to_string(),
                    failure_reason: signal.failure_reason.clone(),
                    correlation: self.correlation(
                        Some(&signal.node_id),
                        Some(stage_attempt_id),
                        branch_id,
                        sequence_no,
                    ),
                },
                idempotency_key,
            )
            .await?;
        Ok(())
    }

    /// The checkpoint carries its own sequence number from
    /// [`RunStorage::next_sequence_no`].
    pub(crate) async fn append_checkpoint(
        &self,
        checkpoint: &CheckpointState,
    ) -> Result<(), EngineError> {
        let Some((writer, context_id)) = self.target() else {
            return Ok(());
        };
        let sequence_no = checkpoint.metadata.sequence_no;
        let node_id = checkpoint.current_node.as_str();
        let correlation = self.correlation(Some(node_id), None, None, sequence_no);
        let record = CheckpointRecord::from_state(checkpoint, correlation)?;
        let idempotency_key = pipeline_idempotency_key(
            &self.run_id,
            node_id,
            &record.checkpoint_id,
            "checkpoint_saved",
            sequence_no,
        );
        writer
            .append_checkpoint(context_id, record, idempotency_key)
            .await?;
        Ok(())
    }
}
