use crate::types::{AppendTurnRequest, ContextId, StoreContext, StoredTurn, StoredTurnRef, TurnId};

#[derive(Debug, thiserror::Error)]
pub enum TurnStoreError {
    #[error("resource not found: {resource} ({id})")]
    NotFound { resource: &'static str, id: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("unsupported operation: {0}")]
    Unsupported(String),

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("backend failure: {0}")]
    Backend(String),
}

pub type TurnStoreResult<T> = Result<T, TurnStoreError>;

#[async_trait::async_trait]
pub trait TurnStore: Send + Sync {
    /// Opens a new context (session). With a base turn the new context starts
    /// from that turn's position in an existing chain.
    async fn create_context(&self, base_turn_id: Option<TurnId>) -> TurnStoreResult<StoreContext>;

    /// Appends a turn at the context head. Appending twice with the same
    /// non-empty idempotency key returns the first stored turn.
    async fn append_turn(&self, request: AppendTurnRequest) -> TurnStoreResult<StoredTurn>;

    async fn get_head(&self, context_id: &ContextId) -> TurnStoreResult<StoredTurnRef>;

    /// Pages backwards from `before_turn_id` (or the head). Results are
    /// returned oldest first.
    async fn list_turns(
        &self,
        context_id: &ContextId,
        before_turn_id: Option<&TurnId>,
        limit: usize,
    ) -> TurnStoreResult<Vec<StoredTurn>>;

    /// Every turn appended to the context after `cursor`, oldest first. A
    /// `None` cursor reads the whole chain.
    async fn read_turns_since(
        &self,
        context_id: &ContextId,
        cursor: Option<&TurnId>,
    ) -> TurnStoreResult<Vec<StoredTurn>>;
}
