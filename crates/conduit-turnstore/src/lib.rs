//! Append-only turn store used by the conduit engine for checkpoints and
//! lifecycle records.
//!
//! A context is an ordered chain of turns. Turns are never rewritten; resume
//! reads them back with [`TurnStore::read_turns_since`].

pub mod fs;
pub mod memory;
pub mod store;
pub mod types;

pub use fs::FsTurnStore;
pub use memory::MemoryTurnStore;
pub use store::{TurnStore, TurnStoreError, TurnStoreResult};
pub use types::{
    AppendTurnRequest, BlobHash, ContextId, CorrelationMetadata, StoreContext, StoredTurn,
    StoredTurnEnvelope, StoredTurnRef, TurnId, ROOT_TURN_ID, pipeline_idempotency_key,
};
