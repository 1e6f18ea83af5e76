use crate::memory::{MemoryState, MemoryTurnStore};
use crate::store::{TurnStore, TurnStoreError, TurnStoreResult};
use crate::types::{AppendTurnRequest, ContextId, StoreContext, StoredTurn, StoredTurnRef, TurnId};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const DOCUMENT_NAME: &str = "turns.json";

fn backend(action: &str, path: &Path, error: std::io::Error) -> TurnStoreError {
    TurnStoreError::Backend(format!("{action} {} failed: {error}", path.display()))
}

fn load_state(document: &Path) -> TurnStoreResult<MemoryState> {
    if !document.exists() {
        return Ok(MemoryState::default());
    }
    let raw = fs::read(document).map_err(|error| backend("read", document, error))?;
    serde_json::from_slice(&raw).map_err(|error| TurnStoreError::Serialization(error.to_string()))
}

/// Write to a sibling temp file, then rename over the document.
fn write_atomically(document: &Path, bytes: &[u8]) -> TurnStoreResult<()> {
    let staging = document.with_extension("json.partial");
    fs::write(&staging, bytes).map_err(|error| backend("write", &staging, error))?;
    fs::rename(&staging, document).map_err(|error| backend("replace", document, error))
}

/// A [`MemoryTurnStore`] whose whole state is rewritten to `turns.json`
/// under `root` after every mutation, and reloaded on open.
#[derive(Clone, Debug)]
pub struct FsTurnStore {
    document: PathBuf,
    memory: MemoryTurnStore,
    write_gate: Arc<Mutex<()>>,
}

impl FsTurnStore {
    pub fn new<P: AsRef<Path>>(root: P) -> TurnStoreResult<Self> {
        let root = root.as_ref();
        fs::create_dir_all(root).map_err(|error| backend("create", root, error))?;
        let document = root.join(DOCUMENT_NAME);
        let state = load_state(&document)?;
        tracing::debug!(path = %document.display(), "file turn store opened");

        Ok(Self {
            document,
            memory: MemoryTurnStore::from_state(state),
            write_gate: Arc::new(Mutex::new(())),
        })
    }

    pub fn path(&self) -> &Path {
        &self.document
    }

    fn flush(&self) -> TurnStoreResult<()> {
        let _gate = self
            .write_gate
            .lock()
            .map_err(|_| TurnStoreError::Backend("file turn store lock poisoned".to_string()))?;
        let bytes = serde_json::to_vec(&self.memory.snapshot()?)
            .map_err(|error| TurnStoreError::Serialization(error.to_string()))?;
        write_atomically(&self.document, &bytes)
    }
}

#[async_trait::async_trait]
impl TurnStore for FsTurnStore {
    async fn create_context(&self, base_turn_id: Option<TurnId>) -> TurnStoreResult<StoreContext> {
        let context = self.memory.create_context(base_turn_id).await?;
        self.flush()?;
        Ok(context)
    }

    async fn append_turn(&self, request: AppendTurnRequest) -> TurnStoreResult<StoredTurn> {
        let turn = self.memory.append_turn(request).await?;
        self.flush()?;
        Ok(turn)
    }

    async fn get_head(&self, context_id: &ContextId) -> TurnStoreResult<StoredTurnRef> {
        self.memory.get_head(context_id).await
    }

    async fn list_turns(
        &self,
        context_id: &ContextId,
        before_turn_id: Option<&TurnId>,
        limit: usize,
    ) -> TurnStoreResult<Vec<StoredTurn>> {
        self.memory.list_turns(context_id, before_turn_id, limit).await
    }

    async fn read_turns_since(
        &self,
        context_id: &ContextId,
        cursor: Option<&TurnId>,
    ) -> TurnStoreResult<Vec<StoredTurn>> {
        self.memory.read_turns_since(context_id, cursor).await
    }
}
