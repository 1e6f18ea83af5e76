use crate::store::{TurnStore, TurnStoreError, TurnStoreResult};
use crate::types::{
    AppendTurnRequest, ContextId, ROOT_TURN_ID, StoreContext, StoredTurn, StoredTurnRef, TurnId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

/// Everything a memory store holds. Serializable so the file store can
/// persist it as one document.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub(crate) struct MemoryState {
    last_context_no: u64,
    last_turn_no: u64,
    heads: BTreeMap<ContextId, StoredTurnRef>,
    turns: BTreeMap<TurnId, StoredTurn>,
    /// Per context: idempotency key -> first turn appended with it.
    keys: BTreeMap<ContextId, BTreeMap<String, TurnId>>,
}

fn not_found(resource: &'static str, id: &str) -> TurnStoreError {
    TurnStoreError::NotFound {
        resource,
        id: id.to_string(),
    }
}

impl MemoryState {
    fn head(&self, context_id: &str) -> TurnStoreResult<&StoredTurnRef> {
        self.heads
            .get(context_id)
            .ok_or_else(|| not_found("context", context_id))
    }

    fn depth_of(&self, turn_id: &str) -> TurnStoreResult<u32> {
        if turn_id == ROOT_TURN_ID {
            return Ok(0);
        }
        self.turns
            .get(turn_id)
            .map(|turn| turn.depth)
            .ok_or_else(|| not_found("turn", turn_id))
    }

    /// Turns from `turn_id` back towards the root, newest first.
    fn ancestors<'a>(&'a self, turn_id: &'a str) -> Ancestors<'a> {
        Ancestors {
            state: self,
            cursor: turn_id,
        }
    }

    fn reaches(&self, head: &StoredTurnRef, turn_id: &str) -> bool {
        turn_id == ROOT_TURN_ID
            || self
                .ancestors(&head.turn_id)
                .map_while(Result::ok)
                .any(|turn| turn.turn_id == turn_id)
    }

    fn require_reachable(&self, head: &StoredTurnRef, turn_id: &str) -> TurnStoreResult<()> {
        if self.reaches(head, turn_id) {
            Ok(())
        } else {
            Err(TurnStoreError::InvalidInput(format!(
                "turn {turn_id} is not on the chain of context {}",
                head.context_id
            )))
        }
    }

    /// Up to `limit` turns ending at `from`, oldest first. Stops before
    /// `stop_at` when given.
    fn collect_chain(
        &self,
        from: &str,
        stop_at: Option<&str>,
        limit: usize,
    ) -> TurnStoreResult<Vec<StoredTurn>> {
        let mut newest_first = Vec::new();
        for turn in self.ancestors(from) {
            let turn = turn?;
            if stop_at == Some(turn.turn_id.as_str()) || newest_first.len() == limit {
                break;
            }
            newest_first.push(turn.clone());
        }
        newest_first.reverse();
        Ok(newest_first)
    }
}

struct Ancestors<'a> {
    state: &'a MemoryState,
    cursor: &'a str,
}

impl<'a> Iterator for Ancestors<'a> {
    type Item = TurnStoreResult<&'a StoredTurn>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor == ROOT_TURN_ID {
            return None;
        }
        match self.state.turns.get(self.cursor) {
            Some(turn) => {
                self.cursor = turn.parent_turn_id.as_str();
                Some(Ok(turn))
            }
            None => {
                let missing = self.cursor;
                self.cursor = ROOT_TURN_ID;
                Some(Err(not_found("turn", missing)))
            }
        }
    }
}

/// Process-local store. Clones share the same state.
#[derive(Clone, Debug, Default)]
pub struct MemoryTurnStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryTurnStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn from_state(state: MemoryState) -> Self {
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub(crate) fn snapshot(&self) -> TurnStoreResult<MemoryState> {
        Ok(self.state()?.clone())
    }

    fn state(&self) -> TurnStoreResult<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| TurnStoreError::Backend("memory turn store lock poisoned".to_string()))
    }
}

#[async_trait::async_trait]
impl TurnStore for MemoryTurnStore {
    async fn create_context(&self, base_turn_id: Option<TurnId>) -> TurnStoreResult<StoreContext> {
        let mut state = self.state()?;
        let base = base_turn_id.unwrap_or_else(|| ROOT_TURN_ID.to_string());
        let depth = state.depth_of(&base)?;

        state.last_context_no += 1;
        let context_id = state.last_context_no.to_string();
        state.heads.insert(
            context_id.clone(),
            StoredTurnRef {
                context_id: context_id.clone(),
                turn_id: base.clone(),
                depth,
            },
        );
        tracing::debug!(
            context_id = %context_id,
            base_turn_id = %base,
            "turn store context created"
        );

        Ok(StoreContext {
            context_id,
            head_turn_id: base,
            head_depth: depth,
        })
    }

    async fn append_turn(&self, request: AppendTurnRequest) -> TurnStoreResult<StoredTurn> {
        let mut state = self.state()?;
        let head = state.head(&request.context_id)?.clone();

        let key = Some(request.idempotency_key.as_str()).filter(|key| !key.is_empty());
        if let Some(key) = key {
            let existing = state
                .keys
                .get(&request.context_id)
                .and_then(|keys| keys.get(key))
                .and_then(|turn_id| state.turns.get(turn_id));
            if let Some(turn) = existing {
                tracing::debug!(
                    context_id = %request.context_id,
                    turn_id = %turn.turn_id,
                    "idempotent append returned existing turn"
                );
                return Ok(turn.clone());
            }
        }

        let parent_turn_id = request.parent_turn_id.unwrap_or(head.turn_id);
        let depth = state.depth_of(&parent_turn_id)? + 1;
        state.last_turn_no += 1;
        let turn = StoredTurn {
            context_id: request.context_id.clone(),
            turn_id: state.last_turn_no.to_string(),
            parent_turn_id,
            depth,
            type_id: request.type_id,
            type_version: request.type_version,
            content_hash: Some(blake3::hash(&request.payload).to_hex().to_string()),
            payload: request.payload,
            idempotency_key: key.map(str::to_string),
        };

        if let Some(key) = key {
            state
                .keys
                .entry(request.context_id.clone())
                .or_default()
                .insert(key.to_string(), turn.turn_id.clone());
        }
        state.turns.insert(turn.turn_id.clone(), turn.clone());
        state.heads.insert(
            request.context_id.clone(),
            StoredTurnRef {
                context_id: request.context_id,
                turn_id: turn.turn_id.clone(),
                depth,
            },
        );
        Ok(turn)
    }

    async fn get_head(&self, context_id: &ContextId) -> TurnStoreResult<StoredTurnRef> {
        Ok(self.state()?.head(context_id)?.clone())
    }

    async fn list_turns(
        &self,
        context_id: &ContextId,
        before_turn_id: Option<&TurnId>,
        limit: usize,
    ) -> TurnStoreResult<Vec<StoredTurn>> {
        let state = self.state()?;
        let head = state.head(context_id)?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        let from = match before_turn_id {
            None => head.turn_id.clone(),
            Some(before) if before == ROOT_TURN_ID => return Ok(Vec::new()),
            Some(before) => {
                state.require_reachable(head, before)?;
                state
                    .turns
                    .get(before)
                    .map(|turn| turn.parent_turn_id.clone())
                    .ok_or_else(|| not_found("turn", before))?
            }
        };
        state.collect_chain(&from, None, limit)
    }

    async fn read_turns_since(
        &self,
        context_id: &ContextId,
        cursor: Option<&TurnId>,
    ) -> TurnStoreResult<Vec<StoredTurn>> {
        let state = self.state()?;
        let head = state.head(context_id)?;
        if let Some(cursor) = cursor {
            state.require_reachable(head, cursor)?;
        }
        state.collect_chain(&head.turn_id, cursor.map(String::as_str), usize::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(context_id: &str, payload: &[u8], key: &str) -> AppendTurnRequest {
        AppendTurnRequest {
            context_id: context_id.to_string(),
            parent_turn_id: None,
            type_id: "conduit.engine.stage_event".to_string(),
            type_version: 1,
            payload: payload.to_vec(),
            idempotency_key: key.to_string(),
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn append_turn_same_key_in_other_context_expected_new_turn() {
        let store = MemoryTurnStore::new();
        let left = store.create_context(None).await.expect("context should be created");
        let right = store.create_context(None).await.expect("context should be created");

        let first = store
            .append_turn(request(&left.context_id, b"a", "k1"))
            .await
            .expect("append should succeed");
        let second = store
            .append_turn(request(&right.context_id, b"a", "k1"))
            .await
            .expect("append should succeed");

        assert_ne!(first.turn_id, second.turn_id);
        assert_eq!(second.depth, 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn read_turns_since_cursor_expected_only_newer_turns() {
        let store = MemoryTurnStore::new();
        let context = store.create_context(None).await.expect("context should be created");
        let mut appended = Vec::new();
        for (payload, key) in [(b"one", "k1"), (b"two", "k2"), (b"333", "k3")] {
            appended.push(
                store
                    .append_turn(request(&context.context_id, payload, key))
                    .await
                    .expect("append should succeed"),
            );
        }

        let all = store
            .read_turns_since(&context.context_id, None)
            .await
            .expect("read should succeed");
        assert_eq!(all, appended);

        let newer = store
            .read_turns_since(&context.context_id, Some(&appended[0].turn_id))
            .await
            .expect("read should succeed");
        assert_eq!(newer, appended[1..].to_vec());

        let none = store
            .read_turns_since(&context.context_id, Some(&appended[2].turn_id))
            .await
            .expect("read should succeed");
        assert!(none.is_empty());
    }

    #[tokio::test(flavor = "current_thread")]
    async fn create_context_from_base_turn_expected_shared_history() {
        let store = MemoryTurnStore::new();
        let origin = store.create_context(None).await.expect("context should be created");
        let base = store
            .append_turn(request(&origin.context_id, b"base", ""))
            .await
            .expect("append should succeed");

        let fork = store
            .create_context(Some(base.turn_id.clone()))
            .await
            .expect("fork should be created");
        assert_eq!(fork.head_depth, 1);

        store
            .append_turn(request(&fork.context_id, b"fork", ""))
            .await
            .expect("append should succeed");
        let turns = store
            .read_turns_since(&fork.context_id, None)
            .await
            .expect("read should succeed");
        let payloads: Vec<_> = turns.iter().map(|turn| turn.payload.clone()).collect();
        assert_eq!(payloads, vec![b"base".to_vec(), b"fork".to_vec()]);

        let origin_turns = store
            .read_turns_since(&origin.context_id, None)
            .await
            .expect("read should succeed");
        assert_eq!(origin_turns.len(), 1);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn read_turns_since_unknown_context_expected_not_found() {
        let store = MemoryTurnStore::new();
        let error = store
            .read_turns_since(&"missing".to_string(), None)
            .await
            .expect_err("unknown context should fail");
        assert!(matches!(
            error,
            TurnStoreError::NotFound {
                resource: "context",
                ..
            }
        ));
    }
}
