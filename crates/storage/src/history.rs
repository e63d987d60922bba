use std::sync::Arc;

use snafu::ResultExt;

use super::backend::KeyValueBackend;
use super::error::{SerializeValueSnafu, StorageResult};
use super::ids::ConversationId;
use super::types::{Conversation, ConversationPatch, History};

/// Namespaced key holding the serialized history.
pub const HISTORY_KEY: &str = "hearth.history";

/// Persisted mapping from conversation id to conversation.
///
/// The whole history lives under one key: every operation reads it, changes it in memory
/// and writes it back with a single backend write. Corrupt data counts as an empty
/// history; a failing backend read aborts a mutation before anything is written.
#[derive(Clone)]
pub struct ConversationStore {
    backend: Arc<dyn KeyValueBackend>,
}

impl ConversationStore {
    pub fn new(backend: Arc<dyn KeyValueBackend>) -> Self {
        Self { backend }
    }

    pub fn get_history(&self) -> History {
        match self.read_history() {
            Ok(history) => history,
            Err(error) => {
                tracing::warn!(key = HISTORY_KEY, error = %error, "failed to read history; using empty history");
                History::new()
            }
        }
    }

    /// Inserts or overwrites a conversation and returns the id it was stored under.
    ///
    /// A missing or unknown id mints a fresh one.
    pub fn store_conversation(
        &self,
        id: Option<ConversationId>,
        conversation: Conversation,
    ) -> StorageResult<ConversationId> {
        let mut history = self.read_history()?;
        let effective_id = match id {
            Some(id) if history.contains_key(&id) => id,
            _ => ConversationId::new_v7(),
        };

        history.insert(effective_id, conversation);
        self.write_history(&history)?;
        Ok(effective_id)
    }

    pub fn update_conversation(
        &self,
        id: ConversationId,
        patch: ConversationPatch,
    ) -> StorageResult<()> {
        let mut history = self.read_history()?;
        let Some(conversation) = history.get_mut(&id) else {
            return Ok(());
        };

        conversation.apply_patch(patch);
        self.write_history(&history)
    }

    pub fn delete_conversation_from_history(&self, id: ConversationId) -> StorageResult<()> {
        let mut history = self.read_history()?;
        if history.remove(&id).is_none() {
            return Ok(());
        }

        self.write_history(&history)
    }

    pub fn clear_history(&self) -> StorageResult<()> {
        self.backend.remove(HISTORY_KEY)
    }

    // Missing key and corrupt JSON read as empty. Backend errors propagate.
    fn read_history(&self) -> StorageResult<History> {
        let Some(raw) = self.backend.read(HISTORY_KEY)? else {
            return Ok(History::new());
        };

        match serde_json::from_str::<History>(&raw) {
            Ok(history) => Ok(history),
            Err(error) => {
                tracing::warn!(key = HISTORY_KEY, error = %error, "stored history is corrupt; using empty history");
                Ok(History::new())
            }
        }
    }

    fn write_history(&self, history: &History) -> StorageResult<()> {
        let serialized = serde_json::to_string(history).context(SerializeValueSnafu {
            stage: "serialize-history",
            key: HISTORY_KEY,
        })?;
        self.backend.write(HISTORY_KEY, &serialized)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::backend::{FileBackend, MemoryBackend};
    use crate::error::{ReadFileSnafu, StorageError};
    use crate::types::{Message, MessageRole};

    /// Memory backend whose reads can be switched to fail.
    #[derive(Default)]
    struct FlakyBackend {
        inner: MemoryBackend,
        fail_reads: AtomicBool,
    }

    impl KeyValueBackend for FlakyBackend {
        fn read(&self, key: &str) -> StorageResult<Option<String>> {
            if self.fail_reads.load(Ordering::SeqCst) {
                return Err(std::io::Error::other("disk unavailable")).context(ReadFileSnafu {
                    stage: "flaky-read",
                    path: key.to_string(),
                });
            }
            self.inner.read(key)
        }

        fn write(&self, key: &str, value: &str) -> StorageResult<()> {
            self.inner.write(key, value)
        }

        fn remove(&self, key: &str) -> StorageResult<()> {
            self.inner.remove(key)
        }
    }

    fn store() -> (Arc<MemoryBackend>, ConversationStore) {
        let backend = Arc::new(MemoryBackend::new());
        let store = ConversationStore::new(backend.clone());
        (backend, store)
    }

    fn conversation(name: &str) -> Conversation {
        Conversation::new(
            name,
            vec![
                Message::new(0, MessageRole::User, "hello"),
                Message::new(1, MessageRole::Assistant, "hi there"),
            ],
            1_000,
        )
    }

    #[test]
    fn missing_history_is_empty() {
        let (_, store) = store();
        assert!(store.get_history().is_empty());
    }

    #[test]
    fn corrupt_history_is_empty() {
        let (backend, store) = store();
        backend.write(HISTORY_KEY, "{not json").expect("write");
        assert!(store.get_history().is_empty());
    }

    #[test]
    fn store_without_id_mints_one_and_reuses_it() {
        let (_, store) = store();

        let id = store
            .store_conversation(None, conversation("first"))
            .expect("store");
        let same = store
            .store_conversation(Some(id), conversation("second"))
            .expect("overwrite");

        assert_eq!(id, same);
        let history = store.get_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[&id].name, "second");
        assert_eq!(history[&id].messages, conversation("x").messages);
    }

    #[test]
    fn store_with_unknown_id_mints_new_id() {
        let (_, store) = store();
        let unknown = ConversationId::new_v7();

        let id = store
            .store_conversation(Some(unknown), conversation("c"))
            .expect("store");

        assert_ne!(id, unknown);
        assert!(store.get_history().contains_key(&id));
    }

    #[test]
    fn update_merges_name_and_ignores_unknown_ids() {
        let (_, store) = store();
        let id = store
            .store_conversation(None, conversation("old"))
            .expect("store");

        store
            .update_conversation(id, ConversationPatch::rename("new"))
            .expect("update");
        store
            .update_conversation(ConversationId::new_v7(), ConversationPatch::rename("ghost"))
            .expect("unknown id is a no-op");

        let history = store.get_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[&id].name, "new");
        assert_eq!(history[&id].last_message, 1_000);
    }

    #[test]
    fn delete_removes_only_the_target() {
        let (_, store) = store();
        let keep = store
            .store_conversation(None, conversation("keep"))
            .expect("store");
        let dropped = store
            .store_conversation(None, conversation("drop"))
            .expect("store");

        store.delete_conversation_from_history(dropped).expect("delete");
        store
            .delete_conversation_from_history(dropped)
            .expect("second delete is a no-op");

        let history = store.get_history();
        assert!(!history.contains_key(&dropped));
        assert!(history.contains_key(&keep));
    }

    #[test]
    fn clear_history_empties_everything() {
        let (_, store) = store();
        store
            .store_conversation(None, conversation("a"))
            .expect("store");
        store
            .store_conversation(None, conversation("b"))
            .expect("store");

        store.clear_history().expect("clear");
        assert!(store.get_history().is_empty());
    }

    #[test]
    fn history_survives_a_new_store_over_the_same_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let id = ConversationStore::new(Arc::new(FileBackend::new(dir.path())))
            .store_conversation(None, conversation("persisted"))
            .expect("store");

        let reopened = ConversationStore::new(Arc::new(FileBackend::new(dir.path())));
        assert_eq!(reopened.get_history()[&id], conversation("persisted"));
    }

    #[test]
    fn failing_reads_abort_mutations_without_touching_history() {
        let backend = Arc::new(FlakyBackend::default());
        let store = ConversationStore::new(backend.clone());
        let first = store
            .store_conversation(None, conversation("a"))
            .expect("store a");
        let second = store
            .store_conversation(None, conversation("b"))
            .expect("store b");
        let before = backend.inner.read(HISTORY_KEY).expect("read").expect("present");

        backend.fail_reads.store(true, Ordering::SeqCst);
        let stored = store.store_conversation(Some(first), conversation("a2"));
        let updated = store.update_conversation(second, ConversationPatch::rename("b2"));
        let deleted = store.delete_conversation_from_history(first);

        assert!(matches!(stored, Err(StorageError::ReadFile { .. })));
        assert!(matches!(updated, Err(StorageError::ReadFile { .. })));
        assert!(matches!(deleted, Err(StorageError::ReadFile { .. })));
        assert!(store.get_history().is_empty(), "reads still fail");

        backend.fail_reads.store(false, Ordering::SeqCst);
        let after = backend.inner.read(HISTORY_KEY).expect("read").expect("present");
        assert_eq!(before, after);
        let history = store.get_history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[&first].name, "a");
        assert_eq!(history[&second].name, "b");
    }
}
