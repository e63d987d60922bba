pub mod backend;
pub mod error;
pub mod history;
pub mod ids;
pub mod sqlite;
pub mod types;

pub use backend::{FileBackend, KeyValueBackend, MemoryBackend};
pub use error::{StorageError, StorageResult};
pub use history::{ConversationStore, HISTORY_KEY};
pub use ids::ConversationId;
pub use sqlite::SqliteBackend;
pub use types::{
    Conversation, ConversationPatch, History, Message, MessageRole, sorted_by_recent,
    unix_timestamp_millis,
};
