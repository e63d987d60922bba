use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use super::ids::ConversationId;

/// Speaker role of a persisted chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

/// One chat message. `id` is positional: it equals the message index in its conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: usize,
    pub role: MessageRole,
    pub content: String,
}

impl Message {
    pub fn new(id: usize, role: MessageRole, content: impl Into<String>) -> Self {
        Self {
            id,
            role,
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub name: String,
    pub messages: Vec<Message>,
    /// Milliseconds since the unix epoch of the last store.
    pub last_message: u64,
}

impl Conversation {
    pub fn new(name: impl Into<String>, messages: Vec<Message>, last_message: u64) -> Self {
        Self {
            name: name.into(),
            messages,
            last_message,
        }
    }

    /// Snapshot stamped with the current time.
    pub fn stamped_now(name: impl Into<String>, messages: Vec<Message>) -> Self {
        Self::new(name, messages, unix_timestamp_millis())
    }

    pub fn apply_patch(&mut self, patch: ConversationPatch) {
        if let Some(name) = patch.name {
            self.name = name;
        }
    }
}

/// Partial update merged into an existing conversation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConversationPatch {
    pub name: Option<String>,
}

impl ConversationPatch {
    pub fn rename(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
        }
    }
}

/// Every persisted conversation keyed by id. Carries no ordering.
pub type History = HashMap<ConversationId, Conversation>;

/// Display order for a history: most recent first, ties broken by id.
pub fn sorted_by_recent(history: &History) -> Vec<(ConversationId, &Conversation)> {
    let mut entries = history
        .iter()
        .map(|(id, conversation)| (*id, conversation))
        .collect::<Vec<_>>();
    entries.sort_by(|(left_id, left), (right_id, right)| {
        right
            .last_message
            .cmp(&left.last_message)
            .then_with(|| right_id.cmp(left_id))
    });
    entries
}

pub fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| duration.as_millis() as u64)
}
