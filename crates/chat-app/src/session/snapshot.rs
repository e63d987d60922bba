use hearth_storage::{Conversation, ConversationId, History, Message, MessageRole, sorted_by_recent};

/// Everything a presentation layer needs to render the session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SessionSnapshot {
    pub messages: Vec<Message>,
    pub conversation_id: Option<ConversationId>,
    pub conversation_name: String,
    pub conversations: History,
    pub is_engine_ready: bool,
    /// A submit is in flight.
    pub loading: bool,
    pub error: Option<String>,
}

impl SessionSnapshot {
    pub fn recent_conversations(&self) -> Vec<(ConversationId, &Conversation)> {
        sorted_by_recent(&self.conversations)
    }

    pub fn last_assistant_message(&self) -> Option<&Message> {
        self.messages
            .iter()
            .rev()
            .find(|message| message.role == MessageRole::Assistant)
    }
}

/// Arguments of [`super::SessionController::add_message`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddMessageOption {
    pub content: String,
    pub system_message_content: String,
    pub rag_result: Vec<String>,
    pub role: MessageRole,
    pub is_submit: bool,
}

impl AddMessageOption {
    /// A user message that is submitted right away.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            system_message_content: String::new(),
            rag_result: Vec::new(),
            role: MessageRole::User,
            is_submit: true,
        }
    }

    pub fn with_system_message(mut self, content: impl Into<String>) -> Self {
        self.system_message_content = content.into();
        self
    }

    pub fn with_rag_result(mut self, rag_result: Vec<String>) -> Self {
        self.rag_result = rag_result;
        self
    }

    pub fn with_role(mut self, role: MessageRole) -> Self {
        self.role = role;
        self
    }

    pub fn without_submit(mut self) -> Self {
        self.is_submit = false;
        self
    }
}
