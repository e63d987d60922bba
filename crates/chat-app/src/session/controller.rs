use std::iter;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use hearth_llm::{
    CallCanceller, CallEvent, CallReply, ModelConfig, OperationOutcome, ProgressUpdate,
    PromptMessage, RemoteEngine, Role,
};
use hearth_storage::{
    Conversation, ConversationId, ConversationPatch, ConversationStore, History, Message,
    MessageRole,
};
use serde_json::Value;
use tokio::sync::watch;

use super::snapshot::{AddMessageOption, SessionSnapshot};
use crate::analytics::{self, AnalyticsSink, INIT_FINISH_EVENT, INIT_START_EVENT};
use crate::settings::DEFAULT_SYSTEM_MESSAGE;

/// Minimum spacing between stores of a streaming reply.
const TOKEN_PERSIST_INTERVAL: Duration = Duration::from_millis(250);

struct InFlight {
    epoch: u64,
    /// Follows the assistant placeholder through renumbering; `None` once it was removed.
    placeholder_id: Option<usize>,
    canceller: Option<CallCanceller>,
    stop_requested: bool,
    persisted_at: Option<Instant>,
    /// Tokens applied since the last store.
    unsaved_tokens: bool,
}

struct SessionState {
    messages: Vec<Message>,
    conversation_id: Option<ConversationId>,
    conversation_name: String,
    conversations: History,
    is_engine_ready: bool,
    error: Option<String>,
    /// Bumped whenever the active session is replaced or cleared.
    epoch: u64,
    in_flight: Option<InFlight>,
}

impl SessionState {
    fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            messages: self.messages.clone(),
            conversation_id: self.conversation_id,
            conversation_name: self.conversation_name.clone(),
            conversations: self.conversations.clone(),
            is_engine_ready: self.is_engine_ready,
            loading: self.in_flight.is_some(),
            error: self.error.clone(),
        }
    }

    fn message_mut(&mut self, id: usize) -> Option<&mut Message> {
        self.messages.iter_mut().find(|message| message.id == id)
    }

    fn current_in_flight(&mut self, epoch: u64) -> Option<&mut InFlight> {
        self.in_flight
            .as_mut()
            .filter(|in_flight| in_flight.epoch == epoch)
    }

    /// Drops the active session. A generation still running for it is cancelled and its
    /// remaining events are ignored.
    fn reset(&mut self) {
        if let Some(in_flight) = self.in_flight.take()
            && let Some(canceller) = in_flight.canceller
        {
            canceller.cancel();
        }
        self.epoch += 1;
        self.messages.clear();
        self.conversation_id = None;
        self.conversation_name.clear();
    }
}

struct SubmitPlan {
    epoch: u64,
    prompt: Vec<PromptMessage>,
    rag_result: Vec<String>,
}

/// Owns the active conversation and drives the engine through the bridge.
///
/// Every accepted change is published as a full [`SessionSnapshot`] on a watch channel and,
/// when it touches the message sequence, written to the [`ConversationStore`] before the
/// call returns. Streamed tokens are stored at most once per `TOKEN_PERSIST_INTERVAL`, and
/// the final reply always is. Storage failures are logged and never surface to the caller.
pub struct SessionController {
    engine: Arc<RemoteEngine>,
    store: ConversationStore,
    analytics: Arc<dyn AnalyticsSink>,
    state: Mutex<SessionState>,
    snapshots: watch::Sender<SessionSnapshot>,
}

impl SessionController {
    pub fn new(
        engine: Arc<RemoteEngine>,
        store: ConversationStore,
        analytics: Arc<dyn AnalyticsSink>,
    ) -> Self {
        let state = SessionState {
            messages: Vec::new(),
            conversation_id: None,
            conversation_name: String::new(),
            conversations: store.get_history(),
            is_engine_ready: false,
            error: None,
            epoch: 0,
            in_flight: None,
        };
        let (snapshots, _) = watch::channel(state.snapshot());

        Self {
            engine,
            store,
            analytics,
            state: Mutex::new(state),
            snapshots,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn engine(&self) -> &Arc<RemoteEngine> {
        &self.engine
    }

    pub async fn init_local_llm<F>(
        &self,
        model_id: &str,
        model_url: &str,
        wasm_url: &str,
        on_progress: F,
    ) -> OperationOutcome
    where
        F: FnMut(ProgressUpdate) + Send,
    {
        let mut params = analytics::model_params(model_url, model_id);
        analytics::emit(&self.analytics, INIT_START_EVENT, params.clone());

        let config = ModelConfig::new(model_id, model_url, wasm_url);
        let outcome = match self.engine.init(config, on_progress).await {
            Ok(outcome) => outcome,
            Err(error) => {
                tracing::error!(model_id, error = %error, "engine init did not reach the worker");
                OperationOutcome::failed(error.to_string())
            }
        };

        self.mutate(|state| {
            state.is_engine_ready = outcome.success;
            state.error = outcome.message.clone().filter(|_| !outcome.success);
        });

        params.insert("success".to_string(), Value::from(outcome.success));
        analytics::emit(&self.analytics, INIT_FINISH_EVENT, params);
        outcome
    }

    pub async fn unload_local_llm(&self) -> OperationOutcome {
        let outcome = match self.engine.unload().await {
            Ok(outcome) => outcome,
            Err(error) => OperationOutcome::failed(error.to_string()),
        };

        if outcome.success {
            self.mutate(|state| state.is_engine_ready = false);
        } else {
            tracing::warn!(message = ?outcome.message, "engine unload failed");
        }
        outcome
    }

    /// Appends a message and, if `is_submit`, generates a reply to it.
    ///
    /// Returns `false` when a submit was requested while another one is in flight; the
    /// whole action is dropped in that case.
    pub async fn add_message(&self, option: AddMessageOption) -> bool {
        let AddMessageOption {
            content,
            system_message_content,
            rag_result,
            role,
            is_submit,
        } = option;

        let plan = {
            let mut state = self.lock();
            if is_submit && state.in_flight.is_some() {
                tracing::debug!("submit already in flight; dropping new message");
                return false;
            }

            let message = Message::new(state.messages.len(), role, content);
            state.messages.push(message.clone());
            let plan = is_submit.then(|| {
                Self::begin_submit(&mut state, &system_message_content, &message, rag_result)
            });
            self.persist(&mut state);
            self.publish(&state);
            plan
        };

        if let Some(plan) = plan {
            self.run_generation(plan).await;
        }
        true
    }

    /// Generates a reply to `new_message` with the current sequence as history.
    pub async fn submit(
        &self,
        system_message_content: &str,
        new_message: Message,
        rag_result: Vec<String>,
    ) -> bool {
        let plan = {
            let mut state = self.lock();
            if state.in_flight.is_some() {
                tracing::debug!("submit already in flight");
                return false;
            }

            let plan =
                Self::begin_submit(&mut state, system_message_content, &new_message, rag_result);
            self.persist(&mut state);
            self.publish(&state);
            plan
        };

        self.run_generation(plan).await;
        true
    }

    /// Cancels the in-flight generation. The reply keeps what was generated so far.
    pub fn stop(&self) -> bool {
        let mut state = self.lock();
        let Some(in_flight) = state.in_flight.as_mut() else {
            return false;
        };

        in_flight.stop_requested = true;
        if let Some(canceller) = &in_flight.canceller {
            canceller.cancel();
        }
        true
    }

    pub fn remove_message(&self, id: usize) -> bool {
        let mut state = self.lock();
        let Some(index) = state.messages.iter().position(|message| message.id == id) else {
            return false;
        };

        state.messages.remove(index);
        for (position, message) in state.messages.iter_mut().enumerate() {
            message.id = position;
        }
        if let Some(in_flight) = state.in_flight.as_mut() {
            in_flight.placeholder_id = match in_flight.placeholder_id {
                Some(placeholder) if placeholder == id => None,
                Some(placeholder) if placeholder > id => Some(placeholder - 1),
                other => other,
            };
        }

        self.persist(&mut state);
        self.publish(&state);
        true
    }

    /// Swaps user and assistant. System messages keep their role.
    pub fn toggle_message_role(&self, id: usize) -> bool {
        let mut state = self.lock();
        let Some(message) = state.message_mut(id) else {
            return false;
        };

        message.role = match message.role {
            MessageRole::User => MessageRole::Assistant,
            MessageRole::Assistant => MessageRole::User,
            MessageRole::System => return false,
        };

        self.persist(&mut state);
        self.publish(&state);
        true
    }

    pub fn update_message_content(&self, id: usize, content: impl Into<String>) -> bool {
        let mut state = self.lock();
        let Some(message) = state.message_mut(id) else {
            return false;
        };
        message.content = content.into();

        self.persist(&mut state);
        self.publish(&state);
        true
    }

    /// Replaces the active session with `conversation` and stores it again, which moves it
    /// to the top of the recent-first history.
    pub fn load_conversation(&self, id: ConversationId, conversation: Conversation) {
        self.mutate(|state| {
            self.flush_unsaved_tokens(state);
            state.reset();
            state.conversation_id = Some(id);
            state.messages = conversation.messages;
            state.conversation_name = conversation.name;
            self.persist(state);
        });
        tracing::debug!(conversation_id = %id, "conversation loaded");
    }

    /// Loads a conversation from the cached history.
    pub fn open_conversation(&self, id: ConversationId) -> bool {
        let conversation = self.lock().conversations.get(&id).cloned();
        match conversation {
            Some(conversation) => {
                self.load_conversation(id, conversation);
                true
            }
            None => false,
        }
    }

    pub fn clear_conversation(&self) {
        self.mutate(|state| {
            self.flush_unsaved_tokens(state);
            state.reset();
        });
    }

    pub fn clear_conversations(&self) {
        if let Err(error) = self.store.clear_history() {
            tracing::error!(error = %error, "failed to clear conversation history");
        }

        self.mutate(|state| {
            state.reset();
            state.conversations.clear();
        });
    }

    pub fn delete_conversation(&self, id: ConversationId) {
        if let Err(error) = self.store.delete_conversation_from_history(id) {
            tracing::error!(conversation_id = %id, error = %error, "failed to delete conversation");
        }

        self.mutate(|state| {
            state.conversations.remove(&id);
            if state.conversation_id == Some(id) {
                state.reset();
            }
        });
    }

    pub fn update_conversation_name(&self, id: ConversationId, name: impl Into<String>) {
        let name = name.into();
        self.mutate(|state| {
            if let Some(conversation) = state.conversations.get_mut(&id) {
                conversation.name = name.clone();
            }
            if state.conversation_id == Some(id) {
                state.conversation_name = name.clone();
            }
        });

        if let Err(error) = self
            .store
            .update_conversation(id, ConversationPatch::rename(name))
        {
            tracing::error!(conversation_id = %id, error = %error, "failed to rename conversation");
        }
    }

    fn begin_submit(
        state: &mut SessionState,
        system_message_content: &str,
        new_message: &Message,
        rag_result: Vec<String>,
    ) -> SubmitPlan {
        let system_content = if system_message_content.trim().is_empty() {
            DEFAULT_SYSTEM_MESSAGE
        } else {
            system_message_content
        };

        let prior = state
            .messages
            .iter()
            .filter(|message| message.id != new_message.id)
            .map(to_prompt_message);
        let prompt = iter::once(PromptMessage::system(system_content))
            .chain(prior)
            .chain(iter::once(to_prompt_message(new_message)))
            .collect();

        let placeholder_id = state.messages.len();
        state
            .messages
            .push(Message::new(placeholder_id, MessageRole::Assistant, ""));
        state.in_flight = Some(InFlight {
            epoch: state.epoch,
            placeholder_id: Some(placeholder_id),
            canceller: None,
            stop_requested: false,
            persisted_at: None,
            unsaved_tokens: false,
        });

        SubmitPlan {
            epoch: state.epoch,
            prompt,
            rag_result,
        }
    }

    async fn run_generation(&self, plan: SubmitPlan) {
        let SubmitPlan {
            epoch,
            prompt,
            rag_result,
        } = plan;

        let mut stream = match self.engine.start_completion(prompt, rag_result) {
            Ok(stream) => stream,
            Err(error) => {
                self.finish_generation(epoch, Err(error.to_string()));
                return;
            }
        };
        self.attach_canceller(epoch, stream.canceller());
        let mut guard = GenerationGuard {
            controller: self,
            epoch,
            armed: true,
        };

        loop {
            let result = match stream.next().await {
                Ok(CallEvent::Token { text, .. }) => {
                    self.apply_token(epoch, text);
                    continue;
                }
                Ok(CallEvent::Progress(_)) => continue,
                Ok(CallEvent::Resolved(CallReply::Completion(reply))) => Ok(reply),
                Ok(CallEvent::Rejected(message)) => Err(message),
                Ok(CallEvent::Resolved(CallReply::Outcome(_))) => {
                    Err("engine answered a completion with a lifecycle outcome".to_string())
                }
                Err(error) => Err(error.to_string()),
            };
            guard.armed = false;
            self.finish_generation(epoch, result);
            return;
        }
    }

    fn attach_canceller(&self, epoch: u64, canceller: CallCanceller) {
        let mut state = self.lock();
        let Some(in_flight) = state.current_in_flight(epoch) else {
            // The session moved on before the call was registered.
            canceller.cancel();
            return;
        };

        if in_flight.stop_requested {
            canceller.cancel();
        }
        in_flight.canceller = Some(canceller);
    }

    fn apply_token(&self, epoch: u64, text: String) {
        let mut state = self.lock();
        let Some(in_flight) = state.current_in_flight(epoch) else {
            return;
        };
        let Some(placeholder_id) = in_flight.placeholder_id else {
            return;
        };
        let persist_due = in_flight
            .persisted_at
            .is_none_or(|at| at.elapsed() >= TOKEN_PERSIST_INTERVAL);
        let Some(message) = state.message_mut(placeholder_id) else {
            return;
        };

        message.content = text;
        if persist_due {
            self.persist(&mut state);
        } else if let Some(in_flight) = state.in_flight.as_mut() {
            in_flight.unsaved_tokens = true;
        }
        self.publish(&state);
    }

    /// Releases the session when the future driving a generation is dropped early.
    fn abandon_generation(&self, epoch: u64) {
        {
            let mut state = self.lock();
            let Some(in_flight) = state.current_in_flight(epoch) else {
                return;
            };
            in_flight.stop_requested = true;
            if let Some(canceller) = &in_flight.canceller {
                canceller.cancel();
            }
        }
        tracing::debug!("generation abandoned by its caller");
        self.finish_generation(epoch, Err("generation was abandoned".to_string()));
    }

    fn finish_generation(&self, epoch: u64, result: Result<String, String>) {
        let mut state = self.lock();
        if state.current_in_flight(epoch).is_none() {
            return;
        }
        let Some(in_flight) = state.in_flight.take() else {
            return;
        };

        let content = match result {
            Ok(reply) => Some(reply),
            Err(message) if in_flight.stop_requested => {
                tracing::debug!(reason = %message, "generation stopped; keeping partial reply");
                None
            }
            Err(message) => {
                tracing::warn!(error = %message, "generation failed");
                Some(message)
            }
        };

        let mut changed = in_flight.unsaved_tokens;
        if let (Some(content), Some(placeholder_id)) = (content, in_flight.placeholder_id)
            && let Some(message) = state.message_mut(placeholder_id)
        {
            message.content = content;
            changed = true;
        }
        if changed {
            self.persist(&mut state);
        }
        self.publish(&state);
    }

    fn flush_unsaved_tokens(&self, state: &mut SessionState) {
        if state
            .in_flight
            .as_ref()
            .is_some_and(|in_flight| in_flight.unsaved_tokens)
        {
            self.persist(state);
        }
    }

    /// Stores the active conversation and adopts the id it was stored under.
    fn persist(&self, state: &mut SessionState) {
        if state.messages.is_empty() {
            return;
        }
        if let Some(in_flight) = state.in_flight.as_mut() {
            in_flight.persisted_at = Some(Instant::now());
            in_flight.unsaved_tokens = false;
        }

        let conversation =
            Conversation::stamped_now(state.conversation_name.clone(), state.messages.clone());
        match self
            .store
            .store_conversation(state.conversation_id, conversation.clone())
        {
            Ok(id) => {
                if state.conversation_id != Some(id) {
                    tracing::debug!(conversation_id = %id, "conversation created");
                }
                state.conversation_id = Some(id);
                state.conversations.insert(id, conversation);
            }
            Err(error) => {
                tracing::error!(error = %error, "failed to store conversation");
            }
        }
    }

    fn publish(&self, state: &SessionState) {
        self.snapshots.send_replace(state.snapshot());
    }

    fn mutate<R>(&self, apply: impl FnOnce(&mut SessionState) -> R) -> R {
        let mut state = self.lock();
        let result = apply(&mut state);
        self.publish(&state);
        result
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        match self.state.lock() {
            Ok(state) => state,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

struct GenerationGuard<'a> {
    controller: &'a SessionController,
    epoch: u64,
    armed: bool,
}

impl Drop for GenerationGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.controller.abandon_generation(self.epoch);
        }
    }
}

fn to_prompt_message(message: &Message) -> PromptMessage {
    let role = match message.role {
        MessageRole::System => Role::System,
        MessageRole::User => Role::User,
        MessageRole::Assistant => Role::Assistant,
    };
    PromptMessage::new(role, message.content.clone())
}
