use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use hearth_llm::{EngineError, RemoteEngine, create_engine_factory};
use hearth_storage::{
    ConversationId, ConversationStore, FileBackend, KeyValueBackend, MemoryBackend, MessageRole,
    SqliteBackend, StorageError,
};
use snafu::{ResultExt, Snafu};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;

use crate::analytics::TracingAnalytics;
use crate::session::{AddMessageOption, SessionController, SessionSnapshot};
use crate::settings::{Settings, SettingsStore, StorageBackendKind};

pub const HELP_TEXT: &str = "\
commands:
  <text>              send a message
  /new                start a new conversation
  /list               list stored conversations, most recent first
  /load <n|id>        open a conversation from /list
  /rename <name>      rename the active conversation
  /delete [n|id]      delete a conversation (the active one by default)
  /clear              delete every stored conversation
  /rm <id>            remove a message
  /role <id>          swap a message between user and assistant
  /edit <id> <text>   replace a message's content
  /system [text]      show or save the system message
  /stop               stop the reply being generated
  /unload             release the model
  /init               load the configured model
  /help               show this text
  /quit               exit";

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("failed to read input on `{stage}`: {source}"))]
    ReadInput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to write output on `{stage}`: {source}"))]
    WriteOutput {
        stage: &'static str,
        source: std::io::Error,
    },
    #[snafu(display("failed to open {backend} storage on `{stage}`: {source}"))]
    OpenStorage {
        stage: &'static str,
        backend: StorageBackendKind,
        source: StorageError,
    },
    #[snafu(display("failed to set up engine on `{stage}`: {source}"))]
    EngineSetup {
        stage: &'static str,
        source: EngineError,
    },
}

/// Selects a conversation either by its position in `/list` (1-based) or by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationRef {
    Position(usize),
    Id(ConversationId),
}

impl ConversationRef {
    fn parse(raw: &str) -> Option<Self> {
        let raw = raw.trim();
        if let Ok(position) = raw.parse::<usize>() {
            return (position > 0).then_some(Self::Position(position));
        }
        ConversationId::parse(raw).ok().map(Self::Id)
    }

    fn resolve(&self, snapshot: &SessionSnapshot) -> Option<ConversationId> {
        match self {
            Self::Id(id) => snapshot.conversations.contains_key(id).then_some(*id),
            Self::Position(position) => snapshot
                .recent_conversations()
                .get(position - 1)
                .map(|(id, _)| *id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Say(String),
    New,
    List,
    Load(ConversationRef),
    Rename(String),
    Delete(Option<ConversationRef>),
    ClearAll,
    Remove(usize),
    ToggleRole(usize),
    Edit(usize, String),
    System(Option<String>),
    Stop,
    Unload,
    Init,
    Help,
    Quit,
}

impl Command {
    /// Parses one input line. `Err` carries a usage hint for the user.
    pub fn parse(line: &str) -> Result<Option<Self>, String> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(None);
        }
        let Some(rest) = line.strip_prefix('/') else {
            return Ok(Some(Self::Say(line.to_string())));
        };

        let (name, argument) = match rest.split_once(char::is_whitespace) {
            Some((name, argument)) => (name, argument.trim()),
            None => (rest, ""),
        };

        let command = match name {
            "new" => Self::New,
            "list" => Self::List,
            "load" => Self::Load(parse_conversation_ref(argument, "/load <n|id>")?),
            "rename" if !argument.is_empty() => Self::Rename(argument.to_string()),
            "rename" => return Err("usage: /rename <name>".to_string()),
            "delete" if argument.is_empty() => Self::Delete(None),
            "delete" => Self::Delete(Some(parse_conversation_ref(argument, "/delete [n|id]")?)),
            "clear" => Self::ClearAll,
            "rm" => Self::Remove(parse_message_id(argument, "/rm <id>")?),
            "role" => Self::ToggleRole(parse_message_id(argument, "/role <id>")?),
            "edit" => {
                let (id, content) = argument
                    .split_once(char::is_whitespace)
                    .ok_or_else(|| "usage: /edit <id> <text>".to_string())?;
                Self::Edit(
                    parse_message_id(id, "/edit <id> <text>")?,
                    content.trim().to_string(),
                )
            }
            "system" if argument.is_empty() => Self::System(None),
            "system" => Self::System(Some(argument.to_string())),
            "stop" => Self::Stop,
            "unload" => Self::Unload,
            "init" => Self::Init,
            "help" => Self::Help,
            "quit" | "exit" => Self::Quit,
            other => return Err(format!("unknown command '/{other}', try /help")),
        };
        Ok(Some(command))
    }
}

fn parse_conversation_ref(raw: &str, usage: &str) -> Result<ConversationRef, String> {
    ConversationRef::parse(raw).ok_or_else(|| format!("usage: {usage}"))
}

fn parse_message_id(raw: &str, usage: &str) -> Result<usize, String> {
    raw.trim().parse().map_err(|_| format!("usage: {usage}"))
}

/// Turns successive snapshots into terminal output for the reply being streamed.
#[derive(Debug, Default)]
pub struct StreamRenderer {
    printed: Option<String>,
}

impl StreamRenderer {
    /// The next finished reply is printed even if no streaming snapshot was observed.
    pub fn expect_reply(&mut self) {
        self.printed = Some(String::new());
    }

    pub fn render(&mut self, snapshot: &SessionSnapshot) -> Option<String> {
        let reply = snapshot
            .last_assistant_message()
            .map(|message| message.content.as_str())
            .unwrap_or_default();

        if snapshot.loading {
            let printed = self.printed.get_or_insert_with(String::new);
            let mut output = String::new();
            if printed.is_empty() && reply.is_empty() {
                return None;
            }
            if printed.is_empty() {
                output.push_str("assistant> ");
            }
            let delta = reply.strip_prefix(printed.as_str())?;
            if delta.is_empty() {
                return None;
            }
            output.push_str(delta);
            *printed = reply.to_string();
            return Some(output);
        }

        let printed = self.printed.take()?;
        let mut output = String::new();
        match reply.strip_prefix(printed.as_str()) {
            Some(delta) if printed.is_empty() => {
                output.push_str("assistant> ");
                output.push_str(delta);
            }
            Some(delta) => output.push_str(delta),
            // The final content replaced the streamed text, e.g. with an error.
            None => {
                output.push_str("\nassistant> ");
                output.push_str(reply);
            }
        }
        output.push('\n');
        Some(output)
    }
}

pub fn open_store(settings: &Settings, config_dir: &Path) -> AppResult<ConversationStore> {
    let location = settings.storage_location(config_dir);
    let backend: Arc<dyn KeyValueBackend> = match settings.storage.backend {
        StorageBackendKind::File => Arc::new(FileBackend::new(location)),
        StorageBackendKind::Sqlite => Arc::new(
            SqliteBackend::open(&location.to_string_lossy()).context(OpenStorageSnafu {
                stage: "open-sqlite-storage",
                backend: StorageBackendKind::Sqlite,
            })?,
        ),
        StorageBackendKind::Memory => Arc::new(MemoryBackend::new()),
    };

    tracing::info!(backend = %settings.storage.backend, "conversation storage ready");
    Ok(ConversationStore::new(backend))
}

pub struct ChatApp {
    controller: Arc<SessionController>,
    settings_store: SettingsStore,
    snapshots: watch::Receiver<SessionSnapshot>,
    renderer: StreamRenderer,
}

impl ChatApp {
    pub fn new(controller: Arc<SessionController>, settings_store: SettingsStore) -> Self {
        let snapshots = controller.subscribe();
        Self {
            controller,
            settings_store,
            snapshots,
            renderer: StreamRenderer::default(),
        }
    }

    /// Builds the controller from settings: storage backend, engine kind and analytics sink.
    pub fn from_settings(settings_store: SettingsStore) -> AppResult<Self> {
        let settings = settings_store.settings();
        let store = open_store(&settings, &settings_store.config_dir())?;
        let factory = create_engine_factory(&settings.engine.kind, &settings.engine.api_key)
            .context(EngineSetupSnafu {
                stage: "create-engine-factory",
            })?;

        let engine = Arc::new(RemoteEngine::wrap(factory));
        let controller = Arc::new(SessionController::new(
            engine,
            store,
            Arc::new(TracingAnalytics),
        ));
        Ok(Self::new(controller, settings_store))
    }

    pub async fn run(mut self) -> AppResult<()> {
        let settings = self.settings_store.settings();
        self.write(&format!(
            "hearth: {} engine, model '{}'. /help lists commands.\n",
            settings.engine.kind, settings.engine.model_id
        ))?;
        self.init_engine().await?;

        let mut lines = BufReader::new(tokio::io::stdin()).lines();

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let line = line.context(ReadInputSnafu { stage: "read-line" })?;
                    let Some(line) = line else {
                        break;
                    };
                    if !self.handle_line(&line).await? {
                        break;
                    }
                }
                changed = self.snapshots.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let snapshot = self.snapshots.borrow_and_update().clone();
                    if let Some(output) = self.renderer.render(&snapshot) {
                        self.write(&output)?;
                    }
                }
            }
        }

        self.controller.stop();
        self.controller.engine().terminate();
        Ok(())
    }

    /// Returns `false` when the user asked to quit.
    async fn handle_line(&mut self, line: &str) -> AppResult<bool> {
        let command = match Command::parse(line) {
            Ok(Some(command)) => command,
            Ok(None) => return Ok(true),
            Err(hint) => {
                self.write(&format!("{hint}\n"))?;
                return Ok(true);
            }
        };

        let snapshot = self.controller.snapshot();
        match command {
            Command::Say(content) => {
                if snapshot.loading {
                    self.write("still generating; /stop to cancel\n")?;
                    return Ok(true);
                }
                // Older snapshots must not be mistaken for the reply.
                drop(self.snapshots.borrow_and_update());
                self.renderer.expect_reply();
                let controller = self.controller.clone();
                let option = AddMessageOption::user(content)
                    .with_system_message(self.settings_store.settings().system_message.clone());
                tokio::spawn(async move { controller.add_message(option).await });
            }
            Command::New => {
                self.controller.clear_conversation();
                self.write("started a new conversation\n")?;
            }
            Command::List => self.write(&render_conversation_list(&snapshot))?,
            Command::Load(reference) => match reference.resolve(&snapshot) {
                Some(id) if self.controller.open_conversation(id) => {
                    let loaded = self.controller.snapshot();
                    self.write(&render_messages(&loaded))?;
                }
                _ => self.write("no such conversation\n")?,
            },
            Command::Rename(name) => match snapshot.conversation_id {
                Some(id) => self.controller.update_conversation_name(id, name),
                None => self.write("nothing to rename yet\n")?,
            },
            Command::Delete(reference) => {
                let target = match reference {
                    Some(reference) => reference.resolve(&snapshot),
                    None => snapshot.conversation_id,
                };
                match target {
                    Some(id) => {
                        self.controller.delete_conversation(id);
                        self.write(&format!("deleted {id}\n"))?;
                    }
                    None => self.write("no such conversation\n")?,
                }
            }
            Command::ClearAll => {
                self.controller.clear_conversations();
                self.write("history cleared\n")?;
            }
            Command::Remove(id) => {
                if !self.controller.remove_message(id) {
                    self.write("no such message\n")?;
                }
            }
            Command::ToggleRole(id) => {
                if !self.controller.toggle_message_role(id) {
                    self.write("no user or assistant message with that id\n")?;
                }
            }
            Command::Edit(id, content) => {
                if !self.controller.update_message_content(id, content) {
                    self.write("no such message\n")?;
                }
            }
            Command::System(None) => {
                let settings = self.settings_store.settings();
                self.write(&format!("system message: {}\n", settings.system_message))?;
            }
            Command::System(Some(system_message)) => {
                let mut settings = Settings::clone(&self.settings_store.settings());
                settings.system_message = system_message;
                let message = match self.settings_store.update(settings) {
                    Ok(()) => format!(
                        "system message saved to {}\n",
                        self.settings_store.config_path().display()
                    ),
                    Err(error) => {
                        tracing::error!(error = %error, "failed to save settings");
                        format!("failed to save settings: {error}\n")
                    }
                };
                self.write(&message)?;
            }
            Command::Stop => {
                if !self.controller.stop() {
                    self.write("nothing is being generated\n")?;
                }
            }
            Command::Unload => {
                let outcome = self.controller.unload_local_llm().await;
                let message = match outcome.message {
                    Some(message) if !outcome.success => format!("unload failed: {message}\n"),
                    _ => "model unloaded\n".to_string(),
                };
                self.write(&message)?;
            }
            Command::Init => self.init_engine().await?,
            Command::Help => self.write(&format!("{HELP_TEXT}\n"))?,
            Command::Quit => return Ok(false),
        }
        Ok(true)
    }

    async fn init_engine(&mut self) -> AppResult<()> {
        let settings = self.settings_store.settings();
        let engine = &settings.engine;
        let outcome = self
            .controller
            .init_local_llm(&engine.model_id, &engine.model_url, &engine.wasm_url, |update| {
                let mut stdout = std::io::stdout().lock();
                let _ = write!(stdout, "\rloading {:>3}% {}", update.percent, update.text);
                let _ = stdout.flush();
            })
            .await;

        let message = if outcome.success {
            "\nmodel ready\n".to_string()
        } else {
            format!(
                "\nmodel failed to load: {}\n",
                outcome.message.unwrap_or_default()
            )
        };
        self.write(&message)
    }

    fn write(&self, text: &str) -> AppResult<()> {
        let mut stdout = std::io::stdout().lock();
        stdout
            .write_all(text.as_bytes())
            .and_then(|()| stdout.flush())
            .context(WriteOutputSnafu {
                stage: "write-stdout",
            })
    }
}

pub fn render_conversation_list(snapshot: &SessionSnapshot) -> String {
    let conversations = snapshot.recent_conversations();
    if conversations.is_empty() {
        return "no stored conversations\n".to_string();
    }

    let mut output = String::new();
    for (position, (id, conversation)) in conversations.iter().enumerate() {
        let name = if conversation.name.trim().is_empty() {
            "(untitled)"
        } else {
            conversation.name.as_str()
        };
        let marker = if snapshot.conversation_id == Some(*id) {
            "*"
        } else {
            " "
        };
        output.push_str(&format!(
            "{marker}{:>3}. {name} ({} messages) {id}\n",
            position + 1,
            conversation.messages.len()
        ));
    }
    output
}

pub fn render_messages(snapshot: &SessionSnapshot) -> String {
    snapshot
        .messages
        .iter()
        .map(|message| {
            let role = match message.role {
                MessageRole::System => "system",
                MessageRole::User => "you",
                MessageRole::Assistant => "assistant",
            };
            format!("[{}] {role}> {}\n", message.id, message.content)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use hearth_storage::{Conversation, Message};

    use super::*;

    fn streaming(reply: &str, loading: bool) -> SessionSnapshot {
        SessionSnapshot {
            messages: vec![
                Message::new(0, MessageRole::User, "hi"),
                Message::new(1, MessageRole::Assistant, reply),
            ],
            loading,
            ..SessionSnapshot::default()
        }
    }

    #[test]
    fn plain_text_is_a_message() {
        assert_eq!(
            Command::parse("  hello there "),
            Ok(Some(Command::Say("hello there".to_string())))
        );
        assert_eq!(Command::parse("   "), Ok(None));
    }

    #[test]
    fn commands_take_their_arguments() {
        assert_eq!(
            Command::parse("/edit 3 new text"),
            Ok(Some(Command::Edit(3, "new text".to_string())))
        );
        assert_eq!(
            Command::parse("/load 2"),
            Ok(Some(Command::Load(ConversationRef::Position(2))))
        );
        assert_eq!(Command::parse("/delete"), Ok(Some(Command::Delete(None))));
        assert_eq!(Command::parse("/role 0"), Ok(Some(Command::ToggleRole(0))));
        assert_eq!(Command::parse("/system"), Ok(Some(Command::System(None))));
        assert_eq!(
            Command::parse("/system  answer in haiku "),
            Ok(Some(Command::System(Some("answer in haiku".to_string()))))
        );
        assert!(Command::parse("/rm x").is_err());
        assert!(Command::parse("/load 0").is_err());
        assert!(Command::parse("/rename").is_err());
        assert!(Command::parse("/bogus").is_err());
    }

    #[test]
    fn conversation_id_reference_is_accepted() {
        let id = ConversationId::new_v7();
        assert_eq!(
            Command::parse(&format!("/load {id}")),
            Ok(Some(Command::Load(ConversationRef::Id(id))))
        );
    }

    #[test]
    fn renderer_prints_only_new_text() {
        let mut renderer = StreamRenderer::default();

        assert_eq!(renderer.render(&streaming("", true)), None);
        assert_eq!(
            renderer.render(&streaming("Hel", true)).as_deref(),
            Some("assistant> Hel")
        );
        assert_eq!(renderer.render(&streaming("Hello", true)).as_deref(), Some("lo"));
        assert_eq!(renderer.render(&streaming("Hello", true)), None);
        assert_eq!(renderer.render(&streaming("Hello!", false)).as_deref(), Some("!\n"));
        assert_eq!(renderer.render(&streaming("Hello!", false)), None);
    }

    #[test]
    fn renderer_reprints_replaced_reply() {
        let mut renderer = StreamRenderer::default();
        renderer.render(&streaming("partial", true));

        assert_eq!(
            renderer.render(&streaming("engine failed", false)).as_deref(),
            Some("\nassistant> engine failed\n")
        );
    }

    #[test]
    fn list_is_sorted_and_marks_active() {
        let older = ConversationId::new_v7();
        let newer = ConversationId::new_v7();
        let mut snapshot = SessionSnapshot {
            conversation_id: Some(older),
            ..SessionSnapshot::default()
        };
        snapshot
            .conversations
            .insert(older, Conversation::new("", vec![], 10));
        snapshot
            .conversations
            .insert(newer, Conversation::new("recipes", vec![], 20));

        let listing = render_conversation_list(&snapshot);
        let lines = listing.lines().collect::<Vec<_>>();
        assert!(lines[0].starts_with("   1. recipes"));
        assert!(lines[1].starts_with("*  2. (untitled)"));

        assert_eq!(ConversationRef::Position(2).resolve(&snapshot), Some(older));
        assert_eq!(ConversationRef::Position(3).resolve(&snapshot), None);
    }
}
