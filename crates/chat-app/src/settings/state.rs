use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arc_swap::ArcSwap;
use figment::{
    Figment,
    providers::{Env, Format, Json, Serialized},
};
use hearth_llm::{ECHO_ENGINE_KIND, ModelConfig};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

pub const SETTINGS_DIRECTORY_NAME: &str = "hearth";
pub const SETTINGS_FILE_NAME: &str = "settings.json";
pub const ENV_PREFIX: &str = "HEARTH_";
pub const DEFAULT_SYSTEM_MESSAGE: &str = "You are a helpful AI chatbot.";
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    #[default]
    File,
    Sqlite,
    Memory,
}

impl fmt::Display for StorageBackendKind {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::File => "file",
            Self::Sqlite => "sqlite",
            Self::Memory => "memory",
        };
        formatter.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub backend: StorageBackendKind,
    /// Directory (file backend) or database path (sqlite). Empty uses the config directory.
    #[serde(default)]
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_engine_kind")]
    pub kind: String,
    #[serde(default = "default_model_id")]
    pub model_id: String,
    #[serde(default = "default_model_url")]
    pub model_url: String,
    #[serde(default = "default_wasm_url")]
    pub wasm_url: String,
    #[serde(default)]
    pub api_key: String,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            kind: default_engine_kind(),
            model_id: default_model_id(),
            model_url: default_model_url(),
            wasm_url: default_wasm_url(),
            api_key: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub engine: EngineSettings,
    #[serde(default = "default_system_message")]
    pub system_message: String,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            engine: EngineSettings::default(),
            system_message: default_system_message(),
            storage: StorageSettings::default(),
            log_filter: default_log_filter(),
        }
    }
}

impl Settings {
    pub fn model_config(&self) -> ModelConfig {
        ModelConfig::new(
            &self.engine.model_id,
            &self.engine.model_url,
            &self.engine.wasm_url,
        )
    }

    /// Where the configured storage backend keeps its data.
    pub fn storage_location(&self, config_dir: &Path) -> PathBuf {
        let location = self.storage.location.trim();
        if !location.is_empty() {
            return PathBuf::from(location);
        }

        match self.storage.backend {
            StorageBackendKind::Sqlite => config_dir.join("history.db"),
            StorageBackendKind::File | StorageBackendKind::Memory => config_dir.join("history"),
        }
    }

    pub fn normalized(mut self) -> Self {
        self.engine.kind = if self.engine.kind.trim().is_empty() {
            default_engine_kind()
        } else {
            self.engine.kind.trim().to_ascii_lowercase()
        };
        self.engine.model_id = self.engine.model_id.trim().to_string();
        self.engine.model_url = self.engine.model_url.trim().to_string();
        self.engine.wasm_url = self.engine.wasm_url.trim().to_string();
        self.engine.api_key = self.engine.api_key.trim().to_string();
        self.storage.location = self.storage.location.trim().to_string();
        if self.system_message.trim().is_empty() {
            self.system_message = default_system_message();
        }
        if self.log_filter.trim().is_empty() {
            self.log_filter = default_log_filter();
        }
        self
    }
}

pub struct SettingsStore {
    settings: Arc<ArcSwap<Settings>>,
    config_path: PathBuf,
}

impl SettingsStore {
    pub fn default_config_dir() -> PathBuf {
        dirs::config_dir()
            .map(|path| path.join(SETTINGS_DIRECTORY_NAME))
            .unwrap_or_else(|| PathBuf::from(".hearth"))
    }

    pub fn default_config_path() -> PathBuf {
        Self::default_config_dir().join(SETTINGS_FILE_NAME)
    }

    pub fn new(config_path: PathBuf) -> Self {
        let settings = Self::load_from_disk(&config_path);
        Self {
            settings: Arc::new(ArcSwap::from_pointee(settings)),
            config_path,
        }
    }

    pub fn load() -> Self {
        Self::new(Self::default_config_path())
    }

    pub fn settings(&self) -> Arc<Settings> {
        self.settings.load_full()
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    pub fn config_dir(&self) -> PathBuf {
        self.config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::default_config_dir)
    }

    pub fn update(&self, settings: Settings) -> Result<(), SettingsError> {
        let normalized_settings = settings.normalized();
        self.persist(&normalized_settings)?;
        self.settings.store(Arc::new(normalized_settings));
        Ok(())
    }

    fn load_from_disk(path: &Path) -> Settings {
        if !path.exists() {
            tracing::info!(path = ?path, "settings file not found; using defaults and environment");
        }

        let figment = Figment::from(Serialized::defaults(Settings::default()))
            .merge(Json::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"));

        match figment.extract::<Settings>() {
            Ok(settings) => settings.normalized(),
            Err(error) => {
                tracing::warn!(path = ?path, error = %error, "failed to parse settings; using defaults");
                Settings::default()
            }
        }
    }

    fn persist(&self, settings: &Settings) -> Result<(), SettingsError> {
        if let Some(parent) = self.config_path.parent() {
            std::fs::create_dir_all(parent).context(CreateDirSnafu {
                stage: "create-settings-directory",
                path: parent.to_path_buf(),
            })?;
        }

        let content = serde_json::to_string_pretty(settings).context(SerializeConfigSnafu {
            stage: "serialize-settings-json",
        })?;

        let temp_path = self.config_path.with_extension("json.tmp");
        std::fs::write(&temp_path, content).context(WriteFileSnafu {
            stage: "write-temporary-settings-file",
            path: temp_path.clone(),
        })?;

        std::fs::rename(&temp_path, &self.config_path).context(RenameTempFileSnafu {
            stage: "rename-temporary-settings-file",
            from: temp_path,
            to: self.config_path.clone(),
        })?;

        tracing::info!(path = ?self.config_path, "saved settings");
        Ok(())
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SettingsError {
    #[snafu(display("failed to create settings directory at {path:?} on `{stage}`: {source}"))]
    CreateDir {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to serialize settings on `{stage}`: {source}"))]
    SerializeConfig {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to write settings file at {path:?} on `{stage}`: {source}"))]
    WriteFile {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display(
        "failed to replace settings file from {from:?} to {to:?} on `{stage}`: {source}"
    ))]
    RenameTempFile {
        stage: &'static str,
        from: PathBuf,
        to: PathBuf,
        source: std::io::Error,
    },
}

fn default_engine_kind() -> String {
    ECHO_ENGINE_KIND.to_string()
}

fn default_model_id() -> String {
    "hearth-echo-q4".to_string()
}

fn default_model_url() -> String {
    "builtin://echo/weights/".to_string()
}

fn default_wasm_url() -> String {
    "builtin://echo/kernels.wasm".to_string()
}

fn default_system_message() -> String {
    DEFAULT_SYSTEM_MESSAGE.to_string()
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}
