pub mod state;

pub use state::{
    DEFAULT_SYSTEM_MESSAGE, EngineSettings, Settings, SettingsError, SettingsStore,
    StorageBackendKind, StorageSettings,
};
