use std::process::ExitCode;

use hearth::app::ChatApp;
use hearth::settings::SettingsStore;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> ExitCode {
    let settings_store = SettingsStore::load();
    init_tracing(&settings_store.settings().log_filter);

    let app = match ChatApp::from_settings(settings_store) {
        Ok(app) => app,
        Err(error) => {
            tracing::error!(error = %error, "failed to start");
            return ExitCode::FAILURE;
        }
    };

    match app.run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(error = %error, "session ended with an error");
            ExitCode::FAILURE
        }
    }
}

// RUST_LOG wins over the configured filter. Logs go to stderr.
fn init_tracing(configured_filter: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(configured_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
