use snafu::Snafu;

use crate::message::Role;
use crate::slot::LifecycleState;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum EngineError {
    #[snafu(display("modelUrl and modelLibMap must be provided"))]
    MissingConfiguration { stage: &'static str },
    #[snafu(display("cannot {operation} while the engine is {state}"))]
    InvalidState {
        stage: &'static str,
        operation: &'static str,
        state: LifecycleState,
    },
    #[snafu(display(
        "engine already holds model '{loaded_model_id}'; unload it before loading '{requested_model_id}'"
    ))]
    ConfigurationMismatch {
        stage: &'static str,
        loaded_model_id: String,
        requested_model_id: String,
    },
    #[snafu(display("engine is busy with another request"))]
    EngineBusy { stage: &'static str },
    #[snafu(display("prompt needs a {role} message"))]
    MissingRole { stage: &'static str, role: Role },
    #[snafu(display("generation was cancelled"))]
    Cancelled { stage: &'static str },
    #[snafu(display("engine failed on `{stage}`: {message}"))]
    Backend {
        stage: &'static str,
        message: String,
    },
    #[snafu(display("engine panicked during {stage}: {detail}"))]
    Panicked { stage: &'static str, detail: String },
    #[snafu(display("unknown engine kind '{kind}'"))]
    UnknownEngineKind { stage: &'static str, kind: String },
    #[snafu(display("missing API key for engine '{engine}'"))]
    MissingApiKey {
        stage: &'static str,
        engine: String,
    },
    #[snafu(display("http client failed on `{stage}`, {source}"))]
    HttpClient {
        stage: &'static str,
        source: rig::http_client::Error,
    },
    #[snafu(display("completions failed on `{stage}`, {source}"))]
    CompletionsFailed {
        stage: &'static str,
        source: rig::completion::CompletionError,
    },
}
