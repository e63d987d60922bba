pub mod bridge;
pub mod echo;
pub mod engine;
pub mod error;
pub mod message;
pub mod model;
pub mod prompt;
pub mod rig_adapter;
pub mod slot;

#[cfg(test)]
mod testing;

use std::sync::Arc;

pub use bridge::{
    BridgeError, BridgeResult, CallCanceller, CallEvent, CallId, CallReply, CallStream,
    CallbackRegistry, EngineWorker, RemoteEngine, WorkerChannel, WorkerEnvelope, WorkerRequest,
};
pub use echo::{ECHO_ENGINE_KIND, EchoEngineFactory};
pub use engine::{
    BoxFuture, EngineFactory, InferenceEngine, InitProgressReport, ProgressCallback,
    TokenCallback,
};
pub use error::{EngineError, EngineResult};
pub use message::{PromptMessage, Role};
pub use model::{AppConfig, ModelConfig, ModelRecord};
pub use prompt::build_prompt;
pub use rig_adapter::{RIG_OPENAI_ENGINE_KIND, RigEngineFactory};
pub use slot::{EngineSlot, LifecycleState, OperationOutcome, ProgressGate, ProgressUpdate};

/// Resolves an engine kind name to its factory.
pub fn create_engine_factory(kind: &str, api_key: &str) -> EngineResult<Arc<dyn EngineFactory>> {
    match kind.trim() {
        ECHO_ENGINE_KIND => Ok(Arc::new(EchoEngineFactory::default())),
        RIG_OPENAI_ENGINE_KIND => Ok(Arc::new(RigEngineFactory::new(api_key))),
        other => error::UnknownEngineKindSnafu {
            stage: "create-engine-factory",
            kind: other.to_string(),
        }
        .fail(),
    }
}
