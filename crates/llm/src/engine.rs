use std::future::Future;
use std::pin::Pin;

use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::model::AppConfig;

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Raw loading progress as an engine reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitProgressReport {
    /// Fraction in `[0, 1]`.
    pub progress: f64,
    /// Seconds since loading started.
    pub time_elapsed: f64,
    pub text: String,
}

impl InitProgressReport {
    pub fn new(progress: f64, time_elapsed: f64, text: impl Into<String>) -> Self {
        Self {
            progress,
            time_elapsed,
            text: text.into(),
        }
    }
}

pub type ProgressCallback = Box<dyn FnMut(InitProgressReport) + Send>;

/// Receives `(step, cumulative_text)`; the text is everything generated so far.
pub type TokenCallback = Box<dyn FnMut(usize, &str) + Send>;

/// The opaque inference capability. Implementations own weights, kernels and tokenizer.
pub trait InferenceEngine: Send {
    fn reload<'a>(
        &'a mut self,
        model_id: &'a str,
        config: &'a AppConfig,
        on_progress: ProgressCallback,
    ) -> BoxFuture<'a, EngineResult<()>>;

    fn generate<'a>(
        &'a mut self,
        prompt: &'a str,
        on_token: TokenCallback,
    ) -> BoxFuture<'a, EngineResult<String>>;

    fn unload<'a>(&'a mut self) -> BoxFuture<'a, EngineResult<()>>;
}

/// Builds fresh engine instances for the slot that owns them.
pub trait EngineFactory: Send + Sync {
    fn name(&self) -> &str;
    fn create(&self) -> EngineResult<Box<dyn InferenceEngine>>;
}
