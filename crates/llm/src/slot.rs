use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ensure};

use crate::engine::{EngineFactory, InferenceEngine, InitProgressReport, TokenCallback};
use crate::error::{
    ConfigurationMismatchSnafu, EngineError, EngineResult, InvalidStateSnafu,
    MissingConfigurationSnafu,
};
use crate::message::PromptMessage;
use crate::model::ModelConfig;
use crate::prompt::build_prompt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LifecycleState {
    Uninitialized,
    Loading,
    Ready,
    Unloading,
    Failed,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Loading => "loading",
            Self::Ready => "ready",
            Self::Unloading => "unloading",
            Self::Failed => "failed",
        };
        formatter.write_str(name)
    }
}

/// Structured result of init/unload. Failures travel as data, never as panics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationOutcome {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl OperationOutcome {
    pub fn succeeded() -> Self {
        Self {
            success: true,
            message: None,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: Some(message.into()),
        }
    }
}

impl From<EngineResult<()>> for OperationOutcome {
    fn from(result: EngineResult<()>) -> Self {
        match result {
            Ok(()) => Self::succeeded(),
            Err(error) => Self::failed(error.to_string()),
        }
    }
}

/// Loading progress as delivered to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    /// Whole percent in `[0, 100]`.
    pub percent: u8,
    pub time_elapsed: f64,
    pub text: String,
}

/// Lets a report through only when the rounded percentage strictly increases.
#[derive(Debug, Default)]
pub struct ProgressGate {
    last_percent: u8,
}

impl ProgressGate {
    pub fn admit(&mut self, report: &InitProgressReport) -> Option<ProgressUpdate> {
        let percent = (report.progress * 100.0).round().clamp(0.0, 100.0) as u8;
        if percent <= self.last_percent {
            return None;
        }

        self.last_percent = percent;
        Some(ProgressUpdate {
            percent,
            time_elapsed: report.time_elapsed,
            text: report.text.clone(),
        })
    }
}

type SharedEngine = Arc<tokio::sync::Mutex<Box<dyn InferenceEngine>>>;

struct SlotInner {
    state: LifecycleState,
    engine: Option<SharedEngine>,
    config: Option<ModelConfig>,
}

/// Owner of the one live engine instance.
///
/// Construction only happens through [`EngineSlot::init`], which moves the slot to
/// `Loading` before any await point, so overlapping inits observe `Loading` and are
/// rejected instead of building a second instance.
pub struct EngineSlot {
    factory: Arc<dyn EngineFactory>,
    inner: Mutex<SlotInner>,
    constructed: AtomicUsize,
}

enum LoadPlan {
    Construct,
    AlreadyLoaded,
}

impl EngineSlot {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            inner: Mutex::new(SlotInner {
                state: LifecycleState::Uninitialized,
                engine: None,
                config: None,
            }),
            constructed: AtomicUsize::new(0),
        }
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().state
    }

    pub fn loaded_config(&self) -> Option<ModelConfig> {
        self.lock().config.clone()
    }

    /// Number of engine instances built over the slot's lifetime.
    pub fn constructed_instances(&self) -> usize {
        self.constructed.load(Ordering::SeqCst)
    }

    pub async fn init<F>(&self, config: ModelConfig, on_progress: F) -> OperationOutcome
    where
        F: FnMut(ProgressUpdate) + Send + 'static,
    {
        match self.plan_load(&config) {
            Ok(LoadPlan::AlreadyLoaded) => return OperationOutcome::succeeded(),
            Ok(LoadPlan::Construct) => {}
            Err(error) => {
                tracing::warn!(model_id = %config.model_id, error = %error, "engine init rejected");
                return OperationOutcome::failed(error.to_string());
            }
        }

        let mut guard = LoadingGuard { slot: self, armed: true };
        let result = self.construct(&config, on_progress).await;
        guard.armed = false;

        let mut inner = self.lock();
        match result {
            Ok(engine) => {
                inner.state = LifecycleState::Ready;
                inner.engine = Some(Arc::new(tokio::sync::Mutex::new(engine)));
                inner.config = Some(config.clone());
                tracing::info!(model_id = %config.model_id, engine = %self.factory.name(), "engine ready");
                OperationOutcome::succeeded()
            }
            Err(error) => {
                inner.state = LifecycleState::Failed;
                tracing::error!(model_id = %config.model_id, error = %error, "engine init failed");
                OperationOutcome::failed(error.to_string())
            }
        }
    }

    pub async fn unload(&self) -> OperationOutcome {
        let engine = match self.begin_unload() {
            Ok(engine) => engine,
            Err(error) => return OperationOutcome::failed(error.to_string()),
        };

        let Ok(mut instance) = engine.clone().try_lock_owned() else {
            self.restore_ready(engine);
            let error = EngineError::EngineBusy {
                stage: "unload-lock",
            };
            return OperationOutcome::failed(error.to_string());
        };
        let result = instance.unload().await;
        drop(instance);

        match result {
            Ok(()) => {
                let mut inner = self.lock();
                inner.state = LifecycleState::Uninitialized;
                inner.config = None;
                tracing::info!("engine unloaded");
                OperationOutcome::succeeded()
            }
            Err(error) => {
                tracing::error!(error = %error, "engine unload failed; keeping instance");
                self.restore_ready(engine);
                OperationOutcome::failed(error.to_string())
            }
        }
    }

    /// Generates a reply for the assembled prompt; `on_token` sees cumulative text.
    pub async fn completion(
        &self,
        messages: Vec<PromptMessage>,
        rag_result: Vec<String>,
        on_token: TokenCallback,
    ) -> EngineResult<String> {
        let engine = {
            let inner = self.lock();
            ensure!(
                inner.state == LifecycleState::Ready,
                InvalidStateSnafu {
                    stage: "completion-state",
                    operation: "generate",
                    state: inner.state,
                }
            );
            inner.engine.clone().context(InvalidStateSnafu {
                stage: "completion-instance",
                operation: "generate",
                state: inner.state,
            })?
        };

        let prompt = build_prompt(&messages, &rag_result)?;
        tracing::debug!(
            message_count = messages.len(),
            context_entries = rag_result.len(),
            prompt_chars = prompt.len(),
            "assembled prompt"
        );

        let mut instance = engine
            .try_lock_owned()
            .map_err(|_| EngineError::EngineBusy {
                stage: "completion-lock",
            })?;
        let reply = instance.generate(&prompt, on_token).await?;
        tracing::debug!(reply_chars = reply.len(), "generation finished");
        Ok(reply)
    }

    fn plan_load(&self, config: &ModelConfig) -> EngineResult<LoadPlan> {
        ensure!(
            config.is_complete(),
            MissingConfigurationSnafu {
                stage: "init-validate-config",
            }
        );

        let mut inner = self.lock();
        match inner.state {
            LifecycleState::Uninitialized | LifecycleState::Failed => {
                inner.state = LifecycleState::Loading;
                Ok(LoadPlan::Construct)
            }
            LifecycleState::Ready => match &inner.config {
                Some(loaded) if loaded == config => Ok(LoadPlan::AlreadyLoaded),
                Some(loaded) => ConfigurationMismatchSnafu {
                    stage: "init-compare-config",
                    loaded_model_id: loaded.model_id.clone(),
                    requested_model_id: config.model_id.clone(),
                }
                .fail(),
                None => InvalidStateSnafu {
                    stage: "init-ready-without-config",
                    operation: "init",
                    state: inner.state,
                }
                .fail(),
            },
            LifecycleState::Loading | LifecycleState::Unloading => InvalidStateSnafu {
                stage: "init-state",
                operation: "init",
                state: inner.state,
            }
            .fail(),
        }
    }

    async fn construct<F>(
        &self,
        config: &ModelConfig,
        mut on_progress: F,
    ) -> EngineResult<Box<dyn InferenceEngine>>
    where
        F: FnMut(ProgressUpdate) + Send + 'static,
    {
        let mut engine = self.factory.create()?;
        self.constructed.fetch_add(1, Ordering::SeqCst);

        let app_config = config.to_app_config();
        let mut gate = ProgressGate::default();
        tracing::info!(
            model_id = %config.model_id,
            model_url = %config.model_url,
            engine = %self.factory.name(),
            "loading engine"
        );

        engine
            .reload(
                &config.model_id,
                &app_config,
                Box::new(move |report| {
                    if let Some(update) = gate.admit(&report) {
                        on_progress(update);
                    }
                }),
            )
            .await?;
        Ok(engine)
    }

    fn begin_unload(&self) -> EngineResult<SharedEngine> {
        let mut inner = self.lock();
        ensure!(
            inner.state == LifecycleState::Ready,
            InvalidStateSnafu {
                stage: "unload-state",
                operation: "unload",
                state: inner.state,
            }
        );
        let engine = inner.engine.take().context(InvalidStateSnafu {
            stage: "unload-instance",
            operation: "unload",
            state: inner.state,
        })?;
        inner.state = LifecycleState::Unloading;
        Ok(engine)
    }

    fn restore_ready(&self, engine: SharedEngine) {
        let mut inner = self.lock();
        inner.engine = Some(engine);
        inner.state = LifecycleState::Ready;
    }

    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        match self.inner.lock() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

// A dropped init future must not leave the slot stuck in `Loading`.
struct LoadingGuard<'a> {
    slot: &'a EngineSlot,
    armed: bool,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.slot.lock().state = LifecycleState::Failed;
        }
    }
}
