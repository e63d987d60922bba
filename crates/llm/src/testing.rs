use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::engine::{
    BoxFuture, EngineFactory, InferenceEngine, InitProgressReport, ProgressCallback,
    TokenCallback,
};
use crate::error::{BackendSnafu, EngineResult};
use crate::model::AppConfig;

/// Deterministic engine behavior for tests.
#[derive(Clone, Default)]
pub(crate) struct Script {
    pub progress: Vec<f64>,
    pub tokens: Vec<&'static str>,
    pub reload_error: Option<&'static str>,
    pub unload_error: Option<&'static str>,
    pub load_gate: Option<Arc<Notify>>,
    pub generate_gate: Option<Arc<Notify>>,
    pub reload_panic: Option<&'static str>,
    pub generate_panic: Option<&'static str>,
}

pub(crate) struct ScriptedFactory {
    script: Script,
    created: Arc<AtomicUsize>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedFactory {
    pub fn new(script: Script) -> Self {
        Self {
            script,
            created: Arc::new(AtomicUsize::new(0)),
            prompts: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompt log").clone()
    }
}

impl EngineFactory for ScriptedFactory {
    fn name(&self) -> &str {
        "scripted"
    }

    fn create(&self) -> EngineResult<Box<dyn InferenceEngine>> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(ScriptedEngine {
            script: self.script.clone(),
            prompts: self.prompts.clone(),
        }))
    }
}

struct ScriptedEngine {
    script: Script,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl InferenceEngine for ScriptedEngine {
    fn reload<'a>(
        &'a mut self,
        _model_id: &'a str,
        _config: &'a AppConfig,
        mut on_progress: ProgressCallback,
    ) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            for (index, progress) in self.script.progress.iter().enumerate() {
                on_progress(InitProgressReport::new(
                    *progress,
                    index as f64,
                    format!("step {index}"),
                ));
            }
            if let Some(gate) = &self.script.load_gate {
                gate.notified().await;
            }
            if let Some(message) = self.script.reload_panic {
                panic!("{message}");
            }
            if let Some(message) = self.script.reload_error {
                return BackendSnafu {
                    stage: "scripted-reload",
                    message,
                }
                .fail();
            }
            Ok(())
        })
    }

    fn generate<'a>(
        &'a mut self,
        prompt: &'a str,
        mut on_token: TokenCallback,
    ) -> BoxFuture<'a, EngineResult<String>> {
        Box::pin(async move {
            self.prompts
                .lock()
                .expect("prompt log")
                .push(prompt.to_string());
            if let Some(gate) = &self.script.generate_gate {
                gate.notified().await;
            }
            if let Some(message) = self.script.generate_panic {
                panic!("{message}");
            }

            let mut cumulative = String::new();
            for (step, token) in self.script.tokens.iter().enumerate() {
                cumulative.push_str(token);
                on_token(step, &cumulative);
                tokio::task::yield_now().await;
            }
            Ok(cumulative)
        })
    }

    fn unload<'a>(&'a mut self) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            if let Some(message) = self.script.unload_error {
                return BackendSnafu {
                    stage: "scripted-unload",
                    message,
                }
                .fail();
            }
            Ok(())
        })
    }
}
