use std::time::Instant;

use futures::StreamExt;
use rig::completion::{CompletionModel, Message as RigMessage};
use rig::prelude::CompletionClient;
use rig::providers::openai;
use rig::streaming::StreamedAssistantContent;
use snafu::{OptionExt, ResultExt, ensure};

use crate::engine::{
    BoxFuture, EngineFactory, InferenceEngine, InitProgressReport, ProgressCallback,
    TokenCallback,
};
use crate::error::{
    CompletionsFailedSnafu, EngineResult, HttpClientSnafu, InvalidStateSnafu, MissingApiKeySnafu,
};
use crate::model::AppConfig;
use crate::slot::LifecycleState;

pub const RIG_OPENAI_ENGINE_KIND: &str = "openai";

/// Engine backed by an OpenAI-compatible endpoint through rig.
///
/// `modelUrl` of the model record is the endpoint base URL; an empty URL keeps rig's default.
#[derive(Debug, Clone)]
pub struct RigEngineFactory {
    api_key: String,
}

impl RigEngineFactory {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }
}

impl EngineFactory for RigEngineFactory {
    fn name(&self) -> &str {
        RIG_OPENAI_ENGINE_KIND
    }

    fn create(&self) -> EngineResult<Box<dyn InferenceEngine>> {
        ensure!(
            !self.api_key.trim().is_empty(),
            MissingApiKeySnafu {
                stage: "rig-engine-create",
                engine: RIG_OPENAI_ENGINE_KIND.to_string(),
            }
        );

        Ok(Box::new(RigEngine {
            api_key: self.api_key.clone(),
            loaded: None,
        }))
    }
}

struct LoadedModel {
    client: openai::Client,
    model_id: String,
}

struct RigEngine {
    api_key: String,
    loaded: Option<LoadedModel>,
}

impl RigEngine {
    fn build_client(&self, endpoint: &str) -> EngineResult<openai::Client> {
        let mut builder = openai::Client::builder().api_key(self.api_key.as_str());
        if !endpoint.trim().is_empty() {
            builder = builder.base_url(endpoint);
        }
        builder.build().context(HttpClientSnafu {
            stage: "build-client",
        })
    }
}

impl InferenceEngine for RigEngine {
    fn reload<'a>(
        &'a mut self,
        model_id: &'a str,
        config: &'a AppConfig,
        mut on_progress: ProgressCallback,
    ) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            let started = Instant::now();
            let endpoint = config
                .model(model_id)
                .map(|record| record.model_url.as_str())
                .unwrap_or_default();

            let client = self.build_client(endpoint)?;
            self.loaded = Some(LoadedModel {
                client,
                model_id: model_id.to_string(),
            });

            on_progress(InitProgressReport::new(
                1.0,
                started.elapsed().as_secs_f64(),
                format!("Connected to {model_id}"),
            ));
            Ok(())
        })
    }

    fn generate<'a>(
        &'a mut self,
        prompt: &'a str,
        mut on_token: TokenCallback,
    ) -> BoxFuture<'a, EngineResult<String>> {
        Box::pin(async move {
            let loaded = self.loaded.as_ref().context(InvalidStateSnafu {
                stage: "rig-generate",
                operation: "generate",
                state: LifecycleState::Uninitialized,
            })?;

            let model = loaded.client.completion_model(loaded.model_id.clone());
            let mut stream = model
                .completion_request(RigMessage::user(prompt.to_string()))
                .stream()
                .await
                .context(CompletionsFailedSnafu {
                    stage: "open-stream",
                })?;

            let mut cumulative = String::new();
            let mut step = 0;
            while let Some(item) = stream.next().await {
                let item = item.context(CompletionsFailedSnafu {
                    stage: "stream-chunk",
                })?;
                // Reasoning and tool-call fragments are not part of the reply.
                if let StreamedAssistantContent::Text(text) = item {
                    if text.text.is_empty() {
                        continue;
                    }
                    cumulative.push_str(&text.text);
                    on_token(step, &cumulative);
                    step += 1;
                }
            }

            tracing::debug!(model_id = %loaded.model_id, steps = step, "remote stream finished");
            Ok(cumulative)
        })
    }

    fn unload<'a>(&'a mut self) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            self.loaded = None;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;

    #[test]
    fn factory_requires_api_key() {
        let error = RigEngineFactory::new("  ").create().err().expect("missing key");
        assert!(matches!(error, EngineError::MissingApiKey { .. }));
    }

    #[tokio::test]
    async fn generate_before_reload_is_rejected() {
        let mut engine = RigEngineFactory::new("sk-test").create().expect("engine");
        let error = engine
            .generate("S\n###\nquestion: Q", Box::new(|_, _| {}))
            .await
            .unwrap_err();
        assert!(matches!(error, EngineError::InvalidState { .. }));
    }
}
