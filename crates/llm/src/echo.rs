use std::time::{Duration, Instant};

use snafu::OptionExt;

use crate::engine::{
    BoxFuture, EngineFactory, InferenceEngine, InitProgressReport, ProgressCallback,
    TokenCallback,
};
use crate::error::{BackendSnafu, EngineResult};
use crate::model::AppConfig;
use crate::prompt::question_of;

pub const ECHO_ENGINE_KIND: &str = "echo";

/// Offline engine that "loads" a fixed number of shards and answers by repeating the
/// question word by word. Useful without weights or network access.
#[derive(Debug, Clone)]
pub struct EchoEngineFactory {
    shard_count: usize,
    shard_delay: Duration,
    token_delay: Duration,
}

impl Default for EchoEngineFactory {
    fn default() -> Self {
        Self {
            shard_count: 8,
            shard_delay: Duration::from_millis(40),
            token_delay: Duration::from_millis(30),
        }
    }
}

impl EchoEngineFactory {
    pub fn new(shard_count: usize, shard_delay: Duration, token_delay: Duration) -> Self {
        Self {
            shard_count: shard_count.max(1),
            shard_delay,
            token_delay,
        }
    }

    /// No artificial delays.
    pub fn instant() -> Self {
        Self::new(4, Duration::ZERO, Duration::ZERO)
    }
}

impl EngineFactory for EchoEngineFactory {
    fn name(&self) -> &str {
        ECHO_ENGINE_KIND
    }

    fn create(&self) -> EngineResult<Box<dyn InferenceEngine>> {
        Ok(Box::new(EchoEngine {
            factory: self.clone(),
            loaded_model: None,
        }))
    }
}

struct EchoEngine {
    factory: EchoEngineFactory,
    loaded_model: Option<String>,
}

impl InferenceEngine for EchoEngine {
    fn reload<'a>(
        &'a mut self,
        model_id: &'a str,
        config: &'a AppConfig,
        mut on_progress: ProgressCallback,
    ) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            let record = config.model(model_id).context(BackendSnafu {
                stage: "echo-reload-model",
                message: format!("model '{model_id}' is not in the model list"),
            })?;
            config.model_lib(model_id).context(BackendSnafu {
                stage: "echo-reload-library",
                message: format!("no kernel library configured for '{model_id}'"),
            })?;

            let started = Instant::now();
            let shards = self.factory.shard_count;
            for shard in 1..=shards {
                if !self.factory.shard_delay.is_zero() {
                    tokio::time::sleep(self.factory.shard_delay).await;
                }
                on_progress(InitProgressReport::new(
                    shard as f64 / shards as f64,
                    started.elapsed().as_secs_f64(),
                    format!("Fetching param cache[{shard}/{shards}] from {}", record.model_url),
                ));
            }

            self.loaded_model = Some(model_id.to_string());
            Ok(())
        })
    }

    fn generate<'a>(
        &'a mut self,
        prompt: &'a str,
        mut on_token: TokenCallback,
    ) -> BoxFuture<'a, EngineResult<String>> {
        Box::pin(async move {
            let mut cumulative = String::new();
            for (step, word) in question_of(prompt).split_whitespace().enumerate() {
                if step > 0 {
                    cumulative.push(' ');
                }
                cumulative.push_str(word);
                on_token(step, &cumulative);

                if self.factory.token_delay.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::time::sleep(self.factory.token_delay).await;
                }
            }
            Ok(cumulative)
        })
    }

    fn unload<'a>(&'a mut self) -> BoxFuture<'a, EngineResult<()>> {
        Box::pin(async move {
            if let Some(model_id) = self.loaded_model.take() {
                tracing::debug!(model_id = %model_id, "echo engine released model");
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::model::ModelConfig;

    #[tokio::test]
    async fn reload_reports_every_shard() {
        let mut engine = EchoEngineFactory::instant().create().expect("engine");
        let app_config = ModelConfig::new("m", "https://w/", "https://k.wasm").to_app_config();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        engine
            .reload(
                "m",
                &app_config,
                Box::new(move |report| sink.lock().expect("sink").push(report.progress)),
            )
            .await
            .expect("reload");

        assert_eq!(*seen.lock().expect("seen"), vec![0.25, 0.5, 0.75, 1.0]);
    }

    #[tokio::test]
    async fn reload_rejects_unknown_model() {
        let mut engine = EchoEngineFactory::instant().create().expect("engine");
        let app_config = ModelConfig::new("m", "https://w/", "https://k.wasm").to_app_config();

        let error = engine
            .reload("other", &app_config, Box::new(|_| {}))
            .await
            .unwrap_err();
        assert!(error.to_string().contains("'other' is not in the model list"));
    }

    #[tokio::test]
    async fn generate_echoes_the_question_cumulatively() {
        let mut engine = EchoEngineFactory::instant().create().expect("engine");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();

        let reply = engine
            .generate(
                "be brief\n###\ngiven: ctx\n###\nquestion: how are  you",
                Box::new(move |step, text| sink.lock().expect("sink").push((step, text.to_string()))),
            )
            .await
            .expect("reply");

        assert_eq!(reply, "how are you");
        assert_eq!(
            *seen.lock().expect("seen"),
            vec![
                (0, "how".to_string()),
                (1, "how are".to_string()),
                (2, "how are you".to_string()),
            ]
        );
    }
}
