use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// What the host hands over at init time. Every field is passed through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    /// Local identifier of the model.
    pub model_id: String,
    /// Origin of the weight shards.
    pub model_url: String,
    /// Location of the compiled kernel library for `model_id`.
    pub wasm_url: String,
}

impl ModelConfig {
    pub fn new(
        model_id: impl Into<String>,
        model_url: impl Into<String>,
        wasm_url: impl Into<String>,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            model_url: model_url.into(),
            wasm_url: wasm_url.into(),
        }
    }

    pub fn is_complete(&self) -> bool {
        [&self.model_id, &self.model_url, &self.wasm_url]
            .iter()
            .all(|field| !field.trim().is_empty())
    }

    /// Expands into the engine-facing configuration with a single model entry.
    pub fn to_app_config(&self) -> AppConfig {
        let mut model_lib_map = BTreeMap::new();
        model_lib_map.insert(self.model_id.clone(), self.wasm_url.clone());

        AppConfig {
            model_list: vec![ModelRecord {
                model_url: self.model_url.clone(),
                local_id: self.model_id.clone(),
            }],
            model_lib_map,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelRecord {
    pub model_url: String,
    pub local_id: String,
}

/// Engine configuration: the models it may load and the kernel library for each.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AppConfig {
    pub model_list: Vec<ModelRecord>,
    pub model_lib_map: BTreeMap<String, String>,
}

impl AppConfig {
    pub fn model(&self, local_id: &str) -> Option<&ModelRecord> {
        self.model_list
            .iter()
            .find(|record| record.local_id == local_id)
    }

    pub fn model_lib(&self, local_id: &str) -> Option<&str> {
        self.model_lib_map.get(local_id).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn app_config_maps_model_to_its_library() {
        let config = ModelConfig::new(
            "vicuna-v1-7b-q4f32_0",
            "https://models.example/vicuna/",
            "https://kernels.example/vicuna-webgpu.wasm",
        );
        let app_config = config.to_app_config();

        let record = app_config.model("vicuna-v1-7b-q4f32_0").expect("model entry");
        assert_eq!(record.model_url, "https://models.example/vicuna/");
        assert_eq!(
            app_config.model_lib("vicuna-v1-7b-q4f32_0"),
            Some("https://kernels.example/vicuna-webgpu.wasm")
        );
        assert!(app_config.model("other").is_none());
    }

    #[test]
    fn blank_fields_make_config_incomplete() {
        assert!(ModelConfig::new("id", "url", "lib").is_complete());
        assert!(!ModelConfig::new("id", " ", "lib").is_complete());
        assert!(!ModelConfig::new("", "url", "lib").is_complete());
    }

    #[test]
    fn model_config_uses_camel_case_on_the_wire() {
        let value = serde_json::to_value(ModelConfig::new("a", "b", "c")).expect("serialize");
        assert_eq!(value["modelId"], "a");
        assert_eq!(value["modelUrl"], "b");
        assert_eq!(value["wasmUrl"], "c");
    }
}
