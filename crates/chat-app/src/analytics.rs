use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};

use serde_json::Value;

pub const INIT_START_EVENT: &str = "init_start_local_llm";
pub const INIT_FINISH_EVENT: &str = "init_finish_local_llm";

pub type AnalyticsParams = BTreeMap<String, Value>;

/// Fire-and-forget event sink.
pub trait AnalyticsSink: Send + Sync {
    fn send(&self, action: &str, params: &AnalyticsParams);
}

/// Writes every event as a `tracing` record on the `hearth::analytics` target.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingAnalytics;

impl AnalyticsSink for TracingAnalytics {
    fn send(&self, action: &str, params: &AnalyticsParams) {
        let params = serde_json::to_string(params).unwrap_or_default();
        tracing::info!(target: "hearth::analytics", action, params = %params, "analytics event");
    }
}

/// Keeps events in memory; handy for inspecting what a session emitted.
#[derive(Debug, Default)]
pub struct RecordingAnalytics {
    events: Mutex<Vec<(String, AnalyticsParams)>>,
}

impl RecordingAnalytics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(String, AnalyticsParams)> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }
}

impl AnalyticsSink for RecordingAnalytics {
    fn send(&self, action: &str, params: &AnalyticsParams) {
        let mut events = match self.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push((action.to_string(), params.clone()));
    }
}

/// Delivers an event without letting a misbehaving sink reach the caller.
pub fn emit(sink: &Arc<dyn AnalyticsSink>, action: &str, params: AnalyticsParams) {
    let delivered = catch_unwind(AssertUnwindSafe(|| sink.send(action, &params)));
    if delivered.is_err() {
        tracing::warn!(action, "analytics sink panicked; event dropped");
    }
}

pub fn model_params(model_url: &str, model_id: &str) -> AnalyticsParams {
    let mut params = AnalyticsParams::new();
    params.insert("modelUrl".to_string(), Value::from(model_url));
    params.insert("modelId".to_string(), Value::from(model_id));
    params
}

#[cfg(test)]
mod tests {
    use super::*;

    struct PanickingSink;

    impl AnalyticsSink for PanickingSink {
        fn send(&self, _action: &str, _params: &AnalyticsParams) {
            panic!("sink exploded");
        }
    }

    #[test]
    fn panicking_sink_is_contained() {
        let sink: Arc<dyn AnalyticsSink> = Arc::new(PanickingSink);
        emit(&sink, INIT_START_EVENT, AnalyticsParams::new());
    }

    #[test]
    fn recording_sink_keeps_order() {
        let recorder = Arc::new(RecordingAnalytics::new());
        let sink: Arc<dyn AnalyticsSink> = recorder.clone();

        emit(&sink, INIT_START_EVENT, model_params("u", "m"));
        emit(&sink, INIT_FINISH_EVENT, model_params("u", "m"));

        let events = recorder.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].0, INIT_START_EVENT);
        assert_eq!(events[1].1["modelId"], Value::from("m"));
    }
}
