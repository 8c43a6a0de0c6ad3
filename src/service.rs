//! Serving façade over the inference host and the pressure monitor

use crate::error::Result;
use crate::memory::{PressureAction, PressureMonitor};
use crate::metrics::ServingMetrics;
use crate::models::host::{InferenceHost, ModelState, Prediction};
use serde::Serialize;
use std::sync::Arc;
use tracing::debug;

/// Health snapshot; memory fields are `None` when the platform cannot report them
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct HealthReport {
    pub status: &'static str,
    pub memory_usage_percent: Option<f64>,
    pub memory_available_bytes: Option<u64>,
    pub model_state: ModelState,
}

/// Entry point used by the transport layer.
///
/// Every mutating call is followed by a memory pressure check.
pub struct ClassifierService {
    host: Arc<InferenceHost>,
    monitor: PressureMonitor,
    metrics: Option<Arc<ServingMetrics>>,
}

impl ClassifierService {
    pub fn new(host: Arc<InferenceHost>, monitor: PressureMonitor) -> Self {
        Self {
            host,
            monitor,
            metrics: None,
        }
    }

    /// Count pressure evictions in `metrics`
    pub fn with_metrics(mut self, metrics: Arc<ServingMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn host(&self) -> &InferenceHost {
        &self.host
    }

    /// Classify an encoded image.
    pub fn predict(&self, image_bytes: &[u8]) -> Result<Prediction> {
        let result = self.host.predict(image_bytes);
        self.after_request();
        result
    }

    /// Evict the model on request. Idempotent.
    pub fn clear_model(&self) {
        self.host.clear();
        self.after_request();
    }

    /// Read-only status report
    pub fn health(&self) -> HealthReport {
        let sample = self.monitor.sample();
        HealthReport {
            status: "healthy",
            memory_usage_percent: sample.map(|s| s.percent_used),
            memory_available_bytes: sample.map(|s| s.available_bytes),
            model_state: self.host.state(),
        }
    }

    /// Run the pressure policy once. Exposed for periodic callers.
    pub fn after_request(&self) -> PressureAction {
        let action = self.monitor.check_and_evict(&self.host);
        debug!(action = ?action, "Pressure check");
        if let Some(metrics) = &self.metrics {
            metrics.record_pressure(&action);
        }
        action
    }
}
