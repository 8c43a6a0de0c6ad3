//! Request metrics and periodic summaries for the classifier service.

use crate::memory::PressureAction;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tracing::info;

/// Latency samples kept before the oldest half is discarded
const LATENCY_WINDOW: usize = 10_000;

/// Metrics collector for the serving loop
pub struct ServingMetrics {
    /// Successful predictions
    pub predictions_served: AtomicU64,
    /// Failed predictions
    pub predictions_failed: AtomicU64,
    /// Pressure-triggered evictions
    pub pressure_evictions: AtomicU64,
    /// Failures by error kind
    failures_by_kind: RwLock<HashMap<&'static str, u64>>,
    /// Predictions by label
    labels_served: RwLock<HashMap<String, u64>>,
    /// Prediction latencies (in microseconds)
    latencies: RwLock<Vec<u64>>,
    /// Start time for rate calculation
    start_time: Instant,
}

impl ServingMetrics {
    pub fn new() -> Self {
        Self {
            predictions_served: AtomicU64::new(0),
            predictions_failed: AtomicU64::new(0),
            pressure_evictions: AtomicU64::new(0),
            failures_by_kind: RwLock::new(HashMap::new()),
            labels_served: RwLock::new(HashMap::new()),
            latencies: RwLock::new(Vec::with_capacity(1000)),
            start_time: Instant::now(),
        }
    }

    /// Record a successful prediction
    pub fn record_prediction(&self, latency: Duration, label: &str) {
        self.predictions_served.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);

        if let Ok(mut labels) = self.labels_served.write() {
            *labels.entry(label.to_string()).or_insert(0) += 1;
        }
    }

    /// Record a failed prediction
    pub fn record_failure(&self, latency: Duration, kind: &'static str) {
        self.predictions_failed.fetch_add(1, Ordering::Relaxed);
        self.record_latency(latency);

        if let Ok(mut by_kind) = self.failures_by_kind.write() {
            *by_kind.entry(kind).or_insert(0) += 1;
        }
    }

    /// Record the outcome of a pressure check
    pub fn record_pressure(&self, action: &PressureAction) {
        if matches!(action, PressureAction::Evicted(_)) {
            self.pressure_evictions.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_latency(&self, latency: Duration) {
        if let Ok(mut times) = self.latencies.write() {
            times.push(latency.as_micros() as u64);
            if times.len() > LATENCY_WINDOW {
                times.drain(0..LATENCY_WINDOW / 2);
            }
        }
    }

    /// Latency statistics over the retained window
    pub fn latency_stats(&self) -> LatencyStats {
        let Ok(times) = self.latencies.read() else {
            return LatencyStats::default();
        };
        if times.is_empty() {
            return LatencyStats::default();
        }

        let mut sorted = times.clone();
        drop(times);
        sorted.sort_unstable();

        let count = sorted.len();
        let sum: u64 = sorted.iter().sum();
        let pick = |q: f64| sorted[((count as f64 * q) as usize).min(count - 1)];

        LatencyStats {
            count: count as u64,
            mean_us: sum / count as u64,
            p50_us: pick(0.50),
            p95_us: pick(0.95),
            p99_us: pick(0.99),
            max_us: sorted[count - 1],
        }
    }

    /// Most frequently predicted labels, highest first
    pub fn top_labels(&self, n: usize) -> Vec<(String, u64)> {
        let Ok(labels) = self.labels_served.read() else {
            return Vec::new();
        };
        let mut ranked: Vec<(String, u64)> =
            labels.iter().map(|(l, c)| (l.clone(), *c)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(n);
        ranked
    }

    pub fn failures_by_kind(&self) -> HashMap<&'static str, u64> {
        self.failures_by_kind
            .read()
            .map(|m| m.clone())
            .unwrap_or_default()
    }

    /// Requests per second since startup
    pub fn throughput(&self) -> f64 {
        let elapsed = self.start_time.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            let total = self.predictions_served.load(Ordering::Relaxed)
                + self.predictions_failed.load(Ordering::Relaxed);
            total as f64 / elapsed
        } else {
            0.0
        }
    }

    /// Log summary statistics
    pub fn print_summary(&self) {
        let served = self.predictions_served.load(Ordering::Relaxed);
        let failed = self.predictions_failed.load(Ordering::Relaxed);
        let evictions = self.pressure_evictions.load(Ordering::Relaxed);
        let latency = self.latency_stats();

        info!(
            served,
            failed,
            pressure_evictions = evictions,
            throughput = format!("{:.2} req/s", self.throughput()),
            mean_ms = latency.mean_us / 1000,
            p95_ms = latency.p95_us / 1000,
            p99_ms = latency.p99_us / 1000,
            "Serving summary"
        );

        for (kind, count) in self.failures_by_kind() {
            info!(kind, count, "Failures");
        }
        for (label, count) in self.top_labels(5) {
            info!(label = %label, count, "Top prediction");
        }
    }
}

impl Default for ServingMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Latency statistics
#[derive(Debug, Default, Clone, PartialEq)]
pub struct LatencyStats {
    pub count: u64,
    pub mean_us: u64,
    pub p50_us: u64,
    pub p95_us: u64,
    pub p99_us: u64,
    pub max_us: u64,
}

/// Logs a summary at a fixed interval
pub struct MetricsReporter {
    metrics: Arc<ServingMetrics>,
    interval_secs: u64,
}

impl MetricsReporter {
    pub fn new(metrics: Arc<ServingMetrics>, interval_secs: u64) -> Self {
        Self {
            metrics,
            interval_secs,
        }
    }

    /// Start the periodic reporting task
    pub async fn start(self) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.interval_secs));
        // First tick completes immediately
        interval.tick().await;
        loop {
            interval.tick().await;
            self.metrics.print_summary();
        }
    }
}
