//! Configuration management for the classifier service

use crate::memory::DEFAULT_PRESSURE_THRESHOLD;
use crate::models::architecture::Architecture;
use crate::models::loader::Precision;
use anyhow::{Context, Result};
use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Main application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub nats: NatsConfig,
    pub model: ModelConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    pub pipeline: PipelineConfig,
    pub logging: LoggingConfig,
}

/// NATS connection configuration
#[derive(Debug, Clone, Deserialize)]
pub struct NatsConfig {
    /// NATS server URL
    pub url: String,
    /// Subject receiving raw image bytes
    pub predict_subject: String,
    /// Subject answering health probes
    pub health_subject: String,
    /// Subject triggering a manual model eviction
    pub clear_subject: String,
    /// Queue group for the predict subject; replicas in one group share the load.
    /// Health and clear requests always reach every replica.
    #[serde(default)]
    pub queue_group: Option<String>,
}

/// Classifier configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Safetensors weights file
    pub weights_path: PathBuf,
    /// JSON class manifest
    pub labels_path: PathBuf,
    /// Backbone variant the weights were trained with
    #[serde(default)]
    pub architecture: Architecture,
    /// Declared output width of the classification head
    #[serde(default = "default_num_classes")]
    pub num_classes: usize,
    /// Resident precision of the weights
    #[serde(default)]
    pub precision: Precision,
    /// Load the model at startup instead of on first request
    #[serde(default)]
    pub warm_up: bool,
}

fn default_num_classes() -> usize {
    196
}

/// Memory pressure policy
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    /// Evict the model when system memory use exceeds this percentage
    #[serde(default = "default_pressure_threshold")]
    pub pressure_threshold_percent: f64,
}

fn default_pressure_threshold() -> f64 {
    DEFAULT_PRESSURE_THRESHOLD
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            pressure_threshold_percent: DEFAULT_PRESSURE_THRESHOLD,
        }
    }
}

/// Request handling configuration
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Maximum predictions in flight
    pub workers: usize,
    /// Seconds between metrics summaries, 0 disables
    #[serde(default = "default_metrics_interval")]
    pub metrics_interval_secs: u64,
}

fn default_metrics_interval() -> u64 {
    60
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,
    /// Log format (json, pretty)
    pub format: String,
}

impl AppConfig {
    /// Load configuration from the default file plus `SPOTR__*` overrides
    pub fn load() -> Result<Self> {
        Self::load_from_path("config/config.toml")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config = Config::builder()
            .add_source(File::from(path.as_ref()))
            .add_source(Environment::with_prefix("SPOTR").separator("__"))
            .build()
            .context("Failed to build configuration")?;

        let config: Self = config
            .try_deserialize()
            .context("Failed to deserialize configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the service cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.workers == 0 {
            anyhow::bail!("pipeline.workers must be at least 1");
        }
        if self.model.num_classes == 0 {
            anyhow::bail!("model.num_classes must be at least 1");
        }
        if matches!(self.nats.queue_group.as_deref(), Some(group) if group.trim().is_empty()) {
            anyhow::bail!("nats.queue_group must not be blank, omit it to disable queueing");
        }
        let threshold = self.memory.pressure_threshold_percent;
        if !(0.0..=100.0).contains(&threshold) {
            anyhow::bail!(
                "memory.pressure_threshold_percent must be within 0..=100, got {}",
                threshold
            );
        }
        Ok(())
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            nats: NatsConfig {
                url: "nats://localhost:4222".to_string(),
                predict_subject: "spotr.predict".to_string(),
                health_subject: "spotr.health".to_string(),
                clear_subject: "spotr.clear-cache".to_string(),
                queue_group: Some("spotr-workers".to_string()),
            },
            model: ModelConfig {
                weights_path: PathBuf::from("models/spotr_weights.safetensors"),
                labels_path: PathBuf::from("models/class_names.json"),
                architecture: Architecture::Resnet101,
                num_classes: default_num_classes(),
                precision: Precision::F16,
                warm_up: false,
            },
            memory: MemoryConfig::default(),
            pipeline: PipelineConfig {
                workers: 2,
                metrics_interval_secs: default_metrics_interval(),
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                format: "pretty".to_string(),
            },
        }
    }
}
