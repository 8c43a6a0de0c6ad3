//! SpotR classifier serving core
//!
//! A memory-constrained, lazily initialized car classifier host. The model is
//! loaded on first use, evicted on request or under memory pressure, and
//! served over NATS request/reply.

pub mod config;
pub mod consumer;
pub mod error;
pub mod labels;
pub mod memory;
pub mod metrics;
pub mod models;
pub mod preprocess;
pub mod producer;
pub mod service;
pub mod types;

pub use config::AppConfig;
pub use error::{Result, ServeError};
pub use labels::{CarDescriptor, ClassLabelTable};
pub use memory::{MemorySample, MemorySampler, PressureAction, PressureMonitor};
pub use models::host::{InferenceHost, ModelState, Prediction};
pub use models::loader::{ImageClassifier, LoadedModel, SafetensorsLoader, WeightLoader};
pub use preprocess::{ImageNormalizer, NormalizedTensor};
pub use service::{ClassifierService, HealthReport};
