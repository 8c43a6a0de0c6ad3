//! Classifier model lifecycle

pub mod architecture;
pub mod host;
pub mod loader;

pub use architecture::Architecture;
pub use host::{InferenceHost, ModelState, Prediction};
pub use loader::{Precision, SafetensorsLoader, WeightLoader};
