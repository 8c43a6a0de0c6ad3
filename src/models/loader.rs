//! Safetensors weight loader

use crate::error::{Result, ServeError};
use crate::models::architecture::{Architecture, ParameterSpec};
use crate::preprocess::NormalizedTensor;
use candle_core::{DType, Device, Module, Tensor};
use candle_nn::{Func, VarBuilder};
use serde::Deserialize;
use std::collections::{HashMap, HashSet};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info};

/// Largest safetensors header we are willing to parse when probing
const MAX_HEADER_BYTES: u64 = 16 * 1024 * 1024;

/// How many offending names to list in a mismatch error
const REPORTED_NAMES: usize = 5;

/// Numeric representation of the resident weights
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    F32,
    #[default]
    F16,
    Bf16,
}

impl Precision {
    pub fn dtype(&self) -> DType {
        match self {
            Precision::F32 => DType::F32,
            Precision::F16 => DType::F16,
            Precision::Bf16 => DType::BF16,
        }
    }
}

/// A loaded, inference-only classifier
pub trait ImageClassifier: Send {
    /// Raw class scores for one normalized image
    fn forward(&self, input: &NormalizedTensor) -> Result<Vec<f32>>;

    /// Number of scores `forward` returns
    fn num_classes(&self) -> usize;
}

/// Loaded model with metadata
pub struct LoadedModel {
    /// Model name for logs
    pub name: String,
    /// The classifier itself
    pub classifier: Box<dyn ImageClassifier>,
    /// Bytes held by the weights after precision conversion
    pub resident_bytes: usize,
}

impl std::fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedModel")
            .field("name", &self.name)
            .field("num_classes", &self.classifier.num_classes())
            .field("resident_bytes", &self.resident_bytes)
            .finish()
    }
}

/// Source of model instances for the inference host
pub trait WeightLoader: Send + Sync {
    /// Load a complete model. Must not leave partial state behind on error.
    fn load(&self) -> Result<LoadedModel>;

    /// Output width the model is declared to have
    fn declared_output_width(&self) -> usize;

    /// Output width stored in persistent weights, if it can be read cheaply.
    fn probe_output_width(&self) -> Result<Option<usize>> {
        Ok(None)
    }
}

/// Loads a bottleneck ResNet from a safetensors file
pub struct SafetensorsLoader {
    path: PathBuf,
    architecture: Architecture,
    num_classes: usize,
    precision: Precision,
    device: Device,
}

impl SafetensorsLoader {
    pub fn new<P: AsRef<Path>>(
        path: P,
        architecture: Architecture,
        num_classes: usize,
        precision: Precision,
    ) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            architecture,
            num_classes,
            precision,
            device: Device::Cpu,
        }
    }

    fn read_tensors(&self) -> Result<HashMap<String, Tensor>> {
        if !self.path.exists() {
            return Err(ServeError::WeightLoad(format!(
                "weights file not found: {}",
                self.path.display()
            )));
        }

        candle_core::safetensors::load(&self.path, &self.device).map_err(|e| {
            ServeError::WeightLoad(format!(
                "failed to read weights from {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

impl WeightLoader for SafetensorsLoader {
    fn load(&self) -> Result<LoadedModel> {
        let started = Instant::now();
        info!(
            path = %self.path.display(),
            architecture = %self.architecture,
            precision = ?self.precision,
            "Loading classifier weights"
        );

        let tensors = self.read_tensors()?;

        let found: HashMap<String, Vec<usize>> = tensors
            .iter()
            .map(|(name, t)| (name.clone(), t.dims().to_vec()))
            .collect();
        let expected = self.architecture.parameters(self.num_classes);
        validate_parameters(&found, &expected, &self.architecture.to_string())?;

        let dtype = self.precision.dtype();
        let resident_bytes =
            expected.iter().map(ParameterSpec::elem_count).sum::<usize>() * dtype.size_in_bytes();

        // Full-precision tensors are released when the builder is consumed
        let vb = VarBuilder::from_tensors(tensors, dtype, &self.device);
        let model = self
            .architecture
            .build(self.num_classes, vb)
            .map_err(|e| ServeError::WeightLoad(format!("failed to build model: {}", e)))?;

        info!(
            architecture = %self.architecture,
            classes = self.num_classes,
            resident_mb = resident_bytes / (1024 * 1024),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Classifier loaded"
        );

        Ok(LoadedModel {
            name: self.architecture.to_string(),
            classifier: Box::new(ResnetClassifier {
                model,
                dtype,
                device: self.device.clone(),
                num_classes: self.num_classes,
            }),
            resident_bytes,
        })
    }

    fn declared_output_width(&self) -> usize {
        self.num_classes
    }

    fn probe_output_width(&self) -> Result<Option<usize>> {
        read_leading_dim(&self.path, self.architecture.head_bias_name())
    }
}

/// Check a weights file's tensor table against the architecture.
///
/// Missing names, shape mismatches and unexpected names are all fatal.
/// Batch norm `num_batches_tracked` counters are tolerated.
pub fn validate_parameters(
    found: &HashMap<String, Vec<usize>>,
    expected: &[ParameterSpec],
    architecture: &str,
) -> Result<()> {
    let mut missing = Vec::new();
    let mut mismatched = Vec::new();

    for spec in expected {
        match found.get(&spec.name) {
            None => missing.push(spec.name.clone()),
            Some(shape) if *shape != spec.shape => mismatched.push(format!(
                "{} expected {:?} found {:?}",
                spec.name, spec.shape, shape
            )),
            Some(_) => {}
        }
    }

    let known: HashSet<&str> = expected.iter().map(|s| s.name.as_str()).collect();
    let mut unexpected: Vec<String> = found
        .keys()
        .filter(|name| !known.contains(name.as_str()) && !name.ends_with("num_batches_tracked"))
        .cloned()
        .collect();
    unexpected.sort();
    mismatched.sort();

    if missing.is_empty() && mismatched.is_empty() && unexpected.is_empty() {
        debug!(architecture, parameters = expected.len(), "Weights match architecture");
        return Ok(());
    }

    let mut problems = Vec::new();
    if !mismatched.is_empty() {
        problems.push(format!(
            "{} shape mismatches ({})",
            mismatched.len(),
            summarize(&mismatched)
        ));
    }
    if !missing.is_empty() {
        problems.push(format!("{} missing ({})", missing.len(), summarize(&missing)));
    }
    if !unexpected.is_empty() {
        problems.push(format!(
            "{} unexpected ({})",
            unexpected.len(),
            summarize(&unexpected)
        ));
    }

    Err(ServeError::WeightLoad(format!(
        "weights do not match {}: {}",
        architecture,
        problems.join("; ")
    )))
}

fn summarize(names: &[String]) -> String {
    let mut listed = names
        .iter()
        .take(REPORTED_NAMES)
        .cloned()
        .collect::<Vec<_>>()
        .join(", ");
    if names.len() > REPORTED_NAMES {
        listed.push_str(", ...");
    }
    listed
}

#[derive(Deserialize)]
struct HeaderEntry {
    shape: Vec<usize>,
}

/// Read the leading dimension of one tensor from a safetensors header
/// without reading tensor data. `Ok(None)` when the tensor is absent.
pub fn read_leading_dim(path: &Path, tensor_name: &str) -> Result<Option<usize>> {
    let header_err = |detail: String| {
        ServeError::WeightLoad(format!(
            "unreadable safetensors header in {}: {}",
            path.display(),
            detail
        ))
    };

    let mut file = File::open(path).map_err(|e| header_err(e.to_string()))?;

    let mut len_bytes = [0u8; 8];
    file.read_exact(&mut len_bytes)
        .map_err(|e| header_err(e.to_string()))?;
    let header_len = u64::from_le_bytes(len_bytes);
    if header_len > MAX_HEADER_BYTES {
        return Err(header_err(format!("header length {} too large", header_len)));
    }

    let mut header = vec![0u8; header_len as usize];
    file.read_exact(&mut header)
        .map_err(|e| header_err(e.to_string()))?;

    let entries: HashMap<String, serde_json::Value> =
        serde_json::from_slice(&header).map_err(|e| header_err(e.to_string()))?;

    match entries.get(tensor_name) {
        None => Ok(None),
        Some(value) => {
            let entry: HeaderEntry = serde_json::from_value(value.clone())
                .map_err(|e| header_err(format!("{}: {}", tensor_name, e)))?;
            Ok(entry.shape.first().copied())
        }
    }
}

/// Bottleneck ResNet held at reduced precision
struct ResnetClassifier {
    model: Func<'static>,
    dtype: DType,
    device: Device,
    num_classes: usize,
}

impl ResnetClassifier {
    fn run(&self, input: &NormalizedTensor) -> candle_core::Result<Vec<f32>> {
        let [batch, channels, height, width] = NormalizedTensor::SHAPE;
        let xs = Tensor::from_slice(input.as_slice(), (batch, channels, height, width), &self.device)?
            .to_dtype(self.dtype)?;
        let logits = self.model.forward(&xs)?;
        logits.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()
    }
}

impl ImageClassifier for ResnetClassifier {
    fn forward(&self, input: &NormalizedTensor) -> Result<Vec<f32>> {
        self.run(input)
            .map_err(|e| ServeError::Inference(e.to_string()))
    }

    fn num_classes(&self) -> usize {
        self.num_classes
    }
}
