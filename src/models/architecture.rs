//! Classifier architecture descriptors
//!
//! Each descriptor knows the exact parameter names and shapes its weights
//! file must contain, so a file can be checked before any model is built.

use candle_nn::{Func, VarBuilder};
use candle_transformers::models::resnet;
use serde::Deserialize;
use std::fmt;

/// Width of the pooled feature vector feeding the `fc` head
const FEATURE_WIDTH: usize = 2048;

/// Bottleneck expansion factor
const EXPANSION: usize = 4;

/// Bottleneck ResNet variants with an N-way linear head
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Resnet50,
    #[default]
    Resnet101,
}

/// Expected tensor in a weights file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParameterSpec {
    pub name: String,
    pub shape: Vec<usize>,
}

impl ParameterSpec {
    fn new(name: impl Into<String>, shape: &[usize]) -> Self {
        Self {
            name: name.into(),
            shape: shape.to_vec(),
        }
    }

    pub fn elem_count(&self) -> usize {
        self.shape.iter().product()
    }
}

impl Architecture {
    /// Bottleneck blocks per stage
    pub fn block_counts(&self) -> [usize; 4] {
        match self {
            Architecture::Resnet50 => [3, 4, 6, 3],
            Architecture::Resnet101 => [3, 4, 23, 3],
        }
    }

    /// Name of the tensor whose leading dimension is the output width
    pub fn head_bias_name(&self) -> &'static str {
        "fc.bias"
    }

    /// Every learned parameter and running statistic, in torchvision naming.
    pub fn parameters(&self, num_classes: usize) -> Vec<ParameterSpec> {
        let mut params = Vec::new();

        params.push(ParameterSpec::new("conv1.weight", &[64, 3, 7, 7]));
        push_batch_norm(&mut params, "bn1", 64);

        let mut in_channels = 64;
        for (stage, (&blocks, planes)) in self
            .block_counts()
            .iter()
            .zip([64usize, 128, 256, 512])
            .enumerate()
        {
            let out_channels = planes * EXPANSION;
            for block in 0..blocks {
                let prefix = format!("layer{}.{}", stage + 1, block);

                params.push(ParameterSpec::new(
                    format!("{prefix}.conv1.weight"),
                    &[planes, in_channels, 1, 1],
                ));
                push_batch_norm(&mut params, &format!("{prefix}.bn1"), planes);

                params.push(ParameterSpec::new(
                    format!("{prefix}.conv2.weight"),
                    &[planes, planes, 3, 3],
                ));
                push_batch_norm(&mut params, &format!("{prefix}.bn2"), planes);

                params.push(ParameterSpec::new(
                    format!("{prefix}.conv3.weight"),
                    &[out_channels, planes, 1, 1],
                ));
                push_batch_norm(&mut params, &format!("{prefix}.bn3"), out_channels);

                // First block of each stage changes width or stride
                if block == 0 {
                    params.push(ParameterSpec::new(
                        format!("{prefix}.downsample.0.weight"),
                        &[out_channels, in_channels, 1, 1],
                    ));
                    push_batch_norm(&mut params, &format!("{prefix}.downsample.1"), out_channels);
                }

                in_channels = out_channels;
            }
        }

        params.push(ParameterSpec::new("fc.weight", &[num_classes, FEATURE_WIDTH]));
        params.push(ParameterSpec::new("fc.bias", &[num_classes]));

        params
    }

    /// Build the inference graph from already validated weights.
    pub fn build(
        &self,
        num_classes: usize,
        vb: VarBuilder<'static>,
    ) -> candle_core::Result<Func<'static>> {
        match self {
            Architecture::Resnet50 => resnet::resnet50(num_classes, vb),
            Architecture::Resnet101 => resnet::resnet101(num_classes, vb),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::Resnet50 => write!(f, "resnet50"),
            Architecture::Resnet101 => write!(f, "resnet101"),
        }
    }
}

fn push_batch_norm(params: &mut Vec<ParameterSpec>, prefix: &str, channels: usize) {
    for suffix in ["weight", "bias", "running_mean", "running_var"] {
        params.push(ParameterSpec::new(format!("{prefix}.{suffix}"), &[channels]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_parameter_counts() {
        // 25.6M and 44.5M parameters including the 1000-way ImageNet head,
        // plus batch norm running statistics
        let learned = |arch: Architecture| -> usize {
            arch.parameters(1000)
                .iter()
                .filter(|p| !p.name.contains("running_"))
                .map(ParameterSpec::elem_count)
                .sum()
        };
        assert_eq!(learned(Architecture::Resnet50), 25_557_032);
        assert_eq!(learned(Architecture::Resnet101), 44_549_160);
    }

    #[test]
    fn test_built_graph_outlives_builder_scope() {
        use candle_core::{DType, Device, Module, Tensor};

        let graph: Func<'static> = {
            let vb = VarBuilder::zeros(DType::F32, &Device::Cpu);
            Architecture::Resnet50.build(10, vb).unwrap()
        };

        let input = Tensor::zeros((1, 3, 32, 32), DType::F32, &Device::Cpu).unwrap();
        let logits = graph.forward(&input).unwrap();
        assert_eq!(logits.dims(), &[1, 10]);
    }

    #[test]
    fn test_names_are_unique() {
        let params = Architecture::Resnet101.parameters(196);
        let names: HashSet<&str> = params.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names.len(), params.len());
    }

    #[test]
    fn test_head_shape() {
        let params = Architecture::Resnet50.parameters(196);
        let fc = params.iter().find(|p| p.name == "fc.weight").unwrap();
        assert_eq!(fc.shape, vec![196, 2048]);
        let bias = params
            .iter()
            .find(|p| p.name == Architecture::Resnet50.head_bias_name())
            .unwrap();
        assert_eq!(bias.shape, vec![196]);
    }

    #[test]
    fn test_downsample_only_on_first_block() {
        let params = Architecture::Resnet50.parameters(10);
        let downsamples = params
            .iter()
            .filter(|p| p.name.ends_with("downsample.0.weight"))
            .count();
        assert_eq!(downsamples, 4);
        assert!(params.iter().any(|p| p.name == "layer1.0.downsample.0.weight"
            && p.shape == vec![256, 64, 1, 1]));
        assert!(!params.iter().any(|p| p.name == "layer3.22.conv2.weight"));
        assert!(Architecture::Resnet101
            .parameters(10)
            .iter()
            .any(|p| p.name == "layer3.22.conv2.weight"));
    }

    #[test]
    fn test_deserialize() {
        #[derive(Deserialize)]
        struct Wrapper {
            arch: Architecture,
        }
        let w: Wrapper = serde_json::from_str(r#"{"arch": "resnet50"}"#).unwrap();
        assert_eq!(w.arch, Architecture::Resnet50);
        assert_eq!(w.arch.to_string(), "resnet50");
    }
}
