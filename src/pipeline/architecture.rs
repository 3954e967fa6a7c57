//! Shape walk over a sequential source architecture.
//!
//! The loader uses it to check every parameter against the layer that owns
//! it; the exporter uses it to size the graph interface.

use std::collections::BTreeMap;

use crate::config::TaskType;
use crate::error::{Error, Result};
use crate::pipeline::source::{LayerKind, ModelConfig};

/// Activation geometry between two layers, batch axis omitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feature {
    /// NCHW image planes
    Image { channels: usize, height: usize, width: usize },
    /// `[batch, features]`
    Flat { features: usize },
    /// Token ids before the embedding
    Tokens,
    /// `[batch, sequence, dim]`
    Sequence { dim: usize },
    /// `[batch, 4 + classes, anchors]`
    Detections { rows: usize, anchors: usize },
}

/// Result of walking an architecture: final feature and expected parameters
#[derive(Debug, Clone, PartialEq)]
pub struct ArchitectureShape {
    pub output: Feature,
    /// `<layer>.<param>` -> expected shape
    pub parameters: BTreeMap<String, Vec<usize>>,
}

fn unsupported(layer: &str, kind: &LayerKind, feature: Feature) -> Error {
    Error::InvalidModel(format!(
        "unsupported architecture: layer '{}' ({:?}) cannot follow {:?}",
        layer, kind, feature
    ))
}

/// Largest vocabulary whose token ids survive the `f32` compute tensors exactly
pub const MAX_VOCAB_SIZE: usize = 1 << 24;

/// Product of config-supplied extents, `InvalidModel` on overflow
pub fn checked_extent(dims: &[usize], what: &str) -> Result<usize> {
    dims.iter()
        .try_fold(1usize, |acc, d| acc.checked_mul(*d))
        .ok_or_else(|| Error::InvalidModel(format!("{}: extent {:?} overflows", what, dims)))
}

fn window_extent(input: usize, kernel: usize, stride: usize, padding: usize, layer: &str) -> Result<usize> {
    if kernel == 0 || stride == 0 || input + 2 * padding < kernel {
        return Err(Error::InvalidModel(format!(
            "layer '{}': window {} with stride {} does not fit extent {}",
            layer, kernel, stride, input
        )));
    }
    Ok((input + 2 * padding - kernel) / stride + 1)
}

/// Walk the layers of `config` for a detection model with `num_classes`
/// classes, or a text model with the configured vocabulary
pub fn walk(config: &ModelConfig, num_classes: usize) -> Result<ArchitectureShape> {
    let mut feature = match config.task {
        TaskType::ObjectDetection => {
            let size = config.image_size();
            Feature::Image {
                channels: config.channels(),
                height: size,
                width: size,
            }
        }
        TaskType::TextGeneration => Feature::Tokens,
    };
    let mut parameters = BTreeMap::new();
    let mut param = |layer: &str, name: &str, shape: Vec<usize>| {
        parameters.insert(format!("{}.{}", layer, name), shape);
    };

    for layer in &config.layers {
        let name = layer.name.as_str();
        feature = match (&layer.kind, feature) {
            (
                LayerKind::Conv2d { out_channels, kernel, stride, padding },
                Feature::Image { channels, height, width },
            ) => {
                param(name, "weight", vec![*out_channels, channels, *kernel, *kernel]);
                param(name, "bias", vec![*out_channels]);
                Feature::Image {
                    channels: *out_channels,
                    height: window_extent(height, *kernel, *stride, *padding, name)?,
                    width: window_extent(width, *kernel, *stride, *padding, name)?,
                }
            }
            (LayerKind::Relu | LayerKind::Sigmoid | LayerKind::Tanh | LayerKind::Gelu, f)
                if f != Feature::Tokens =>
            {
                f
            }
            (LayerKind::MaxPool { kernel, stride }, Feature::Image { channels, height, width }) => {
                let stride = stride.unwrap_or(*kernel);
                Feature::Image {
                    channels,
                    height: window_extent(height, *kernel, stride, 0, name)?,
                    width: window_extent(width, *kernel, stride, 0, name)?,
                }
            }
            (LayerKind::GlobalAvgPool, Feature::Image { channels, .. }) => Feature::Image {
                channels,
                height: 1,
                width: 1,
            },
            (LayerKind::Flatten, Feature::Image { channels, height, width }) => Feature::Flat {
                features: checked_extent(&[channels, height, width], name)?,
            },
            (LayerKind::Flatten, f @ Feature::Flat { .. }) => f,
            (LayerKind::Dense { units }, Feature::Flat { features }) => {
                param(name, "weight", vec![features, *units]);
                param(name, "bias", vec![*units]);
                Feature::Flat { features: *units }
            }
            (LayerKind::Dense { units }, Feature::Sequence { dim }) => {
                param(name, "weight", vec![dim, *units]);
                param(name, "bias", vec![*units]);
                Feature::Sequence { dim: *units }
            }
            (LayerKind::DetectionHead, Feature::Image { channels, height, width }) => {
                if num_classes == 0 {
                    return Err(Error::InvalidModel(format!(
                        "layer '{}': detection head needs a non-empty class map",
                        name
                    )));
                }
                let rows = 4 + num_classes;
                param(name, "weight", vec![rows, channels, 1, 1]);
                param(name, "bias", vec![rows]);
                Feature::Detections {
                    rows,
                    anchors: checked_extent(&[height, width], name)?,
                }
            }
            (LayerKind::Embedding { dim }, Feature::Tokens) => {
                let vocab = config.vocab_size.unwrap_or(0);
                if vocab == 0 {
                    return Err(Error::InvalidModel(format!(
                        "layer '{}': embedding needs vocab_size in config.json",
                        name
                    )));
                }
                if vocab > MAX_VOCAB_SIZE {
                    return Err(Error::InvalidModel(format!(
                        "layer '{}': vocab_size {} exceeds {}, token ids would not be exact",
                        name, vocab, MAX_VOCAB_SIZE
                    )));
                }
                param(name, "weight", vec![vocab, *dim]);
                Feature::Sequence { dim: *dim }
            }
            (LayerKind::AttentionMask, f @ Feature::Sequence { .. }) => f,
            (LayerKind::LayerNorm { .. }, f @ Feature::Sequence { dim: width })
            | (LayerKind::LayerNorm { .. }, f @ Feature::Flat { features: width }) => {
                param(name, "weight", vec![width]);
                param(name, "bias", vec![width]);
                f
            }
            // Lowering decides whether a custom block is usable
            (LayerKind::Custom { .. }, f) => f,
            (kind, f) => return Err(unsupported(name, kind, f)),
        };
    }

    match (config.task, feature) {
        (TaskType::ObjectDetection, Feature::Detections { .. }) => {}
        (TaskType::TextGeneration, Feature::Sequence { dim }) => {
            let vocab = config.vocab_size.unwrap_or(0);
            if dim != vocab {
                return Err(Error::InvalidModel(format!(
                    "incompatible logits width {} for vocabulary of {}",
                    dim, vocab
                )));
            }
        }
        (task, f) => {
            return Err(Error::InvalidModel(format!(
                "unsupported architecture: {} model ends in {:?}",
                task, f
            )))
        }
    }

    Ok(ArchitectureShape {
        output: feature,
        parameters,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(json: &str) -> ModelConfig {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn detector_walk_sizes_head_from_classes() {
        let config = config(
            r#"{"task": "object-detection", "image_size": 64, "layers": [
                {"name": "stem", "kind": "conv2d", "out_channels": 8, "kernel": 4, "stride": 4},
                {"name": "act", "kind": "relu"},
                {"name": "pool", "kind": "max_pool", "kernel": 2},
                {"name": "head", "kind": "detection_head"}]}"#,
        );
        let shape = walk(&config, 13).unwrap();
        assert_eq!(shape.output, Feature::Detections { rows: 17, anchors: 64 });
        assert_eq!(shape.parameters["stem.weight"], vec![8, 3, 4, 4]);
        assert_eq!(shape.parameters["head.weight"], vec![17, 8, 1, 1]);
    }

    #[test]
    fn text_walk_requires_vocab_sized_logits() {
        let mut config = config(
            r#"{"task": "text-generation", "vocab_size": 32, "layers": [
                {"name": "embed", "kind": "embedding", "dim": 8},
                {"name": "mask", "kind": "attention_mask"},
                {"name": "norm", "kind": "layer_norm"},
                {"name": "lm_head", "kind": "dense", "units": 32}]}"#,
        );
        let shape = walk(&config, 0).unwrap();
        assert_eq!(shape.parameters["embed.weight"], vec![32, 8]);
        assert_eq!(shape.parameters["norm.bias"], vec![8]);

        config.vocab_size = Some(40);
        assert!(walk(&config, 0).is_err());
    }

    #[test]
    fn oversized_geometry_is_rejected() {
        let config = config(
            r#"{"task": "object-detection", "image_size": 4294967296, "layers": [
                {"name": "flat", "kind": "flatten"}]}"#,
        );
        let message = walk(&config, 2).unwrap_err().to_string();
        assert!(message.contains("overflows"), "{}", message);

        let config = self::config(
            r#"{"task": "text-generation", "vocab_size": 16777217, "layers": [
                {"name": "embed", "kind": "embedding", "dim": 4}]}"#,
        );
        let message = walk(&config, 0).unwrap_err().to_string();
        assert!(message.contains("would not be exact"), "{}", message);
    }

    #[test]
    fn misplaced_layer_is_unsupported() {
        let config = config(
            r#"{"task": "object-detection", "image_size": 32, "layers": [
                {"name": "embed", "kind": "embedding", "dim": 8}]}"#,
        );
        let message = walk(&config, 2).unwrap_err().to_string();
        assert!(message.contains("unsupported architecture"));
    }
}
