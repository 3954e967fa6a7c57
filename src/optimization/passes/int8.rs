use std::collections::{HashMap, HashSet};
use std::time::Instant;

use log::debug;
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::execution::{ExecutionEngine, ExecutionOptions};
use crate::model::{DataType, Node, OnnxModel, Tensor};
use crate::ops::tensor::{saturate_round, Tensor as RuntimeTensor};
use crate::optimization::graph_optimizer::{OptimizationPass, PassResult};
use crate::optimization::passes::float16::MIN_QUANTIZED_ELEMENTS;
use crate::parser::GraphBuilder;

/// Operators whose activation input gets a quantize/dequantize pair
const QUANTIZED_CONSUMERS: [&str; 3] = ["Conv", "MatMul", "Gemm"];

/// Static QDQ int8 quantization
///
/// Weights become symmetric per-tensor int8 with a `DequantizeLinear` in
/// front of their consumers. Activations feeding `Conv`, `MatMul` and `Gemm`
/// are wrapped in uint8 `QuantizeLinear`/`DequantizeLinear` pairs whose scale
/// and zero point come from the observed calibration range.
pub struct Int8Quantization {
    calibration: Vec<HashMap<String, RuntimeTensor>>,
}

/// Uint8 affine parameters of one activation
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ActivationParams {
    pub scale: f32,
    pub zero_point: u8,
}

impl ActivationParams {
    /// Parameters covering `[min, max]` and zero
    pub fn from_range(min: f32, max: f32) -> Option<Self> {
        if !min.is_finite() || !max.is_finite() {
            return None;
        }
        let lo = min.min(0.0);
        let hi = max.max(0.0);
        let scale = (hi - lo) / 255.0;
        if !(scale > f32::EPSILON) {
            return None;
        }
        Some(Self {
            scale,
            zero_point: saturate_round::<u8>(-lo / scale) as u8,
        })
    }
}

/// Symmetric int8 parameters: scale = max|w| / 127
pub fn quantize_weights(values: &[f32]) -> (Vec<i8>, f32) {
    let max_abs = values.iter().fold(0.0f32, |m, v| m.max(v.abs()));
    let scale = if max_abs > 0.0 { max_abs / 127.0 } else { 1.0 };
    let quantized = values
        .iter()
        .map(|v| saturate_round::<i8>(v / scale) as i8)
        .collect();
    (quantized, scale)
}

impl Int8Quantization {
    pub fn new(calibration: Vec<HashMap<String, RuntimeTensor>>) -> Self {
        Self { calibration }
    }

    /// Activation tensors to be wrapped, in graph order
    fn activation_targets(model: &OnnxModel) -> Vec<String> {
        let mut seen = HashSet::new();
        model
            .graph
            .nodes
            .iter()
            .filter(|n| QUANTIZED_CONSUMERS.contains(&n.op_type.as_str()))
            .filter_map(|n| n.inputs.first())
            .filter(|name| !model.graph.is_initializer(name))
            .filter(|name| seen.insert(name.to_string()))
            .cloned()
            .collect()
    }

    /// Observed min/max of each target over the calibration set
    fn collect_ranges(&self, model: &OnnxModel, targets: &[String]) -> Result<HashMap<String, (f32, f32)>> {
        let options = ExecutionOptions::new().keep_intermediates(true);
        let engine = ExecutionEngine::prepared(model.clone(), options)?;

        self.calibration
            .par_iter()
            .map(|sample| -> Result<HashMap<String, (f32, f32)>> {
                let context = engine.run_with_context(sample.clone())?;
                let mut ranges = HashMap::new();
                for target in targets {
                    let tensor = context.get_tensor(target)?;
                    let range = tensor
                        .data
                        .iter()
                        .fold((f32::INFINITY, f32::NEG_INFINITY), |(lo, hi), v| {
                            (lo.min(*v), hi.max(*v))
                        });
                    ranges.insert(target.clone(), range);
                }
                Ok(ranges)
            })
            .try_reduce(HashMap::new, |mut merged, ranges| {
                for (name, (lo, hi)) in ranges {
                    let entry = merged.entry(name).or_insert((f32::INFINITY, f32::NEG_INFINITY));
                    entry.0 = entry.0.min(lo);
                    entry.1 = entry.1.max(hi);
                }
                Ok(merged)
            })
    }

    fn quantize_initializers(model: &mut OnnxModel) -> Result<Vec<Node>> {
        let mut dequantizers = Vec::new();
        let mut extra = Vec::new();

        for initializer in model.graph.initializers.iter_mut() {
            if initializer.data_type != DataType::Float
                || initializer.element_count() < MIN_QUANTIZED_ELEMENTS
            {
                continue;
            }
            let original = initializer.name.clone();
            let (quantized, scale) = quantize_weights(&initializer.to_f32_vec()?);

            let q_name = format!("{}_quantized", original);
            let scale_name = format!("{}_scale", original);
            let zp_name = format!("{}_zero_point", original);
            *initializer = Tensor::from_i8(q_name.clone(), initializer.dims.clone(), &quantized);
            extra.push(Tensor::from_f32(scale_name.clone(), vec![], &[scale]));
            extra.push(Tensor::from_i8(zp_name.clone(), vec![], &[0]));

            dequantizers.push(Node::new(
                format!("{}_dequantize", original),
                "DequantizeLinear",
                vec![q_name, scale_name, zp_name],
                vec![original],
            ));
        }

        model.graph.initializers.extend(extra);
        Ok(dequantizers)
    }

    fn wrap_activations(
        &self,
        model: &mut OnnxModel,
        targets: &[String],
        ranges: &HashMap<String, (f32, f32)>,
    ) -> Result<Vec<Node>> {
        let mut nodes = Vec::new();
        for target in targets {
            let (min, max) = ranges.get(target).copied().unwrap_or((f32::NAN, f32::NAN));
            let params = ActivationParams::from_range(min, max).ok_or_else(|| {
                Error::OptimizationFailure {
                    pass: "Int8Quantization".to_string(),
                    reason: format!("degenerate calibration range [{}, {}] for {}", min, max, target),
                }
            })?;
            debug!(
                "Activation {}: range [{}, {}], scale {}, zero point {}",
                target, min, max, params.scale, params.zero_point
            );

            let scale_name = format!("{}_scale", target);
            let zp_name = format!("{}_zero_point", target);
            let quantized = format!("{}_quantized", target);
            let dequantized = format!("{}_dequantized", target);
            model
                .graph
                .initializers
                .push(Tensor::from_f32(scale_name.clone(), vec![], &[params.scale]));
            model
                .graph
                .initializers
                .push(Tensor::from_u8(zp_name.clone(), vec![], &[params.zero_point]));

            for node in model.graph.nodes.iter_mut() {
                if QUANTIZED_CONSUMERS.contains(&node.op_type.as_str())
                    && node.inputs.first() == Some(target)
                {
                    node.inputs[0] = dequantized.clone();
                }
            }

            nodes.push(Node::new(
                format!("{}_quantize", target),
                "QuantizeLinear",
                vec![target.clone(), scale_name.clone(), zp_name.clone()],
                vec![quantized.clone()],
            ));
            nodes.push(Node::new(
                format!("{}_dequantize", target),
                "DequantizeLinear",
                vec![quantized, scale_name, zp_name],
                vec![dequantized],
            ));
        }
        Ok(nodes)
    }
}

impl OptimizationPass for Int8Quantization {
    fn name(&self) -> &str {
        "Int8Quantization"
    }

    fn run(&self, model: &mut OnnxModel) -> Result<PassResult> {
        let start_time = Instant::now();
        if self.calibration.is_empty() {
            return Err(Error::Config(
                "int8 quantization requires a calibration set".to_string(),
            ));
        }

        let targets = Self::activation_targets(model);
        let ranges = self.collect_ranges(model, &targets)?;

        let mut inserted = self.wrap_activations(model, &targets, &ranges)?;
        inserted.extend(Self::quantize_initializers(model)?);
        let count = inserted.len();

        model.graph.nodes.extend(inserted);
        model.graph.renumber();
        model.graph.nodes = GraphBuilder::topological_sort(&model.graph.nodes)?;
        model.graph.renumber();

        Ok(PassResult {
            name: self.name().to_string(),
            optimizations_applied: count,
            duration: start_time.elapsed(),
            changed: count > 0,
        })
    }

    fn dependencies(&self) -> Vec<&str> {
        vec!["DeadNodeElimination"]
    }
}
