//! In-memory forward pass of a source model.
//!
//! This is the ground truth the validator compares exported graphs against,
//! so it works on the layer list and weights directly and shares no code
//! with the graph interpreter.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, Array3, Array4, ArrayD, Axis, Ix1, Ix2, Ix4, IxDyn};

use crate::config::TaskType;
use crate::error::{Error, Result};
use crate::pipeline::sample::SampleInput;
use crate::pipeline::source::{self, LayerKind, SourceModel};

fn exec(context: &str, e: impl std::fmt::Display) -> Error {
    Error::ExecutionError(format!("reference {}: {}", context, e))
}

fn param<D: ndarray::Dimension>(model: &SourceModel, layer: &str, name: &str) -> Result<ndarray::Array<f32, D>> {
    model
        .weight(layer, name)?
        .clone()
        .into_dimensionality::<D>()
        .map_err(|e| exec(layer, e))
}

fn conv2d(x: &Array4<f32>, w: &Array4<f32>, b: &Array1<f32>, stride: usize, padding: usize) -> Array4<f32> {
    let (batch, channels, height, width) = x.dim();
    let (out_channels, _, kernel, _) = w.dim();
    let oh = (height + 2 * padding - kernel) / stride + 1;
    let ow = (width + 2 * padding - kernel) / stride + 1;

    let mut out = Array4::<f32>::zeros((batch, out_channels, oh, ow));
    for n in 0..batch {
        for o in 0..out_channels {
            for oy in 0..oh {
                for ox in 0..ow {
                    let mut acc = b[o];
                    for c in 0..channels {
                        for ky in 0..kernel {
                            let iy = (oy * stride + ky) as isize - padding as isize;
                            if iy < 0 || iy >= height as isize {
                                continue;
                            }
                            for kx in 0..kernel {
                                let ix = (ox * stride + kx) as isize - padding as isize;
                                if ix < 0 || ix >= width as isize {
                                    continue;
                                }
                                acc += x[[n, c, iy as usize, ix as usize]] * w[[o, c, ky, kx]];
                            }
                        }
                    }
                    out[[n, o, oy, ox]] = acc;
                }
            }
        }
    }
    out
}

fn max_pool(x: &Array4<f32>, kernel: usize, stride: usize) -> Array4<f32> {
    let (batch, channels, height, width) = x.dim();
    let oh = (height - kernel) / stride + 1;
    let ow = (width - kernel) / stride + 1;
    Array4::from_shape_fn((batch, channels, oh, ow), |(n, c, oy, ox)| {
        let mut best = f32::NEG_INFINITY;
        for ky in 0..kernel {
            for kx in 0..kernel {
                best = best.max(x[[n, c, oy * stride + ky, ox * stride + kx]]);
            }
        }
        best
    })
}

/// `x @ w + b` over the last axis of `x`
fn dense(x: &ArrayD<f32>, w: &Array2<f32>, b: &Array1<f32>, layer: &str) -> Result<ArrayD<f32>> {
    let inner = w.nrows();
    let rows = x.len() / inner.max(1);
    let flat = x
        .as_standard_layout()
        .into_owned()
        .into_shape((rows, inner))
        .map_err(|e| exec(layer, e))?;
    let product = flat.dot(w) + b;

    let mut shape = x.shape().to_vec();
    if let Some(last) = shape.last_mut() {
        *last = w.ncols();
    }
    product.into_shape(IxDyn(&shape)).map_err(|e| exec(layer, e))
}

/// Exact GELU, erf by the Abramowitz and Stegun 7.1.26 polynomial
fn gelu(x: f32) -> f32 {
    let z = (x / std::f32::consts::SQRT_2) as f64;
    let t = 1.0 / (1.0 + 0.327_591_1 * z.abs());
    let tail = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))))
        * (-z * z).exp();
    let erf = if z >= 0.0 { 1.0 - tail } else { tail - 1.0 };
    (0.5 * x as f64 * (1.0 + erf)) as f32
}

fn layer_norm(x: &ArrayD<f32>, gamma: &Array1<f32>, beta: &Array1<f32>, epsilon: f32) -> ArrayD<f32> {
    let last = Axis(x.ndim() - 1);
    let mut out = x.clone();
    for mut row in out.lanes_mut(last) {
        let n = row.len() as f32;
        let mean = row.sum() / n;
        let var = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
        let denom = (var + epsilon).sqrt();
        for (i, v) in row.iter_mut().enumerate() {
            *v = (*v - mean) / denom * gamma[i] + beta[i];
        }
    }
    out
}

/// Run the source model on a sample, keyed by graph output name
pub fn run_reference(model: &SourceModel, sample: &SampleInput) -> Result<BTreeMap<String, ArrayD<f32>>> {
    let task = model.task();
    let first = source::input_names(task)[0];
    let mut state = sample
        .get(first)
        .ok_or_else(|| exec("input", format!("sample has no '{}'", first)))?
        .data
        .clone();

    for layer in &model.config.layers {
        let name = layer.name.as_str();
        state = match &layer.kind {
            LayerKind::Conv2d { stride, padding, .. } => {
                let x = state.into_dimensionality::<Ix4>().map_err(|e| exec(name, e))?;
                let w = param::<Ix4>(model, name, "weight")?;
                let b = param::<Ix1>(model, name, "bias")?;
                conv2d(&x, &w, &b, *stride, *padding).into_dyn()
            }
            LayerKind::Relu => state.mapv(|v| v.max(0.0)),
            LayerKind::Sigmoid => state.mapv(|v| 1.0 / (1.0 + (-v).exp())),
            LayerKind::Tanh => state.mapv(f32::tanh),
            LayerKind::Gelu => state.mapv(gelu),
            LayerKind::MaxPool { kernel, stride } => {
                let x = state.into_dimensionality::<Ix4>().map_err(|e| exec(name, e))?;
                max_pool(&x, *kernel, stride.unwrap_or(*kernel)).into_dyn()
            }
            LayerKind::GlobalAvgPool => {
                let x = state.into_dimensionality::<Ix4>().map_err(|e| exec(name, e))?;
                let (n, c, h, w) = x.dim();
                let means = x
                    .into_shape((n, c, h * w))
                    .map_err(|e| exec(name, e))?
                    .mean_axis(Axis(2))
                    .ok_or_else(|| exec(name, "empty spatial extent"))?;
                means.into_shape((n, c, 1, 1)).map_err(|e| exec(name, e))?.into_dyn()
            }
            LayerKind::Flatten => {
                let batch = state.shape()[0];
                let rest = state.len() / batch.max(1);
                state
                    .as_standard_layout()
                    .into_owned()
                    .into_shape(IxDyn(&[batch, rest]))
                    .map_err(|e| exec(name, e))?
            }
            LayerKind::Dense { .. } => {
                let w = param::<Ix2>(model, name, "weight")?;
                let b = param::<Ix1>(model, name, "bias")?;
                dense(&state, &w, &b, name)?
            }
            LayerKind::DetectionHead => {
                let x = state.into_dimensionality::<Ix4>().map_err(|e| exec(name, e))?;
                let w = param::<Ix4>(model, name, "weight")?;
                let b = param::<Ix1>(model, name, "bias")?;
                let y = conv2d(&x, &w, &b, 1, 0);
                let (n, rows, h, wd) = y.dim();
                let y: Array3<f32> = y.into_shape((n, rows, h * wd)).map_err(|e| exec(name, e))?;
                y.mapv(|v| 1.0 / (1.0 + (-v).exp())).into_dyn()
            }
            LayerKind::Embedding { dim } => {
                let table = param::<Ix2>(model, name, "weight")?;
                let vocab = table.nrows();
                let ids = state;
                let mut shape = ids.shape().to_vec();
                shape.push(*dim);
                let mut out = ArrayD::<f32>::zeros(IxDyn(&shape));
                for (position, id) in ids.iter().enumerate() {
                    let row = *id as i64;
                    if row < 0 || row as usize >= vocab {
                        return Err(exec(name, format!("token id {} outside vocabulary of {}", row, vocab)));
                    }
                    let target = out
                        .as_slice_mut()
                        .ok_or_else(|| exec(name, "non-contiguous output"))?;
                    target[position * dim..(position + 1) * dim]
                        .copy_from_slice(&table.row(row as usize).to_vec());
                }
                out
            }
            LayerKind::AttentionMask => {
                let mask = sample
                    .get(source::MASK_INPUT)
                    .ok_or_else(|| exec(name, "sample has no attention mask"))?
                    .data
                    .clone()
                    .insert_axis(Axis(2));
                let mask = mask
                    .broadcast(state.raw_dim())
                    .ok_or_else(|| exec(name, "mask does not match hidden state"))?
                    .to_owned();
                state * mask
            }
            LayerKind::LayerNorm { epsilon } => {
                let gamma = param::<Ix1>(model, name, "weight")?;
                let beta = param::<Ix1>(model, name, "bias")?;
                layer_norm(&state, &gamma, &beta, *epsilon)
            }
            LayerKind::Custom { op } => {
                return Err(Error::UnsupportedOperator {
                    op_type: op.clone(),
                    detail: format!("layer '{}' has no reference implementation", name),
                })
            }
        };
    }

    if task == TaskType::ObjectDetection && state.ndim() != 3 {
        return Err(exec("output", "detection output must be [batch, rows, anchors]"));
    }
    let mut outputs = BTreeMap::new();
    outputs.insert(source::output_name(task).to_string(), state);
    Ok(outputs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    #[test]
    fn padded_conv_matches_hand_computation() {
        let x = Array4::from_shape_vec((1, 1, 2, 2), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let w = Array4::from_elem((1, 1, 3, 3), 1.0);
        let y = conv2d(&x, &w, &array![0.5], 1, 1);
        assert_eq!(y.shape(), &[1, 1, 2, 2]);
        assert!(y.iter().all(|v| (*v - 10.5).abs() < 1e-6));
    }

    #[test]
    fn dense_applies_over_last_axis() {
        let x = ArrayD::from_shape_vec(IxDyn(&[1, 2, 2]), vec![1.0, 0.0, 0.0, 1.0]).unwrap();
        let w = array![[1.0, 2.0, 3.0], [4.0, 5.0, 6.0]];
        let y = dense(&x, &w, &array![0.0, 0.0, 1.0], "d").unwrap();
        assert_eq!(y.shape(), &[1, 2, 3]);
        assert_eq!(y.as_slice().unwrap(), &[1.0, 2.0, 4.0, 4.0, 5.0, 7.0]);
    }

    #[test]
    fn layer_norm_zero_centres_rows() {
        let x = ArrayD::from_shape_vec(IxDyn(&[1, 4]), vec![1.0, 2.0, 3.0, 4.0]).unwrap();
        let y = layer_norm(&x, &Array1::ones(4), &Array1::zeros(4), 1e-5);
        assert!(y.sum().abs() < 1e-5);
        assert!((gelu(1.0) - 0.841_344_7).abs() < 1e-5);
    }
}
