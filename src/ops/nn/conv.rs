//! # Convolution Operator Implementation
//!
//! 2D convolution over NCHW data following the ONNX `Conv` definition:
//! explicit or automatic padding, strides, dilations and grouped
//! (including depthwise) convolution.
//!
//! The kernel is lowered with Im2Col + GEMM. Column construction runs on
//! the rayon pool, one kernel tap per task; the product itself goes through
//! `ndarray`'s matrix multiply.

use std::str::FromStr;

use ndarray::parallel::prelude::*;
use ndarray::{s, Array2, Array4, ArrayView3, Axis, Ix4};

use crate::error::{Error, Result};
use crate::model::{Attribute, Dimension, Node, SymbolicShape};
use crate::ops::registry::{expect_inputs, Operator, ShapeInput};
use crate::ops::tensor::Tensor;

/// Auto-padding modes supported by ONNX
///
/// - `NotSet`: Use explicit padding values provided in the `pads` attribute
/// - `SameUpper`: Pad so the output is `ceil(input / stride)`, extra padding at the end
/// - `SameLower`: As `SameUpper` with the extra padding at the beginning
/// - `Valid`: No padding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoPadding {
    NotSet,
    SameUpper,
    SameLower,
    Valid,
}

impl FromStr for AutoPadding {
    type Err = Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "NOTSET" => Ok(AutoPadding::NotSet),
            "SAME_UPPER" => Ok(AutoPadding::SameUpper),
            "SAME_LOWER" => Ok(AutoPadding::SameLower),
            "VALID" => Ok(AutoPadding::Valid),
            _ => Err(Error::ValidationError(format!("Unknown auto_pad value: {}", s))),
        }
    }
}

/// Window geometry shared by convolution and pooling
#[derive(Debug, Clone, PartialEq)]
pub struct Window {
    pub kernel_shape: Option<Vec<usize>>,
    /// Strides for each spatial dimension (default: all 1's)
    pub strides: Vec<usize>,
    /// Padding as [top, left, bottom, right]
    pub pads: Vec<usize>,
    pub dilations: Vec<usize>,
    pub auto_pad: AutoPadding,
}

fn usize_list(node: &Node, name: &str) -> Result<Option<Vec<usize>>> {
    match node.get_ints(name) {
        None => Ok(None),
        Some(values) => values
            .iter()
            .map(|v| {
                usize::try_from(*v).map_err(|_| {
                    Error::InvalidOperator(format!("{} has negative {} value {}", node.name, name, v))
                })
            })
            .collect::<Result<Vec<_>>>()
            .map(Some),
    }
}

impl Window {
    /// Read window attributes of a 2D node
    pub fn from_node(node: &Node) -> Result<Self> {
        let auto_pad = match node.attributes.get("auto_pad") {
            Some(Attribute::String(mode)) => mode.parse()?,
            _ => AutoPadding::NotSet,
        };
        let window = Self {
            kernel_shape: usize_list(node, "kernel_shape")?,
            strides: usize_list(node, "strides")?.unwrap_or_else(|| vec![1, 1]),
            pads: usize_list(node, "pads")?.unwrap_or_else(|| vec![0; 4]),
            dilations: usize_list(node, "dilations")?.unwrap_or_else(|| vec![1, 1]),
            auto_pad,
        };

        if window.strides.len() != 2 || window.dilations.len() != 2 || window.pads.len() != 4 {
            return Err(Error::UnsupportedFeature(format!(
                "{} {}: only 2D windows are supported",
                node.op_type, node.name
            )));
        }
        if window.strides.contains(&0) || window.dilations.contains(&0) {
            return Err(Error::InvalidOperator(format!(
                "{} {} has a zero stride or dilation",
                node.op_type, node.name
            )));
        }
        Ok(window)
    }

    /// Padding at the beginning and end of one spatial axis
    fn axis_padding(&self, axis: usize, input: usize, kernel: usize) -> (usize, usize) {
        let stride = self.strides[axis];
        let effective = (kernel - 1) * self.dilations[axis] + 1;
        match self.auto_pad {
            AutoPadding::NotSet => (self.pads[axis], self.pads[axis + 2]),
            AutoPadding::Valid => (0, 0),
            AutoPadding::SameUpper | AutoPadding::SameLower => {
                let output = (input + stride - 1) / stride;
                let total = ((output - 1) * stride + effective).saturating_sub(input);
                let small = total / 2;
                if self.auto_pad == AutoPadding::SameUpper {
                    (small, total - small)
                } else {
                    (total - small, small)
                }
            }
        }
    }

    /// Output extent and leading padding for each spatial axis
    pub fn output_geometry(&self, input: [usize; 2], kernel: [usize; 2]) -> Result<[(usize, usize); 2]> {
        let mut geometry = [(0, 0); 2];
        for axis in 0..2 {
            let (begin, end) = self.axis_padding(axis, input[axis], kernel[axis]);
            let effective = (kernel[axis] - 1) * self.dilations[axis] + 1;
            let padded = input[axis] + begin + end;
            if padded < effective {
                return Err(Error::ExecutionError(format!(
                    "Kernel extent {} exceeds padded input {}",
                    effective, padded
                )));
            }
            geometry[axis] = ((padded - effective) / self.strides[axis] + 1, begin);
        }
        Ok(geometry)
    }

    /// Symbolic output shape for NCHW input with `out_channels`
    pub fn symbolic_output(
        &self,
        input: &[Dimension],
        kernel: [usize; 2],
        out_channels: Dimension,
    ) -> Result<Option<SymbolicShape>> {
        if input.len() != 4 {
            return Err(Error::ValidationError(format!(
                "Expected NCHW input, got rank {}",
                input.len()
            )));
        }
        let (h, w) = match (&input[2], &input[3]) {
            (Dimension::Value(h), Dimension::Value(w)) => (*h as usize, *w as usize),
            _ => return Ok(None),
        };
        let [(oh, _), (ow, _)] = self.output_geometry([h, w], kernel)?;
        Ok(Some(vec![
            input[0].clone(),
            out_channels,
            Dimension::Value(oh as i64),
            Dimension::Value(ow as i64),
        ]))
    }
}

/// Convolution operator for 2D data (NCHW)
#[derive(Debug, Clone)]
pub struct Conv {
    pub window: Window,
    /// Number of groups input and output channels are divided into
    pub group: usize,
}

impl Conv {
    pub fn create(node: &Node) -> Result<Box<dyn Operator>> {
        let group = node.get_int("group", 1);
        if group < 1 {
            return Err(Error::InvalidOperator(format!(
                "Conv {} has invalid group {}",
                node.name, group
            )));
        }
        Ok(Box::new(Conv {
            window: Window::from_node(node)?,
            group: group as usize,
        }))
    }
}

impl Operator for Conv {
    fn compute(&self, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        expect_inputs("Conv", inputs, 2)?;
        let bias = inputs.get(2).copied();
        outputs[0] = compute_conv2d(inputs[0], inputs[1], bias, &self.window, self.group)?;
        Ok(())
    }

    fn output_shapes(&self, inputs: &[ShapeInput]) -> Result<Vec<Option<SymbolicShape>>> {
        let x = inputs.first().and_then(|i| i.shape.as_ref());
        let w = inputs.get(1).and_then(|i| i.shape.as_ref());
        let (x, w) = match (x, w) {
            (Some(x), Some(w)) => (x, w),
            _ => return Ok(vec![None]),
        };
        let kernel = match (w.get(2).and_then(Dimension::value), w.get(3).and_then(Dimension::value)) {
            (Some(kh), Some(kw)) => [kh as usize, kw as usize],
            _ => return Ok(vec![None]),
        };
        Ok(vec![self.window.symbolic_output(x, kernel, w[0].clone())?])
    }
}

/// Compute a grouped 2D convolution with Im2Col + GEMM
pub fn compute_conv2d(
    input: &Tensor,
    weights: &Tensor,
    bias: Option<&Tensor>,
    window: &Window,
    group: usize,
) -> Result<Tensor> {
    let to_exec = |e: ndarray::ShapeError| Error::ExecutionError(format!("Conv operand: {}", e));

    let x = input.data.view().into_dimensionality::<Ix4>().map_err(to_exec)?;
    let w = weights.data.view().into_dimensionality::<Ix4>().map_err(to_exec)?;
    let (batch, channels, height, width) = x.dim();
    let (out_channels, group_channels, kh, kw) = w.dim();

    if channels != group_channels * group || out_channels % group != 0 {
        return Err(Error::ExecutionError(format!(
            "Conv channel mismatch: input {} channels, weight {:?}, group {}",
            channels,
            w.shape(),
            group
        )));
    }
    if let Some(k) = &window.kernel_shape {
        if k.as_slice() != [kh, kw] {
            return Err(Error::ExecutionError(format!(
                "Conv kernel_shape {:?} disagrees with weight {:?}",
                k,
                w.shape()
            )));
        }
    }

    let [(oh, pad_top), (ow, pad_left)] = window.output_geometry([height, width], [kh, kw])?;
    let rows = group_channels * kh * kw;
    let out_per_group = out_channels / group;

    let mut output = Array4::<f32>::zeros((batch, out_channels, oh, ow));
    for b in 0..batch {
        for g in 0..group {
            let image = x.slice(s![b, g * group_channels..(g + 1) * group_channels, .., ..]);
            let columns = im2col(image, [kh, kw], [oh, ow], [pad_top, pad_left], window);

            let kernel = w
                .slice(s![g * out_per_group..(g + 1) * out_per_group, .., .., ..])
                .to_owned()
                .into_shape((out_per_group, rows))
                .map_err(to_exec)?;
            let product = kernel.dot(&columns);
            let product = product
                .into_shape((out_per_group, oh, ow))
                .map_err(to_exec)?;
            output
                .slice_mut(s![b, g * out_per_group..(g + 1) * out_per_group, .., ..])
                .assign(&product);
        }
    }

    if let Some(bias) = bias {
        if bias.len() != out_channels {
            return Err(Error::ExecutionError(format!(
                "Conv bias has {} values for {} output channels",
                bias.len(),
                out_channels
            )));
        }
        for (oc, value) in bias.data.iter().enumerate() {
            output.slice_mut(s![.., oc, .., ..]).mapv_inplace(|v| v + value);
        }
    }

    Ok(Tensor::from_array(output.into_dyn(), input.data_type))
}

/// Unfold one image into a [channels * kh * kw, oh * ow] matrix
fn im2col(
    image: ArrayView3<f32>,
    kernel: [usize; 2],
    out: [usize; 2],
    pad: [usize; 2],
    window: &Window,
) -> Array2<f32> {
    let (_, height, width) = image.dim();
    let [kh, kw] = kernel;
    let [oh, ow] = out;
    let mut columns = Array2::<f32>::zeros((image.dim().0 * kh * kw, oh * ow));

    columns
        .axis_iter_mut(Axis(0))
        .into_par_iter()
        .enumerate()
        .for_each(|(row, mut values)| {
            let c = row / (kh * kw);
            let ki = (row / kw) % kh;
            let kj = row % kw;
            for y in 0..oh {
                let ih = (y * window.strides[0] + ki * window.dilations[0]) as isize - pad[0] as isize;
                if ih < 0 || ih >= height as isize {
                    continue;
                }
                for xpos in 0..ow {
                    let iw = (xpos * window.strides[1] + kj * window.dilations[1]) as isize
                        - pad[1] as isize;
                    if iw >= 0 && iw < width as isize {
                        values[y * ow + xpos] = image[[c, ih as usize, iw as usize]];
                    }
                }
            }
        });

    columns
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DataType;

    fn window(strides: [usize; 2], pads: [usize; 4]) -> Window {
        Window {
            kernel_shape: None,
            strides: strides.to_vec(),
            pads: pads.to_vec(),
            dilations: vec![1, 1],
            auto_pad: AutoPadding::NotSet,
        }
    }

    #[test]
    fn padded_box_filter_sums_neighbourhood() {
        let input = Tensor::from_vec(&[1, 1, 3, 3], (1..=9).map(|v| v as f32).collect(), DataType::Float).unwrap();
        let weights = Tensor::from_vec(&[1, 1, 3, 3], vec![1.0; 9], DataType::Float).unwrap();
        let out = compute_conv2d(&input, &weights, None, &window([1, 1], [1, 1, 1, 1]), 1).unwrap();
        assert_eq!(out.shape, vec![1, 1, 3, 3]);
        // Centre sees the whole image, corner sees a 2x2 block
        assert_eq!(out.data[&[0, 0, 1, 1][..]], 45.0);
        assert_eq!(out.data[&[0, 0, 0, 0][..]], 1.0 + 2.0 + 4.0 + 5.0);
    }

    #[test]
    fn strided_conv_with_bias_and_groups() {
        let input = Tensor::from_vec(&[1, 2, 4, 4], vec![1.0; 32], DataType::Float).unwrap();
        let weights = Tensor::from_vec(&[2, 1, 2, 2], vec![1.0, 1.0, 1.0, 1.0, 2.0, 2.0, 2.0, 2.0], DataType::Float).unwrap();
        let bias = Tensor::from_vec(&[2], vec![0.5, -1.0], DataType::Float).unwrap();
        let out = compute_conv2d(&input, &weights, Some(&bias), &window([2, 2], [0; 4]), 2).unwrap();
        assert_eq!(out.shape, vec![1, 2, 2, 2]);
        assert!(out.data.slice(s![0, 0, .., ..]).iter().all(|v| *v == 4.5));
        assert!(out.data.slice(s![0, 1, .., ..]).iter().all(|v| *v == 7.0));
    }

    #[test]
    fn same_upper_keeps_ceil_extent() {
        let mut w = window([2, 2], [0; 4]);
        w.auto_pad = AutoPadding::SameUpper;
        let geometry = w.output_geometry([5, 5], [3, 3]).unwrap();
        assert_eq!(geometry[0].0, 3);
    }
}
