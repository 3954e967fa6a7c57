use ndarray::{s, Array4, Axis, Ix4};

use crate::error::{Error, Result};
use crate::model::{Dimension, Node, SymbolicShape};
use crate::ops::nn::conv::Window;
use crate::ops::registry::{expect_inputs, first_shape, Operator, ShapeInput};
use crate::ops::tensor::Tensor;

/// MaxPool operator
#[derive(Debug, Clone)]
pub struct MaxPool {
    pub window: Window,
    pub kernel: [usize; 2],
}

/// GlobalAveragePool operator
#[derive(Debug, Clone, Default)]
pub struct GlobalAveragePool;

impl MaxPool {
    pub fn create(node: &Node) -> Result<Box<dyn Operator>> {
        let window = Window::from_node(node)?;
        let kernel = match window.kernel_shape.as_deref() {
            Some([kh, kw]) if *kh > 0 && *kw > 0 => [*kh, *kw],
            other => {
                return Err(Error::InvalidOperator(format!(
                    "MaxPool {} needs a 2D kernel_shape, got {:?}",
                    node.name, other
                )))
            }
        };
        if node.get_int("ceil_mode", 0) != 0 {
            return Err(Error::UnsupportedFeature(format!(
                "MaxPool {} uses ceil_mode",
                node.name
            )));
        }
        Ok(Box::new(MaxPool { window, kernel }))
    }
}

impl Operator for MaxPool {
    fn compute(&self, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        expect_inputs("MaxPool", inputs, 1)?;
        outputs[0] = max_pool(inputs[0], &self.window, self.kernel)?;
        Ok(())
    }

    fn output_shapes(&self, inputs: &[ShapeInput]) -> Result<Vec<Option<SymbolicShape>>> {
        match first_shape(inputs) {
            Some(x) if x.len() == 4 => {
                let channels = x[1].clone();
                Ok(vec![self.window.symbolic_output(&x, self.kernel, channels)?])
            }
            Some(x) => Err(Error::ValidationError(format!(
                "MaxPool expects NCHW input, got rank {}",
                x.len()
            ))),
            None => Ok(vec![None]),
        }
    }
}

/// Max pooling over NCHW input; padded positions never win
pub fn max_pool(input: &Tensor, window: &Window, kernel: [usize; 2]) -> Result<Tensor> {
    let x = input
        .data
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|e| Error::ExecutionError(format!("MaxPool input: {}", e)))?;
    let (batch, channels, height, width) = x.dim();
    let [(oh, pad_top), (ow, pad_left)] = window.output_geometry([height, width], kernel)?;

    let mut output = Array4::<f32>::from_elem((batch, channels, oh, ow), f32::NEG_INFINITY);
    for ((b, c, y, xpos), out) in output.indexed_iter_mut() {
        for ki in 0..kernel[0] {
            let ih = (y * window.strides[0] + ki * window.dilations[0]) as isize - pad_top as isize;
            if ih < 0 || ih >= height as isize {
                continue;
            }
            for kj in 0..kernel[1] {
                let iw = (xpos * window.strides[1] + kj * window.dilations[1]) as isize
                    - pad_left as isize;
                if iw >= 0 && iw < width as isize {
                    let value = x[[b, c, ih as usize, iw as usize]];
                    if value > *out || value.is_nan() {
                        *out = value;
                    }
                }
            }
        }
    }

    Ok(Tensor::from_array(output.into_dyn(), input.data_type))
}

impl GlobalAveragePool {
    pub fn create(_node: &Node) -> Result<Box<dyn Operator>> {
        Ok(Box::new(GlobalAveragePool))
    }
}

impl Operator for GlobalAveragePool {
    fn compute(&self, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        expect_inputs("GlobalAveragePool", inputs, 1)?;
        outputs[0] = global_average_pool(inputs[0])?;
        Ok(())
    }

    fn output_shapes(&self, inputs: &[ShapeInput]) -> Result<Vec<Option<SymbolicShape>>> {
        // Spatial dimensions collapse to 1
        Ok(vec![first_shape(inputs).map(|shape| {
            shape
                .iter()
                .enumerate()
                .map(|(axis, d)| if axis < 2 { d.clone() } else { Dimension::Value(1) })
                .collect()
        })])
    }
}

pub fn global_average_pool(input: &Tensor) -> Result<Tensor> {
    let x = input
        .data
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|e| Error::ExecutionError(format!("GlobalAveragePool input: {}", e)))?;
    let (batch, channels, height, width) = x.dim();
    let area = (height * width).max(1) as f32;

    let mut output = Array4::<f32>::zeros((batch, channels, 1, 1));
    for b in 0..batch {
        for (c, plane) in x.slice(s![b, .., .., ..]).axis_iter(Axis(0)).enumerate() {
            output[[b, c, 0, 0]] = plane.sum() / area;
        }
    }
    Ok(Tensor::from_array(output.into_dyn(), input.data_type))
}
