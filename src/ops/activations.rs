use crate::error::{Error, Result};
use crate::model::{Attribute, Node, SymbolicShape};
use crate::ops::registry::{expect_inputs, first_shape, Operator, ShapeInput};
use crate::ops::tensor::{element_wise_unary_op, Tensor};

/// Base struct for simple activation operators
#[derive(Debug, Clone)]
struct ActivationBase {
    activation_fn: fn(f32) -> f32,
    name: &'static str,
}

/// ReLU activation operator
#[derive(Debug, Clone, Default)]
pub struct Relu;

/// Sigmoid activation operator
#[derive(Debug, Clone, Default)]
pub struct Sigmoid;

/// Tanh activation operator
#[derive(Debug, Clone, Default)]
pub struct Tanh;

/// GELU activation operator
#[derive(Debug, Clone, Default)]
pub struct Gelu {
    tanh_approximation: bool,
}

impl ActivationBase {
    fn new(activation_fn: fn(f32) -> f32, name: &'static str) -> Self {
        Self { activation_fn, name }
    }

    fn compute_impl(&self, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        expect_inputs(self.name, inputs, 1)?;
        outputs[0] = element_wise_unary_op(inputs[0], self.activation_fn);
        Ok(())
    }
}

/// Activation functions preserve input shape
fn same_shape(inputs: &[ShapeInput]) -> Result<Vec<Option<SymbolicShape>>> {
    Ok(vec![first_shape(inputs)])
}

pub fn relu(x: f32) -> f32 {
    if x > 0.0 {
        x
    } else {
        0.0
    }
}

pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Error function, Abramowitz and Stegun 7.1.26 (|error| < 1.5e-7)
pub fn erf(x: f32) -> f32 {
    let x = x as f64;
    let sign = x.signum();
    let x = x.abs();
    let t = 1.0 / (1.0 + 0.327_591_1 * x);
    let poly = t
        * (0.254_829_592
            + t * (-0.284_496_736 + t * (1.421_413_741 + t * (-1.453_152_027 + t * 1.061_405_429))));
    (sign * (1.0 - poly * (-x * x).exp())) as f32
}

pub fn gelu(x: f32) -> f32 {
    0.5 * x * (1.0 + erf(x / std::f32::consts::SQRT_2))
}

pub fn gelu_tanh(x: f32) -> f32 {
    let c = (2.0 / std::f32::consts::PI).sqrt();
    0.5 * x * (1.0 + (c * (x + 0.044_715 * x * x * x)).tanh())
}

impl Relu {
    pub fn create(_node: &Node) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Relu))
    }
}

impl Operator for Relu {
    fn compute(&self, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        ActivationBase::new(relu, "Relu").compute_impl(inputs, outputs)
    }

    fn output_shapes(&self, inputs: &[ShapeInput]) -> Result<Vec<Option<SymbolicShape>>> {
        same_shape(inputs)
    }
}

impl Sigmoid {
    pub fn create(_node: &Node) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Sigmoid))
    }
}

impl Operator for Sigmoid {
    fn compute(&self, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        ActivationBase::new(sigmoid, "Sigmoid").compute_impl(inputs, outputs)
    }

    fn output_shapes(&self, inputs: &[ShapeInput]) -> Result<Vec<Option<SymbolicShape>>> {
        same_shape(inputs)
    }
}

impl Tanh {
    pub fn create(_node: &Node) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Tanh))
    }
}

impl Operator for Tanh {
    fn compute(&self, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        ActivationBase::new(f32::tanh, "Tanh").compute_impl(inputs, outputs)
    }

    fn output_shapes(&self, inputs: &[ShapeInput]) -> Result<Vec<Option<SymbolicShape>>> {
        same_shape(inputs)
    }
}

impl Gelu {
    pub fn create(node: &Node) -> Result<Box<dyn Operator>> {
        let tanh_approximation = match node.attributes.get("approximate") {
            None => false,
            Some(Attribute::String(mode)) if mode == "none" => false,
            Some(Attribute::String(mode)) if mode == "tanh" => true,
            Some(other) => {
                return Err(Error::InvalidOperator(format!(
                    "Gelu {} has invalid approximate attribute {:?}",
                    node.name, other
                )))
            }
        };
        Ok(Box::new(Gelu { tanh_approximation }))
    }
}

impl Operator for Gelu {
    fn compute(&self, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        let f = if self.tanh_approximation { gelu_tanh } else { gelu };
        ActivationBase::new(f, "Gelu").compute_impl(inputs, outputs)
    }

    fn output_shapes(&self, inputs: &[ShapeInput]) -> Result<Vec<Option<SymbolicShape>>> {
        same_shape(inputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DataType;

    #[test]
    fn erf_matches_known_values() {
        assert!((erf(0.0)).abs() < 1e-6);
        assert!((erf(1.0) - 0.842_700_8).abs() < 1e-6);
        assert!((erf(-2.0) + 0.995_322_3).abs() < 1e-6);
    }

    #[test]
    fn relu_clamps_negatives() {
        let x = Tensor::from_vec(&[4], vec![-1.0, 0.0, 2.0, -3.5], DataType::Float).unwrap();
        let mut out = vec![Tensor::new(&[0], DataType::Float)];
        Relu.compute(&[&x], &mut out).unwrap();
        assert_eq!(out[0].data.iter().copied().collect::<Vec<_>>(), vec![0.0, 0.0, 2.0, 0.0]);
    }

    #[test]
    fn gelu_approximations_agree_closely() {
        for x in [-3.0_f32, -0.5, 0.0, 0.7, 2.5] {
            assert!((gelu(x) - gelu_tanh(x)).abs() < 1e-2);
        }
    }
}
