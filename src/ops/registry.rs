use std::collections::HashMap;
use std::fmt::Debug;

use crate::error::{Error, Result};
use crate::model::{Node, SymbolicShape};
use super::tensor::Tensor;

/// Shape-level view of one operator input during inference
#[derive(Debug, Clone, Default)]
pub struct ShapeInput {
    pub shape: Option<SymbolicShape>,
    /// Integer payload when the input is a constant initializer
    pub constant: Option<Vec<i64>>,
}

/// Trait for implementing ONNX operators
pub trait Operator: Send + Sync + Debug {
    /// Compute the operation
    fn compute(&self, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()>;

    /// Infer output shapes, `None` where a shape cannot be known statically
    fn output_shapes(&self, inputs: &[ShapeInput]) -> Result<Vec<Option<SymbolicShape>>>;
}

/// Builds an operator from a node's attributes
pub type OperatorFactory = fn(&Node) -> Result<Box<dyn Operator>>;

/// Registry for ONNX operators
#[derive(Debug, Default)]
pub struct OperatorRegistry {
    factories: HashMap<String, OperatorFactory>,
}

impl OperatorRegistry {
    /// Create a new operator registry
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register an operator
    pub fn register_operator(&mut self, op_type: &str, factory: OperatorFactory) -> Result<()> {
        if self.factories.contains_key(op_type) {
            return Err(Error::InvalidOperator(format!(
                "Operator {} is already registered",
                op_type
            )));
        }
        self.factories.insert(op_type.to_string(), factory);
        Ok(())
    }

    pub fn supports(&self, op_type: &str) -> bool {
        self.factories.contains_key(op_type)
    }

    /// Initialize the registry with standard operators
    pub fn initialize_standard_operators() -> Self {
        use crate::ops::activations::{Gelu, Relu, Sigmoid, Tanh};
        use crate::ops::math::elementwise::{Add, Mul};
        use crate::ops::math::gemm::Gemm;
        use crate::ops::math::matmul::MatMul;
        use crate::ops::nn::conv::Conv;
        use crate::ops::nn::normalization::LayerNormalization;
        use crate::ops::nn::pool::{GlobalAveragePool, MaxPool};
        use crate::ops::quantize::{DequantizeLinear, QuantizeLinear};
        use crate::ops::shape::{Cast, Flatten, Gather, Identity, Reshape, Unsqueeze};

        let standard: [(&str, OperatorFactory); 20] = [
            ("Conv", Conv::create),
            ("MaxPool", MaxPool::create),
            ("GlobalAveragePool", GlobalAveragePool::create),
            ("Relu", Relu::create),
            ("Sigmoid", Sigmoid::create),
            ("Tanh", Tanh::create),
            ("Gelu", Gelu::create),
            ("MatMul", MatMul::create),
            ("Gemm", Gemm::create),
            ("Add", Add::create),
            ("Mul", Mul::create),
            ("Reshape", Reshape::create),
            ("Flatten", Flatten::create),
            ("Unsqueeze", Unsqueeze::create),
            ("Gather", Gather::create),
            ("Cast", Cast::create),
            ("LayerNormalization", LayerNormalization::create),
            ("QuantizeLinear", QuantizeLinear::create),
            ("DequantizeLinear", DequantizeLinear::create),
            ("Identity", Identity::create),
        ];

        let mut registry = Self::new();
        for (op_type, factory) in standard {
            registry.factories.insert(op_type.to_string(), factory);
        }
        registry
    }

    /// Create an operator for a node
    pub fn create_operator_for_node(&self, node: &Node) -> Result<Box<dyn Operator>> {
        if !node.domain.is_empty() {
            return Err(Error::UnsupportedFeature(format!(
                "Operator {}.{} not supported",
                node.domain, node.op_type
            )));
        }
        let factory = self.factories.get(&node.op_type).ok_or_else(|| {
            Error::UnsupportedFeature(format!("Operator {} not found in registry", node.op_type))
        })?;
        factory(node)
    }
}

/// Check the input count an operator receives at run time
pub(crate) fn expect_inputs(op: &str, inputs: &[&Tensor], min: usize) -> Result<()> {
    if inputs.len() < min {
        return Err(Error::ExecutionError(format!(
            "{} requires at least {} inputs, got {}",
            op,
            min,
            inputs.len()
        )));
    }
    Ok(())
}

/// Shape of the first input, as most shape functions start from it
pub(crate) fn first_shape(inputs: &[ShapeInput]) -> Option<SymbolicShape> {
    inputs.first().and_then(|i| i.shape.clone())
}
