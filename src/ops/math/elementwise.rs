use crate::error::Result;
use crate::model::{Node, SymbolicShape};
use crate::ops::registry::{expect_inputs, Operator, ShapeInput};
use crate::ops::tensor::{broadcast_symbolic, element_wise_binary_op, Tensor};

/// Broadcasting addition
#[derive(Debug, Clone, Default)]
pub struct Add;

/// Broadcasting multiplication
#[derive(Debug, Clone, Default)]
pub struct Mul;

fn binary_output_shape(inputs: &[ShapeInput]) -> Result<Vec<Option<SymbolicShape>>> {
    let a = inputs.first().and_then(|i| i.shape.as_ref());
    let b = inputs.get(1).and_then(|i| i.shape.as_ref());
    match (a, b) {
        (Some(a), Some(b)) => Ok(vec![Some(broadcast_symbolic(a, b)?)]),
        _ => Ok(vec![None]),
    }
}

impl Add {
    pub fn create(_node: &Node) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Add))
    }
}

impl Operator for Add {
    fn compute(&self, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        expect_inputs("Add", inputs, 2)?;
        outputs[0] = element_wise_binary_op(inputs[0], inputs[1], |x, y| x + y)?;
        Ok(())
    }

    fn output_shapes(&self, inputs: &[ShapeInput]) -> Result<Vec<Option<SymbolicShape>>> {
        binary_output_shape(inputs)
    }
}

impl Mul {
    pub fn create(_node: &Node) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Mul))
    }
}

impl Operator for Mul {
    fn compute(&self, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        expect_inputs("Mul", inputs, 2)?;
        outputs[0] = element_wise_binary_op(inputs[0], inputs[1], |x, y| x * y)?;
        Ok(())
    }

    fn output_shapes(&self, inputs: &[ShapeInput]) -> Result<Vec<Option<SymbolicShape>>> {
        binary_output_shape(inputs)
    }
}
