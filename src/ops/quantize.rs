use crate::error::{Error, Result};
use crate::model::{DataType, Node, SymbolicShape};
use crate::ops::registry::{expect_inputs, first_shape, Operator, ShapeInput};
use crate::ops::tensor::{element_wise_unary_op, saturate_round, Tensor};

/// Per-tensor linear quantization: y = saturate(round(x / scale) + zero_point)
#[derive(Debug, Clone, Default)]
pub struct QuantizeLinear;

/// Per-tensor linear dequantization: y = (x - zero_point) * scale
#[derive(Debug, Clone, Default)]
pub struct DequantizeLinear;

fn scalar(tensor: &Tensor, what: &str) -> Result<f32> {
    if tensor.len() != 1 {
        return Err(Error::UnsupportedFeature(format!(
            "Per-axis {} with {} values",
            what,
            tensor.len()
        )));
    }
    tensor
        .data
        .iter()
        .next()
        .copied()
        .ok_or_else(|| Error::ExecutionError(format!("Empty {}", what)))
}

impl QuantizeLinear {
    pub fn create(_node: &Node) -> Result<Box<dyn Operator>> {
        Ok(Box::new(QuantizeLinear))
    }
}

impl Operator for QuantizeLinear {
    fn compute(&self, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        expect_inputs("QuantizeLinear", inputs, 2)?;
        let scale = scalar(inputs[1], "quantization scale")?;
        if scale <= 0.0 || !scale.is_finite() {
            return Err(Error::ExecutionError(format!("Invalid quantization scale {}", scale)));
        }
        let (zero_point, target) = match inputs.get(2) {
            Some(zp) => (scalar(zp, "zero point")?, zp.data_type),
            None => (0.0, DataType::Uint8),
        };

        let quantize: fn(f32) -> f32 = match target {
            DataType::Uint8 => saturate_round::<u8>,
            DataType::Int8 => saturate_round::<i8>,
            other => {
                return Err(Error::ExecutionError(format!(
                    "QuantizeLinear cannot produce {:?}",
                    other
                )))
            }
        };

        // Zero point is integral, so rounding after the shift is equivalent
        let mut y = element_wise_unary_op(inputs[0], |x| quantize(x / scale + zero_point));
        y.data_type = target;
        outputs[0] = y;
        Ok(())
    }

    fn output_shapes(&self, inputs: &[ShapeInput]) -> Result<Vec<Option<SymbolicShape>>> {
        Ok(vec![first_shape(inputs)])
    }
}

impl DequantizeLinear {
    pub fn create(_node: &Node) -> Result<Box<dyn Operator>> {
        Ok(Box::new(DequantizeLinear))
    }
}

impl Operator for DequantizeLinear {
    fn compute(&self, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        expect_inputs("DequantizeLinear", inputs, 2)?;
        let scale = scalar(inputs[1], "dequantization scale")?;
        let zero_point = match inputs.get(2) {
            Some(zp) => scalar(zp, "zero point")?,
            None => 0.0,
        };
        let mut y = element_wise_unary_op(inputs[0], |q| (q - zero_point) * scale);
        y.data_type = DataType::Float;
        outputs[0] = y;
        Ok(())
    }

    fn output_shapes(&self, inputs: &[ShapeInput]) -> Result<Vec<Option<SymbolicShape>>> {
        Ok(vec![first_shape(inputs)])
    }
}
