use crate::error::{Error, Result};
use crate::model::{Node, SymbolicShape};
use crate::ops::registry::{expect_inputs, first_shape, Operator, ShapeInput};
use crate::ops::tensor::Tensor;

/// LayerNormalization over the trailing axes starting at `axis`
#[derive(Debug, Clone)]
pub struct LayerNormalization {
    pub axis: i64,
    pub epsilon: f32,
}

impl LayerNormalization {
    pub fn create(node: &Node) -> Result<Box<dyn Operator>> {
        if node.get_int("stash_type", 1) != 1 {
            return Err(Error::UnsupportedFeature(format!(
                "LayerNormalization {} requests a non-float stash type",
                node.name
            )));
        }
        Ok(Box::new(LayerNormalization {
            axis: node.get_int("axis", -1),
            epsilon: node.get_float("epsilon", 1e-5),
        }))
    }
}

impl Operator for LayerNormalization {
    fn compute(&self, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        expect_inputs("LayerNormalization", inputs, 2)?;
        outputs[0] = layer_norm(inputs[0], inputs[1], inputs.get(2).copied(), self.axis, self.epsilon)?;
        Ok(())
    }

    fn output_shapes(&self, inputs: &[ShapeInput]) -> Result<Vec<Option<SymbolicShape>>> {
        Ok(vec![first_shape(inputs)])
    }
}

pub fn layer_norm(
    x: &Tensor,
    scale: &Tensor,
    bias: Option<&Tensor>,
    axis: i64,
    epsilon: f32,
) -> Result<Tensor> {
    let rank = x.shape.len() as i64;
    let axis = if axis < 0 { axis + rank } else { axis };
    if axis < 0 || axis >= rank {
        return Err(Error::ExecutionError(format!(
            "LayerNormalization axis {} out of range for rank {}",
            axis, rank
        )));
    }

    let inner: usize = x.shape[axis as usize..].iter().product();
    let inner_shape = &x.shape[axis as usize..];
    let scale = scale.broadcast_to(inner_shape)?;
    let bias = match bias {
        Some(b) => Some(b.broadcast_to(inner_shape)?),
        None => None,
    };
    let scale: Vec<f32> = scale.data.iter().copied().collect();
    let bias: Option<Vec<f32>> = bias.map(|b| b.data.iter().copied().collect());

    let values: Vec<f32> = x.data.iter().copied().collect();
    let mut result = Vec::with_capacity(values.len());
    for row in values.chunks(inner.max(1)) {
        let n = row.len() as f32;
        let mean = row.iter().sum::<f32>() / n;
        let variance = row.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / n;
        let inv_std = 1.0 / (variance + epsilon).sqrt();
        for (i, v) in row.iter().enumerate() {
            let mut normalized = (v - mean) * inv_std * scale[i];
            if let Some(bias) = &bias {
                normalized += bias[i];
            }
            result.push(normalized);
        }
    }

    Tensor::from_vec(&x.shape, result, x.data_type)
}
