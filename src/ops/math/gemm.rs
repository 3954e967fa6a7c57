use ndarray::{Array2, Ix2};

use crate::error::{Error, Result};
use crate::model::{Node, SymbolicShape};
use crate::ops::registry::{expect_inputs, Operator, ShapeInput};
use crate::ops::tensor::Tensor;

/// GEMM (General Matrix Multiplication) operator
/// Y = alpha * (A @ B) + beta * C
/// A can be optionally transposed (transA)
/// B can be optionally transposed (transB)
#[derive(Debug, Clone)]
pub struct Gemm {
    pub alpha: f32,
    pub beta: f32,
    pub transpose_a: bool,
    pub transpose_b: bool,
}

impl Default for Gemm {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
            transpose_a: false,
            transpose_b: false,
        }
    }
}

impl Gemm {
    pub fn create(node: &Node) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Gemm {
            alpha: node.get_float("alpha", 1.0),
            beta: node.get_float("beta", 1.0),
            transpose_a: node.get_int("transA", 0) != 0,
            transpose_b: node.get_int("transB", 0) != 0,
        }))
    }
}

impl Operator for Gemm {
    fn compute(&self, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        expect_inputs("Gemm", inputs, 2)?;
        let c = inputs.get(2).copied();
        outputs[0] = compute_gemm(inputs[0], inputs[1], c, self)?;
        Ok(())
    }

    fn output_shapes(&self, inputs: &[ShapeInput]) -> Result<Vec<Option<SymbolicShape>>> {
        let a = inputs.first().and_then(|i| i.shape.as_ref());
        let b = inputs.get(1).and_then(|i| i.shape.as_ref());
        match (a, b) {
            (Some(a), Some(b)) => {
                if a.len() != 2 || b.len() != 2 {
                    return Err(Error::ValidationError(
                        "Gemm inputs must be rank 2".to_string(),
                    ));
                }
                let m = if self.transpose_a { &a[1] } else { &a[0] };
                let n = if self.transpose_b { &b[0] } else { &b[1] };
                Ok(vec![Some(vec![m.clone(), n.clone()])])
            }
            _ => Ok(vec![None]),
        }
    }
}

/// Compute Y = alpha * op(A) @ op(B) + beta * C
pub fn compute_gemm(a: &Tensor, b: &Tensor, c: Option<&Tensor>, params: &Gemm) -> Result<Tensor> {
    let to_exec = |e: ndarray::ShapeError| Error::ExecutionError(format!("Gemm operand: {}", e));

    let a2 = a.data.view().into_dimensionality::<Ix2>().map_err(to_exec)?;
    let b2 = b.data.view().into_dimensionality::<Ix2>().map_err(to_exec)?;
    let a2 = if params.transpose_a { a2.reversed_axes() } else { a2 };
    let b2 = if params.transpose_b { b2.reversed_axes() } else { b2 };

    if a2.ncols() != b2.nrows() {
        return Err(Error::ExecutionError(format!(
            "Incompatible matrix dimensions for Gemm: {:?} and {:?}",
            a2.shape(),
            b2.shape()
        )));
    }

    let mut y: Array2<f32> = a2.dot(&b2);
    if params.alpha != 1.0 {
        y.mapv_inplace(|v| v * params.alpha);
    }

    if let Some(c) = c {
        let (rows, cols) = y.dim();
        let c_broadcast = c.broadcast_to(&[rows, cols])?;
        let c2 = c_broadcast
            .data
            .into_dimensionality::<Ix2>()
            .map_err(to_exec)?;
        y.zip_mut_with(&c2, |out, bias| *out += params.beta * bias);
    }

    Ok(Tensor::from_array(y.into_dyn(), a.data_type))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DataType;

    #[test]
    fn gemm_applies_transpose_and_bias() {
        let a = Tensor::from_vec(&[1, 2], vec![1.0, 2.0], DataType::Float).unwrap();
        // B stored transposed: [N=2, K=2]
        let b = Tensor::from_vec(&[2, 2], vec![1.0, 1.0, 0.0, 1.0], DataType::Float).unwrap();
        let c = Tensor::from_vec(&[2], vec![0.5, -0.5], DataType::Float).unwrap();
        let params = Gemm {
            transpose_b: true,
            ..Gemm::default()
        };
        let y = compute_gemm(&a, &b, Some(&c), &params).unwrap();
        assert_eq!(y.shape, vec![1, 2]);
        assert_eq!(y.data.iter().copied().collect::<Vec<_>>(), vec![3.5, 1.5]);
    }
}
