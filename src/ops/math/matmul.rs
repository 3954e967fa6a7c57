use ndarray::{s, Array2, Array3, Ix2, IxDyn};

use crate::error::{Error, Result};
use crate::model::{Dimension, Node, SymbolicShape};
use crate::ops::registry::{expect_inputs, Operator, ShapeInput};
use crate::ops::tensor::{broadcast_symbolic, Tensor};

#[derive(Debug, Clone, Default)]
pub struct MatMul;

impl MatMul {
    pub fn create(_node: &Node) -> Result<Box<dyn Operator>> {
        Ok(Box::new(MatMul))
    }
}

impl Operator for MatMul {
    fn compute(&self, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        expect_inputs("MatMul", inputs, 2)?;
        outputs[0] = compute_matmul(inputs[0], inputs[1])?;
        Ok(())
    }

    fn output_shapes(&self, inputs: &[ShapeInput]) -> Result<Vec<Option<SymbolicShape>>> {
        let shapes = (
            inputs.first().and_then(|i| i.shape.as_ref()),
            inputs.get(1).and_then(|i| i.shape.as_ref()),
        );
        match shapes {
            (Some(a), Some(b)) => Ok(vec![Some(matmul_symbolic_shape(a, b)?)]),
            // If either shape is unknown, we can't infer the output shape
            _ => Ok(vec![None]),
        }
    }
}

/// Output shape of `a @ b` over symbolic dimensions
pub fn matmul_symbolic_shape(a: &[Dimension], b: &[Dimension]) -> Result<SymbolicShape> {
    if a.len() < 2 || b.len() < 2 {
        return Err(Error::ValidationError(format!(
            "MatMul inputs must have at least rank 2, got {} and {}",
            a.len(),
            b.len()
        )));
    }
    let (a_batch, a_mat) = a.split_at(a.len() - 2);
    let (b_batch, b_mat) = b.split_at(b.len() - 2);

    if let (Dimension::Value(k1), Dimension::Value(k2)) = (&a_mat[1], &b_mat[0]) {
        if k1 != k2 {
            return Err(Error::ValidationError(format!(
                "Incompatible matrix dimensions for MatMul: {} vs {}",
                k1, k2
            )));
        }
    }

    let mut shape = broadcast_symbolic(a_batch, b_batch)?;
    shape.push(a_mat[0].clone());
    shape.push(b_mat[1].clone());
    Ok(shape)
}

/// Compute the matrix multiplication of two tensors
pub fn compute_matmul(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let a_rank = a.shape.len();
    let b_rank = b.shape.len();

    if a_rank < 2 || b_rank < 2 {
        return Err(Error::ExecutionError(format!(
            "MatMul inputs must have at least rank 2, got {} and {}",
            a_rank, b_rank
        )));
    }

    let (m, k) = (a.shape[a_rank - 2], a.shape[a_rank - 1]);
    let (k2, n) = (b.shape[b_rank - 2], b.shape[b_rank - 1]);
    if k != k2 {
        return Err(Error::ExecutionError(format!(
            "Incompatible matrix dimensions for MatMul: {}x{} and {}x{}",
            m, k, k2, n
        )));
    }

    let mut output_shape = a.shape[..a_rank - 2].to_vec();
    output_shape.push(m);
    output_shape.push(n);

    let to_exec = |e: ndarray::ShapeError| Error::ExecutionError(format!("MatMul layout: {}", e));

    // Shared weight matrix: fold the batch axes of A into its rows
    if b_rank == 2 {
        let rows = a.len() / k.max(1);
        let a2 = a
            .data
            .as_standard_layout()
            .into_owned()
            .into_shape((rows, k))
            .map_err(to_exec)?;
        let b2 = b.data.view().into_dimensionality::<Ix2>().map_err(to_exec)?;
        let c2: Array2<f32> = a2.dot(&b2);
        let data = c2.into_shape(IxDyn(&output_shape)).map_err(to_exec)?;
        return Ok(Tensor::from_array(data, a.data_type));
    }

    if a.shape[..a_rank - 2] != b.shape[..b_rank - 2] {
        return Err(Error::UnsupportedFeature(format!(
            "Broadcasting batch MatMul {:?} x {:?}",
            a.shape, b.shape
        )));
    }

    let batch: usize = a.shape[..a_rank - 2].iter().product();
    let a3 = a
        .data
        .as_standard_layout()
        .into_owned()
        .into_shape((batch, m, k))
        .map_err(to_exec)?;
    let b3 = b
        .data
        .as_standard_layout()
        .into_owned()
        .into_shape((batch, k, n))
        .map_err(to_exec)?;
    let mut c3 = Array3::<f32>::zeros((batch, m, n));
    for i in 0..batch {
        let a_mat = a3.slice(s![i, .., ..]);
        let b_mat = b3.slice(s![i, .., ..]);
        let mut c_mat = c3.slice_mut(s![i, .., ..]);
        ndarray::linalg::general_mat_mul(1.0, &a_mat, &b_mat, 0.0, &mut c_mat);
    }
    let data = c3.into_shape(IxDyn(&output_shape)).map_err(to_exec)?;
    Ok(Tensor::from_array(data, a.data_type))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::DataType;

    #[test]
    fn batched_input_against_shared_weight() {
        let a = Tensor::from_vec(&[2, 1, 2], vec![1.0, 2.0, 3.0, 4.0], DataType::Float).unwrap();
        let b = Tensor::from_vec(&[2, 2], vec![1.0, 0.0, 0.0, 2.0], DataType::Float).unwrap();
        let c = compute_matmul(&a, &b).unwrap();
        assert_eq!(c.shape, vec![2, 1, 2]);
        assert_eq!(c.data.iter().copied().collect::<Vec<_>>(), vec![1.0, 4.0, 3.0, 8.0]);
    }

    #[test]
    fn symbolic_shape_keeps_sequence_axis() {
        let a = vec![
            Dimension::Param("batch_size".into()),
            Dimension::Param("sequence_length".into()),
            Dimension::Value(16),
        ];
        let b = vec![Dimension::Value(16), Dimension::Value(32)];
        let shape = matmul_symbolic_shape(&a, &b).unwrap();
        assert_eq!(shape[1], Dimension::Param("sequence_length".into()));
        assert_eq!(shape[2], Dimension::Value(32));
    }
}
