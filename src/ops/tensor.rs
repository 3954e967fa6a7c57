use std::fmt;

use half::f16;
use ndarray::{ArrayD, IxDyn};
use num_traits::{Bounded, ToPrimitive};

use crate::error::{Error, Result};
use crate::model::{self, DataType, Dimension, SymbolicShape};

/// Shape of a tensor
pub type Shape = Vec<usize>;

/// Tensor struct for runtime computation
///
/// Integer tensors share the `f32` storage, so values are exact only up to
/// 2^24 in magnitude. Token ids stay below that because vocabularies are
/// capped at `pipeline::architecture::MAX_VOCAB_SIZE`.
#[derive(Clone)]
pub struct Tensor {
    pub name: Option<String>,
    pub data_type: DataType,
    pub shape: Shape,
    // Every element type is held as f32; integer types carry integral values
    pub data: ArrayD<f32>,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor {{ name: {:?}, data_type: {:?}, shape: {:?} }}",
            self.name, self.data_type, self.shape
        )
    }
}

impl PartialEq for Tensor {
    fn eq(&self, other: &Self) -> bool {
        self.data_type == other.data_type && self.shape == other.shape && self.data == other.data
    }
}

impl Tensor {
    /// Create a new zero-filled tensor
    pub fn new(shape: &[usize], data_type: DataType) -> Self {
        Self {
            name: None,
            data_type,
            shape: shape.to_vec(),
            data: ArrayD::zeros(IxDyn(shape)),
        }
    }

    pub fn from_array(data: ArrayD<f32>, data_type: DataType) -> Self {
        Self {
            name: None,
            data_type,
            shape: data.shape().to_vec(),
            data,
        }
    }

    pub fn from_vec(shape: &[usize], values: Vec<f32>, data_type: DataType) -> Result<Self> {
        let data = ArrayD::from_shape_vec(IxDyn(shape), values).map_err(|e| {
            Error::ExecutionError(format!("Cannot build tensor of shape {:?}: {}", shape, e))
        })?;
        Ok(Self::from_array(data, data_type))
    }

    pub fn from_i64(shape: &[usize], values: &[i64]) -> Result<Self> {
        Self::from_vec(
            shape,
            values.iter().map(|v| *v as f32).collect(),
            DataType::Int64,
        )
    }

    /// Create a runtime tensor from a graph initializer
    pub fn from_model_tensor(tensor: &model::Tensor) -> Result<Self> {
        let shape = tensor
            .dims
            .iter()
            .map(|d| {
                usize::try_from(*d).map_err(|_| {
                    Error::InvalidModel(format!("Tensor {} has negative dim {}", tensor.name, d))
                })
            })
            .collect::<Result<Shape>>()?;
        let mut runtime = Self::from_vec(&shape, tensor.to_f32_vec()?, tensor.data_type)?;
        runtime.name = Some(tensor.name.clone());
        Ok(runtime)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn symbolic_shape(&self) -> SymbolicShape {
        self.shape
            .iter()
            .map(|d| Dimension::Value(*d as i64))
            .collect()
    }

    /// Values as integers, for index and shape operands
    pub fn as_i64_vec(&self) -> Vec<i64> {
        self.data.iter().map(|v| *v as i64).collect()
    }

    /// Number of NaN or infinite elements
    pub fn non_finite_count(&self) -> usize {
        self.data.iter().filter(|v| !v.is_finite()).count()
    }

    /// Reshape a tensor to a concrete shape
    pub fn reshape(&self, shape: &[usize]) -> Result<Tensor> {
        let total: usize = shape.iter().product();
        if total != self.len() {
            return Err(Error::ExecutionError(format!(
                "Cannot reshape tensor of shape {:?} to {:?}",
                self.shape, shape
            )));
        }
        let values: Vec<f32> = self.data.iter().copied().collect();
        Tensor::from_vec(shape, values, self.data_type)
    }

    /// Broadcast to a larger shape following numpy rules
    pub fn broadcast_to(&self, shape: &[usize]) -> Result<Tensor> {
        if self.shape == shape {
            return Ok(self.clone());
        }
        let view = self.data.broadcast(IxDyn(shape)).ok_or_else(|| {
            Error::ExecutionError(format!(
                "Cannot broadcast shape {:?} to {:?}",
                self.shape, shape
            ))
        })?;
        Ok(Tensor::from_array(view.to_owned(), self.data_type))
    }

    /// Convert element values to the target type's representable set
    pub fn cast_to(&self, target_type: DataType) -> Result<Tensor> {
        let data = match target_type {
            DataType::Float | DataType::Double => self.data.clone(),
            DataType::Float16 => self.data.mapv(|v| f16::from_f32(v).to_f32()),
            DataType::Int64 => self.data.mapv(saturate_trunc::<i64>),
            DataType::Int32 => self.data.mapv(saturate_trunc::<i32>),
            DataType::Int8 => self.data.mapv(saturate_trunc::<i8>),
            DataType::Uint8 => self.data.mapv(saturate_trunc::<u8>),
            DataType::Bool => self.data.mapv(|v| if v != 0.0 { 1.0 } else { 0.0 }),
            DataType::Undefined => {
                return Err(Error::ExecutionError("Cannot cast to undefined type".to_string()))
            }
        };
        Ok(Tensor {
            name: self.name.clone(),
            data_type: target_type,
            shape: self.shape.clone(),
            data,
        })
    }
}

/// Truncate toward zero, clamped to the range of `T`
pub fn saturate_trunc<T: Bounded + ToPrimitive>(value: f32) -> f32 {
    saturate::<T>(value.trunc())
}

/// Round half to even, clamped to the range of `T`
pub fn saturate_round<T: Bounded + ToPrimitive>(value: f32) -> f32 {
    let rounded = value.round();
    // f32::round rounds half away from zero; pull exact ties back to even
    let rounded = if (value - value.trunc()).abs() == 0.5 && rounded % 2.0 != 0.0 {
        rounded - value.signum()
    } else {
        rounded
    };
    saturate::<T>(rounded)
}

fn saturate<T: Bounded + ToPrimitive>(value: f32) -> f32 {
    let lo = T::min_value().to_f32().unwrap_or(f32::MIN);
    let hi = T::max_value().to_f32().unwrap_or(f32::MAX);
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(lo, hi)
}

/// Numpy-style broadcast of two concrete shapes
pub fn broadcast_shape(shape1: &[usize], shape2: &[usize]) -> Result<Shape> {
    let rank = shape1.len().max(shape2.len());
    let mut result = vec![0; rank];

    for i in 0..rank {
        let d1 = if i < rank - shape1.len() { 1 } else { shape1[i - (rank - shape1.len())] };
        let d2 = if i < rank - shape2.len() { 1 } else { shape2[i - (rank - shape2.len())] };
        result[i] = match (d1, d2) {
            (a, b) if a == b => a,
            (1, b) => b,
            (a, 1) => a,
            (a, b) => {
                return Err(Error::ExecutionError(format!(
                    "Incompatible shapes for broadcasting: {:?} and {:?} ({} vs {})",
                    shape1, shape2, a, b
                )))
            }
        };
    }

    Ok(result)
}

/// Numpy-style broadcast of two symbolic shapes
pub fn broadcast_symbolic(shape1: &[Dimension], shape2: &[Dimension]) -> Result<SymbolicShape> {
    let rank = shape1.len().max(shape2.len());
    let one = Dimension::Value(1);
    let mut result = Vec::with_capacity(rank);

    for i in 0..rank {
        let d1 = if i < rank - shape1.len() { &one } else { &shape1[i - (rank - shape1.len())] };
        let d2 = if i < rank - shape2.len() { &one } else { &shape2[i - (rank - shape2.len())] };
        let dim = match (d1, d2) {
            (a, b) if a == b => a.clone(),
            (Dimension::Value(1), b) => b.clone(),
            (a, Dimension::Value(1)) => a.clone(),
            // A named axis broadcast against a fixed extent takes that extent
            (Dimension::Param(_), b @ Dimension::Value(_)) => b.clone(),
            (a @ Dimension::Value(_), Dimension::Param(_)) => a.clone(),
            (a, b) => {
                return Err(Error::ValidationError(format!(
                    "Incompatible shapes for broadcasting: {} vs {}",
                    a, b
                )))
            }
        };
        result.push(dim);
    }

    Ok(result)
}

/// Element-wise binary operation
pub fn element_wise_binary_op<F>(a: &Tensor, b: &Tensor, op: F) -> Result<Tensor>
where
    F: Fn(f32, f32) -> f32,
{
    let output_shape = broadcast_shape(&a.shape, &b.shape)?;
    let mut result = a.broadcast_to(&output_shape)?;
    let b_broadcast = b.broadcast_to(&output_shape)?;
    result.data.zip_mut_with(&b_broadcast.data, |x, y| *x = op(*x, *y));

    // Floating point has precedence over integer
    let output_type = if a.data_type.is_floating_point() || !b.data_type.is_floating_point() {
        a.data_type
    } else {
        b.data_type
    };

    Ok(Tensor {
        name: None,
        data_type: output_type,
        shape: output_shape,
        data: result.data,
    })
}

/// Element-wise unary operation
pub fn element_wise_unary_op<F>(a: &Tensor, op: F) -> Tensor
where
    F: Fn(f32) -> f32,
{
    Tensor {
        name: None,
        data_type: a.data_type,
        shape: a.shape.clone(),
        data: a.data.mapv(op),
    }
}
