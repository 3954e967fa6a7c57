//! Operators that move data around without arithmetic.

use ndarray::{Axis, IxDyn};

use crate::error::{Error, Result};
use crate::model::{DataType, Dimension, Node, SymbolicShape};
use crate::ops::registry::{expect_inputs, first_shape, Operator, ShapeInput};
use crate::ops::tensor::{Shape, Tensor};

#[derive(Debug, Clone, Default)]
pub struct Reshape {
    pub allow_zero: bool,
}

#[derive(Debug, Clone)]
pub struct Flatten {
    pub axis: i64,
}

#[derive(Debug, Clone, Default)]
pub struct Unsqueeze;

#[derive(Debug, Clone)]
pub struct Gather {
    pub axis: i64,
}

#[derive(Debug, Clone)]
pub struct Cast {
    pub to: DataType,
}

#[derive(Debug, Clone, Default)]
pub struct Identity;

fn normalize_axis(axis: i64, rank: usize) -> Result<usize> {
    let rank = rank as i64;
    let normalized = if axis < 0 { axis + rank } else { axis };
    if normalized < 0 || normalized >= rank {
        return Err(Error::ExecutionError(format!(
            "Axis {} out of range for rank {}",
            axis, rank
        )));
    }
    Ok(normalized as usize)
}

/// Product of a run of symbolic dimensions, when it can be named
fn symbolic_product(dims: &[Dimension]) -> Option<Dimension> {
    let params: Vec<&Dimension> = dims.iter().filter(|d| d.is_dynamic()).collect();
    let product: i64 = dims.iter().filter_map(Dimension::value).product();
    match params.as_slice() {
        [] => Some(Dimension::Value(product)),
        [single] if product == 1 => Some((*single).clone()),
        _ => None,
    }
}

impl Reshape {
    pub fn create(node: &Node) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Reshape {
            allow_zero: node.get_int("allowzero", 0) != 0,
        }))
    }

    /// Resolve `0` and `-1` entries of a target shape against the input shape
    pub fn resolve_shape(&self, input: &[usize], target: &[i64]) -> Result<Shape> {
        let mut shape = Vec::with_capacity(target.len());
        let mut infer_at = None;
        for (i, &dim) in target.iter().enumerate() {
            match dim {
                -1 if infer_at.is_none() => {
                    infer_at = Some(i);
                    shape.push(1);
                }
                0 if !self.allow_zero => {
                    let copied = input.get(i).copied().ok_or_else(|| {
                        Error::ExecutionError(format!("Reshape copies missing input axis {}", i))
                    })?;
                    shape.push(copied);
                }
                d if d >= 0 => shape.push(d as usize),
                d => {
                    return Err(Error::ExecutionError(format!(
                        "Reshape target {:?} has invalid entry {}",
                        target, d
                    )))
                }
            }
        }

        let total: usize = input.iter().product();
        if let Some(i) = infer_at {
            let known: usize = shape.iter().product();
            if known == 0 || total % known != 0 {
                return Err(Error::ExecutionError(format!(
                    "Cannot infer Reshape of {:?} to {:?}",
                    input, target
                )));
            }
            shape[i] = total / known;
        }
        Ok(shape)
    }
}

impl Operator for Reshape {
    fn compute(&self, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        expect_inputs("Reshape", inputs, 2)?;
        let shape = self.resolve_shape(&inputs[0].shape, &inputs[1].as_i64_vec())?;
        outputs[0] = inputs[0].reshape(&shape)?;
        Ok(())
    }

    fn output_shapes(&self, inputs: &[ShapeInput]) -> Result<Vec<Option<SymbolicShape>>> {
        let (input, target) = match (first_shape(inputs), inputs.get(1).and_then(|i| i.constant.clone())) {
            (Some(input), Some(target)) => (input, target),
            _ => return Ok(vec![None]),
        };

        let mut unresolved: Vec<Dimension> = input.clone();
        let mut shape = Vec::with_capacity(target.len());
        let mut infer_at = None;
        for (i, &dim) in target.iter().enumerate() {
            match dim {
                0 if !self.allow_zero => {
                    let copied = input.get(i).cloned().ok_or_else(|| {
                        Error::ValidationError(format!("Reshape copies missing input axis {}", i))
                    })?;
                    // The copied axis cancels out of the element count
                    if let Some(pos) = unresolved.iter().position(|d| *d == copied) {
                        unresolved.remove(pos);
                    }
                    shape.push(copied);
                }
                -1 => {
                    infer_at = Some(i);
                    shape.push(Dimension::Value(1));
                }
                d => {
                    shape.push(Dimension::Value(d));
                }
            }
        }

        if let Some(i) = infer_at {
            let explicit: i64 = target.iter().filter(|d| **d > 0).product();
            match symbolic_product(&unresolved) {
                Some(Dimension::Value(total)) if explicit > 0 && total % explicit == 0 => {
                    shape[i] = Dimension::Value(total / explicit);
                }
                Some(param @ Dimension::Param(_)) if explicit == 1 => shape[i] = param,
                _ => return Ok(vec![None]),
            }
        }
        Ok(vec![Some(shape)])
    }
}

impl Flatten {
    pub fn create(node: &Node) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Flatten {
            axis: node.get_int("axis", 1),
        }))
    }

    fn split(&self, rank: usize) -> Result<usize> {
        // axis == rank is allowed and flattens everything into the first dim
        if self.axis == rank as i64 {
            return Ok(rank);
        }
        normalize_axis(self.axis, rank)
    }
}

impl Operator for Flatten {
    fn compute(&self, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        expect_inputs("Flatten", inputs, 1)?;
        let x = inputs[0];
        let axis = self.split(x.shape.len())?;
        let outer: usize = x.shape[..axis].iter().product();
        let inner: usize = x.shape[axis..].iter().product();
        outputs[0] = x.reshape(&[outer, inner])?;
        Ok(())
    }

    fn output_shapes(&self, inputs: &[ShapeInput]) -> Result<Vec<Option<SymbolicShape>>> {
        let input = match first_shape(inputs) {
            Some(input) => input,
            None => return Ok(vec![None]),
        };
        let axis = self.split(input.len())?;
        let shape = match (symbolic_product(&input[..axis]), symbolic_product(&input[axis..])) {
            (Some(outer), Some(inner)) => Some(vec![outer, inner]),
            _ => None,
        };
        Ok(vec![shape])
    }
}

fn unsqueeze_axes(axes: &[i64], output_rank: usize) -> Result<Vec<usize>> {
    let mut normalized = axes
        .iter()
        .map(|a| normalize_axis(*a, output_rank))
        .collect::<Result<Vec<_>>>()?;
    normalized.sort_unstable();
    normalized.dedup();
    if normalized.len() != axes.len() {
        return Err(Error::ExecutionError(format!("Unsqueeze has repeated axes {:?}", axes)));
    }
    Ok(normalized)
}

impl Unsqueeze {
    pub fn create(_node: &Node) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Unsqueeze))
    }
}

impl Operator for Unsqueeze {
    fn compute(&self, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        expect_inputs("Unsqueeze", inputs, 2)?;
        let x = inputs[0];
        let axes_values = inputs[1].as_i64_vec();
        let axes = unsqueeze_axes(&axes_values, x.shape.len() + axes_values.len())?;
        let mut shape = x.shape.clone();
        for axis in axes {
            shape.insert(axis, 1);
        }
        outputs[0] = x.reshape(&shape)?;
        Ok(())
    }

    fn output_shapes(&self, inputs: &[ShapeInput]) -> Result<Vec<Option<SymbolicShape>>> {
        let (input, axes_values) = match (first_shape(inputs), inputs.get(1).and_then(|i| i.constant.clone())) {
            (Some(input), Some(axes)) => (input, axes),
            _ => return Ok(vec![None]),
        };
        let axes = unsqueeze_axes(&axes_values, input.len() + axes_values.len())?;
        let mut shape = input;
        for axis in axes {
            shape.insert(axis, Dimension::Value(1));
        }
        Ok(vec![Some(shape)])
    }
}

impl Gather {
    pub fn create(node: &Node) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Gather {
            axis: node.get_int("axis", 0),
        }))
    }
}

impl Operator for Gather {
    fn compute(&self, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        expect_inputs("Gather", inputs, 2)?;
        let (data, indices) = (inputs[0], inputs[1]);
        let axis = normalize_axis(self.axis, data.shape.len())?;
        let extent = data.shape[axis] as i64;

        let positions = indices
            .as_i64_vec()
            .into_iter()
            .map(|i| {
                let wrapped = if i < 0 { i + extent } else { i };
                if wrapped < 0 || wrapped >= extent {
                    return Err(Error::ExecutionError(format!(
                        "Gather index {} out of range for axis of size {}",
                        i, extent
                    )));
                }
                Ok(wrapped as usize)
            })
            .collect::<Result<Vec<_>>>()?;

        let selected = data.data.select(Axis(axis), &positions);
        let mut shape = data.shape[..axis].to_vec();
        shape.extend_from_slice(&indices.shape);
        shape.extend_from_slice(&data.shape[axis + 1..]);
        let gathered = selected
            .as_standard_layout()
            .into_owned()
            .into_shape(IxDyn(&shape))
            .map_err(|e| Error::ExecutionError(format!("Gather layout: {}", e)))?;
        outputs[0] = Tensor::from_array(gathered, data.data_type);
        Ok(())
    }

    fn output_shapes(&self, inputs: &[ShapeInput]) -> Result<Vec<Option<SymbolicShape>>> {
        let data = inputs.first().and_then(|i| i.shape.as_ref());
        let indices = inputs.get(1).and_then(|i| i.shape.as_ref());
        match (data, indices) {
            (Some(data), Some(indices)) => {
                let axis = normalize_axis(self.axis, data.len())?;
                let mut shape = data[..axis].to_vec();
                shape.extend(indices.iter().cloned());
                shape.extend(data[axis + 1..].iter().cloned());
                Ok(vec![Some(shape)])
            }
            _ => Ok(vec![None]),
        }
    }
}

impl Cast {
    pub fn create(node: &Node) -> Result<Box<dyn Operator>> {
        let to = DataType::from_proto(node.get_int("to", 0) as i32);
        if to == DataType::Undefined {
            return Err(Error::InvalidOperator(format!(
                "Cast {} has unsupported target type {}",
                node.name,
                node.get_int("to", 0)
            )));
        }
        Ok(Box::new(Cast { to }))
    }
}

impl Operator for Cast {
    fn compute(&self, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        expect_inputs("Cast", inputs, 1)?;
        outputs[0] = inputs[0].cast_to(self.to)?;
        Ok(())
    }

    fn output_shapes(&self, inputs: &[ShapeInput]) -> Result<Vec<Option<SymbolicShape>>> {
        Ok(vec![first_shape(inputs)])
    }
}

impl Identity {
    pub fn create(_node: &Node) -> Result<Box<dyn Operator>> {
        Ok(Box::new(Identity))
    }
}

impl Operator for Identity {
    fn compute(&self, inputs: &[&Tensor], outputs: &mut [Tensor]) -> Result<()> {
        expect_inputs("Identity", inputs, 1)?;
        outputs[0] = inputs[0].clone();
        Ok(())
    }

    fn output_shapes(&self, inputs: &[ShapeInput]) -> Result<Vec<Option<SymbolicShape>>> {
        Ok(vec![first_shape(inputs)])
    }
}
