use std::collections::HashMap;
use std::time::Instant;

use crate::error::{Error, Result};
use crate::model::{Dimension, OnnxModel, TensorInfo};
use crate::optimization::graph_optimizer::{OptimizationPass, PassResult};

/// Pins every dynamic input dimension to a concrete extent
///
/// Named axes shared with outputs or intermediate tensors are pinned there too,
/// so `batch_size` becomes the same number everywhere.
#[derive(Debug, Clone)]
pub struct FixedShape {
    /// Concrete input shapes, usually those of the canonical sample
    shapes: HashMap<String, Vec<usize>>,
}

impl FixedShape {
    pub fn new(shapes: HashMap<String, Vec<usize>>) -> Self {
        Self { shapes }
    }

    fn pin(info: &mut TensorInfo, bindings: &HashMap<String, i64>) -> usize {
        let mut pinned = 0;
        for dim in info.shape.iter_mut() {
            if let Dimension::Param(name) = dim {
                if let Some(value) = bindings.get(name.as_str()) {
                    *dim = Dimension::Value(*value);
                    pinned += 1;
                }
            }
        }
        pinned
    }
}

impl OptimizationPass for FixedShape {
    fn name(&self) -> &str {
        "FixedShape"
    }

    fn run(&self, model: &mut OnnxModel) -> Result<PassResult> {
        let start_time = Instant::now();

        // Bind each named axis to the extent of the sample
        let mut bindings: HashMap<String, i64> = HashMap::new();
        for input in &model.graph.inputs {
            let concrete = self.shapes.get(&input.name).ok_or_else(|| {
                Error::ValidationError(format!("No concrete shape for input {}", input.name))
            })?;
            if concrete.len() != input.shape.len() {
                return Err(Error::ValidationError(format!(
                    "Input {} has rank {}, fixed shape has rank {}",
                    input.name,
                    input.shape.len(),
                    concrete.len()
                )));
            }
            for (dim, extent) in input.shape.iter().zip(concrete) {
                match dim {
                    Dimension::Param(name) => {
                        let extent = *extent as i64;
                        if let Some(previous) = bindings.insert(name.clone(), extent) {
                            if previous != extent {
                                return Err(Error::ValidationError(format!(
                                    "Axis {} bound to both {} and {}",
                                    name, previous, extent
                                )));
                            }
                        }
                    }
                    Dimension::Value(v) if *v != *extent as i64 => {
                        return Err(Error::ValidationError(format!(
                            "Input {} declares {} where the fixed shape has {}",
                            input.name, v, extent
                        )));
                    }
                    Dimension::Value(_) => {}
                }
            }
        }

        let graph = &mut model.graph;
        let mut pinned = 0;
        for info in graph
            .inputs
            .iter_mut()
            .chain(graph.outputs.iter_mut())
            .chain(graph.value_info.iter_mut())
        {
            pinned += Self::pin(info, &bindings);
        }

        Ok(PassResult {
            name: self.name().to_string(),
            optimizations_applied: pinned,
            duration: start_time.elapsed(),
            changed: pinned > 0,
        })
    }

    fn requires_fixed_input_shapes(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataType, Graph};
    use std::collections::BTreeMap;

    #[test]
    fn named_axes_are_pinned_everywhere() {
        let batch = || Dimension::Param("batch_size".into());
        let seq = || Dimension::Param("sequence_length".into());
        let mut model = OnnxModel {
            metadata: Default::default(),
            graph: Graph {
                name: "g".into(),
                nodes: vec![],
                inputs: vec![TensorInfo::new("input_ids", DataType::Int64, vec![batch(), seq()])],
                outputs: vec![TensorInfo::new(
                    "logits",
                    DataType::Float,
                    vec![batch(), seq(), Dimension::Value(32)],
                )],
                initializers: vec![],
                value_info: vec![],
                doc_string: String::new(),
            },
            opset_imports: BTreeMap::new(),
            metadata_props: vec![],
        };

        let pass = FixedShape::new(HashMap::from([("input_ids".to_string(), vec![1, 7])]));
        let result = pass.run(&mut model).unwrap();
        assert_eq!(result.optimizations_applied, 4);
        assert_eq!(
            model.graph.outputs[0].shape,
            vec![Dimension::Value(1), Dimension::Value(7), Dimension::Value(32)]
        );
    }

    #[test]
    fn conflicting_static_dim_is_rejected() {
        let mut model = OnnxModel {
            metadata: Default::default(),
            graph: Graph {
                name: "g".into(),
                nodes: vec![],
                inputs: vec![TensorInfo::new("images", DataType::Float, vec![Dimension::Value(3)])],
                outputs: vec![],
                initializers: vec![],
                value_info: vec![],
                doc_string: String::new(),
            },
            opset_imports: BTreeMap::new(),
            metadata_props: vec![],
        };
        let pass = FixedShape::new(HashMap::from([("images".to_string(), vec![4])]));
        assert!(pass.run(&mut model).is_err());
    }
}
