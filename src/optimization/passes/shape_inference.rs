use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::model::{Attribute, DataType, Node, OnnxModel, SymbolicShape, TensorInfo};
use crate::ops::{OperatorRegistry, ShapeInput};
use crate::optimization::graph_optimizer::{OptimizationPass, PassResult};
use crate::parser::GraphBuilder;

/// Annotates `value_info` with the shape and type of every intermediate tensor
pub struct ShapeInference {
    registry: OperatorRegistry,
}

impl Default for ShapeInference {
    fn default() -> Self {
        Self::new()
    }
}

impl ShapeInference {
    pub fn new() -> Self {
        Self {
            registry: OperatorRegistry::initialize_standard_operators(),
        }
    }

    /// Infer shapes for every tensor of the model, keyed by tensor name
    pub fn infer(&self, model: &OnnxModel) -> Result<HashMap<String, TensorInfo>> {
        let graph = &model.graph;
        let mut known: HashMap<String, TensorInfo> = HashMap::new();
        let mut constants: HashMap<&str, Vec<i64>> = HashMap::new();

        for input in &graph.inputs {
            known.insert(input.name.clone(), input.clone());
        }
        for init in &graph.initializers {
            let shape = init
                .dims
                .iter()
                .map(|d| crate::model::Dimension::Value(*d))
                .collect();
            known.insert(
                init.name.clone(),
                TensorInfo::new(init.name.clone(), init.data_type, shape),
            );
            if matches!(init.data_type, DataType::Int64 | DataType::Int32) {
                constants.insert(init.name.as_str(), init.to_i64_vec()?);
            }
        }

        for node in GraphBuilder::topological_sort(&graph.nodes)? {
            let operator = self.registry.create_operator_for_node(&node)?;
            let inputs: Vec<ShapeInput> = node
                .inputs
                .iter()
                .filter(|name| !name.is_empty())
                .map(|name| ShapeInput {
                    shape: known.get(name).map(|info| info.shape.clone()),
                    constant: constants.get(name.as_str()).cloned(),
                })
                .collect();

            let shapes = operator.output_shapes(&inputs).map_err(|e| {
                Error::ValidationError(format!("{} ({}): {}", node.name, node.op_type, e))
            })?;
            let data_type = Self::output_type(&node, &known, model)?;

            for (output, shape) in node.outputs.iter().zip(shapes) {
                if let Some(shape) = shape {
                    known.insert(output.clone(), TensorInfo::new(output.clone(), data_type, shape));
                }
            }
        }

        Ok(known)
    }

    /// Element type of a node's outputs
    fn output_type(node: &Node, known: &HashMap<String, TensorInfo>, model: &OnnxModel) -> Result<DataType> {
        let input_type = |index: usize| {
            node.inputs
                .get(index)
                .and_then(|name| known.get(name))
                .map(|info| info.data_type)
                .unwrap_or(DataType::Undefined)
        };

        Ok(match node.op_type.as_str() {
            "Cast" => match node.attributes.get("to") {
                Some(Attribute::Int(to)) => DataType::from_proto(*to as i32),
                _ => {
                    return Err(Error::MissingField(format!(
                        "Cast {} has no 'to' attribute",
                        node.name
                    )))
                }
            },
            "QuantizeLinear" => match node.inputs.get(2) {
                Some(zp) if !zp.is_empty() => model
                    .graph
                    .initializer(zp)
                    .map(|t| t.data_type)
                    .unwrap_or_else(|| input_type(2)),
                _ => DataType::Uint8,
            },
            "DequantizeLinear" => DataType::Float,
            _ => input_type(0),
        })
    }

    /// Check inferred graph outputs against their declared static dimensions
    fn check_outputs(model: &OnnxModel, known: &HashMap<String, TensorInfo>) -> Result<()> {
        for declared in &model.graph.outputs {
            let inferred = match known.get(&declared.name) {
                Some(info) => info,
                None => continue,
            };
            if declared.shape.is_empty() {
                continue;
            }
            let consistent = declared.shape.len() == inferred.shape.len()
                && declared
                    .shape
                    .iter()
                    .zip(&inferred.shape)
                    .all(|(d, i)| match (d.value(), i.value()) {
                        (Some(a), Some(b)) => a == b,
                        _ => true,
                    });
            if !consistent {
                return Err(Error::ValidationError(format!(
                    "Output {} declared as {:?} but inferred as {:?}",
                    declared.name,
                    format_shape(&declared.shape),
                    format_shape(&inferred.shape)
                )));
            }
        }
        Ok(())
    }
}

fn format_shape(shape: &SymbolicShape) -> String {
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    format!("[{}]", dims.join(", "))
}

impl OptimizationPass for ShapeInference {
    fn name(&self) -> &str {
        "ShapeInference"
    }

    fn run(&self, model: &mut OnnxModel) -> Result<PassResult> {
        let start_time = Instant::now();

        let known = self.infer(model)?;
        Self::check_outputs(model, &known)?;

        let excluded: HashSet<&str> = model
            .graph
            .inputs
            .iter()
            .map(|i| i.name.as_str())
            .chain(model.graph.outputs.iter().map(|o| o.name.as_str()))
            .chain(model.graph.initializers.iter().map(|t| t.name.as_str()))
            .collect();

        // Keep node order so the annotation is deterministic
        let mut value_info = Vec::new();
        for node in &model.graph.nodes {
            for output in &node.outputs {
                if excluded.contains(output.as_str()) {
                    continue;
                }
                if let Some(info) = known.get(output) {
                    value_info.push(info.clone());
                }
            }
        }

        let count = value_info.len();
        let changed = value_info != model.graph.value_info;
        model.graph.value_info = value_info;

        Ok(PassResult {
            name: self.name().to_string(),
            optimizations_applied: count,
            duration: start_time.elapsed(),
            changed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Dimension, Graph, Tensor};
    use std::collections::BTreeMap;

    #[test]
    fn symbolic_batch_flows_through_flatten_and_matmul() {
        let graph = Graph {
            name: "g".into(),
            nodes: vec![
                Node::new("flat", "Flatten", vec!["x".into()], vec!["f".into()]),
                Node::new("mm", "MatMul", vec!["f".into(), "w".into()], vec!["y".into()]),
            ],
            inputs: vec![TensorInfo::new(
                "x",
                DataType::Float,
                vec![
                    Dimension::Param("batch".into()),
                    Dimension::Value(2),
                    Dimension::Value(3),
                ],
            )],
            outputs: vec![TensorInfo::new("y", DataType::Float, vec![])],
            initializers: vec![Tensor::from_f32("w", vec![6, 4], &[0.0; 24])],
            value_info: vec![],
            doc_string: String::new(),
        };
        let mut model = OnnxModel {
            metadata: Default::default(),
            graph,
            opset_imports: BTreeMap::from([(String::new(), 17)]),
            metadata_props: vec![],
        };
        model.graph.renumber();

        let result = ShapeInference::new().run(&mut model).unwrap();
        assert!(result.changed);
        assert_eq!(model.graph.value_info.len(), 1);
        let flat = &model.graph.value_info[0];
        assert_eq!(flat.name, "f");
        assert_eq!(flat.shape, vec![Dimension::Param("batch".into()), Dimension::Value(6)]);

        let known = ShapeInference::new().infer(&model).unwrap();
        assert_eq!(
            known["y"].shape,
            vec![Dimension::Param("batch".into()), Dimension::Value(4)]
        );
    }
}
