use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use log::debug;

use crate::error::{Error, Result};
use crate::model::{DataType, Dimension, Node, NodeId, OnnxModel};
use crate::ops::{Operator, OperatorRegistry, Tensor};
use crate::parser::{ExecutionGraph, GraphBuilder};

use super::context::{ExecutionContext, ExecutionOptions};

/// Interpreter for decoded ONNX graphs
///
/// The engine only knows the graph it was given: operators are instantiated
/// from node attributes and initializers are materialised once in `prepare`.
/// A prepared engine is immutable, so `run` can be called from several
/// threads at once.
pub struct ExecutionEngine {
    /// The ONNX model (immutable once created)
    model: Arc<OnnxModel>,
    /// Execution options (immutable configuration)
    options: ExecutionOptions,
    /// Operator registry
    operator_registry: OperatorRegistry,
    /// Nodes in execution order, set by `prepare`
    execution_graph: Option<ExecutionGraph>,
    /// Mapping from node IDs to operators
    node_operators: HashMap<NodeId, Box<dyn Operator>>,
    /// Constant tensors from the graph
    initializers: HashMap<String, Tensor>,
    /// Index of the last node reading each tensor
    last_use: HashMap<String, usize>,
}

impl ExecutionEngine {
    /// Create a new execution engine
    pub fn new(model: OnnxModel, options: ExecutionOptions) -> Result<Self> {
        Ok(Self {
            model: Arc::new(model),
            options,
            operator_registry: OperatorRegistry::initialize_standard_operators(),
            execution_graph: None,
            node_operators: HashMap::new(),
            initializers: HashMap::new(),
            last_use: HashMap::new(),
        })
    }

    /// Create and prepare in one step
    pub fn prepared(model: OnnxModel, options: ExecutionOptions) -> Result<Self> {
        let mut engine = Self::new(model, options)?;
        engine.prepare()?;
        Ok(engine)
    }

    pub fn model(&self) -> &OnnxModel {
        &self.model
    }

    pub fn is_prepared(&self) -> bool {
        self.execution_graph.is_some()
    }

    /// Sort the graph, build operators and load initializers
    pub fn prepare(&mut self) -> Result<()> {
        if self.is_prepared() {
            return Ok(());
        }

        let graph = GraphBuilder::build_graph(&self.model.graph)?;

        let mut node_operators = HashMap::new();
        for node in &graph.nodes {
            if node.outputs.is_empty() {
                return Err(Error::InvalidGraph(format!(
                    "Node {} ({}) declares no outputs",
                    node.name, node.op_type
                )));
            }
            let operator = self.operator_registry.create_operator_for_node(node).map_err(|e| {
                Error::ExecutionError(format!(
                    "Cannot instantiate {} ({}): {}",
                    node.name, node.op_type, e
                ))
            })?;
            node_operators.insert(node.id, operator);
        }

        let mut initializers = HashMap::new();
        for initializer in &self.model.graph.initializers {
            initializers.insert(
                initializer.name.clone(),
                Tensor::from_model_tensor(initializer)?,
            );
        }

        // Graph outputs are never released
        let outputs: HashSet<&str> = self
            .model
            .graph
            .outputs
            .iter()
            .map(|o| o.name.as_str())
            .collect();
        let mut last_use = HashMap::new();
        for (position, node) in graph.nodes.iter().enumerate() {
            for input in node.inputs.iter().filter(|i| !i.is_empty()) {
                if !outputs.contains(input.as_str()) && !initializers.contains_key(input) {
                    last_use.insert(input.clone(), position);
                }
            }
        }

        debug!(
            "Prepared graph {}: {} nodes, {} initializers",
            self.model.graph.name,
            graph.nodes.len(),
            initializers.len()
        );

        self.node_operators = node_operators;
        self.initializers = initializers;
        self.last_use = last_use;
        self.execution_graph = Some(graph);
        Ok(())
    }

    /// Run the model and return the graph outputs by name
    pub fn run(&self, inputs: HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
        let mut context = self.run_with_context(inputs)?;

        let mut outputs = HashMap::new();
        for name in self.model.output_names() {
            let tensor = context.take_tensor(&name).map_err(|_| {
                Error::InvalidGraph(format!("Output tensor '{}' was not produced", name))
            })?;
            outputs.insert(name, tensor);
        }
        Ok(outputs)
    }

    /// Run the model and return the full execution context
    pub fn run_with_context(&self, inputs: HashMap<String, Tensor>) -> Result<ExecutionContext> {
        let graph = self
            .execution_graph
            .as_ref()
            .ok_or_else(|| Error::InvalidGraph("Execution graph not prepared".to_string()))?;

        let mut context = ExecutionContext::new();
        self.bind_inputs(&mut context, inputs)?;

        let started = Instant::now();
        for (position, node) in graph.nodes.iter().enumerate() {
            self.run_node(node, &mut context)?;

            if !self.options.keep_intermediates {
                for input in node.inputs.iter().filter(|i| !i.is_empty()) {
                    if self.last_use.get(input) == Some(&position) {
                        context.release(input);
                    }
                }
            }
        }
        debug!(
            "Executed {} nodes in {:.2?}",
            graph.nodes.len(),
            started.elapsed()
        );

        Ok(context)
    }

    fn bind_inputs(&self, context: &mut ExecutionContext, mut inputs: HashMap<String, Tensor>) -> Result<()> {
        for declared in &self.model.graph.inputs {
            if self.initializers.contains_key(&declared.name) {
                continue;
            }
            let tensor = inputs.remove(&declared.name).ok_or_else(|| {
                Error::ExecutionError(format!("Missing input tensor '{}'", declared.name))
            })?;

            if self.options.strict_input_shapes {
                let rank_matches = declared.shape.len() == tensor.shape.len();
                let dims_match = rank_matches
                    && declared
                        .shape
                        .iter()
                        .zip(&tensor.shape)
                        .all(|(d, actual)| d.value().map_or(true, |v| v == *actual as i64));
                if !dims_match {
                    return Err(Error::ExecutionError(format!(
                        "Input '{}' has shape {:?}, graph declares {}",
                        declared.name,
                        tensor.shape,
                        format_shape(&declared.shape)
                    )));
                }
            }

            let tensor = if declared.data_type != DataType::Undefined
                && declared.data_type != tensor.data_type
            {
                tensor.cast_to(declared.data_type)?
            } else {
                tensor
            };
            context.set_tensor(&declared.name, tensor);
        }

        if let Some(unknown) = inputs.keys().next() {
            return Err(Error::ExecutionError(format!(
                "Input tensor '{}' is not defined in the model",
                unknown
            )));
        }
        Ok(())
    }

    /// Run a single node
    fn run_node(&self, node: &Node, context: &mut ExecutionContext) -> Result<()> {
        let operator = self.node_operators.get(&node.id).ok_or_else(|| {
            Error::InvalidGraph(format!("Operator for node {} not found", node.id))
        })?;

        let mut input_tensors = Vec::with_capacity(node.inputs.len());
        for input_name in node.inputs.iter().filter(|i| !i.is_empty()) {
            let tensor = match self.initializers.get(input_name) {
                Some(constant) => constant,
                None => context.get_tensor(input_name)?,
            };
            input_tensors.push(tensor);
        }

        let mut output_tensors = vec![Tensor::new(&[0], DataType::Float); node.outputs.len()];
        operator
            .compute(&input_tensors, &mut output_tensors)
            .map_err(|e| {
                Error::ExecutionError(format!("Node {} ({}) failed: {}", node.name, node.op_type, e))
            })?;

        debug!(
            "Ran {} ({}) -> {:?}",
            node.name,
            node.op_type,
            output_tensors.first().map(|t| &t.shape)
        );

        for (output_name, tensor) in node.outputs.iter().zip(output_tensors) {
            if !output_name.is_empty() {
                context.set_tensor(output_name, tensor);
            }
        }
        Ok(())
    }
}

fn format_shape(shape: &[Dimension]) -> String {
    let dims: Vec<String> = shape.iter().map(|d| d.to_string()).collect();
    format!("[{}]", dims.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Graph, ModelMetadata, TensorInfo};
    use std::collections::BTreeMap;

    fn dense_model() -> OnnxModel {
        let weight = crate::model::Tensor::from_f32("w", vec![2, 2], &[1.0, 2.0, 3.0, 4.0]);
        let bias = crate::model::Tensor::from_f32("b", vec![2], &[0.5, -0.5]);
        let graph = Graph {
            name: "dense".to_string(),
            nodes: vec![
                Node::new("mm", "MatMul", vec!["x".into(), "w".into()], vec!["h".into()]),
                Node::new("add", "Add", vec!["h".into(), "b".into()], vec!["y".into()]),
            ],
            inputs: vec![TensorInfo::new(
                "x",
                DataType::Float,
                vec![Dimension::Param("batch".into()), Dimension::Value(2)],
            )],
            outputs: vec![TensorInfo::new("y", DataType::Float, vec![])],
            initializers: vec![weight, bias],
            value_info: vec![],
            doc_string: String::new(),
        };
        let mut model = OnnxModel {
            metadata: ModelMetadata::default(),
            graph,
            opset_imports: BTreeMap::from([(String::new(), 17)]),
            metadata_props: vec![],
        };
        model.graph.renumber();
        model
    }

    #[test]
    fn runs_dense_graph() {
        let engine = ExecutionEngine::prepared(dense_model(), ExecutionOptions::new()).unwrap();
        let x = Tensor::from_vec(&[1, 2], vec![1.0, 1.0], DataType::Float).unwrap();
        let outputs = engine.run(HashMap::from([("x".to_string(), x)])).unwrap();
        let y = &outputs["y"];
        assert_eq!(y.shape, vec![1, 2]);
        assert_eq!(y.data.iter().copied().collect::<Vec<_>>(), vec![4.5, 5.5]);
    }

    #[test]
    fn rejects_input_with_wrong_static_dim() {
        let engine = ExecutionEngine::prepared(dense_model(), ExecutionOptions::new()).unwrap();
        let x = Tensor::from_vec(&[1, 3], vec![1.0; 3], DataType::Float).unwrap();
        assert!(engine.run(HashMap::from([("x".to_string(), x)])).is_err());
    }

    #[test]
    fn node_without_outputs_is_rejected_at_prepare() {
        let mut model = dense_model();
        model
            .graph
            .nodes
            .push(Node::new("sink", "Relu", vec!["y".into()], vec![]));
        model.graph.renumber();
        let err = ExecutionEngine::prepared(model, ExecutionOptions::new()).err().unwrap();
        assert!(matches!(err, Error::InvalidGraph(ref msg) if msg.contains("no outputs")));
    }

    #[test]
    fn intermediates_are_kept_on_request() {
        let options = ExecutionOptions::new().keep_intermediates(true);
        let engine = ExecutionEngine::prepared(dense_model(), options).unwrap();
        let x = Tensor::from_vec(&[2, 2], vec![1.0, 0.0, 0.0, 1.0], DataType::Float).unwrap();
        let context = engine.run_with_context(HashMap::from([("x".to_string(), x)])).unwrap();
        assert!(context.contains("h"));
        assert!(context.contains("y"));
    }
}
