use std::collections::{HashMap, HashSet};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::model::{Node, NodeId, OnnxModel};
use crate::optimization::graph_optimizer::{OptimizationPass, PassResult};
use crate::optimization::passes::shape_inference::ShapeInference;

/// Candidate for operator fusion
#[derive(Debug)]
pub struct FusionCandidate {
    /// Pattern name
    pub pattern_name: &'static str,
    /// Nodes involved in the fusion
    pub nodes: Vec<NodeId>,
    /// Node that replaces the fused nodes, `None` when they are simply bypassed
    pub fused_node: Option<Node>,
}

/// Operator fusion pass
///
/// Folds `MatMul` + `Add` into `Gemm` when the activation is a matrix and
/// both weight and bias are initializers, and bypasses `Identity` nodes.
pub struct OperatorFusion {
    /// Name of the pass
    name: String,
}

impl Default for OperatorFusion {
    fn default() -> Self {
        Self::new()
    }
}

impl OperatorFusion {
    /// Create a new operator fusion pass
    pub fn new() -> Self {
        Self {
            name: "OperatorFusion".to_string(),
        }
    }

    /// Find fusion patterns in the graph
    pub fn find_fusion_patterns(&self, model: &OnnxModel) -> Vec<FusionCandidate> {
        let mut candidates = self.find_matmul_add_patterns(model);
        candidates.extend(self.find_identity_patterns(model));
        candidates
    }

    /// Apply fusion to a graph
    pub fn apply_fusion(&self, model: &mut OnnxModel, candidates: Vec<FusionCandidate>) -> Result<usize> {
        let mut count = 0;

        // Track nodes that have been fused, so we don't try to fuse them again
        let mut fused_nodes = HashSet::new();

        for candidate in candidates {
            if candidate.nodes.iter().any(|node_id| fused_nodes.contains(node_id)) {
                continue;
            }

            match candidate.pattern_name {
                "matmul_add" => self.apply_matmul_add_fusion(model, &candidate)?,
                "identity" => self.apply_identity_bypass(model, &candidate)?,
                other => {
                    return Err(Error::InvalidGraph(format!("Unknown fusion pattern {}", other)))
                }
            }
            count += 1;

            fused_nodes.extend(candidate.nodes.iter().copied());
        }

        model.graph.renumber();
        Ok(count)
    }

    /// Find MatMul + Add patterns
    fn find_matmul_add_patterns(&self, model: &OnnxModel) -> Vec<FusionCandidate> {
        let graph = &model.graph;
        let shapes = match ShapeInference::new().infer(model) {
            Ok(shapes) => shapes,
            Err(_) => return Vec::new(),
        };
        let graph_outputs: HashSet<&str> = graph.outputs.iter().map(|o| o.name.as_str()).collect();

        let mut candidates = Vec::new();
        for matmul in graph.nodes.iter().filter(|n| n.op_type == "MatMul") {
            let (activation, weight) = match matmul.inputs.as_slice() {
                [a, b] => (a, b),
                _ => continue,
            };
            let product = &matmul.outputs[0];

            // Gemm only takes matrices
            let is_matrix = shapes.get(activation).map_or(false, |info| info.shape.len() == 2);
            let weight_is_matrix = graph.initializer(weight).map_or(false, |w| w.dims.len() == 2);
            if !is_matrix || !weight_is_matrix || graph_outputs.contains(product.as_str()) {
                continue;
            }

            let consumers = graph.consumers(product);
            let add = match consumers.as_slice() {
                [add] if add.op_type == "Add" => *add,
                _ => continue,
            };
            let bias = match add.inputs.iter().find(|i| *i != product) {
                Some(bias) if graph.initializer(bias).map_or(false, |b| b.dims.len() <= 2) => bias,
                _ => continue,
            };

            let fused_node = Node::new(
                format!("{}_gemm", matmul.name),
                "Gemm",
                vec![activation.clone(), weight.clone(), bias.clone()],
                add.outputs.clone(),
            );
            candidates.push(FusionCandidate {
                pattern_name: "matmul_add",
                nodes: vec![matmul.id, add.id],
                fused_node: Some(fused_node),
            });
        }
        candidates
    }

    /// Find Identity nodes that can be bypassed
    fn find_identity_patterns(&self, model: &OnnxModel) -> Vec<FusionCandidate> {
        let graph_outputs: HashSet<&str> =
            model.graph.outputs.iter().map(|o| o.name.as_str()).collect();

        model
            .graph
            .nodes
            .iter()
            .filter(|n| n.op_type == "Identity")
            .filter(|n| !n.outputs.iter().any(|o| graph_outputs.contains(o.as_str())))
            .map(|n| FusionCandidate {
                pattern_name: "identity",
                nodes: vec![n.id],
                fused_node: None,
            })
            .collect()
    }

    fn apply_matmul_add_fusion(&self, model: &mut OnnxModel, candidate: &FusionCandidate) -> Result<()> {
        let fused = candidate
            .fused_node
            .clone()
            .ok_or_else(|| Error::InvalidGraph("MatMul+Add fusion without a fused node".to_string()))?;

        let nodes = &mut model.graph.nodes;
        let position = nodes
            .iter()
            .position(|n| n.id == candidate.nodes[0])
            .ok_or_else(|| Error::InvalidGraph(format!("Node {} not found", candidate.nodes[0])))?;
        let product = nodes[position].outputs.clone();
        nodes[position] = Node { id: candidate.nodes[0], ..fused };
        nodes.retain(|n| n.id != candidate.nodes[1]);

        // The MatMul result no longer exists
        model.graph.value_info.retain(|info| !product.contains(&info.name));
        Ok(())
    }

    fn apply_identity_bypass(&self, model: &mut OnnxModel, candidate: &FusionCandidate) -> Result<()> {
        let identity = model
            .graph
            .nodes
            .iter()
            .find(|n| n.id == candidate.nodes[0])
            .cloned()
            .ok_or_else(|| Error::InvalidGraph(format!("Node {} not found", candidate.nodes[0])))?;

        let rename: HashMap<&str, &str> = identity
            .outputs
            .iter()
            .map(|o| o.as_str())
            .zip(identity.inputs.iter().map(|i| i.as_str()))
            .collect();

        model.graph.nodes.retain(|n| n.id != identity.id);
        for node in model.graph.nodes.iter_mut() {
            for input in node.inputs.iter_mut() {
                if let Some(source) = rename.get(input.as_str()) {
                    *input = source.to_string();
                }
            }
        }
        model
            .graph
            .value_info
            .retain(|info| !rename.contains_key(info.name.as_str()));
        Ok(())
    }
}

impl OptimizationPass for OperatorFusion {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, model: &mut OnnxModel) -> Result<PassResult> {
        let start_time = Instant::now();

        // Find fusion candidates
        let candidates = self.find_fusion_patterns(model);

        // Apply fusions
        let count = self.apply_fusion(model, candidates)?;

        let duration = start_time.elapsed();

        Ok(PassResult {
            name: self.name.clone(),
            optimizations_applied: count,
            duration,
            changed: count > 0,
        })
    }

    fn dependencies(&self) -> Vec<&str> {
        // Fusion reads the annotated shapes
        vec!["ShapeInference"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataType, Dimension, Graph, Tensor, TensorInfo};
    use std::collections::BTreeMap;

    fn model(nodes: Vec<Node>, input_shape: Vec<Dimension>) -> OnnxModel {
        let mut model = OnnxModel {
            metadata: Default::default(),
            graph: Graph {
                name: "g".into(),
                nodes,
                inputs: vec![TensorInfo::new("x", DataType::Float, input_shape)],
                outputs: vec![TensorInfo::new("y", DataType::Float, vec![])],
                initializers: vec![
                    Tensor::from_f32("w", vec![3, 2], &[1.0; 6]),
                    Tensor::from_f32("b", vec![2], &[0.5; 2]),
                ],
                value_info: vec![],
                doc_string: String::new(),
            },
            opset_imports: BTreeMap::from([(String::new(), 17)]),
            metadata_props: vec![],
        };
        model.graph.renumber();
        model
    }

    fn dense_nodes() -> Vec<Node> {
        vec![
            Node::new("id", "Identity", vec!["x".into()], vec!["x1".into()]),
            Node::new("mm", "MatMul", vec!["x1".into(), "w".into()], vec!["h".into()]),
            Node::new("add", "Add", vec!["h".into(), "b".into()], vec!["y".into()]),
        ]
    }

    #[test]
    fn matrix_dense_becomes_gemm() {
        let mut m = model(dense_nodes(), vec![Dimension::Param("batch".into()), Dimension::Value(3)]);
        let result = OperatorFusion::new().run(&mut m).unwrap();
        assert_eq!(result.optimizations_applied, 2);
        let ops: Vec<&str> = m.graph.nodes.iter().map(|n| n.op_type.as_str()).collect();
        assert_eq!(ops, vec!["Gemm"]);
        assert_eq!(m.graph.nodes[0].inputs, vec!["x", "w", "b"]);
        assert_eq!(m.graph.nodes[0].outputs, vec!["y"]);
    }

    #[test]
    fn rank_three_dense_is_left_alone() {
        let shape = vec![Dimension::Param("batch".into()), Dimension::Value(4), Dimension::Value(3)];
        let mut m = model(dense_nodes(), shape);
        OperatorFusion::new().run(&mut m).unwrap();
        let ops: Vec<&str> = m.graph.nodes.iter().map(|n| n.op_type.as_str()).collect();
        assert_eq!(ops, vec!["MatMul", "Add"]);
        assert_eq!(m.graph.nodes[0].inputs[0], "x");
    }
}
