use std::collections::HashSet;
use std::time::Instant;

use crate::error::Result;
use crate::model::OnnxModel;
use crate::optimization::graph_optimizer::{OptimizationPass, PassResult};
use crate::parser::GraphBuilder;

/// Removes nodes and initializers that do not contribute to a graph output
#[derive(Debug, Default)]
pub struct DeadNodeElimination;

impl DeadNodeElimination {
    pub fn new() -> Self {
        Self
    }
}

impl OptimizationPass for DeadNodeElimination {
    fn name(&self) -> &str {
        "DeadNodeElimination"
    }

    fn run(&self, model: &mut OnnxModel) -> Result<PassResult> {
        let start_time = Instant::now();
        let graph = &mut model.graph;

        let live = GraphBuilder::live_nodes(graph);
        let nodes_before = graph.nodes.len();
        graph.nodes.retain(|n| live.contains(&n.id));
        graph.renumber();

        let referenced: HashSet<String> = graph
            .nodes
            .iter()
            .flat_map(|n| n.inputs.iter().chain(n.outputs.iter()).cloned())
            .chain(graph.outputs.iter().map(|o| o.name.clone()))
            .collect();

        let initializers_before = graph.initializers.len();
        graph.initializers.retain(|t| referenced.contains(&t.name));
        graph.value_info.retain(|info| referenced.contains(&info.name));

        let removed = (nodes_before - graph.nodes.len())
            + (initializers_before - graph.initializers.len());

        Ok(PassResult {
            name: self.name().to_string(),
            optimizations_applied: removed,
            duration: start_time.elapsed(),
            changed: removed > 0,
        })
    }

    fn dependencies(&self) -> Vec<&str> {
        vec!["OperatorFusion"]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DataType, Graph, Node, Tensor, TensorInfo};
    use std::collections::BTreeMap;

    #[test]
    fn unreachable_branch_and_its_weights_are_dropped() {
        let mut model = OnnxModel {
            metadata: Default::default(),
            graph: Graph {
                name: "g".into(),
                nodes: vec![
                    Node::new("keep", "Relu", vec!["x".into()], vec!["y".into()]),
                    Node::new("dead", "Mul", vec!["x".into(), "k".into()], vec!["unused".into()]),
                ],
                inputs: vec![TensorInfo::new("x", DataType::Float, vec![])],
                outputs: vec![TensorInfo::new("y", DataType::Float, vec![])],
                initializers: vec![Tensor::from_f32("k", vec![1], &[2.0])],
                value_info: vec![TensorInfo::new("unused", DataType::Float, vec![])],
                doc_string: String::new(),
            },
            opset_imports: BTreeMap::new(),
            metadata_props: vec![],
        };
        model.graph.renumber();

        let result = DeadNodeElimination::new().run(&mut model).unwrap();
        assert_eq!(result.optimizations_applied, 2);
        assert_eq!(model.graph.nodes.len(), 1);
        assert!(model.graph.initializers.is_empty());
        assert!(model.graph.value_info.is_empty());
    }
}
