use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Dfs, Reversed};

use crate::error::{Error, Result};
use crate::model::{Graph, Node, NodeId, TensorInfo};

/// Nodes in execution order plus their data dependencies
#[derive(Debug, Clone)]
pub struct ExecutionGraph {
    pub nodes: Vec<Node>,
    pub output_nodes: Vec<NodeId>,
    pub dependencies: HashMap<NodeId, Vec<NodeId>>,
}

/// Graph builder responsible for constructing the computational graph
pub struct GraphBuilder;

impl GraphBuilder {
    /// Build an execution graph from a model graph
    pub fn build_graph(graph: &Graph) -> Result<ExecutionGraph> {
        let sorted_nodes = Self::topological_sort(&graph.nodes)?;
        let dependencies = Self::build_dependency_map(&sorted_nodes);
        let output_nodes = Self::find_output_nodes(&sorted_nodes, &graph.outputs);

        Ok(ExecutionGraph {
            nodes: sorted_nodes,
            output_nodes,
            dependencies,
        })
    }

    /// Map of tensor name to the node producing it
    pub fn tensor_producers(nodes: &[Node]) -> HashMap<&str, NodeId> {
        let mut producers = HashMap::new();
        for node in nodes {
            for output in node.outputs.iter().filter(|o| !o.is_empty()) {
                producers.insert(output.as_str(), node.id);
            }
        }
        producers
    }

    fn dependency_graph(nodes: &[Node]) -> (DiGraph<NodeId, ()>, HashMap<NodeId, NodeIndex>) {
        let mut dag = DiGraph::new();
        let indices: HashMap<NodeId, NodeIndex> =
            nodes.iter().map(|n| (n.id, dag.add_node(n.id))).collect();

        let producers = Self::tensor_producers(nodes);
        for node in nodes {
            for input in node.inputs.iter().filter(|i| !i.is_empty()) {
                // Tensors without a producer are graph inputs or initializers
                if let Some(producer) = producers.get(input.as_str()) {
                    dag.update_edge(indices[producer], indices[&node.id], ());
                }
            }
        }
        (dag, indices)
    }

    /// Sort nodes topologically
    pub fn topological_sort(nodes: &[Node]) -> Result<Vec<Node>> {
        let (dag, _) = Self::dependency_graph(nodes);
        let order = toposort(&dag, None).map_err(|cycle| {
            Error::InvalidGraph(format!(
                "Graph contains a cycle through node {}",
                dag[cycle.node_id()]
            ))
        })?;

        let by_id: HashMap<NodeId, &Node> = nodes.iter().map(|n| (n.id, n)).collect();
        order
            .into_iter()
            .map(|index| {
                let id = dag[index];
                by_id
                    .get(&id)
                    .map(|n| (*n).clone())
                    .ok_or_else(|| Error::InvalidGraph(format!("Unknown node id {}", id)))
            })
            .collect()
    }

    /// Nodes whose results reach at least one graph output
    pub fn live_nodes(graph: &Graph) -> HashSet<NodeId> {
        let (dag, indices) = Self::dependency_graph(&graph.nodes);
        let output_nodes = Self::find_output_nodes(&graph.nodes, &graph.outputs);

        let reversed = Reversed(&dag);
        let mut live = HashSet::new();
        for id in output_nodes {
            let mut dfs = Dfs::new(reversed, indices[&id]);
            while let Some(index) = dfs.next(reversed) {
                live.insert(dag[index]);
            }
        }
        live
    }

    /// Find output nodes in the execution graph
    pub fn find_output_nodes(nodes: &[Node], model_outputs: &[TensorInfo]) -> Vec<NodeId> {
        let model_output_names: HashSet<&str> =
            model_outputs.iter().map(|o| o.name.as_str()).collect();

        nodes
            .iter()
            .filter(|node| {
                node.outputs
                    .iter()
                    .any(|o| model_output_names.contains(o.as_str()))
            })
            .map(|node| node.id)
            .collect()
    }

    /// Build a dependency map for all nodes
    pub fn build_dependency_map(nodes: &[Node]) -> HashMap<NodeId, Vec<NodeId>> {
        let producers = Self::tensor_producers(nodes);

        nodes
            .iter()
            .map(|node| {
                let mut dependencies = Vec::new();
                for input in &node.inputs {
                    if let Some(&producer_id) = producers.get(input.as_str()) {
                        if !dependencies.contains(&producer_id) {
                            dependencies.push(producer_id);
                        }
                    }
                }
                (node.id, dependencies)
            })
            .collect()
    }
}
