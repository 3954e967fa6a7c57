use std::collections::{HashMap, HashSet};
use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};
use crate::model::OnnxModel;

/// Result of running an optimization pass
#[derive(Debug, Clone)]
pub struct PassResult {
    /// Name of the pass
    pub name: String,
    /// Number of optimizations applied
    pub optimizations_applied: usize,
    /// Duration of the pass
    pub duration: Duration,
    /// Whether the pass made any changes
    pub changed: bool,
}

/// Statistics from running optimization passes
#[derive(Debug, Clone, Default)]
pub struct OptimizationStats {
    /// Results from each pass
    pub pass_results: Vec<PassResult>,
    /// Total number of optimizations applied
    pub total_optimizations: usize,
    /// Total time spent optimizing
    pub total_duration: Duration,
}

impl OptimizationStats {
    /// Create a new optimization stats object
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pass result
    pub fn add_pass_result(&mut self, result: PassResult) {
        self.total_optimizations += result.optimizations_applied;
        self.total_duration += result.duration;
        self.pass_results.push(result);
    }

    /// Names of the passes that changed the graph
    pub fn applied_passes(&self) -> Vec<String> {
        self.pass_results
            .iter()
            .filter(|r| r.changed)
            .map(|r| r.name.clone())
            .collect()
    }
}

/// Trait for graph optimization passes
pub trait OptimizationPass: Send + Sync {
    /// Name of the pass
    fn name(&self) -> &str;

    /// Run the pass on the model
    fn run(&self, model: &mut OnnxModel) -> Result<PassResult>;

    /// Whether the graph must have static input shapes once this pass has run
    fn requires_fixed_input_shapes(&self) -> bool {
        false
    }

    /// Dependencies of this pass (names of passes that must run before this one)
    fn dependencies(&self) -> Vec<&str> {
        Vec::new()
    }
}

/// Graph optimizer that applies optimization passes
#[derive(Default)]
pub struct GraphOptimizer {
    /// Registered optimization passes
    passes: Vec<Box<dyn OptimizationPass>>,
}

impl GraphOptimizer {
    /// Create a new graph optimizer
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Register an optimization pass
    pub fn register_pass(&mut self, pass: Box<dyn OptimizationPass>) {
        self.passes.push(pass);
    }

    pub fn with_pass(mut self, pass: Box<dyn OptimizationPass>) -> Self {
        self.register_pass(pass);
        self
    }

    pub fn pass_names(&self) -> Vec<&str> {
        self.passes.iter().map(|p| p.name()).collect()
    }

    /// Run every registered pass in dependency order
    ///
    /// A failing pass is reported as `Error::OptimizationFailure` naming the
    /// pass; the model may be partially rewritten at that point, so callers
    /// run this on a copy.
    pub fn run_passes(&self, model: &mut OnnxModel) -> Result<OptimizationStats> {
        let mut stats = OptimizationStats::new();

        // Sort passes by dependencies
        let sorted_passes = self.sort_passes_by_dependencies(&self.passes)?;

        for pass in sorted_passes {
            debug!("Running optimization pass {}", pass.name());
            let result = pass.run(model).map_err(|e| match e {
                failure @ Error::OptimizationFailure { .. } => failure,
                other => Error::OptimizationFailure {
                    pass: pass.name().to_string(),
                    reason: other.to_string(),
                },
            })?;
            debug!(
                "Pass {} applied {} rewrites in {:.2?}",
                result.name, result.optimizations_applied, result.duration
            );
            stats.add_pass_result(result);
        }

        if let Some(pass) = self.passes.iter().find(|p| p.requires_fixed_input_shapes()) {
            if let Some(input) = model
                .graph
                .inputs
                .iter()
                .find(|i| i.shape.iter().any(|d| d.is_dynamic()))
            {
                return Err(Error::OptimizationFailure {
                    pass: pass.name().to_string(),
                    reason: format!("input {} still has dynamic dimensions", input.name),
                });
            }
        }

        Ok(stats)
    }

    /// Sort passes by dependencies
    fn sort_passes_by_dependencies<'a>(
        &self,
        passes: &'a [Box<dyn OptimizationPass>],
    ) -> Result<Vec<&'a dyn OptimizationPass>> {
        let mut sorted_passes = Vec::new();
        let mut visited = HashSet::new();
        let mut visiting = HashSet::new();

        // Build dependency graph
        let mut dep_graph: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut pass_map: HashMap<&str, &dyn OptimizationPass> = HashMap::new();

        for pass in passes {
            let name = pass.name();
            dep_graph.insert(name, pass.dependencies());
            pass_map.insert(name, pass.as_ref());
        }

        // Topological sort, registration order breaks ties
        for pass in passes {
            let name = pass.name();
            if !visited.contains(name) {
                Self::dfs_sort(name, &dep_graph, &pass_map, &mut visited, &mut visiting, &mut sorted_passes)?;
            }
        }

        Ok(sorted_passes)
    }

    /// DFS helper for topological sort
    fn dfs_sort<'a, 'n>(
        pass_name: &'n str,
        dep_graph: &HashMap<&'n str, Vec<&'n str>>,
        pass_map: &HashMap<&'n str, &'a dyn OptimizationPass>,
        visited: &mut HashSet<&'n str>,
        visiting: &mut HashSet<&'n str>,
        sorted_passes: &mut Vec<&'a dyn OptimizationPass>,
    ) -> Result<()> {
        if visited.contains(pass_name) {
            return Ok(());
        }

        if visiting.contains(pass_name) {
            return Err(Error::InvalidGraph(format!(
                "Cycle detected in optimization pass dependencies: {}",
                pass_name
            )));
        }

        visiting.insert(pass_name);

        // Visit dependencies
        if let Some(deps) = dep_graph.get(pass_name) {
            for &dep in deps {
                if !pass_map.contains_key(dep) {
                    return Err(Error::InvalidGraph(format!(
                        "Optimization pass '{}' depends on '{}', which is not registered",
                        pass_name, dep
                    )));
                }

                Self::dfs_sort(dep, dep_graph, pass_map, visited, visiting, sorted_passes)?;
            }
        }

        visiting.remove(pass_name);
        visited.insert(pass_name);

        if let Some(&pass) = pass_map.get(pass_name) {
            sorted_passes.push(pass);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    struct Recording {
        name: &'static str,
        deps: Vec<&'static str>,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl OptimizationPass for Recording {
        fn name(&self) -> &str {
            self.name
        }

        fn run(&self, _model: &mut OnnxModel) -> Result<PassResult> {
            self.log.lock().unwrap().push(self.name.to_string());
            Ok(PassResult {
                name: self.name.to_string(),
                optimizations_applied: 0,
                duration: Duration::ZERO,
                changed: false,
            })
        }

        fn dependencies(&self) -> Vec<&str> {
            self.deps.clone()
        }
    }

    fn empty_model() -> OnnxModel {
        OnnxModel {
            metadata: Default::default(),
            graph: crate::model::Graph {
                name: "g".into(),
                nodes: vec![],
                inputs: vec![],
                outputs: vec![],
                initializers: vec![],
                value_info: vec![],
                doc_string: String::new(),
            },
            opset_imports: Default::default(),
            metadata_props: vec![],
        }
    }

    #[test]
    fn passes_run_after_their_dependencies() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let optimizer = GraphOptimizer::new()
            .with_pass(Box::new(Recording { name: "b", deps: vec!["a"], log: log.clone() }))
            .with_pass(Box::new(Recording { name: "a", deps: vec![], log: log.clone() }));
        optimizer.run_passes(&mut empty_model()).unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn missing_dependency_is_an_error() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let optimizer = GraphOptimizer::new()
            .with_pass(Box::new(Recording { name: "b", deps: vec!["a"], log }));
        assert!(optimizer.run_passes(&mut empty_model()).is_err());
    }
}
