use std::sync::Arc;

use log::{info, warn};

use crate::config::{PipelineConfig, QuantizationMode};
use crate::error::{Error, Result};
use crate::model::OnnxModel;
use crate::optimization::{
    DeadNodeElimination, FixedShape, Float16Quantization, GraphOptimizer, Int8Quantization, OperatorFusion,
    OptimizationPass, OptimizationStats, ShapeInference,
};
use crate::parser::SchemaValidator;
use crate::pipeline::exporter::ExportedGraph;
use crate::pipeline::sample::SampleInput;

/// Builds an extra pass for each optimizer run
pub type PassFactory = Arc<dyn Fn() -> Box<dyn OptimizationPass> + Send + Sync>;

/// Which path the optimizer took
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimizationOutcome {
    Optimized,
    Skipped,
    /// The input graph was kept unchanged
    Fallback { reason: String },
}

impl OptimizationOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizationOutcome::Optimized => "optimized",
            OptimizationOutcome::Skipped => "skipped",
            OptimizationOutcome::Fallback { .. } => "fallback",
        }
    }

    pub fn fallback_reason(&self) -> Option<&str> {
        match self {
            OptimizationOutcome::Fallback { reason } => Some(reason),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct OptimizationResult {
    pub graph: ExportedGraph,
    /// Quantization actually present in `graph`
    pub quantization: QuantizationMode,
    pub fusion_applied: bool,
    /// Passes that changed the graph
    pub passes: Vec<String>,
    pub outcome: OptimizationOutcome,
    /// Optimized size minus exported size
    pub size_delta_bytes: i64,
}

impl OptimizationResult {
    pub fn unchanged(graph: ExportedGraph, outcome: OptimizationOutcome) -> Self {
        Self {
            graph,
            quantization: QuantizationMode::None,
            fusion_applied: false,
            passes: Vec::new(),
            outcome,
            size_delta_bytes: 0,
        }
    }

    pub fn optimization_applied(&self) -> bool {
        self.outcome == OptimizationOutcome::Optimized
    }
}

/// Shape inference, fusion, cleanup and quantization of an exported graph
pub struct OptimizerStage<'a> {
    config: &'a PipelineConfig,
    extra_passes: &'a [PassFactory],
}

impl<'a> OptimizerStage<'a> {
    pub fn new(config: &'a PipelineConfig, extra_passes: &'a [PassFactory]) -> Self {
        Self { config, extra_passes }
    }

    fn build(&self, sample: &SampleInput, calibration: &[SampleInput]) -> GraphOptimizer {
        let mut optimizer = GraphOptimizer::new();
        if self.config.needs_fixed_shapes() {
            optimizer.register_pass(Box::new(FixedShape::new(sample.shapes())));
        }
        optimizer.register_pass(Box::new(ShapeInference::new()));
        optimizer.register_pass(Box::new(OperatorFusion::new()));
        optimizer.register_pass(Box::new(DeadNodeElimination::new()));
        match self.config.quantization {
            QuantizationMode::None => {}
            QuantizationMode::Float16 => optimizer.register_pass(Box::new(Float16Quantization::new())),
            QuantizationMode::Int8 => {
                let feeds = calibration.iter().map(SampleInput::to_feed).collect();
                optimizer.register_pass(Box::new(Int8Quantization::new(feeds)));
            }
        }
        for factory in self.extra_passes {
            optimizer.register_pass(factory());
        }
        optimizer
    }

    /// Optimize `exported`; any internal failure falls back to the input graph
    pub fn optimize(
        &self,
        exported: &ExportedGraph,
        sample: &SampleInput,
        calibration: &[SampleInput],
    ) -> Result<OptimizationResult> {
        if self.config.skip_optimization {
            info!("Optimization skipped by configuration");
            return Ok(OptimizationResult::unchanged(exported.clone(), OptimizationOutcome::Skipped));
        }
        if self.config.quantization == QuantizationMode::Int8 && calibration.is_empty() {
            return Err(Error::Config(
                "int8 quantization requires a calibration set".to_string(),
            ));
        }

        let optimizer = self.build(sample, calibration);
        info!("Optimizing with passes {:?}", optimizer.pass_names());

        match self.try_optimize(&optimizer, exported) {
            Ok((graph, stats)) => {
                let fusion_applied = stats
                    .pass_results
                    .iter()
                    .any(|r| r.name == "OperatorFusion" && r.changed);
                let size_delta_bytes = graph.size_bytes() as i64 - exported.size_bytes() as i64;
                info!(
                    "Optimized graph: {} -> {} bytes ({} rewrites in {:.2?})",
                    exported.size_bytes(),
                    graph.size_bytes(),
                    stats.total_optimizations,
                    stats.total_duration
                );
                Ok(OptimizationResult {
                    graph,
                    quantization: self.config.quantization,
                    fusion_applied,
                    passes: stats.applied_passes(),
                    outcome: OptimizationOutcome::Optimized,
                    size_delta_bytes,
                })
            }
            Err(e) => {
                warn!("Optimization failed, keeping the exported graph: {}", e);
                Ok(OptimizationResult::unchanged(
                    exported.clone(),
                    OptimizationOutcome::Fallback { reason: e.to_string() },
                ))
            }
        }
    }

    fn try_optimize(
        &self,
        optimizer: &GraphOptimizer,
        exported: &ExportedGraph,
    ) -> Result<(ExportedGraph, OptimizationStats)> {
        let mut model = exported.decode()?;
        let stats = optimizer.run_passes(&mut model)?;
        let optimized = ExportedGraph::serialize(&model);
        check_post_conditions(exported, &optimized).map_err(|e| Error::OptimizationFailure {
            pass: "post-check".to_string(),
            reason: e.to_string(),
        })?;
        Ok((optimized, stats))
    }

    /// Fixed-shape variant of a validated graph, for static-shape runtimes
    pub fn fixed_variant(&self, graph: &ExportedGraph, sample: &SampleInput) -> Result<ExportedGraph> {
        let optimizer = GraphOptimizer::new()
            .with_pass(Box::new(FixedShape::new(sample.shapes())))
            .with_pass(Box::new(ShapeInference::new()));
        let mut model = graph.decode()?;
        optimizer.run_passes(&mut model)?;
        let fixed = ExportedGraph::serialize(&model);
        check_post_conditions(graph, &fixed)?;
        Ok(fixed)
    }
}

/// The optimized bytes decode, keep the interface and pass schema checks
fn check_post_conditions(before: &ExportedGraph, after: &ExportedGraph) -> Result<OnnxModel> {
    let decoded = after.decode()?;
    let (inputs, outputs) = (decoded.input_names(), decoded.output_names());
    if before.input_names != inputs || before.output_names != outputs {
        return Err(Error::ValidationError(format!(
            "interface changed: {:?}/{:?} -> {:?}/{:?}",
            before.input_names, before.output_names, inputs, outputs
        )));
    }
    SchemaValidator::new().validate_model(&decoded)?;
    Ok(decoded)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outcome_names_are_stable() {
        assert_eq!(OptimizationOutcome::Optimized.as_str(), "optimized");
        let fallback = OptimizationOutcome::Fallback { reason: "boom".into() };
        assert_eq!(fallback.as_str(), "fallback");
        assert_eq!(fallback.fallback_reason(), Some("boom"));
        assert_eq!(OptimizationOutcome::Skipped.fallback_reason(), None);
    }
}
