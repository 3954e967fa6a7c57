//! Numeric comparison of an exported graph against the reference model.

use std::collections::{BTreeMap, HashMap};

use log::{debug, info, warn};
use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::config::{PipelineConfig, Tolerance};
use crate::error::{Error, Result};
use crate::execution::{ExecutionEngine, ExecutionOptions};
use crate::model::{DataType, OnnxModel};
use crate::ops::Tensor;
use crate::parser::SchemaValidator;
use crate::pipeline::exporter::ExportedGraph;
use crate::pipeline::sample::SampleInput;

/// Results of comparing a single output tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorComparisonResult {
    pub name: String,
    pub expected_shape: Vec<usize>,
    pub actual_shape: Vec<usize>,
    pub shape_match: bool,
    /// Maximum absolute difference between corresponding elements
    pub max_abs_diff: f32,
    /// Maximum relative difference between corresponding elements
    pub max_rel_diff: f32,
    /// Average absolute difference between corresponding elements
    pub mean_abs_diff: f32,
    pub element_count: usize,
    /// Elements outside tolerance
    pub mismatched_elements: usize,
    /// NaN or Inf values in the exported output
    pub non_finite: usize,
    pub passed: bool,
}

impl TensorComparisonResult {
    fn missing(name: &str, expected_shape: Vec<usize>) -> Self {
        Self {
            name: name.to_string(),
            expected_shape,
            actual_shape: Vec::new(),
            shape_match: false,
            max_abs_diff: f32::INFINITY,
            max_rel_diff: f32::INFINITY,
            mean_abs_diff: f32::INFINITY,
            element_count: 0,
            mismatched_elements: 0,
            non_finite: 0,
            passed: false,
        }
    }

    fn describe(&self) -> String {
        if !self.shape_match {
            if self.element_count == 0 && self.actual_shape.is_empty() {
                return format!("{}: missing output, expected shape {:?}", self.name, self.expected_shape);
            }
            return format!("{}: shape {:?} vs expected {:?}", self.name, self.actual_shape, self.expected_shape);
        }
        format!(
            "{}: {}/{} elements outside tolerance, max abs diff {:.3e}, max rel diff {:.3e}, {} non-finite",
            self.name,
            self.mismatched_elements,
            self.element_count,
            self.max_abs_diff,
            self.max_rel_diff,
            self.non_finite
        )
    }
}

/// Compare one exported output against its reference
pub fn compare_tensors(name: &str, expected: &ArrayD<f32>, actual: &Tensor, tolerance: &Tolerance) -> TensorComparisonResult {
    let expected_shape = expected.shape().to_vec();
    let actual_shape = actual.shape.clone();
    if expected_shape != actual_shape {
        return TensorComparisonResult {
            actual_shape,
            ..TensorComparisonResult::missing(name, expected_shape)
        };
    }

    let mut max_abs_diff = 0.0f32;
    let mut max_rel_diff = 0.0f32;
    let mut sum_abs_diff = 0.0f64;
    let mut mismatched_elements = 0;
    let mut non_finite = 0;
    for (e, a) in expected.iter().zip(actual.data.iter()) {
        if !a.is_finite() {
            non_finite += 1;
        }
        let diff = (a - e).abs();
        if !tolerance.allows(*a, *e) {
            mismatched_elements += 1;
        }
        if diff.is_finite() {
            max_abs_diff = max_abs_diff.max(diff);
            max_rel_diff = max_rel_diff.max(diff / e.abs().max(f32::EPSILON));
            sum_abs_diff += diff as f64;
        }
    }
    let element_count = expected.len();
    TensorComparisonResult {
        name: name.to_string(),
        expected_shape,
        actual_shape,
        shape_match: true,
        max_abs_diff,
        max_rel_diff,
        mean_abs_diff: if element_count > 0 { (sum_abs_diff / element_count as f64) as f32 } else { 0.0 },
        element_count,
        mismatched_elements,
        non_finite,
        passed: mismatched_elements == 0 && non_finite == 0,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub passed: bool,
    /// Failed, but reported as a warning by configuration
    pub downgraded: bool,
    /// Load-and-run check without a reference
    pub smoke: bool,
    pub tolerance: Tolerance,
    pub outputs: Vec<TensorComparisonResult>,
}

impl ValidationReport {
    fn from_outputs(outputs: Vec<TensorComparisonResult>, tolerance: Tolerance, smoke: bool) -> Self {
        Self {
            passed: !outputs.is_empty() && outputs.iter().all(|o| o.passed),
            downgraded: false,
            smoke,
            tolerance,
            outputs,
        }
    }

    pub fn failing(&self) -> Vec<&TensorComparisonResult> {
        self.outputs.iter().filter(|o| !o.passed).collect()
    }

    /// One line per failing output
    pub fn summary(&self) -> String {
        if self.outputs.is_empty() {
            return "graph produced no outputs".to_string();
        }
        self.failing()
            .iter()
            .map(|o| o.describe())
            .collect::<Vec<_>>()
            .join("; ")
    }

    pub fn max_abs_diff(&self) -> BTreeMap<String, f32> {
        self.outputs.iter().map(|o| (o.name.clone(), o.max_abs_diff)).collect()
    }
}

/// Runs exported graphs in the execution engine and judges their outputs
pub struct Validator<'a> {
    config: &'a PipelineConfig,
}

impl<'a> Validator<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self { config }
    }

    fn execute(&self, model_id: &str, graph: &ExportedGraph, feed: HashMap<String, Tensor>) -> Result<HashMap<String, Tensor>> {
        let model = graph.decode()?;
        SchemaValidator::new()
            .validate_model(&model)
            .map_err(|e| Error::ValidationMismatch {
                model: model_id.to_string(),
                summary: format!("graph is not well formed: {}", e),
            })?;
        let engine = ExecutionEngine::prepared(model, ExecutionOptions::new()).map_err(|e| Error::ValidationMismatch {
            model: model_id.to_string(),
            summary: format!("graph does not load in the execution engine: {}", e),
        })?;
        engine.run(feed).map_err(|e| Error::ValidationMismatch {
            model: model_id.to_string(),
            summary: format!("graph does not run: {}", e),
        })
    }

    /// Compare the graph's outputs on `sample` with the reference outputs
    pub fn validate(
        &self,
        model_id: &str,
        graph: &ExportedGraph,
        sample: &SampleInput,
        reference: &BTreeMap<String, ArrayD<f32>>,
    ) -> Result<ValidationReport> {
        let tolerance = self.config.tolerance();
        let actual = self.execute(model_id, graph, sample.to_feed())?;

        let outputs = graph
            .output_names
            .iter()
            .map(|name| match (reference.get(name), actual.get(name)) {
                (Some(expected), Some(tensor)) => compare_tensors(name, expected, tensor, &tolerance),
                (Some(expected), None) => TensorComparisonResult::missing(name, expected.shape().to_vec()),
                (None, _) => TensorComparisonResult::missing(name, Vec::new()),
            })
            .collect();
        let report = ValidationReport::from_outputs(outputs, tolerance, false);
        for output in &report.outputs {
            debug!(
                "{}: max abs diff {:.3e}, mean abs diff {:.3e}",
                output.name, output.max_abs_diff, output.mean_abs_diff
            );
        }
        self.gate(model_id, report)
    }

    /// Load-and-run check of a graph with synthesized inputs
    pub fn smoke_check(&self, model_id: &str, graph: &ExportedGraph) -> Result<ValidationReport> {
        let model = graph.decode()?;
        let feed = synthesize_inputs(&model)?;
        let actual = self.execute(model_id, graph, feed)?;

        let outputs = model
            .graph
            .outputs
            .iter()
            .map(|declared| match actual.get(&declared.name) {
                None => TensorComparisonResult::missing(&declared.name, Vec::new()),
                Some(tensor) => {
                    // Dynamic dims take the produced extent; rank always comes from the declaration
                    let expected_shape: Vec<usize> = declared
                        .shape
                        .iter()
                        .enumerate()
                        .map(|(axis, d)| match d.value() {
                            Some(v) => v.max(0) as usize,
                            None => tensor.shape.get(axis).copied().unwrap_or(0),
                        })
                        .collect();
                    let shape_match = declared.shape.is_empty() || expected_shape == tensor.shape;
                    let non_finite = tensor.non_finite_count();
                    TensorComparisonResult {
                        name: declared.name.clone(),
                        expected_shape,
                        actual_shape: tensor.shape.clone(),
                        shape_match,
                        max_abs_diff: 0.0,
                        max_rel_diff: 0.0,
                        mean_abs_diff: 0.0,
                        element_count: tensor.len(),
                        mismatched_elements: 0,
                        non_finite,
                        passed: shape_match && non_finite == 0,
                    }
                }
            })
            .collect();
        let report = ValidationReport::from_outputs(outputs, self.config.tolerance(), true);
        self.gate(model_id, report)
    }

    /// Fail on a failed report unless configured to warn
    fn gate(&self, model_id: &str, mut report: ValidationReport) -> Result<ValidationReport> {
        if report.passed {
            info!("Validation passed for {} ({} outputs)", model_id, report.outputs.len());
            return Ok(report);
        }
        if self.config.allow_validation_failure {
            warn!("Validation failed for {}, continuing: {}", model_id, report.summary());
            report.downgraded = true;
            return Ok(report);
        }
        Err(Error::ValidationMismatch {
            model: model_id.to_string(),
            summary: report.summary(),
        })
    }
}

/// One input per declared graph input, dynamic axes set to 1
pub fn synthesize_inputs(model: &OnnxModel) -> Result<HashMap<String, Tensor>> {
    model
        .graph
        .inputs
        .iter()
        .filter(|input| !model.graph.is_initializer(&input.name))
        .map(|input| {
            let shape: Vec<usize> = input
                .shape
                .iter()
                .map(|d| d.value().filter(|v| *v > 0).map_or(1, |v| v as usize))
                .collect();
            let count = shape.iter().product();
            let fill = if input.data_type.is_floating_point() { 0.5 } else { 0.0 };
            let data_type = if input.data_type == DataType::Undefined { DataType::Float } else { input.data_type };
            let tensor = Tensor::from_vec(&shape, vec![fill; count], data_type)?.with_name(input.name.clone());
            Ok((input.name.clone(), tensor))
        })
        .collect()
}
