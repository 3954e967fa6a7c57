//! The conversion pipeline: load, sample, export, optimize, validate, package.

pub mod architecture;
pub mod exporter;
pub mod loader;
pub mod optimizer;
pub mod packager;
pub mod reference;
pub mod repository;
pub mod sample;
pub mod source;
pub mod validator;

use std::path::Path;
use std::time::Instant;

use log::info;
use rayon::prelude::*;

use crate::config::PipelineConfig;
use crate::error::{Error, Result, Stage, StageFailure};

pub use exporter::{ExportedGraph, GraphExporter};
pub use loader::SourceModelLoader;
pub use optimizer::{OptimizationOutcome, OptimizationResult, OptimizerStage, PassFactory};
pub use packager::{
    update_registry, verify_artifact, ArtifactMetadata, ArtifactPackager, DeploymentArtifact, PackageInput,
    REGISTRY_FILE,
};
pub use repository::{open_repository, LocalRepository, ModelRepository};
pub use sample::{SampleInput, SampleInputBuilder};
pub use source::{ClassMap, SourceModel};
pub use validator::{ValidationReport, Validator};

/// Outcome of one model variant
pub type VariantResult = std::result::Result<DeploymentArtifact, StageFailure>;

/// Runs every configured model variant through the stages
pub struct Pipeline {
    config: PipelineConfig,
    extra_passes: Vec<PassFactory>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            extra_passes: Vec::new(),
        }
    }

    /// Append a pass to every optimizer run
    pub fn with_pass(mut self, factory: PassFactory) -> Self {
        self.extra_passes.push(factory);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Check the configuration and open the repository before any stage runs
    fn preflight(&self) -> Result<Box<dyn ModelRepository>> {
        self.config.validate()?;
        open_repository(&self.config.repository)
    }

    /// Run every variant, then list the packaged ones in the registry.
    /// `Err` when nothing could start or the registry cannot be written.
    pub fn run(&self) -> Result<Vec<VariantResult>> {
        let repository = self.preflight()?;
        let repository = repository.as_ref();

        let results: Vec<VariantResult> = if self.config.jobs > 1 && self.config.models.len() > 1 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(self.config.jobs)
                .build()
                .map_err(|e| Error::Config(format!("worker pool: {}", e)))?;
            pool.install(|| {
                self.config
                    .models
                    .par_iter()
                    .map(|model_id| self.run_variant(model_id, repository))
                    .collect()
            })
        } else {
            self.config
                .models
                .iter()
                .map(|model_id| self.run_variant(model_id, repository))
                .collect()
        };

        let packaged: Vec<&DeploymentArtifact> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        if !packaged.is_empty() {
            update_registry(&self.config.output_dir, &packaged)?;
        }
        Ok(results)
    }

    /// The full stage chain for one model
    pub fn run_variant(&self, model_id: &str, repository: &dyn ModelRepository) -> VariantResult {
        let start = Instant::now();
        let fail = |stage: Stage| move |e: Error| StageFailure::new(model_id, stage, e);
        let config = &self.config;

        let model = SourceModelLoader::new(config, repository)
            .load(model_id)
            .map_err(fail(Stage::Load))?;

        let builder = SampleInputBuilder::new(config);
        let sample = builder.canonical(&model).map_err(fail(Stage::SampleInputs))?;
        let calibration = builder
            .calibration_set(&model, &sample)
            .map_err(fail(Stage::SampleInputs))?;

        let exported = GraphExporter::new(config)
            .export(&model, &sample)
            .map_err(fail(Stage::Export))?;
        let expected = reference::run_reference(&model, &sample).map_err(fail(Stage::Validate))?;

        let optimizer = OptimizerStage::new(config, &self.extra_passes);
        let optimization = optimizer
            .optimize(&exported, &sample, &calibration)
            .map_err(fail(Stage::Optimize))?;

        let report = Validator::new(config)
            .validate(model_id, &optimization.graph, &sample, &expected)
            .map_err(fail(Stage::Validate))?;

        let (fixed_graph, fixed_report) = if config.create_ort {
            let fixed = optimizer
                .fixed_variant(&optimization.graph, &sample)
                .map_err(fail(Stage::Package))?;
            let fixed_report = Validator::new(config)
                .validate(model_id, &fixed, &sample, &expected)
                .map_err(fail(Stage::Validate))?;
            (Some(fixed), Some(fixed_report))
        } else {
            (None, None)
        };

        let artifact_name = config.artifact_name.clone().unwrap_or_else(|| model.artifact_name());
        let artifact = ArtifactPackager::new(config)
            .package(&PackageInput {
                model: &model,
                artifact_name: &artifact_name,
                optimization: &optimization,
                validation: &report,
                fixed_graph: fixed_graph.as_ref(),
                fixed_validation: fixed_report.as_ref(),
            })
            .map_err(fail(Stage::Package))?;

        info!("Finished {} in {:.2?}", model_id, start.elapsed());
        Ok(artifact)
    }

    /// Validate an existing graph file: against the reference when a model is
    /// configured, otherwise a load-and-run smoke check
    pub fn validate_existing(&self, graph_path: &Path) -> std::result::Result<ValidationReport, StageFailure> {
        let label = graph_path.display().to_string();
        let fail = |stage: Stage| {
            let label = label.clone();
            move |e: Error| StageFailure::new(label, stage, e)
        };
        let config = &self.config;
        let repository = self.preflight().map_err(fail(Stage::Preflight))?;
        let graph = ExportedGraph::from_file(graph_path).map_err(fail(Stage::Load))?;

        let report = match config.models.first() {
            Some(model_id) => {
                let model = SourceModelLoader::new(config, repository.as_ref())
                    .load(model_id)
                    .map_err(fail(Stage::Load))?;
                let sample = SampleInputBuilder::new(config)
                    .canonical(&model)
                    .map_err(fail(Stage::SampleInputs))?;
                let expected = reference::run_reference(&model, &sample).map_err(fail(Stage::Validate))?;
                Validator::new(config).validate(model_id, &graph, &sample, &expected)
            }
            None => Validator::new(config).smoke_check(&label, &graph),
        }
        .map_err(fail(Stage::Validate))?;

        let has_metadata = graph_path
            .file_stem()
            .map(|stem| graph_path.with_file_name(format!("{}_info.json", stem.to_string_lossy())).exists())
            .unwrap_or(false);
        if has_metadata {
            verify_artifact(graph_path).map_err(fail(Stage::Validate))?;
            info!("Checksum verified for {}", label);
        }
        Ok(report)
    }
}
