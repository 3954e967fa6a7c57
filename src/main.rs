use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use log::{error, info, warn};

use onnx_deploy::{Pipeline, PipelineConfig, Precision, QuantizationMode, TargetDevice};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Source model identifier, may be repeated
    #[arg(short, long = "model")]
    models: Vec<String>,

    /// Model repository: an http(s) base URL or a local directory
    #[arg(long)]
    repository: Option<String>,

    /// Repository revision
    #[arg(long)]
    revision: Option<String>,

    /// Deployment directory
    #[arg(short, long = "output-dir", visible_alias = "output")]
    output_dir: Option<PathBuf>,

    /// Local model cache
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// ONNX opset of the exported graph
    #[arg(long)]
    opset_version: Option<i64>,

    #[arg(long)]
    skip_optimization: bool,

    /// Also write a fixed-shape variant for static-shape runtimes
    #[arg(long)]
    create_ort: bool,

    /// Validate an existing graph instead of exporting
    #[arg(long, value_name = "PATH")]
    validate_only: Option<PathBuf>,

    /// none, float16 or int8
    #[arg(long)]
    quantization: Option<QuantizationMode>,

    /// cpu, gpu or npu
    #[arg(long)]
    target_device: Option<TargetDevice>,

    /// Weight precision of the loaded model
    #[arg(long)]
    precision: Option<Precision>,

    #[arg(long)]
    seed: Option<u64>,

    #[arg(long)]
    calibration_samples: Option<usize>,

    /// Directory of .npy images used for int8 calibration
    #[arg(long)]
    calibration_dir: Option<PathBuf>,

    #[arg(long)]
    image_size: Option<usize>,

    /// Export images with a dynamic batch axis
    #[arg(long)]
    dynamic_batch: bool,

    #[arg(long)]
    max_length: Option<usize>,

    #[arg(long)]
    pad_to_max_length: bool,

    #[arg(long)]
    rtol: Option<f32>,

    #[arg(long)]
    atol: Option<f32>,

    /// Report validation failures as warnings
    #[arg(long)]
    allow_validation_failure: bool,

    /// Replace existing artifacts of the same name
    #[arg(long)]
    overwrite: bool,

    /// Base name of the packaged files
    #[arg(long)]
    artifact_name: Option<String>,

    /// Retries for transient download failures
    #[arg(long)]
    retries: Option<u32>,

    /// Variants processed concurrently
    #[arg(short, long)]
    jobs: Option<usize>,

    /// JSON config file; flags given here take precedence
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, e.g. `debug` or `onnx_deploy=trace`
    #[arg(long)]
    log_level: Option<String>,
}

impl Args {
    fn into_config(self) -> onnx_deploy::Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::from_file(path)?,
            None => PipelineConfig::default(),
        };
        if !self.models.is_empty() {
            config.models = self.models;
        }
        if let Some(v) = self.repository {
            config.repository = v;
        }
        if let Some(v) = self.revision {
            config.revision = v;
        }
        if let Some(v) = self.output_dir {
            config.output_dir = v;
        }
        if let Some(v) = self.cache_dir {
            config.cache_dir = v;
        }
        if let Some(v) = self.opset_version {
            config.opset_version = v;
        }
        if let Some(v) = self.quantization {
            config.quantization = v;
        }
        if let Some(v) = self.target_device {
            config.target_device = v;
        }
        if let Some(v) = self.precision {
            config.precision = v;
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
        if let Some(v) = self.calibration_samples {
            config.calibration_samples = v;
        }
        if let Some(v) = self.retries {
            config.retries = v;
        }
        if let Some(v) = self.jobs {
            config.jobs = v;
        }
        config.calibration_dir = self.calibration_dir.or(config.calibration_dir);
        config.image_size = self.image_size.or(config.image_size);
        config.max_length = self.max_length.or(config.max_length);
        config.rtol = self.rtol.or(config.rtol);
        config.atol = self.atol.or(config.atol);
        config.artifact_name = self.artifact_name.or(config.artifact_name);
        config.validate_only = self.validate_only.or(config.validate_only);
        config.skip_optimization |= self.skip_optimization;
        config.create_ort |= self.create_ort;
        config.dynamic_batch |= self.dynamic_batch;
        config.pad_to_max_length |= self.pad_to_max_length;
        config.allow_validation_failure |= self.allow_validation_failure;
        config.overwrite |= self.overwrite;
        Ok(config)
    }
}

fn init_logging(filter: Option<&str>) {
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(filter) = filter {
        builder.parse_filters(filter);
    }
    builder.init();
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(args.log_level.as_deref());

    let config = match args.into_config() {
        Ok(config) => config,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };
    let pipeline = Pipeline::new(config);

    if let Some(path) = pipeline.config().validate_only.clone() {
        return match pipeline.validate_existing(&path) {
            Ok(report) if report.downgraded => {
                warn!("{} failed validation (downgraded): {}", path.display(), report.summary());
                ExitCode::SUCCESS
            }
            Ok(_) => {
                info!("{} passed validation", path.display());
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("{}", e);
                ExitCode::FAILURE
            }
        };
    }

    let results = match pipeline.run() {
        Ok(results) => results,
        Err(e) => {
            error!("{}", e);
            return ExitCode::FAILURE;
        }
    };

    let mut failed = 0;
    for result in &results {
        match result {
            Ok(artifact) => info!(
                "{} -> {} ({} MB)",
                artifact.metadata.source_model,
                artifact.paths.graph.display(),
                artifact.metadata.size_mb
            ),
            Err(e) => {
                error!("{}", e);
                failed += 1;
            }
        }
    }
    if failed > 0 {
        error!("{} of {} model variants failed", failed, results.len());
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
