use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Missing dependency {dependency}: {guidance}")]
    DependencyMissing { dependency: String, guidance: String },

    #[error("Failed to load model {model}: {reason}")]
    ModelLoad { model: String, reason: String },

    #[error("Failed to export model {model}: {reason}")]
    Export { model: String, reason: String },

    #[error("Unsupported operator {op_type}: {detail}")]
    UnsupportedOperator { op_type: String, detail: String },

    #[error("Optimization pass {pass} failed: {reason}")]
    OptimizationFailure { pass: String, reason: String },

    #[error("Validation mismatch for {model}: {summary}")]
    ValidationMismatch { model: String, summary: String },

    #[error("Failed to write artifact {0}: {1}")]
    ArtifactWrite(PathBuf, String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Protobuf parsing error: {0}")]
    ProtobufError(#[from] prost::DecodeError),

    #[error("Invalid ONNX model: {0}")]
    InvalidModel(String),

    #[error("Invalid operator: {0}")]
    InvalidOperator(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid graph structure: {0}")]
    InvalidGraph(String),

    #[error("Unsupported feature: {0}")]
    UnsupportedFeature(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),
}

impl Error {
    /// Optimization failures are recorded and the run continues; everything else aborts the variant.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Error::OptimizationFailure { .. })
    }

    pub(crate) fn model_load(model: &str, reason: impl Into<String>) -> Self {
        Error::ModelLoad {
            model: model.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn export(model: &str, reason: impl Into<String>) -> Self {
        Error::Export {
            model: model.to_string(),
            reason: reason.into(),
        }
    }
}

/// Pipeline stage, used to attribute failures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Preflight,
    Load,
    SampleInputs,
    Export,
    Optimize,
    Validate,
    Package,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Preflight => "preflight",
            Stage::Load => "load",
            Stage::SampleInputs => "sample-inputs",
            Stage::Export => "export",
            Stage::Optimize => "optimize",
            Stage::Validate => "validate",
            Stage::Package => "package",
        };
        f.write_str(name)
    }
}

/// A failure of one model variant's run, with the stage it happened in
#[derive(Error, Debug)]
#[error("[{model}] {stage} stage failed: {source}")]
pub struct StageFailure {
    pub model: String,
    pub stage: Stage,
    #[source]
    pub source: Error,
}

impl StageFailure {
    pub fn new(model: impl Into<String>, stage: Stage, source: Error) -> Self {
        Self {
            model: model.into(),
            stage,
            source,
        }
    }
}
