pub mod config;
pub mod error;
pub mod execution;
pub mod model;
pub mod ops;
pub mod optimization;
pub mod parser;
pub mod pipeline;
pub mod proto;

// Re-export commonly used types
pub use config::{PipelineConfig, Precision, QuantizationMode, TargetDevice, TaskType, Tolerance};
pub use error::{Error, Result, Stage, StageFailure};
pub use execution::{ExecutionContext, ExecutionEngine, ExecutionOptions};
pub use model::{Graph, ModelMetadata, Node, OnnxModel, Tensor, TensorInfo};
pub use ops::registry::{Operator, OperatorRegistry};
pub use ops::tensor::Tensor as ComputeTensor;
pub use optimization::{GraphOptimizer, OptimizationPass, OptimizationStats, PassResult};
pub use pipeline::{
    verify_artifact, ArtifactMetadata, DeploymentArtifact, ExportedGraph, OptimizationOutcome, OptimizationResult,
    PassFactory, Pipeline, ValidationReport, VariantResult,
};
