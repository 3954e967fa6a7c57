//! Deployment bundle: graph files, auxiliary assets and the metadata record.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{SecondsFormat, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tempfile::{NamedTempFile, TempPath};

use crate::config::{PipelineConfig, QuantizationMode, TargetDevice, TaskType};
use crate::error::{Error, Result};
use crate::model::TensorInfo;
use crate::pipeline::exporter::ExportedGraph;
use crate::pipeline::optimizer::OptimizationResult;
use crate::pipeline::source::{ClassMap, SourceModel, DEFAULT_ARTIFACT_VERSION};
use crate::pipeline::validator::ValidationReport;

pub const GRAPH_FORMAT: &str = "onnx";
pub const FIXED_FORMAT: &str = "onnx-fixed";
/// Index of every packaged model in an output directory
pub const REGISTRY_FILE: &str = "model_config.json";

/// Files making up one bundle
#[derive(Debug, Clone, PartialEq)]
pub struct ArtifactPaths {
    pub graph: PathBuf,
    pub fixed_graph: Option<PathBuf>,
    pub classes: Option<PathBuf>,
    pub tokenizer: Option<PathBuf>,
    pub metadata: PathBuf,
}

impl ArtifactPaths {
    pub fn new(output_dir: &Path, artifact_name: &str, task: TaskType, with_fixed: bool) -> Self {
        Self {
            graph: output_dir.join(format!("{}.onnx", artifact_name)),
            fixed_graph: with_fixed.then(|| output_dir.join(format!("{}.fixed.onnx", artifact_name))),
            classes: (task == TaskType::ObjectDetection)
                .then(|| output_dir.join(format!("{}_classes.json", artifact_name))),
            tokenizer: (task == TaskType::TextGeneration)
                .then(|| output_dir.join(format!("{}_tokenizer.json", artifact_name))),
            metadata: metadata_path(output_dir, artifact_name),
        }
    }

    /// Every target, metadata last
    pub fn all(&self) -> Vec<&Path> {
        let mut paths = vec![self.graph.as_path()];
        paths.extend(self.fixed_graph.as_deref());
        paths.extend(self.classes.as_deref());
        paths.extend(self.tokenizer.as_deref());
        paths.push(self.metadata.as_path());
        paths
    }
}

fn metadata_path(output_dir: &Path, artifact_name: &str) -> PathBuf {
    output_dir.join(format!("{}_info.json", artifact_name))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InterfaceEntry {
    pub name: String,
    pub shape: Vec<i64>,
    pub dynamic_axes: BTreeMap<usize, String>,
}

impl From<&TensorInfo> for InterfaceEntry {
    fn from(info: &TensorInfo) -> Self {
        Self {
            name: info.name.clone(),
            shape: info.shape_with_wildcards(),
            dynamic_axes: info.dynamic_axes().into_iter().collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OptimizationSummary {
    pub applied: bool,
    pub outcome: String,
    pub fallback_reason: Option<String>,
    pub fusion_applied: bool,
    pub passes: Vec<String>,
    pub size_delta_bytes: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ValidationSummary {
    pub passed: bool,
    pub downgraded: bool,
    pub rtol: f32,
    pub atol: f32,
    pub max_abs_diff: BTreeMap<String, f32>,
}

impl From<&ValidationReport> for ValidationSummary {
    fn from(report: &ValidationReport) -> Self {
        Self {
            passed: report.passed,
            downgraded: report.downgraded,
            rtol: report.tolerance.rtol,
            atol: report.tolerance.atol,
            max_abs_diff: report.max_abs_diff(),
        }
    }
}

/// The `<artifact>_info.json` record
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtifactMetadata {
    pub model_name: String,
    pub source_model: String,
    pub revision: String,
    pub filename: String,
    pub format: String,
    pub formats: Vec<String>,
    pub version: String,
    pub ir_version: i64,
    pub opset_version: i64,
    pub task: TaskType,
    pub size_bytes: u64,
    pub size_mb: f64,
    pub input_size: Vec<usize>,
    pub inputs: Vec<InterfaceEntry>,
    pub outputs: Vec<InterfaceEntry>,
    pub num_classes: usize,
    pub classes: Option<ClassMap>,
    pub quantization: QuantizationMode,
    pub optimization: OptimizationSummary,
    pub target_device: TargetDevice,
    pub supported_backends: Vec<String>,
    /// Advisory latency per entry of `supported_backends`
    pub inference_time_ms: BTreeMap<String, f64>,
    pub accuracy_score: f64,
    pub min_memory_gb: u32,
    pub validation: ValidationSummary,
    pub fixed_validation: Option<ValidationSummary>,
    pub checksum: String,
    pub fixed_checksum: Option<String>,
    pub created_at: String,
}

/// A packaged, validated deployment bundle
#[derive(Debug, Clone)]
pub struct DeploymentArtifact {
    pub artifact_name: String,
    pub paths: ArtifactPaths,
    pub metadata: ArtifactMetadata,
}

/// Backends a runtime should try, most preferred first
pub fn supported_backends(device: TargetDevice) -> Vec<String> {
    let backends: &[&str] = match device {
        TargetDevice::Cpu => &["CPU", "GPU_OPENGL", "GPU_OPENCL"],
        TargetDevice::Gpu => &["GPU_OPENCL", "GPU_OPENGL", "CPU"],
        TargetDevice::Npu => &["NPU_NNAPI", "GPU_OPENCL", "CPU"],
    };
    backends.iter().map(|b| b.to_string()).collect()
}

/// Rough on-device latency in milliseconds for one backend tag
pub fn estimate_backend_ms(size_mb: f64, quantization: QuantizationMode, backend: &str) -> f64 {
    let per_mb = match quantization {
        QuantizationMode::None => 25.0,
        QuantizationMode::Float16 => 20.0,
        QuantizationMode::Int8 => 15.0,
    };
    let factor = if backend.starts_with("NPU") {
        0.2
    } else if backend.starts_with("GPU") {
        0.3
    } else {
        1.0
    };
    round2(size_mb * per_mb * factor)
}

pub fn estimate_inference_ms(
    size_mb: f64,
    quantization: QuantizationMode,
    backends: &[String],
) -> BTreeMap<String, f64> {
    backends
        .iter()
        .map(|backend| (backend.clone(), estimate_backend_ms(size_mb, quantization, backend)))
        .collect()
}

pub fn estimate_accuracy(quantization: QuantizationMode) -> f64 {
    match quantization {
        QuantizationMode::None => 0.89,
        QuantizationMode::Float16 => 0.88,
        QuantizationMode::Int8 => 0.85,
    }
}

pub fn estimate_min_memory_gb(size_mb: f64) -> u32 {
    if size_mb < 50.0 {
        2
    } else if size_mb < 200.0 {
        3
    } else {
        4
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("sha256:{:x}", Sha256::digest(bytes))
}

/// Everything the packager needs about one validated variant
pub struct PackageInput<'a> {
    pub model: &'a SourceModel,
    pub artifact_name: &'a str,
    pub optimization: &'a OptimizationResult,
    pub validation: &'a ValidationReport,
    pub fixed_graph: Option<&'a ExportedGraph>,
    pub fixed_validation: Option<&'a ValidationReport>,
}

/// A file written and synced next to its target, not yet visible
struct StagedFile<'p> {
    target: &'p Path,
    staging: NamedTempFile,
}

/// A published file moved aside while its replacement goes in
struct Displaced<'p> {
    target: &'p Path,
    backup: TempPath,
}

fn restore(displaced: Vec<Displaced<'_>>) {
    for entry in displaced.into_iter().rev() {
        if let Err(e) = fs::rename(&entry.backup, entry.target) {
            warn!("Could not restore {}: {}", entry.target.display(), e);
        }
    }
}

/// Writes bundles into the output directory
pub struct ArtifactPackager<'a> {
    config: &'a PipelineConfig,
}

impl<'a> ArtifactPackager<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self { config }
    }

    pub fn package(&self, input: &PackageInput<'_>) -> Result<DeploymentArtifact> {
        let output_dir = &self.config.output_dir;
        fs::create_dir_all(output_dir).map_err(|e| Error::ArtifactWrite(output_dir.clone(), e.to_string()))?;

        let task = input.model.task();
        let paths = ArtifactPaths::new(output_dir, input.artifact_name, task, input.fixed_graph.is_some());
        if !self.config.overwrite {
            if let Some(existing) = paths.all().into_iter().find(|p| p.exists()) {
                return Err(Error::ArtifactWrite(
                    existing.to_path_buf(),
                    "already exists (pass --overwrite to replace)".to_string(),
                ));
            }
        }

        let classes = match (&input.model.classes, &paths.classes) {
            (Some(classes), Some(path)) => Some(self.stable_classes(classes, path)?),
            _ => None,
        };

        let graph = &input.optimization.graph;
        let metadata = self.build_metadata(input, &paths, graph, classes.clone())?;
        let record = serde_json::to_vec_pretty(&metadata)
            .map_err(|e| Error::ArtifactWrite(paths.metadata.clone(), e.to_string()))?;

        // Everything is on disk before the first target changes
        let mut staged = vec![stage(&paths.graph, &graph.bytes)?];
        if let (Some(fixed), Some(path)) = (input.fixed_graph, &paths.fixed_graph) {
            staged.push(stage(path, &fixed.bytes)?);
        }
        if let (Some(classes), Some(path)) = (&classes, &paths.classes) {
            staged.push(stage(path, classes.to_json()?.as_bytes())?);
        }
        if let (Some(asset), Some(path)) = (&input.model.tokenizer, &paths.tokenizer) {
            staged.push(stage(path, &asset.raw)?);
        }
        staged.push(stage(&paths.metadata, &record)?);
        self.commit(staged)?;

        info!(
            "Packaged {} ({} bytes, {}) into {}",
            input.artifact_name,
            metadata.size_bytes,
            metadata.checksum,
            output_dir.display()
        );
        Ok(DeploymentArtifact {
            artifact_name: input.artifact_name.to_string(),
            paths,
            metadata,
        })
    }

    /// Rename staged files into place, metadata last. With overwrite, the
    /// published files are moved aside first, metadata before anything else,
    /// and put back if any step fails.
    fn commit(&self, staged: Vec<StagedFile<'_>>) -> Result<()> {
        let mut displaced = Vec::new();
        if self.config.overwrite {
            for file in staged.iter().rev() {
                match displace(file.target) {
                    Ok(Some(entry)) => displaced.push(entry),
                    Ok(None) => {}
                    Err(e) => {
                        restore(displaced);
                        return Err(e);
                    }
                }
            }
        }

        let mut persisted: Vec<&Path> = Vec::new();
        for file in staged {
            let target = file.target;
            let result = if self.config.overwrite {
                file.staging.persist(target)
            } else {
                file.staging.persist_noclobber(target)
            };
            if let Err(e) = result {
                for path in persisted {
                    if let Err(e) = fs::remove_file(path) {
                        warn!("Could not remove {}: {}", path.display(), e);
                    }
                }
                restore(displaced);
                return Err(Error::ArtifactWrite(target.to_path_buf(), e.error.to_string()));
            }
            debug!("Published {}", target.display());
            persisted.push(target);
        }
        Ok(())
    }

    /// Class map to publish; with an existing map at `path`, indices stay stable
    fn stable_classes(&self, classes: &ClassMap, path: &Path) -> Result<ClassMap> {
        if !path.exists() {
            return Ok(classes.clone());
        }
        let text = fs::read_to_string(path).map_err(|e| Error::ArtifactWrite(path.to_path_buf(), e.to_string()))?;
        let published =
            ClassMap::from_json(&text).map_err(|e| Error::ArtifactWrite(path.to_path_buf(), e.to_string()))?;
        for (index, name) in published.names().iter().enumerate() {
            match classes.index_of(name) {
                Some(current) if current != index => {
                    return Err(Error::ArtifactWrite(
                        path.to_path_buf(),
                        format!(
                            "class '{}' would move from index {} to {}; published indices must stay stable",
                            name, index, current
                        ),
                    ))
                }
                _ => {}
            }
        }
        let merged = classes.merge_stable(&published);
        debug!("Merged class map: {} published, {} total", published.len(), merged.len());
        Ok(merged)
    }

    fn build_metadata(
        &self,
        input: &PackageInput<'_>,
        paths: &ArtifactPaths,
        graph: &ExportedGraph,
        classes: Option<ClassMap>,
    ) -> Result<ArtifactMetadata> {
        let model = input.model;
        let decoded = graph.decode()?;
        let size_bytes = graph.size_bytes() as u64;
        let size_mb = round2(size_bytes as f64 / (1024.0 * 1024.0));
        let quantization = input.optimization.quantization;
        let device = self.config.target_device;
        let backends = supported_backends(device);

        let input_size = match model.task() {
            TaskType::ObjectDetection => vec![model.config.image_size(), model.config.image_size()],
            TaskType::TextGeneration => vec![model.config.max_length()],
        };
        let mut formats = vec![GRAPH_FORMAT.to_string()];
        if input.fixed_graph.is_some() {
            formats.push(FIXED_FORMAT.to_string());
        }
        let filename = paths
            .graph
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();

        Ok(ArtifactMetadata {
            model_name: input.artifact_name.to_string(),
            source_model: model.descriptor.model_id.clone(),
            revision: model.descriptor.revision.clone(),
            filename,
            format: GRAPH_FORMAT.to_string(),
            formats,
            version: model
                .config
                .version
                .clone()
                .unwrap_or_else(|| DEFAULT_ARTIFACT_VERSION.to_string()),
            ir_version: graph.ir_version,
            opset_version: graph.opset_version,
            task: model.task(),
            size_bytes,
            size_mb,
            input_size,
            inputs: decoded.graph.inputs.iter().map(InterfaceEntry::from).collect(),
            outputs: decoded.graph.outputs.iter().map(InterfaceEntry::from).collect(),
            num_classes: classes.as_ref().map_or(0, ClassMap::len),
            classes,
            quantization,
            optimization: OptimizationSummary {
                applied: input.optimization.optimization_applied(),
                outcome: input.optimization.outcome.as_str().to_string(),
                fallback_reason: input.optimization.outcome.fallback_reason().map(str::to_string),
                fusion_applied: input.optimization.fusion_applied,
                passes: input.optimization.passes.clone(),
                size_delta_bytes: input.optimization.size_delta_bytes,
            },
            target_device: device,
            inference_time_ms: estimate_inference_ms(size_mb, quantization, &backends),
            supported_backends: backends,
            accuracy_score: estimate_accuracy(quantization),
            min_memory_gb: estimate_min_memory_gb(size_mb),
            validation: ValidationSummary::from(input.validation),
            fixed_validation: input.fixed_validation.map(ValidationSummary::from),
            checksum: sha256_hex(&graph.bytes),
            fixed_checksum: input.fixed_graph.map(|fixed| sha256_hex(&fixed.bytes)),
            created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        })
    }
}

/// Write `bytes` to a synced temporary file in the target's directory
fn stage<'p>(target: &'p Path, bytes: &[u8]) -> Result<StagedFile<'p>> {
    let write_error = |e: std::io::Error| Error::ArtifactWrite(target.to_path_buf(), e.to_string());
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let mut staging = NamedTempFile::new_in(dir).map_err(write_error)?;
    staging.write_all(bytes).map_err(write_error)?;
    staging.as_file().sync_all().map_err(write_error)?;
    debug!("Staged {} ({} bytes)", target.display(), bytes.len());
    Ok(StagedFile { target, staging })
}

/// Move an existing target to a temporary name in the same directory
fn displace(target: &Path) -> Result<Option<Displaced<'_>>> {
    if fs::symlink_metadata(target).is_err() {
        return Ok(None);
    }
    let write_error = |e: std::io::Error| Error::ArtifactWrite(target.to_path_buf(), e.to_string());
    let dir = target.parent().unwrap_or_else(|| Path::new("."));
    let backup = NamedTempFile::new_in(dir).map_err(write_error)?.into_temp_path();
    fs::rename(target, &backup).map_err(write_error)?;
    Ok(Some(Displaced { target, backup }))
}

/// Merge packaged variants into `<output_dir>/model_config.json`, keeping
/// entries for every other model already listed
pub fn update_registry(output_dir: &Path, artifacts: &[&DeploymentArtifact]) -> Result<PathBuf> {
    let path = output_dir.join(REGISTRY_FILE);
    let registry_error = |reason: String| Error::ArtifactWrite(path.clone(), reason);

    let mut registry = match fs::read_to_string(&path) {
        Ok(text) => serde_json::from_str::<Value>(&text).map_err(|e| registry_error(e.to_string()))?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Value::Object(Map::new()),
        Err(e) => return Err(registry_error(e.to_string())),
    };
    let root = registry
        .as_object_mut()
        .ok_or_else(|| registry_error("registry is not a JSON object".to_string()))?;
    let models = root
        .entry("models")
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
        .ok_or_else(|| registry_error("\"models\" is not a JSON object".to_string()))?;
    for artifact in artifacts {
        let entry = serde_json::to_value(&artifact.metadata).map_err(|e| registry_error(e.to_string()))?;
        models.insert(artifact.artifact_name.clone(), entry);
    }

    let record = serde_json::to_vec_pretty(&registry).map_err(|e| registry_error(e.to_string()))?;
    stage(&path, &record)?
        .staging
        .persist(&path)
        .map_err(|e| registry_error(e.error.to_string()))?;
    info!("Registry {} lists {} models", path.display(), models_len(&registry));
    Ok(path)
}

fn models_len(registry: &Value) -> usize {
    registry
        .get("models")
        .and_then(Value::as_object)
        .map_or(0, Map::len)
}

/// Re-read a packaged graph and its metadata, checking the recorded checksum
pub fn verify_artifact(graph_path: &Path) -> Result<()> {
    let read_error = |e: std::io::Error| Error::ArtifactWrite(graph_path.to_path_buf(), e.to_string());
    let bytes = fs::read(graph_path).map_err(read_error)?;
    let artifact_name = graph_path
        .file_name()
        .and_then(|f| f.to_str())
        .and_then(|f| f.strip_suffix(".onnx"))
        .ok_or_else(|| Error::ArtifactWrite(graph_path.to_path_buf(), "not an .onnx file".to_string()))?;
    let dir = graph_path.parent().unwrap_or_else(|| Path::new("."));
    let info_path = metadata_path(dir, artifact_name);

    let text = fs::read_to_string(&info_path).map_err(|e| Error::ArtifactWrite(info_path.clone(), e.to_string()))?;
    let record: serde_json::Value =
        serde_json::from_str(&text).map_err(|e| Error::ArtifactWrite(info_path.clone(), e.to_string()))?;
    let recorded = record
        .get("checksum")
        .and_then(|c| c.as_str())
        .ok_or_else(|| Error::ArtifactWrite(info_path.clone(), "metadata has no checksum".to_string()))?;

    let actual = sha256_hex(&bytes);
    if recorded != actual {
        return Err(Error::ArtifactWrite(
            graph_path.to_path_buf(),
            format!("checksum mismatch: recorded {}, file has {}", recorded, actual),
        ));
    }
    ExportedGraph::from_bytes(bytes.into())?;

    if let Some(recorded) = record.get("fixed_checksum").and_then(|c| c.as_str()) {
        let fixed_path = dir.join(format!("{}.fixed.onnx", artifact_name));
        let fixed = fs::read(&fixed_path).map_err(|e| Error::ArtifactWrite(fixed_path.clone(), e.to_string()))?;
        let actual = sha256_hex(&fixed);
        if recorded != actual {
            return Err(Error::ArtifactWrite(
                fixed_path,
                format!("checksum mismatch: recorded {}, file has {}", recorded, actual),
            ));
        }
    }
    Ok(())
}
