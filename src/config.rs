use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{Error, Result};

/// Opset versions the exporter can target
pub const MIN_OPSET: i64 = 13;
pub const MAX_OPSET: i64 = 21;
pub const DEFAULT_OPSET: i64 = 17;

/// Default public model repository
pub const DEFAULT_REPOSITORY: &str = "https://huggingface.co";

/// Precision reduction applied by the optimizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
pub enum QuantizationMode {
    #[strum(to_string = "none")]
    None,
    #[strum(to_string = "float16", serialize = "fp16")]
    Float16,
    #[strum(to_string = "int8", serialize = "uint8")]
    Int8,
}

impl Default for QuantizationMode {
    fn default() -> Self {
        QuantizationMode::None
    }
}

impl QuantizationMode {
    /// Comparison bounds matching the precision loss of each mode
    pub fn default_tolerance(self) -> Tolerance {
        match self {
            QuantizationMode::None => Tolerance { rtol: 1e-3, atol: 1e-5 },
            QuantizationMode::Float16 => Tolerance { rtol: 1e-2, atol: 1e-3 },
            QuantizationMode::Int8 => Tolerance { rtol: 1e-2, atol: 5e-2 },
        }
    }
}

/// Execution target class of the mobile device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
pub enum TargetDevice {
    #[strum(to_string = "cpu")]
    Cpu,
    #[strum(to_string = "gpu")]
    Gpu,
    #[strum(to_string = "npu")]
    Npu,
}

impl Default for TargetDevice {
    fn default() -> Self {
        TargetDevice::Cpu
    }
}

/// What the source model does, which decides its inputs and outputs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
pub enum TaskType {
    #[strum(to_string = "object-detection")]
    ObjectDetection,
    #[strum(to_string = "text-generation")]
    TextGeneration,
}

/// Weight precision requested at load time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "kebab-case")]
pub enum Precision {
    #[strum(to_string = "float32", serialize = "fp32")]
    Float32,
    #[strum(to_string = "float16", serialize = "fp16")]
    Float16,
}

impl Default for Precision {
    fn default() -> Self {
        Precision::Float32
    }
}

/// Element-wise closeness bound: |actual - expected| <= atol + rtol * |expected|
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Tolerance {
    pub rtol: f32,
    pub atol: f32,
}

impl Tolerance {
    pub fn allows(&self, actual: f32, expected: f32) -> bool {
        (actual - expected).abs() <= self.atol + self.rtol * expected.abs()
    }
}

/// Every knob of a pipeline run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Model identifiers, one pipeline run each
    pub models: Vec<String>,
    /// Repository root: a local directory or an http(s) base URL
    pub repository: String,
    pub revision: String,
    pub cache_dir: PathBuf,
    pub output_dir: PathBuf,
    pub opset_version: i64,
    pub skip_optimization: bool,
    /// Also package a fixed-shape graph for runtimes without dynamic shapes
    pub create_ort: bool,
    pub quantization: QuantizationMode,
    pub target_device: TargetDevice,
    pub precision: Precision,
    pub seed: u64,
    pub calibration_samples: usize,
    /// Directory of `.npy` tensors used instead of synthetic calibration images
    pub calibration_dir: Option<PathBuf>,
    /// Overrides the model's declared image size
    pub image_size: Option<usize>,
    pub dynamic_batch: bool,
    /// Overrides the model's declared maximum sequence length
    pub max_length: Option<usize>,
    pub pad_to_max_length: bool,
    pub rtol: Option<f32>,
    pub atol: Option<f32>,
    /// Report validation failures as warnings and package anyway
    pub allow_validation_failure: bool,
    pub overwrite: bool,
    /// Overrides the artifact base name from the model config
    pub artifact_name: Option<String>,
    /// Bounded retries for remote fetches
    pub retries: u32,
    /// Number of variants processed concurrently
    pub jobs: usize,
    /// Validate an existing artifact instead of exporting
    pub validate_only: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            repository: DEFAULT_REPOSITORY.to_string(),
            revision: "main".to_string(),
            cache_dir: PathBuf::from(".cache/onnx-deploy"),
            output_dir: PathBuf::from("deployment"),
            opset_version: DEFAULT_OPSET,
            skip_optimization: false,
            create_ort: false,
            quantization: QuantizationMode::None,
            target_device: TargetDevice::Cpu,
            precision: Precision::Float32,
            seed: 42,
            calibration_samples: 100,
            calibration_dir: None,
            image_size: None,
            dynamic_batch: false,
            max_length: None,
            pad_to_max_length: false,
            rtol: None,
            atol: None,
            allow_validation_failure: false,
            overwrite: false,
            artifact_name: None,
            retries: 3,
            jobs: 1,
            validate_only: None,
        }
    }
}

impl PipelineConfig {
    /// Load a JSON config file; absent keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    /// Reject inconsistent settings before any stage runs
    pub fn validate(&self) -> Result<()> {
        if self.models.is_empty() && self.validate_only.is_none() {
            return Err(Error::Config("no model identifier given".to_string()));
        }
        if !(MIN_OPSET..=MAX_OPSET).contains(&self.opset_version) {
            return Err(Error::Config(format!(
                "opset version {} outside supported range {}..={}",
                self.opset_version, MIN_OPSET, MAX_OPSET
            )));
        }
        if self.quantization == QuantizationMode::Int8
            && !self.skip_optimization
            && self.calibration_samples == 0
            && self.calibration_dir.is_none()
        {
            return Err(Error::Config(
                "int8 quantization requires a calibration set (calibration_samples > 0)".to_string(),
            ));
        }
        for (name, value) in [("rtol", self.rtol), ("atol", self.atol)] {
            if let Some(v) = value {
                if !(v >= 0.0) || !v.is_finite() {
                    return Err(Error::Config(format!("{} must be a non-negative number, got {}", name, v)));
                }
            }
        }
        if self.artifact_name.is_some() && self.models.len() > 1 {
            return Err(Error::Config(
                "artifact_name can only be set for a single model".to_string(),
            ));
        }
        if self.jobs == 0 {
            return Err(Error::Config("jobs must be at least 1".to_string()));
        }
        if self.image_size == Some(0) || self.max_length == Some(0) {
            return Err(Error::Config("input sizes must be positive".to_string()));
        }
        Ok(())
    }

    /// Tolerance for validation: explicit overrides over the mode default
    pub fn tolerance(&self) -> Tolerance {
        let mode = if self.skip_optimization {
            QuantizationMode::None
        } else {
            self.quantization
        };
        let default = mode.default_tolerance();
        Tolerance {
            rtol: self.rtol.unwrap_or(default.rtol),
            atol: self.atol.unwrap_or(default.atol),
        }
    }

    /// Whether the optimizer must pin dynamic dimensions
    pub fn needs_fixed_shapes(&self) -> bool {
        self.target_device == TargetDevice::Npu
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn enums_parse_their_cli_spellings() {
        assert_eq!(QuantizationMode::from_str("fp16").unwrap(), QuantizationMode::Float16);
        assert_eq!(QuantizationMode::Int8.to_string(), "int8");
        assert_eq!(TaskType::from_str("object-detection").unwrap(), TaskType::ObjectDetection);
        assert_eq!(TargetDevice::Npu.to_string(), "npu");
        assert!(Precision::from_str("bfloat16").is_err());
    }

    #[test]
    fn int8_without_calibration_is_a_config_error() {
        let config = PipelineConfig {
            models: vec!["m".into()],
            quantization: QuantizationMode::Int8,
            calibration_samples: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn opset_range_and_tolerances_are_checked() {
        let mut config = PipelineConfig {
            models: vec!["m".into()],
            ..Default::default()
        };
        assert!(config.validate().is_ok());
        config.opset_version = 12;
        assert!(config.validate().is_err());
        config.opset_version = 17;
        config.rtol = Some(-1.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn tolerance_follows_quantization_unless_overridden() {
        let mut config = PipelineConfig {
            quantization: QuantizationMode::Float16,
            ..Default::default()
        };
        assert_eq!(config.tolerance().rtol, 1e-2);
        config.atol = Some(0.5);
        assert_eq!(config.tolerance().atol, 0.5);
        config.skip_optimization = true;
        assert_eq!(config.tolerance().rtol, 1e-3);
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"models": ["a/b"], "quantization": "float16"}"#).unwrap();
        assert_eq!(config.quantization, QuantizationMode::Float16);
        assert_eq!(config.opset_version, DEFAULT_OPSET);
        assert_eq!(config.revision, "main");
    }
}
