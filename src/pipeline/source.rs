use std::collections::HashMap;
use std::path::PathBuf;

use ndarray::ArrayD;
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use tokenizers::Tokenizer;

use crate::config::TaskType;
use crate::error::{Error, Result};

pub const DEFAULT_IMAGE_SIZE: usize = 640;
pub const DEFAULT_MAX_LENGTH: usize = 512;
pub const DEFAULT_ARTIFACT_VERSION: &str = "1.0.0";

pub const IMAGE_INPUT: &str = "images";
pub const TOKEN_INPUT: &str = "input_ids";
pub const MASK_INPUT: &str = "attention_mask";
pub const DETECTION_OUTPUT: &str = "output0";
pub const LOGITS_OUTPUT: &str = "logits";

/// Graph input names of a task, in binding order
pub fn input_names(task: TaskType) -> &'static [&'static str] {
    match task {
        TaskType::ObjectDetection => &[IMAGE_INPUT],
        TaskType::TextGeneration => &[TOKEN_INPUT, MASK_INPUT],
    }
}

pub fn output_name(task: TaskType) -> &'static str {
    match task {
        TaskType::ObjectDetection => DETECTION_OUTPUT,
        TaskType::TextGeneration => LOGITS_OUTPUT,
    }
}

/// Prompt used to trace text models when the model config has none
pub const CONSTRUCTION_SAFETY_PROMPT: &str = "You are an OSHA-certified construction safety expert. \
Analyze construction site images for: 1. PPE compliance (hard hats, safety vests, boots, gloves, eye protection) \
2. Fall protection hazards 3. Electrical safety violations 4. Equipment safety issues 5. Site housekeeping problems. \
Respond with JSON containing detected hazards, PPE compliance status, and safety recommendations.";

/// One layer of a sequential source architecture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LayerKind {
    Conv2d {
        out_channels: usize,
        kernel: usize,
        #[serde(default = "one")]
        stride: usize,
        #[serde(default)]
        padding: usize,
    },
    Relu,
    Sigmoid,
    Tanh,
    Gelu,
    MaxPool {
        kernel: usize,
        #[serde(default)]
        stride: Option<usize>,
    },
    GlobalAvgPool,
    Flatten,
    Dense {
        units: usize,
    },
    DetectionHead,
    Embedding {
        dim: usize,
    },
    AttentionMask,
    LayerNorm {
        #[serde(default = "default_epsilon")]
        epsilon: f32,
    },
    /// A framework-specific block with no graph lowering
    Custom {
        op: String,
    },
}

fn one() -> usize {
    1
}

fn default_epsilon() -> f32 {
    1e-5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerSpec {
    pub name: String,
    #[serde(flatten)]
    pub kind: LayerKind,
}

/// Declared weight storage of the source model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WeightDtype {
    Float32,
    /// Weights that must not be reduced at load time
    Float32Only,
}

impl Default for WeightDtype {
    fn default() -> Self {
        WeightDtype::Float32
    }
}

/// Contents of a source model's `config.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub task: TaskType,
    #[serde(default)]
    pub artifact_name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub dtype: WeightDtype,
    #[serde(default)]
    pub image_size: Option<usize>,
    #[serde(default)]
    pub channels: Option<usize>,
    #[serde(default)]
    pub vocab_size: Option<usize>,
    #[serde(default)]
    pub max_length: Option<usize>,
    #[serde(default)]
    pub prompt: Option<String>,
    pub layers: Vec<LayerSpec>,
}

impl ModelConfig {
    pub fn channels(&self) -> usize {
        self.channels.unwrap_or(3)
    }

    pub fn image_size(&self) -> usize {
        self.image_size.unwrap_or(DEFAULT_IMAGE_SIZE)
    }

    pub fn max_length(&self) -> usize {
        self.max_length.unwrap_or(DEFAULT_MAX_LENGTH)
    }

    pub fn prompt(&self) -> &str {
        self.prompt.as_deref().unwrap_or(CONSTRUCTION_SAFETY_PROMPT)
    }
}

/// Class name to index mapping, held in index order
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ClassMap {
    names: Vec<String>,
}

impl ClassMap {
    /// Build from `name -> index` pairs; indices must be unique and contiguous from 0
    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, usize)>) -> Result<Self> {
        let mut pairs: Vec<(String, usize)> = pairs.into_iter().collect();
        pairs.sort_by_key(|(_, index)| *index);
        for (expected, (name, index)) in pairs.iter().enumerate() {
            if *index != expected {
                return Err(Error::InvalidModel(format!(
                    "class indices must be contiguous from 0: '{}' has index {}, expected {}",
                    name, index, expected
                )));
            }
        }
        Ok(Self {
            names: pairs.into_iter().map(|(name, _)| name).collect(),
        })
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let raw: HashMap<String, usize> = serde_json::from_str(text)
            .map_err(|e| Error::InvalidModel(format!("class map: {}", e)))?;
        Self::from_pairs(raw)
    }

    pub fn from_names(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    /// Merge with a previously published map: existing names keep their
    /// index, new names are appended after them
    pub fn merge_stable(&self, published: &ClassMap) -> ClassMap {
        let mut names = published.names.clone();
        for name in &self.names {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        ClassMap { names }
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| Error::InvalidModel(format!("class map: {}", e)))
    }
}

// Written as an object in index order
impl Serialize for ClassMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.names.len()))?;
        for (index, name) in self.names.iter().enumerate() {
            map.serialize_entry(name, &index)?;
        }
        map.end()
    }
}

/// Identifies a source model and where its files were resolved
#[derive(Debug, Clone, PartialEq)]
pub struct SourceModelDescriptor {
    pub model_id: String,
    pub revision: String,
    /// Cache directory holding the resolved files
    pub local_path: PathBuf,
    pub task: TaskType,
}

/// A tokenizer together with the bytes it was loaded from
pub struct TokenizerAsset {
    pub tokenizer: Tokenizer,
    pub raw: Vec<u8>,
}

impl std::fmt::Debug for TokenizerAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenizerAsset")
            .field("vocab_size", &self.tokenizer.get_vocab_size(true))
            .finish()
    }
}

/// A loaded source model: architecture, weights and auxiliary assets
#[derive(Debug)]
pub struct SourceModel {
    pub descriptor: SourceModelDescriptor,
    pub config: ModelConfig,
    pub weights: HashMap<String, ArrayD<f32>>,
    pub classes: Option<ClassMap>,
    pub tokenizer: Option<TokenizerAsset>,
}

impl SourceModel {
    pub fn task(&self) -> TaskType {
        self.config.task
    }

    pub fn weight(&self, layer: &str, param: &str) -> Result<&ArrayD<f32>> {
        let key = format!("{}.{}", layer, param);
        self.weights
            .get(&key)
            .ok_or_else(|| Error::model_load(&self.descriptor.model_id, format!("missing weight {}", key)))
    }

    pub fn num_classes(&self) -> usize {
        self.classes.as_ref().map_or(0, ClassMap::len)
    }

    pub fn vocab_size(&self) -> usize {
        self.config.vocab_size.unwrap_or(0)
    }

    /// Artifact base name, falling back to a sanitised model id
    pub fn artifact_name(&self) -> String {
        self.config
            .artifact_name
            .clone()
            .unwrap_or_else(|| sanitize_model_id(&self.descriptor.model_id))
    }
}

/// `org/name` -> `org--name`, safe as a file name
pub fn sanitize_model_id(model_id: &str) -> String {
    let mut sanitized = String::with_capacity(model_id.len() + 2);
    for c in model_id.chars() {
        match c {
            '/' => sanitized.push_str("--"),
            c if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' => sanitized.push(c),
            _ => sanitized.push('_'),
        }
    }
    sanitized
}
