//! Source model fixtures laid out as a local model repository.

#![allow(dead_code)]

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use ndarray::{ArrayD, IxDyn};
use ndarray_npy::NpzWriter;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use serde_json::{json, Value};
use tempfile::TempDir;

use onnx_deploy::pipeline::architecture;
use onnx_deploy::pipeline::source::ModelConfig;
use onnx_deploy::PipelineConfig;

pub const CONSTRUCTION_CLASSES: [&str; 13] = [
    "hardhat",
    "no_hardhat",
    "safety_vest",
    "no_safety_vest",
    "person",
    "ladder",
    "scaffold",
    "excavator",
    "crane",
    "fall_hazard",
    "electrical_hazard",
    "debris",
    "fire_extinguisher",
];

pub const VOCAB: [&str; 16] = [
    "[UNK]", "[PAD]", "inspect", "the", "scaffold", "for", "fall", "hazards", "wear", "a", "hardhat", "site",
    "is", "safe", "ladder", "vest",
];

/// Small detector: 64x64 input, 8x8 anchor grid
pub fn detector_config() -> Value {
    json!({
        "task": "object-detection",
        "image_size": 64,
        "layers": [
            {"name": "stem", "kind": "conv2d", "out_channels": 32, "kernel": 4, "stride": 4},
            {"name": "stem_act", "kind": "relu"},
            {"name": "pool", "kind": "max_pool", "kernel": 2},
            {"name": "head", "kind": "detection_head"}
        ]
    })
}

/// Token classifier over the fixture vocabulary
pub fn text_config() -> Value {
    json!({
        "task": "text-generation",
        "vocab_size": VOCAB.len(),
        "max_length": 16,
        "prompt": "inspect the scaffold for fall hazards",
        "layers": [
            {"name": "embed", "kind": "embedding", "dim": 8},
            {"name": "mask", "kind": "attention_mask"},
            {"name": "proj", "kind": "dense", "units": 8},
            {"name": "act", "kind": "gelu"},
            {"name": "norm", "kind": "layer_norm"},
            {"name": "lm_head", "kind": "dense", "units": VOCAB.len()}
        ]
    })
}

pub fn tokenizer_json() -> Value {
    let vocab: serde_json::Map<String, Value> = VOCAB
        .iter()
        .enumerate()
        .map(|(id, word)| (word.to_string(), json!(id)))
        .collect();
    json!({
        "version": "1.0",
        "truncation": null,
        "padding": null,
        "added_tokens": [],
        "normalizer": null,
        "pre_tokenizer": {"type": "Whitespace"},
        "post_processor": null,
        "decoder": null,
        "model": {"type": "WordLevel", "vocab": vocab, "unk_token": "[UNK]"}
    })
}

/// Scratch repository, cache and deployment directories
pub struct Fixture {
    pub repo: TempDir,
    pub cache: TempDir,
    pub output: TempDir,
}

impl Fixture {
    pub fn new() -> Self {
        Self {
            repo: tempfile::tempdir().unwrap(),
            cache: tempfile::tempdir().unwrap(),
            output: tempfile::tempdir().unwrap(),
        }
    }

    pub fn model_dir(&self, model_id: &str) -> PathBuf {
        self.repo.path().join(model_id)
    }

    /// Deployment directory, not created until something is packaged
    pub fn deploy_dir(&self) -> PathBuf {
        self.output.path().join("deployment")
    }

    /// Write `config.json`, weights matching the architecture and the task's asset
    pub fn add_model(&self, model_id: &str, config: &Value) -> PathBuf {
        let dir = self.model_dir(model_id);
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("config.json"), serde_json::to_vec_pretty(config).unwrap()).unwrap();

        let parsed: ModelConfig = serde_json::from_value(config.clone()).unwrap();
        let num_classes = match parsed.task {
            onnx_deploy::TaskType::ObjectDetection => {
                let classes: serde_json::Map<String, Value> = CONSTRUCTION_CLASSES
                    .iter()
                    .enumerate()
                    .map(|(index, name)| (name.to_string(), json!(index)))
                    .collect();
                fs::write(dir.join("classes.json"), serde_json::to_vec_pretty(&classes).unwrap()).unwrap();
                CONSTRUCTION_CLASSES.len()
            }
            onnx_deploy::TaskType::TextGeneration => {
                fs::write(dir.join("tokenizer.json"), serde_json::to_vec(&tokenizer_json()).unwrap()).unwrap();
                0
            }
        };

        let shape = architecture::walk(&parsed, num_classes).unwrap();
        write_weights(&dir.join("model.npz"), &shape.parameters, 7);
        dir
    }

    pub fn config(&self, models: &[&str]) -> PipelineConfig {
        PipelineConfig {
            models: models.iter().map(|m| m.to_string()).collect(),
            repository: self.repo.path().display().to_string(),
            cache_dir: self.cache.path().to_path_buf(),
            output_dir: self.deploy_dir(),
            ..Default::default()
        }
    }
}

fn write_weights(path: &Path, parameters: &std::collections::BTreeMap<String, Vec<usize>>, seed: u64) {
    let mut rng = StdRng::seed_from_u64(seed);
    let normal = Normal::new(0.0f32, 0.2).unwrap();
    let mut npz = NpzWriter::new(File::create(path).unwrap());
    for (name, shape) in parameters {
        let count = shape.iter().product();
        let values: Vec<f32> = if name.ends_with(".bias") {
            (0..count).map(|_| normal.sample(&mut rng) * 0.1).collect()
        } else if name.starts_with("norm") {
            vec![1.0; count]
        } else {
            (0..count).map(|_| normal.sample(&mut rng)).collect()
        };
        let array = ArrayD::from_shape_vec(IxDyn(shape), values).unwrap();
        npz.add_array(name.as_str(), &array).unwrap();
    }
    npz.finish().unwrap();
}
