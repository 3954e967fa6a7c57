use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::{PipelineConfig, QuantizationMode, TaskType};
use crate::error::{Error, Result};
use crate::model::DataType;
use crate::ops::Tensor;
use crate::pipeline::architecture;
use crate::pipeline::source::{self, SourceModel, TokenizerAsset};

pub const BATCH_AXIS: &str = "batch_size";
pub const SEQUENCE_AXIS: &str = "sequence_length";

/// Concrete values for every graph input, with the axes allowed to vary
#[derive(Debug, Clone, PartialEq)]
pub struct SampleInput {
    entries: Vec<(String, Tensor)>,
    /// input name -> (axis, parameter name)
    pub dynamic_axes: BTreeMap<String, Vec<(usize, String)>>,
}

impl SampleInput {
    pub fn new(entries: Vec<(String, Tensor)>, dynamic_axes: BTreeMap<String, Vec<(usize, String)>>) -> Self {
        Self { entries, dynamic_axes }
    }

    pub fn get(&self, name: &str) -> Option<&Tensor> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, t)| t)
    }

    /// Input names in binding order
    pub fn names(&self) -> Vec<&str> {
        self.entries.iter().map(|(n, _)| n.as_str()).collect()
    }

    pub fn entries(&self) -> &[(String, Tensor)] {
        &self.entries
    }

    /// Inputs keyed by name, as the execution engine takes them
    pub fn to_feed(&self) -> HashMap<String, Tensor> {
        self.entries.iter().cloned().collect()
    }

    pub fn shapes(&self) -> HashMap<String, Vec<usize>> {
        self.entries
            .iter()
            .map(|(n, t)| (n.clone(), t.shape.clone()))
            .collect()
    }

    pub fn dynamic_axes_of(&self, name: &str) -> &[(usize, String)] {
        self.dynamic_axes.get(name).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// Builds the canonical trace input and the int8 calibration set
pub struct SampleInputBuilder<'a> {
    config: &'a PipelineConfig,
}

impl<'a> SampleInputBuilder<'a> {
    pub fn new(config: &'a PipelineConfig) -> Self {
        Self { config }
    }

    /// The input used for export and validation
    pub fn canonical(&self, model: &SourceModel) -> Result<SampleInput> {
        let sample = match model.task() {
            TaskType::ObjectDetection => self.image_sample(model, self.config.seed)?,
            TaskType::TextGeneration => self.prompt_sample(model)?,
        };
        debug!(
            "Canonical sample for {}: {:?}",
            model.descriptor.model_id,
            sample.shapes()
        );
        Ok(sample)
    }

    /// Representative inputs for int8 calibration; empty for other modes
    pub fn calibration_set(&self, model: &SourceModel, canonical: &SampleInput) -> Result<Vec<SampleInput>> {
        if self.config.skip_optimization || self.config.quantization != QuantizationMode::Int8 {
            return Ok(Vec::new());
        }

        let samples = match (&self.config.calibration_dir, model.task()) {
            (Some(dir), TaskType::ObjectDetection) => self.calibration_from_dir(dir, canonical)?,
            (Some(_), TaskType::TextGeneration) => {
                return Err(Error::Config(
                    "calibration directories are only supported for image models".to_string(),
                ))
            }
            (None, TaskType::ObjectDetection) => (0..self.config.calibration_samples)
                .map(|i| self.image_sample(model, derived_seed(self.config.seed, i)))
                .collect::<Result<Vec<_>>>()?,
            (None, TaskType::TextGeneration) => (0..self.config.calibration_samples)
                .map(|i| random_tokens(model, canonical, derived_seed(self.config.seed, i)))
                .collect::<Result<Vec<_>>>()?,
        };
        info!("Built {} calibration samples", samples.len());
        Ok(samples)
    }

    fn image_sample(&self, model: &SourceModel, seed: u64) -> Result<SampleInput> {
        let size = model.config.image_size();
        let shape = [1, model.config.channels(), size, size];
        let mut rng = StdRng::seed_from_u64(seed);
        let count = architecture::checked_extent(&shape, source::IMAGE_INPUT)?;
        let pixels: Vec<f32> = (0..count)
            .map(|_| rng.gen_range(0..=255u8) as f32 / 255.0)
            .collect();
        let image = Tensor::from_vec(&shape, pixels, DataType::Float)?.with_name(source::IMAGE_INPUT);

        let mut dynamic_axes = BTreeMap::new();
        if self.config.dynamic_batch {
            dynamic_axes.insert(source::IMAGE_INPUT.to_string(), vec![(0, BATCH_AXIS.to_string())]);
        }
        Ok(SampleInput::new(vec![(source::IMAGE_INPUT.to_string(), image)], dynamic_axes))
    }

    fn prompt_sample(&self, model: &SourceModel) -> Result<SampleInput> {
        let asset = tokenizer_of(model)?;
        let encoding = asset
            .tokenizer
            .encode(model.config.prompt(), false)
            .map_err(|e| Error::model_load(&model.descriptor.model_id, format!("tokenizer: {}", e)))?;

        let max_length = model.config.max_length();
        let mut ids: Vec<i64> = encoding.get_ids().iter().map(|id| *id as i64).collect();
        ids.truncate(max_length);
        if ids.is_empty() {
            return Err(Error::InvalidModel("prompt tokenizes to an empty sequence".to_string()));
        }
        let mut mask = vec![1i64; ids.len()];
        if self.config.pad_to_max_length {
            let pad = pad_id(asset) as i64;
            ids.resize(max_length, pad);
            mask.resize(max_length, 0);
        }
        token_sample(ids, mask)
    }

    fn calibration_from_dir(&self, dir: &Path, canonical: &SampleInput) -> Result<Vec<SampleInput>> {
        let expected = canonical
            .get(source::IMAGE_INPUT)
            .map(|t| t.shape.clone())
            .unwrap_or_default();

        let mut files: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().map_or(false, |ext| ext == "npy"))
            .collect();
        files.sort();
        if self.config.calibration_samples > 0 {
            files.truncate(self.config.calibration_samples);
        }

        files
            .iter()
            .map(|path| {
                let array: ndarray::ArrayD<f32> = ndarray_npy::read_npy(path)
                    .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
                if array.shape() != expected.as_slice() {
                    return Err(Error::Config(format!(
                        "{} has shape {:?}, expected {:?}",
                        path.display(),
                        array.shape(),
                        expected
                    )));
                }
                let image = Tensor::from_array(array, DataType::Float).with_name(source::IMAGE_INPUT);
                Ok(SampleInput::new(
                    vec![(source::IMAGE_INPUT.to_string(), image)],
                    canonical.dynamic_axes.clone(),
                ))
            })
            .collect()
    }
}

fn derived_seed(base: u64, index: usize) -> u64 {
    base.wrapping_add(index as u64 + 1)
}

fn tokenizer_of(model: &SourceModel) -> Result<&TokenizerAsset> {
    model
        .tokenizer
        .as_ref()
        .ok_or_else(|| Error::model_load(&model.descriptor.model_id, "text model has no tokenizer"))
}

/// Pad id from the tokenizer's padding config or its pad token, else 0
pub fn pad_id(asset: &TokenizerAsset) -> u32 {
    asset
        .tokenizer
        .get_padding()
        .map(|p| p.pad_id)
        .or_else(|| asset.tokenizer.token_to_id("[PAD]"))
        .or_else(|| asset.tokenizer.token_to_id("<pad>"))
        .unwrap_or(0)
}

fn token_sample(ids: Vec<i64>, mask: Vec<i64>) -> Result<SampleInput> {
    let shape = [1, ids.len()];
    let input_ids = Tensor::from_i64(&shape, &ids)?.with_name(source::TOKEN_INPUT);
    let attention_mask = Tensor::from_i64(&shape, &mask)?.with_name(source::MASK_INPUT);

    let axes = vec![(0, BATCH_AXIS.to_string()), (1, SEQUENCE_AXIS.to_string())];
    let dynamic_axes = BTreeMap::from([
        (source::TOKEN_INPUT.to_string(), axes.clone()),
        (source::MASK_INPUT.to_string(), axes),
    ]);
    Ok(SampleInput::new(
        vec![
            (source::TOKEN_INPUT.to_string(), input_ids),
            (source::MASK_INPUT.to_string(), attention_mask),
        ],
        dynamic_axes,
    ))
}

fn random_tokens(model: &SourceModel, canonical: &SampleInput, seed: u64) -> Result<SampleInput> {
    let length = canonical
        .get(source::TOKEN_INPUT)
        .and_then(|t| t.shape.get(1).copied())
        .unwrap_or(1);
    let vocab = model.vocab_size().max(1) as i64;
    let mut rng = StdRng::seed_from_u64(seed);
    let ids = (0..length).map(|_| rng.gen_range(0..vocab)).collect();
    token_sample(ids, vec![1; length])
}
