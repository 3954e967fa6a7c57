use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use fs2::FileExt;
use half::f16;
use log::{debug, info, warn};
use ndarray::{ArrayD, IxDyn, OwnedRepr};
use ndarray_npy::NpzReader;
use tempfile::NamedTempFile;
use tokenizers::Tokenizer;

use crate::config::{PipelineConfig, Precision, TaskType};
use crate::error::{Error, Result};
use crate::pipeline::architecture;
use crate::pipeline::repository::{FetchError, ModelRepository};
use crate::pipeline::source::{
    sanitize_model_id, ClassMap, ModelConfig, SourceModel, SourceModelDescriptor, TokenizerAsset, WeightDtype,
};

pub const CONFIG_FILE: &str = "config.json";
pub const WEIGHTS_FILE: &str = "model.npz";
pub const CLASSES_FILE: &str = "classes.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

const BACKOFF_BASE: Duration = Duration::from_millis(200);

/// Exclusive hold on one model's cache entry, released on drop
struct CacheLock {
    file: File,
}

impl CacheLock {
    fn acquire(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).write(true).open(path)?;
        file.lock_exclusive()?;
        Ok(Self { file })
    }
}

impl Drop for CacheLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Resolves source models through the local cache
pub struct SourceModelLoader<'a> {
    config: &'a PipelineConfig,
    repository: &'a dyn ModelRepository,
}

impl<'a> SourceModelLoader<'a> {
    pub fn new(config: &'a PipelineConfig, repository: &'a dyn ModelRepository) -> Self {
        Self { config, repository }
    }

    /// `<cache>/models--<org>--<name>/<revision>`
    pub fn cache_path(&self, model_id: &str) -> PathBuf {
        self.config
            .cache_dir
            .join(format!("models--{}", sanitize_model_id(model_id)))
            .join(&self.config.revision)
    }

    fn lock_path(&self, model_id: &str) -> PathBuf {
        self.config
            .cache_dir
            .join(".locks")
            .join(format!("{}.lock", sanitize_model_id(model_id)))
    }

    /// Resolve, cache and load a model with its auxiliary assets
    pub fn load(&self, model_id: &str) -> Result<SourceModel> {
        info!("Loading {} from {}", model_id, self.repository.describe());
        let dir = self.cache_path(model_id);

        let (model_config, classes, tokenizer) = {
            let _lock = CacheLock::acquire(&self.lock_path(model_id))?;
            fs::create_dir_all(&dir)?;

            let config_path = self.fetch_file(model_id, &dir, CONFIG_FILE)?;
            let mut model_config = parse_config(model_id, &config_path)?;
            self.fetch_file(model_id, &dir, WEIGHTS_FILE)?;

            let (classes, tokenizer) = match model_config.task {
                TaskType::ObjectDetection => {
                    let path = self.fetch_file(model_id, &dir, CLASSES_FILE)?;
                    let text = fs::read_to_string(path)?;
                    let classes = ClassMap::from_json(&text)
                        .map_err(|e| Error::model_load(model_id, e.to_string()))?;
                    (Some(classes), None)
                }
                TaskType::TextGeneration => {
                    let path = self.fetch_file(model_id, &dir, TOKENIZER_FILE)?;
                    (None, Some(load_tokenizer(model_id, &path)?))
                }
            };

            if let Some(size) = self.config.image_size {
                model_config.image_size = Some(size);
            }
            if let Some(length) = self.config.max_length {
                model_config.max_length = Some(length);
            }
            (model_config, classes, tokenizer)
        };

        if self.config.precision == Precision::Float16 && model_config.dtype == WeightDtype::Float32Only {
            return Err(Error::model_load(
                model_id,
                "incompatible precision request: float16 weights requested for a float32-only model",
            ));
        }

        let num_classes = classes.as_ref().map_or(0, ClassMap::len);
        let expected = architecture::walk(&model_config, num_classes)
            .map_err(|e| Error::model_load(model_id, e.to_string()))?;

        let mut weights = read_weights(model_id, &dir.join(WEIGHTS_FILE))?;
        for (name, shape) in &expected.parameters {
            let actual = weights
                .get(name)
                .ok_or_else(|| Error::model_load(model_id, format!("incompatible weights: missing {}", name)))?;
            if actual.shape() != shape.as_slice() {
                return Err(Error::model_load(
                    model_id,
                    format!(
                        "incompatible weights: {} has shape {:?}, architecture expects {:?}",
                        name,
                        actual.shape(),
                        shape
                    ),
                ));
            }
        }
        if let Some(extra) = weights.keys().find(|k| !expected.parameters.contains_key(*k)) {
            return Err(Error::model_load(
                model_id,
                format!("incompatible weights: {} belongs to no layer", extra),
            ));
        }

        if self.config.precision == Precision::Float16 {
            // Round every weight through half precision
            for array in weights.values_mut() {
                array.mapv_inplace(|v| f16::from_f32(v).to_f32());
            }
        }

        info!(
            "Loaded {} ({}, {} layers, {} parameter tensors)",
            model_id,
            model_config.task,
            model_config.layers.len(),
            weights.len()
        );
        Ok(SourceModel {
            descriptor: SourceModelDescriptor {
                model_id: model_id.to_string(),
                revision: self.config.revision.clone(),
                local_path: dir,
                task: model_config.task,
            },
            config: model_config,
            weights,
            classes,
            tokenizer,
        })
    }

    /// Fetch one file into the cache unless already present
    fn fetch_file(&self, model_id: &str, dir: &Path, file: &str) -> Result<PathBuf> {
        let dest = dir.join(file);
        if dest.is_file() {
            debug!("{} already cached at {}", file, dest.display());
            return Ok(dest);
        }

        let mut attempt = 0;
        loop {
            let mut staging = NamedTempFile::new_in(dir)?;
            match self
                .repository
                .fetch(model_id, &self.config.revision, file, staging.as_file_mut())
            {
                Ok(bytes) => {
                    staging.as_file().sync_all()?;
                    staging.persist(&dest).map_err(|e| Error::IoError(e.error))?;
                    debug!("Fetched {} ({} bytes)", file, bytes);
                    return Ok(dest);
                }
                Err(FetchError::Transient(reason)) if attempt < self.config.retries => {
                    let delay = BACKOFF_BASE * 2u32.pow(attempt);
                    warn!(
                        "Fetching {} for {} failed ({}), retrying in {:?}",
                        file, model_id, reason, delay
                    );
                    attempt += 1;
                    thread::sleep(delay);
                }
                Err(FetchError::NotFound(location)) => {
                    return Err(Error::model_load(
                        model_id,
                        format!("missing remote artifact {} ({})", file, location),
                    ))
                }
                Err(e) => return Err(Error::model_load(model_id, format!("fetching {}: {}", file, e))),
            }
        }
    }
}

fn parse_config(model_id: &str, path: &Path) -> Result<ModelConfig> {
    let text = fs::read_to_string(path)?;
    serde_json::from_str(&text).map_err(|e| {
        Error::model_load(model_id, format!("unsupported architecture in {}: {}", CONFIG_FILE, e))
    })
}

fn load_tokenizer(model_id: &str, path: &Path) -> Result<TokenizerAsset> {
    let raw = fs::read(path)?;
    let tokenizer = Tokenizer::from_bytes(&raw)
        .map_err(|e| Error::model_load(model_id, format!("{}: {}", TOKENIZER_FILE, e)))?;
    Ok(TokenizerAsset { tokenizer, raw })
}

/// Every array of the archive as f32, keyed without the `.npy` suffix
fn read_weights(model_id: &str, path: &Path) -> Result<HashMap<String, ArrayD<f32>>> {
    let npz_error = |e: ndarray_npy::ReadNpzError| Error::model_load(model_id, format!("{}: {}", WEIGHTS_FILE, e));
    let mut npz = NpzReader::new(File::open(path)?).map_err(npz_error)?;

    let mut weights = HashMap::new();
    for name in npz.names().map_err(npz_error)? {
        let array = npz.by_name::<OwnedRepr<f32>, IxDyn>(&name).map_err(|e| {
            Error::model_load(
                model_id,
                format!("incompatible weight {}: expected float32 ({})", name, e),
            )
        })?;
        let key = name.strip_suffix(".npy").unwrap_or(&name).to_string();
        weights.insert(key, array);
    }
    Ok(weights)
}
