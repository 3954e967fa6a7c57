//! Read-only model repositories the loader fetches source files from.

use std::fs::File;
use std::io::{self, Write};
use std::path::PathBuf;

use thiserror::Error;

use crate::error::{Error, Result};

/// Why a single fetch failed; only `Transient` is worth retrying
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("{0}")]
    Fatal(String),
}

impl From<io::Error> for FetchError {
    fn from(e: io::Error) -> Self {
        FetchError::Fatal(e.to_string())
    }
}

/// A source of model files addressed by model id, revision and file name
pub trait ModelRepository: Send + Sync {
    /// Human readable location, for logs
    fn describe(&self) -> String;

    /// Stream `file` of `model_id` at `revision` into `dest`
    fn fetch(
        &self,
        model_id: &str,
        revision: &str,
        file: &str,
        dest: &mut dyn Write,
    ) -> std::result::Result<u64, FetchError>;
}

/// A directory mirror laid out as `<root>/<model-id>/<file>`
#[derive(Debug, Clone)]
pub struct LocalRepository {
    root: PathBuf,
}

impl LocalRepository {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ModelRepository for LocalRepository {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn fetch(
        &self,
        model_id: &str,
        _revision: &str,
        file: &str,
        dest: &mut dyn Write,
    ) -> std::result::Result<u64, FetchError> {
        let path = self.root.join(model_id).join(file);
        let mut source = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FetchError::NotFound(path.display().to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        Ok(io::copy(&mut source, dest)?)
    }
}

/// A HuggingFace-compatible HTTP repository
#[cfg(feature = "remote")]
pub struct HttpRepository {
    base_url: String,
    client: reqwest::blocking::Client,
}

#[cfg(feature = "remote")]
impl HttpRepository {
    pub fn new(base_url: &str) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(600))
            .build()
            .map_err(|e| Error::Config(format!("http client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, model_id: &str, revision: &str, file: &str) -> String {
        format!("{}/{}/resolve/{}/{}", self.base_url, model_id, revision, file)
    }
}

#[cfg(feature = "remote")]
impl ModelRepository for HttpRepository {
    fn describe(&self) -> String {
        self.base_url.clone()
    }

    fn fetch(
        &self,
        model_id: &str,
        revision: &str,
        file: &str,
        dest: &mut dyn Write,
    ) -> std::result::Result<u64, FetchError> {
        let url = self.url(model_id, revision, file);
        let mut response = self
            .client
            .get(&url)
            .send()
            .map_err(|e| FetchError::Transient(format!("{}: {}", url, e)))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(FetchError::NotFound(url));
        }
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(FetchError::Transient(format!("{}: HTTP {}", url, status)));
        }
        if !status.is_success() {
            return Err(FetchError::Fatal(format!("{}: HTTP {}", url, status)));
        }
        response
            .copy_to(dest)
            .map_err(|e| FetchError::Transient(format!("{}: {}", url, e)))
    }
}

fn is_remote(location: &str) -> bool {
    location.starts_with("http://") || location.starts_with("https://")
}

/// Repository for a configured location: an http(s) base URL or a directory
pub fn open_repository(location: &str) -> Result<Box<dyn ModelRepository>> {
    if is_remote(location) {
        #[cfg(feature = "remote")]
        {
            return Ok(Box::new(HttpRepository::new(location)?));
        }
        #[cfg(not(feature = "remote"))]
        {
            return Err(Error::DependencyMissing {
                dependency: "reqwest".to_string(),
                guidance: "rebuild with `--features remote` or point --repository at a local directory"
                    .to_string(),
            });
        }
    }
    Ok(Box::new(LocalRepository::new(location)))
}
