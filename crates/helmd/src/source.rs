//! Authoritative configuration export

use serde_json::Value;
use std::path::PathBuf;
use thiserror::Error;

/// Export errors
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("export is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// Where the current configuration tree comes from. The authoritative
/// store lives outside this daemon; this is the seam it is consumed
/// through.
pub trait ConfigSource: Send + Sync {
    fn export(&self) -> Result<Value, SourceError>;
}

/// Reads the export from a JSON file on disk.
pub struct JsonFileSource {
    path: PathBuf,
}

impl JsonFileSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ConfigSource for JsonFileSource {
    fn export(&self) -> Result<Value, SourceError> {
        let raw = std::fs::read(&self.path)?;
        Ok(serde_json::from_slice(&raw)?)
    }
}
