//! On-disk snapshot cache for cold starts
//!
//! `${prefix}/config.cache.json.gz` holds the gzip of the raw decoded tree
//! of the most recently applied snapshot. The file is pre-created with
//! owner-only permissions so later writes never race the umask; stores go
//! through a same-directory temp file and a rename.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use fleetsync_net::message::{deflate, inflate, MessageError};

/// Cache file name under the state directory.
pub const CACHE_FILE: &str = "config.cache.json.gz";

/// Bound on the inflated cache size.
const INFLATE_LIMIT: usize = 64 * 1024 * 1024;

/// Cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache payload error: {0}")]
    Payload(#[from] MessageError),
    #[error("cached config is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// The on-disk snapshot cache.
pub struct LocalCache {
    path: PathBuf,
}

impl LocalCache {
    /// Open the cache under `prefix`, pre-creating an empty file with mode
    /// 0600 when absent.
    pub fn open(prefix: &Path) -> Result<Self, CacheError> {
        fs::create_dir_all(prefix)?;
        let path = prefix.join(CACHE_FILE);
        if !path.exists() {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .mode(0o600)
                .open(&path)?;
        }
        Ok(Self { path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the cached tree. An empty file reads as no cache.
    pub fn load(&self) -> Result<Option<Value>, CacheError> {
        let bytes = fs::read(&self.path)?;
        if bytes.is_empty() {
            return Ok(None);
        }
        let raw = inflate(&bytes, INFLATE_LIMIT)?;
        Ok(Some(serde_json::from_slice(&raw)?))
    }

    /// Persist the raw tree.
    pub fn store(&self, tree: &Value) -> Result<(), CacheError> {
        let deflated = deflate(&serde_json::to_vec(tree)?)?;
        let tmp = self.path.with_extension("gz.tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&tmp)?;
            file.write_all(&deflated)?;
        }
        fs::rename(&tmp, &self.path)?;
        debug!(path = %self.path.display(), bytes = deflated.len(), "snapshot cached");
        Ok(())
    }
}
