//! Snapshot building and the byte-payload cache
//!
//! The builder exports the configuration tree, records which plugins it
//! references, wraps it in the `reconfigure` envelope, and caches the
//! deflated wire payload. Every attached peer receives the same bytes.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;

use fleetsync_core::ConfiguredPlugins;
use fleetsync_net::message::{MessageError, Reconfigure};

use crate::source::{ConfigSource, SourceError};

/// Snapshot errors
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("config export failed: {0}")]
    Source(#[from] SourceError),
    #[error("cannot encode snapshot: {0}")]
    Encode(#[from] MessageError),
}

/// One built configuration snapshot.
pub struct Snapshot {
    /// Gzip-deflated `reconfigure` envelope, as sent on the wire.
    pub deflated: Bytes,
    /// Plugin names referenced by the exported configuration.
    pub configured: ConfiguredPlugins,
}

/// Builds snapshots and keeps the latest one. A failed rebuild leaves the
/// previous snapshot in place; concurrent rebuilds are benign, last writer
/// wins.
pub struct SnapshotBuilder {
    source: Arc<dyn ConfigSource>,
    cache: RwLock<Option<Arc<Snapshot>>>,
}

impl SnapshotBuilder {
    pub fn new(source: Arc<dyn ConfigSource>) -> Self {
        Self {
            source,
            cache: RwLock::new(None),
        }
    }

    /// Rebuild from a fresh export and replace the cache.
    pub fn rebuild(&self) -> Result<Arc<Snapshot>, SnapshotError> {
        let tree = self.source.export()?;
        let configured = configured_plugins(&tree);
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64();
        let deflated = Reconfigure::new(tree, timestamp).encode()?;

        let snapshot = Arc::new(Snapshot {
            deflated: Bytes::from(deflated),
            configured,
        });
        *self.cache.write() = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Current snapshot, building one on first request.
    pub fn current(&self) -> Result<Arc<Snapshot>, SnapshotError> {
        if let Some(snapshot) = self.cache.read().clone() {
            return Ok(snapshot);
        }
        self.rebuild()
    }
}

/// Plugin names appearing in at least one record of the export's `plugins`
/// collection.
fn configured_plugins(tree: &Value) -> ConfiguredPlugins {
    tree.get("plugins")
        .and_then(Value::as_array)
        .map(|plugins| {
            plugins
                .iter()
                .filter_map(|record| record.get("name"))
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}
