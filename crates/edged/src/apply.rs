//! Configuration apply path
//!
//! `update` is the single entry point for new trees, whether they arrive
//! over the channel or from the cold-start cache. Applying is atomic from
//! the gateway's point of view: the previous configuration stays in effect
//! until the declarative load succeeds.

use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::Value;
use thiserror::Error;
use tracing::{error, info, warn};

use fleetsync_core::{config_hash, UNAPPLIED_HASH};

use crate::cache::LocalCache;

/// Declarative-load failure reported by the gateway's config loader.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct SinkError(pub String);

/// Apply errors
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("declarative load failed: {0}")]
    Sink(#[from] SinkError),
}

/// The gateway's declarative loader. Schema parsing and the in-memory
/// cache load live outside this daemon; this is the seam they are invoked
/// through.
pub trait ConfigSink: Send + Sync {
    fn load(&self, tree: &Value, hash: &str) -> Result<(), SinkError>;
}

/// Keeps the latest applied tree in memory.
#[derive(Default)]
pub struct MemorySink {
    current: RwLock<Option<(Value, String)>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn applied(&self) -> Option<(Value, String)> {
        self.current.read().clone()
    }
}

impl ConfigSink for MemorySink {
    fn load(&self, tree: &Value, hash: &str) -> Result<(), SinkError> {
        *self.current.write() = Some((tree.clone(), hash.to_string()));
        Ok(())
    }
}

/// What an update attempt did.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    /// The fingerprint was already current; nothing happened.
    Unchanged,
    /// The tree was loaded (and possibly persisted).
    Fresh,
}

/// Owns the applied-fingerprint state and the cache file.
pub struct Applier {
    sink: Arc<dyn ConfigSink>,
    cache: LocalCache,
    applied: RwLock<String>,
}

impl Applier {
    pub fn new(sink: Arc<dyn ConfigSink>, cache: LocalCache) -> Self {
        Self {
            sink,
            cache,
            applied: RwLock::new(UNAPPLIED_HASH.to_string()),
        }
    }

    /// Fingerprint currently applied; 32 zeros before the first apply.
    pub fn applied_hash(&self) -> String {
        self.applied.read().clone()
    }

    /// Apply a decoded tree. Persisting is best-effort: a cache write
    /// failure is logged and the apply still counts as successful.
    pub fn update(&self, tree: &Value, persist: bool) -> Result<Applied, ApplyError> {
        let hash = config_hash(tree);
        if *self.applied.read() == hash {
            info!(hash = %hash, "configuration unchanged");
            return Ok(Applied::Unchanged);
        }

        self.sink.load(tree, &hash)?;

        if persist {
            if let Err(e) = self.cache.store(tree) {
                error!(error = %e, "cannot persist configuration cache");
            }
        }

        *self.applied.write() = hash.clone();
        info!(hash = %hash, "configuration applied");
        Ok(Applied::Fresh)
    }

    /// Feed the cached snapshot once at process start. Any failure only
    /// warns; the channel will deliver a fresh snapshot.
    pub fn cold_start(&self) -> Option<String> {
        match self.cache.load() {
            Ok(Some(tree)) => match self.update(&tree, false) {
                Ok(_) => Some(self.applied_hash()),
                Err(e) => {
                    error!(error = %e, "cached configuration rejected");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "cannot read configuration cache");
                None
            }
        }
    }
}
