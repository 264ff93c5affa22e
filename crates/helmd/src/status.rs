//! Peer liveness and status records
//!
//! Every heartbeat (and every fatal version check) upserts one record per
//! data plane. Records carry an expiry implementing the purge delay:
//! expired entries read as absent and a background prune deletes them.
//! Session teardown deliberately leaves the last status in place.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use fleetsync_core::SyncStatus;

/// Status store errors
#[derive(Debug, Error)]
pub enum StatusError {
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("record codec error: {0}")]
    Json(#[from] serde_json::Error),
}

/// One data plane as last reported.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub hostname: String,
    pub ip: String,
    pub version: String,
    /// Unix seconds of the last heartbeat or handshake.
    pub last_seen: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_hash: Option<String>,
    pub sync_status: SyncStatus,
    /// Unix seconds after which the record is purged.
    pub expires_at: u64,
}

/// Fields a session reports on each upsert.
#[derive(Clone, Debug)]
pub struct PeerUpdate {
    pub id: String,
    pub hostname: String,
    pub ip: String,
    pub version: String,
    pub config_hash: Option<String>,
    pub sync_status: SyncStatus,
}

/// sled-backed store of [`PeerRecord`]s.
pub struct StatusStore {
    records: sled::Tree,
    purge_delay: Duration,
}

impl StatusStore {
    pub fn open(db: &sled::Db, purge_delay: Duration) -> Result<Self, StatusError> {
        Ok(Self {
            records: db.open_tree("peer_records")?,
            purge_delay,
        })
    }

    /// Upsert a record, refreshing `last_seen` and the expiry. An empty
    /// hash is stored as absent.
    pub fn upsert(&self, update: PeerUpdate) -> Result<(), StatusError> {
        let now = unix_now();
        let record = PeerRecord {
            id: update.id,
            hostname: update.hostname,
            ip: update.ip,
            version: update.version,
            last_seen: now,
            config_hash: update.config_hash.filter(|hash| !hash.is_empty()),
            sync_status: update.sync_status,
            expires_at: now + self.purge_delay.as_secs(),
        };
        self.records
            .insert(record.id.as_bytes(), serde_json::to_vec(&record)?)?;
        Ok(())
    }

    /// Fetch one record; expired entries read as absent.
    pub fn get(&self, node_id: &str) -> Result<Option<PeerRecord>, StatusError> {
        let now = unix_now();
        match self.records.get(node_id.as_bytes())? {
            Some(bytes) => {
                let record: PeerRecord = serde_json::from_slice(&bytes)?;
                Ok((record.expires_at > now).then_some(record))
            }
            None => Ok(None),
        }
    }

    /// All live records.
    pub fn list(&self) -> Result<Vec<PeerRecord>, StatusError> {
        let now = unix_now();
        let mut records = Vec::new();
        for entry in self.records.iter() {
            let (_, bytes) = entry?;
            let record: PeerRecord = serde_json::from_slice(&bytes)?;
            if record.expires_at > now {
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Delete expired records. Returns how many were removed.
    pub fn prune(&self) -> Result<usize, StatusError> {
        let now = unix_now();
        let mut removed = 0;
        for entry in self.records.iter() {
            let (key, bytes) = entry?;
            let record: PeerRecord = serde_json::from_slice(&bytes)?;
            if record.expires_at <= now {
                self.records.remove(key)?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
