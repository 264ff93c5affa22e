//! Process-wide registry of attached data planes

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;

use crate::snapshot::Snapshot;

/// One outbound queue item. Payloads and pong replies share a single FIFO
/// so a pong never overtakes a pending config push.
#[derive(Clone)]
pub enum Outbound {
    Payload(Arc<Snapshot>),
    Pong,
}

/// Write-side handle to one attached peer.
#[derive(Clone)]
pub struct PeerHandle {
    pub node_id: String,
    pub outbound: mpsc::UnboundedSender<Outbound>,
}

/// Registry of attached peers, keyed by session id. Sessions register once
/// admitted and must deregister on teardown.
#[derive(Default)]
pub struct PeerRegistry {
    next_id: AtomicU64,
    peers: RwLock<HashMap<u64, PeerHandle>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: PeerHandle) -> u64 {
        let session_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.peers.write().insert(session_id, handle);
        session_id
    }

    pub fn deregister(&self, session_id: u64) {
        self.peers.write().remove(&session_id);
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Append the snapshot to every attached peer's queue. Returns how many
    /// queues accepted it.
    pub fn broadcast(&self, snapshot: Arc<Snapshot>) -> usize {
        let peers = self.peers.read();
        let mut queued = 0;
        for handle in peers.values() {
            if handle
                .outbound
                .send(Outbound::Payload(snapshot.clone()))
                .is_ok()
            {
                queued += 1;
            }
        }
        queued
    }
}
