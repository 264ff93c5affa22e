//! Change fan-out to attached peers
//!
//! One push loop per process. Store-change triggers land on a coalescing
//! signal (`Notify` holds at most one permit), so any burst of triggers
//! during an in-flight push collapses into a single follow-up push. After
//! a successful push the loop sits out the quiescent delay before taking
//! the next trigger.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, Notify};
use tracing::{debug, error, info};

use crate::registry::PeerRegistry;
use crate::snapshot::SnapshotBuilder;

/// The process-wide push loop.
pub struct Broadcaster {
    registry: Arc<PeerRegistry>,
    snapshots: Arc<SnapshotBuilder>,
    trigger: Notify,
    quiet_period: Duration,
    pushes: AtomicU64,
}

impl Broadcaster {
    pub fn new(
        registry: Arc<PeerRegistry>,
        snapshots: Arc<SnapshotBuilder>,
        quiet_period: Duration,
    ) -> Self {
        Self {
            registry,
            snapshots,
            trigger: Notify::new(),
            quiet_period,
            pushes: AtomicU64::new(0),
        }
    }

    /// Post a change trigger. Safe from any task; triggers arriving while a
    /// push is in flight coalesce into one follow-up push.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    /// Completed pushes since startup.
    pub fn push_count(&self) -> u64 {
        self.pushes.load(Ordering::Relaxed)
    }

    /// Run until shutdown. At most one push is ever in flight.
    pub async fn run(&self, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = self.trigger.notified() => {}
                _ = shutdown.recv() => return,
            }

            let snapshot = match self.snapshots.rebuild() {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    // The next trigger retries with the store hopefully back.
                    error!(error = %e, "snapshot rebuild failed, skipping push");
                    continue;
                }
            };

            let queued = self.registry.broadcast(snapshot);
            self.pushes.fetch_add(1, Ordering::Relaxed);
            info!(peers = queued, "configuration pushed");

            debug!(seconds = self.quiet_period.as_secs_f64(), "quiescent");
            tokio::select! {
                _ = tokio::time::sleep(self.quiet_period) => {}
                _ = shutdown.recv() => return,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Outbound, PeerHandle};
    use crate::source::{ConfigSource, SourceError};
    use serde_json::{json, Value};
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::mpsc;

    struct CountingSource {
        exports: AtomicUsize,
    }

    impl ConfigSource for CountingSource {
        fn export(&self) -> Result<Value, SourceError> {
            self.exports.fetch_add(1, Ordering::SeqCst);
            Ok(json!({"services": [], "plugins": []}))
        }
    }

    fn broadcaster(quiet: Duration) -> (Arc<Broadcaster>, Arc<CountingSource>, Arc<PeerRegistry>) {
        let source = Arc::new(CountingSource {
            exports: AtomicUsize::new(0),
        });
        let registry = Arc::new(PeerRegistry::new());
        let snapshots = Arc::new(SnapshotBuilder::new(source.clone()));
        (
            Arc::new(Broadcaster::new(registry.clone(), snapshots, quiet)),
            source,
            registry,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_of_triggers_coalesces_to_one_push() {
        let (broadcaster, source, registry) = broadcaster(Duration::from_secs(5));
        let (tx, mut rx) = mpsc::unbounded_channel();
        registry.register(PeerHandle {
            node_id: "dp-1".into(),
            outbound: tx,
        });

        // A burst lands before the loop even starts: one permit is stored.
        for _ in 0..100 {
            broadcaster.trigger();
        }

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let runner = {
            let broadcaster = broadcaster.clone();
            tokio::spawn(async move { broadcaster.run(shutdown_rx).await })
        };

        // Let the push and the quiescent sleep complete.
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(broadcaster.push_count(), 1);
        assert_eq!(source.exports.load(Ordering::SeqCst), 1);
        assert!(matches!(rx.try_recv(), Ok(Outbound::Payload(_))));
        assert!(rx.try_recv().is_err());

        shutdown_tx.send(()).unwrap();
        runner.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_triggers_during_quiescent_delay_yield_one_more_push() {
        let (broadcaster, _source, _registry) = broadcaster(Duration::from_secs(5));

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let runner = {
            let broadcaster = broadcaster.clone();
            tokio::spawn(async move { broadcaster.run(shutdown_rx).await })
        };

        broadcaster.trigger();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(broadcaster.push_count(), 1);

        // Still inside the quiescent delay.
        for _ in 0..10 {
            broadcaster.trigger();
        }
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(broadcaster.push_count(), 1, "push must wait out the delay");

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(broadcaster.push_count(), 2);

        shutdown_tx.send(()).unwrap();
        runner.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_without_triggers() {
        let (broadcaster, source, _registry) = broadcaster(Duration::from_secs(5));

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let runner = {
            let broadcaster = broadcaster.clone();
            tokio::spawn(async move { broadcaster.run(shutdown_rx).await })
        };

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(broadcaster.push_count(), 0);
        assert_eq!(source.exports.load(Ordering::SeqCst), 0);

        shutdown_tx.send(()).unwrap();
        runner.await.unwrap();
    }
}
