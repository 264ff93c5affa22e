//! Control-plane session behavior, driven over in-memory channels.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::codec::Framed;

use fleetsync_core::{config_hash, SyncStatus, UNAPPLIED_HASH};
use fleetsync_net::framing::{Frame, FrameCodec, FrameType};
use fleetsync_net::handshake::decode_ack;
use fleetsync_net::message::{BasicInfo, PluginEntry, Reconfigure};
use helmd::registry::PeerRegistry;
use helmd::session::{self, SessionContext, SessionError};
use helmd::snapshot::SnapshotBuilder;
use helmd::source::{ConfigSource, SourceError};
use helmd::status::StatusStore;

struct StaticSource(Value);

impl ConfigSource for StaticSource {
    fn export(&self) -> Result<Value, SourceError> {
        Ok(self.0.clone())
    }
}

struct Harness {
    ctx: SessionContext,
    status: Arc<StatusStore>,
    registry: Arc<PeerRegistry>,
    shutdown: broadcast::Sender<()>,
    _dir: tempfile::TempDir,
}

fn harness(export: Value, cp_version: &str, cp_plugins: &[&str]) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let db = sled::open(dir.path().join("status")).unwrap();
    let status = Arc::new(StatusStore::open(&db, Duration::from_secs(3600)).unwrap());
    let registry = Arc::new(PeerRegistry::new());
    let snapshots = Arc::new(SnapshotBuilder::new(Arc::new(StaticSource(export))));
    let (shutdown, _) = broadcast::channel(1);

    let cp_inventory = fleetsync_core::plugin::inventory_from(
        cp_plugins
            .iter()
            .map(|spec| fleetsync_core::PluginDescriptor::parse_spec(spec).unwrap()),
    );

    let ctx = SessionContext {
        registry: registry.clone(),
        snapshots,
        status: status.clone(),
        cp_version: cp_version.to_string(),
        cp_inventory: Arc::new(cp_inventory),
        ping_interval: Duration::from_secs(1),
        shutdown: shutdown.clone(),
    };

    Harness {
        ctx,
        status,
        registry,
        shutdown,
        _dir: dir,
    }
}

fn basic_info(plugins: &[(&str, Option<&str>)]) -> Frame {
    let info = BasicInfo {
        kind: "basic_info".to_string(),
        plugins: plugins
            .iter()
            .map(|(name, version)| PluginEntry {
                name: name.to_string(),
                version: version.map(str::to_string),
            })
            .collect(),
    };
    info.to_frame().unwrap()
}

async fn handshake(
    channel: &mut Framed<tokio::io::DuplexStream, FrameCodec>,
    node_version: &str,
    plugins: &[(&str, Option<&str>)],
) {
    let uri = format!("/v1/outlet?node_id=dp-1&node_hostname=dp.internal&node_version={node_version}");
    channel
        .send(Frame::new(FrameType::Hello, uri.into_bytes()))
        .await
        .unwrap();

    let ack = channel.next().await.unwrap().unwrap();
    assert_eq!(ack.frame_type, FrameType::HelloAck);
    assert_eq!(decode_ack(&ack.payload).unwrap(), 200);

    channel.send(basic_info(plugins)).await.unwrap();
}

// S1: matching versions and inventory. The session pushes one snapshot,
// answers heartbeats, and the record tracks the advertised fingerprint.
#[tokio::test]
async fn test_happy_path_connect() {
    let export = json!({"services": [{"name": "s1"}], "plugins": [{"name": "key-auth"}]});
    let h = harness(export, "3.0.0", &["key-auth@3.0.0"]);

    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = tokio::spawn(session::run(server_io, "127.0.0.1".to_string(), h.ctx));

    let mut channel = Framed::new(client_io, FrameCodec::new());
    handshake(&mut channel, "3.0.0", &[("key-auth", Some("3.0.0"))]).await;

    // The initial push arrives before anything else.
    let push = channel.next().await.unwrap().unwrap();
    assert_eq!(push.frame_type, FrameType::Config);
    let envelope = Reconfigure::decode(&push.payload, 1 << 20).unwrap();
    let snapshot_hash = config_hash(&envelope.config_table);

    // First heartbeat: nothing applied yet.
    channel.send(Frame::ping(UNAPPLIED_HASH)).await.unwrap();
    let pong = channel.next().await.unwrap().unwrap();
    assert_eq!(pong.frame_type, FrameType::Pong);

    let record = h.status.get("dp-1").unwrap().unwrap();
    assert_eq!(record.sync_status, SyncStatus::Normal);
    assert_eq!(record.config_hash.as_deref(), Some(UNAPPLIED_HASH));
    assert_eq!(record.hostname, "dp.internal");
    assert_eq!(h.registry.len(), 1);

    // After applying, the heartbeat carries the snapshot's fingerprint.
    channel.send(Frame::ping(&snapshot_hash)).await.unwrap();
    channel.next().await.unwrap().unwrap();

    let record = h.status.get("dp-1").unwrap().unwrap();
    assert_eq!(record.config_hash.as_deref(), Some(snapshot_hash.as_str()));

    channel.send(Frame::close("test over")).await.unwrap();
    server.await.unwrap().unwrap();
    assert!(h.registry.is_empty());
}

// S2: major version mismatch. The peer is recorded as incompatible and
// the channel closes without any snapshot send.
#[tokio::test]
async fn test_major_version_mismatch_closes() {
    let export = json!({"services": [], "plugins": []});
    let h = harness(export, "3.0.0", &[]);

    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = tokio::spawn(session::run(server_io, "127.0.0.1".to_string(), h.ctx));

    let mut channel = Framed::new(client_io, FrameCodec::new());
    handshake(&mut channel, "2.8.1", &[]).await;

    let frame = channel.next().await.unwrap().unwrap();
    assert_eq!(frame.frame_type, FrameType::Close);

    assert!(matches!(
        server.await.unwrap(),
        Err(SessionError::Rejected(_))
    ));

    let record = h.status.get("dp-1").unwrap().unwrap();
    assert_eq!(record.sync_status, SyncStatus::VersionIncompatible);
    assert!(record.config_hash.is_none());
    assert!(h.registry.is_empty());
}

// Missing node_id means a 400 ack and no session.
#[tokio::test]
async fn test_missing_node_id_is_rejected_with_400() {
    let export = json!({});
    let h = harness(export, "3.0.0", &[]);

    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = tokio::spawn(session::run(server_io, "127.0.0.1".to_string(), h.ctx));

    let mut channel = Framed::new(client_io, FrameCodec::new());
    channel
        .send(Frame::new(
            FrameType::Hello,
            b"/v1/outlet?node_hostname=h&node_version=3.0.0".to_vec(),
        ))
        .await
        .unwrap();

    let ack = channel.next().await.unwrap().unwrap();
    assert_eq!(ack.frame_type, FrameType::HelloAck);
    assert_eq!(decode_ack(&ack.payload).unwrap(), 400);

    assert!(server.await.unwrap().is_err());
    assert!(h.status.get("dp-1").unwrap().is_none());
}

// A first application frame that is not basic_info closes the channel.
#[tokio::test]
async fn test_frame_instead_of_basic_info_closes() {
    let export = json!({});
    let h = harness(export, "3.0.0", &[]);

    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = tokio::spawn(session::run(server_io, "127.0.0.1".to_string(), h.ctx));

    let mut channel = Framed::new(client_io, FrameCodec::new());
    channel
        .send(Frame::new(
            FrameType::Hello,
            b"/v1/outlet?node_id=dp-1&node_version=3.0.0".to_vec(),
        ))
        .await
        .unwrap();
    channel.next().await.unwrap().unwrap(); // ack

    channel.send(Frame::ping(UNAPPLIED_HASH)).await.unwrap();

    let frame = channel.next().await.unwrap().unwrap();
    assert_eq!(frame.frame_type, FrameType::Close);
    assert!(matches!(
        server.await.unwrap(),
        Err(SessionError::UnexpectedFrame(FrameType::Ping))
    ));
}

// S4: a configured plugin the data plane lacks suppresses pushes but
// keeps the connection (and its heartbeats) alive.
#[tokio::test]
async fn test_missing_configured_plugin_suppresses_push() {
    let export = json!({"services": [], "plugins": [{"name": "rate-limiting"}]});
    let h = harness(export, "3.0.0", &["rate-limiting@3.0.0"]);

    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = tokio::spawn(session::run(server_io, "127.0.0.1".to_string(), h.ctx));

    let mut channel = Framed::new(client_io, FrameCodec::new());
    handshake(&mut channel, "3.0.0", &[]).await;

    // The initial payload is dropped at the compatibility gate, so the
    // first frames back are pong replies.
    channel.send(Frame::ping(UNAPPLIED_HASH)).await.unwrap();
    let first = channel.next().await.unwrap().unwrap();
    assert_eq!(first.frame_type, FrameType::Pong);

    // The payload was dequeued before that pong (FIFO), so by the next
    // heartbeat the record reflects the failed configuration check.
    channel.send(Frame::ping(UNAPPLIED_HASH)).await.unwrap();
    let second = channel.next().await.unwrap().unwrap();
    assert_eq!(second.frame_type, FrameType::Pong);

    let record = h.status.get("dp-1").unwrap().unwrap();
    assert_eq!(record.sync_status, SyncStatus::PluginSetIncompatible);
    assert_eq!(h.registry.len(), 1, "peer must stay attached");

    channel.send(Frame::close("test over")).await.unwrap();
    server.await.unwrap().unwrap();
}

// Outbound items are delivered in queue order: a broadcast queued before
// a heartbeat's pong arrives first.
#[tokio::test]
async fn test_outbound_fifo_payload_before_pong() {
    let export = json!({"services": [], "plugins": []});
    let h = harness(export, "3.0.0", &[]);
    let snapshots = h.ctx.snapshots.clone();

    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = tokio::spawn(session::run(server_io, "127.0.0.1".to_string(), h.ctx));

    let mut channel = Framed::new(client_io, FrameCodec::new());
    handshake(&mut channel, "3.0.0", &[]).await;

    // Initial push.
    let first = channel.next().await.unwrap().unwrap();
    assert_eq!(first.frame_type, FrameType::Config);

    // Queue a broadcast, then a heartbeat whose pong must come after it.
    h.registry.broadcast(snapshots.current().unwrap());
    channel.send(Frame::ping(UNAPPLIED_HASH)).await.unwrap();

    let second = channel.next().await.unwrap().unwrap();
    assert_eq!(second.frame_type, FrameType::Config);
    let third = channel.next().await.unwrap().unwrap();
    assert_eq!(third.frame_type, FrameType::Pong);

    channel.send(Frame::close("test over")).await.unwrap();
    server.await.unwrap().unwrap();
    drop(h.shutdown);
}

// Law 7: with heartbeats absent, the session ends once the liveness
// window (1.5 ping intervals) has passed, observed at the next receive
// timeout.
#[tokio::test]
async fn test_silent_peer_is_torn_down() {
    let export = json!({"services": [], "plugins": []});
    let h = harness(export, "3.0.0", &[]);

    let (client_io, server_io) = tokio::io::duplex(1 << 20);
    let server = tokio::spawn(session::run(server_io, "127.0.0.1".to_string(), h.ctx));

    let mut channel = Framed::new(client_io, FrameCodec::new());
    handshake(&mut channel, "3.0.0", &[]).await;
    channel.next().await.unwrap().unwrap(); // initial push

    // No heartbeats from here on. ping_interval is 1s, so the 5s receive
    // timeout is the bound on noticing.
    let result = tokio::time::timeout(Duration::from_secs(10), server)
        .await
        .expect("session must notice the dead peer")
        .unwrap();
    assert!(matches!(result, Err(SessionError::LivenessExpired)));
    assert!(h.registry.is_empty());
}
