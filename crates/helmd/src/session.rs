//! Per-data-plane session
//!
//! Lifecycle: handshake over the already-authenticated channel, inventory
//! exchange, version gate, registration, initial push, then one read loop
//! (sole reader, liveness) and one write task (sole writer, draining the
//! outbound queue). Either side exiting tears the other down. The session
//! is generic over the stream so tests can drive it over an in-memory
//! duplex pipe.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use fleetsync_core::compat::{evaluate_configured, evaluate_versions, CompatNote, NoteLevel};
use fleetsync_core::{PluginInventory, SyncStatus};
use fleetsync_net::framing::{Frame, FrameCodec, FrameError, FrameType};
use fleetsync_net::handshake::{
    encode_ack, HandshakeError, HandshakeRequest, STATUS_BAD_REQUEST, STATUS_OK,
};
use fleetsync_net::message::{parse_ping, BasicInfo, MessageError};
use fleetsync_net::{ping_wait, CLUSTERING_TIMEOUT};

use crate::registry::{Outbound, PeerHandle, PeerRegistry};
use crate::snapshot::SnapshotBuilder;
use crate::status::{PeerUpdate, StatusError, StatusStore};

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    #[error("status store error: {0}")]
    Status(#[from] StatusError),
    #[error("peer rejected: {0}")]
    Rejected(String),
    #[error("no frame within the channel timeout")]
    Timeout,
    #[error("channel closed by peer")]
    ClosedByPeer,
    #[error("peer missed its liveness window")]
    LivenessExpired,
    #[error("protocol violation: unexpected {0:?} frame")]
    UnexpectedFrame(FrameType),
}

/// Everything a session borrows from the daemon.
#[derive(Clone)]
pub struct SessionContext {
    pub registry: Arc<PeerRegistry>,
    pub snapshots: Arc<SnapshotBuilder>,
    pub status: Arc<StatusStore>,
    pub cp_version: String,
    pub cp_inventory: Arc<PluginInventory>,
    pub ping_interval: Duration,
    pub shutdown: broadcast::Sender<()>,
}

/// Handshake-time facts about the peer, shared by the two halves.
struct PeerState {
    node_id: String,
    hostname: String,
    remote_ip: String,
    version: String,
    dp_inventory: PluginInventory,
    /// Last compatibility verdict; written by the write half on each push
    /// attempt, reported by the read half on each heartbeat.
    sync_status: RwLock<SyncStatus>,
}

/// Run one admitted connection to completion.
pub async fn run<S>(stream: S, remote_ip: String, ctx: SessionContext) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let mut reader = FramedRead::new(read_half, FrameCodec::new());
    let mut writer = FramedWrite::new(write_half, FrameCodec::new());

    // Handshake: Hello with the outlet URI, then the basic_info inventory.
    let hello = next_frame(&mut reader).await?;
    if hello.frame_type != FrameType::Hello {
        writer.send(Frame::close("expected handshake")).await.ok();
        return Err(SessionError::UnexpectedFrame(hello.frame_type));
    }
    let request = match HandshakeRequest::parse(&hello.payload) {
        Ok(request) => request,
        Err(e) => {
            warn!(ip = %remote_ip, error = %e, "rejecting handshake");
            writer
                .send(Frame::new(FrameType::HelloAck, encode_ack(STATUS_BAD_REQUEST)))
                .await
                .ok();
            writer.send(Frame::close("bad handshake")).await.ok();
            return Err(e.into());
        }
    };
    writer
        .send(Frame::new(FrameType::HelloAck, encode_ack(STATUS_OK)))
        .await?;

    let info_frame = next_frame(&mut reader).await?;
    if info_frame.frame_type != FrameType::Info {
        error!(
            node = %request.node_id,
            "first application frame was {:?}, not basic_info",
            info_frame.frame_type
        );
        writer.send(Frame::close("basic_info expected")).await.ok();
        return Err(SessionError::UnexpectedFrame(info_frame.frame_type));
    }
    let dp_inventory = match BasicInfo::from_frame(&info_frame) {
        Ok(info) => info.to_inventory(),
        Err(e) => {
            error!(node = %request.node_id, error = %e, "malformed basic_info");
            writer.send(Frame::close("malformed basic_info")).await.ok();
            return Err(e.into());
        }
    };

    // Version gate. A fatal verdict is recorded before the close so
    // operators can see why the peer is gone.
    let report = evaluate_versions(
        &ctx.cp_version,
        &request.node_version,
        &ctx.cp_inventory,
        &dp_inventory,
    );
    for note in &report.notes {
        log_note(&request.node_id, note);
    }
    if let Some(fatal) = report.fatal {
        error!(node = %request.node_id, reason = %fatal.reason, "version incompatible");
        ctx.status.upsert(PeerUpdate {
            id: request.node_id.clone(),
            hostname: request.node_hostname.clone(),
            ip: remote_ip.clone(),
            version: request.node_version.clone(),
            config_hash: None,
            sync_status: fatal.status,
        })?;
        writer.send(Frame::close(&fatal.reason)).await.ok();
        return Err(SessionError::Rejected(fatal.reason));
    }

    let peer = Arc::new(PeerState {
        node_id: request.node_id.clone(),
        hostname: request.node_hostname.clone(),
        remote_ip,
        version: request.node_version.clone(),
        dp_inventory,
        sync_status: RwLock::new(SyncStatus::Normal),
    });

    // Admitted: register, queue the initial push, spawn the writer.
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let session_id = ctx.registry.register(PeerHandle {
        node_id: peer.node_id.clone(),
        outbound: outbound_tx.clone(),
    });
    info!(node = %peer.node_id, version = %peer.version, "data plane attached");

    match ctx.snapshots.current() {
        Ok(snapshot) => {
            outbound_tx.send(Outbound::Payload(snapshot)).ok();
        }
        Err(e) => {
            error!(node = %peer.node_id, error = %e, "initial snapshot unavailable");
        }
    }

    let mut write_handle = tokio::spawn(write_loop(
        writer,
        outbound_rx,
        peer.clone(),
        ctx.cp_inventory.clone(),
        ctx.shutdown.subscribe(),
    ));

    let result = read_loop(
        &mut reader,
        &peer,
        &ctx,
        &outbound_tx,
        &mut write_handle,
    )
    .await;

    ctx.registry.deregister(session_id);
    write_handle.abort();
    info!(node = %peer.node_id, "data plane detached");
    result
}

/// Sole reader: heartbeats, liveness, protocol policing.
async fn read_loop<R>(
    reader: &mut FramedRead<ReadHalf<R>, FrameCodec>,
    peer: &Arc<PeerState>,
    ctx: &SessionContext,
    outbound_tx: &mpsc::UnboundedSender<Outbound>,
    write_handle: &mut tokio::task::JoinHandle<Result<(), SessionError>>,
) -> Result<(), SessionError>
where
    R: AsyncRead + AsyncWrite + Send + 'static,
{
    let liveness_window = ping_wait(ctx.ping_interval);
    let mut last_seen = Instant::now();
    let mut shutdown_rx = ctx.shutdown.subscribe();

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => return Ok(()),
            joined = &mut *write_handle => {
                return match joined {
                    Ok(result) => result,
                    Err(_) => Ok(()),
                };
            }
            received = timeout(CLUSTERING_TIMEOUT, reader.next()) => match received {
                Err(_) => {
                    if last_seen.elapsed() > liveness_window {
                        warn!(node = %peer.node_id, "no heartbeat within the liveness window");
                        return Err(SessionError::LivenessExpired);
                    }
                }
                Ok(None) => return Err(SessionError::ClosedByPeer),
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(frame))) => match frame.frame_type {
                    FrameType::Ping => {
                        let hash = match parse_ping(&frame.payload) {
                            Ok(hash) => hash,
                            Err(e) => {
                                error!(node = %peer.node_id, error = %e, "bad heartbeat");
                                return Err(e.into());
                            }
                        };
                        last_seen = Instant::now();
                        debug!(node = %peer.node_id, hash = %hash, "heartbeat");

                        let sync_status = *peer.sync_status.read();
                        if let Err(e) = ctx.status.upsert(PeerUpdate {
                            id: peer.node_id.clone(),
                            hostname: peer.hostname.clone(),
                            ip: peer.remote_ip.clone(),
                            version: peer.version.clone(),
                            config_hash: Some(hash),
                            sync_status,
                        }) {
                            error!(node = %peer.node_id, error = %e, "cannot record heartbeat");
                        }

                        if outbound_tx.send(Outbound::Pong).is_err() {
                            return Ok(());
                        }
                    }
                    FrameType::Close => return Ok(()),
                    other => {
                        error!(node = %peer.node_id, "protocol violation: {other:?} frame");
                        return Err(SessionError::UnexpectedFrame(other));
                    }
                },
            },
        }
    }
}

/// Sole writer: drains the outbound queue. Configuration compatibility is
/// evaluated against the peer's inventory on every dequeued payload; an
/// incompatible payload is dropped with a warning and the peer stays
/// attached.
async fn write_loop<W>(
    mut writer: FramedWrite<WriteHalf<W>, FrameCodec>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
    peer: Arc<PeerState>,
    cp_inventory: Arc<PluginInventory>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), SessionError>
where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                writer.send(Frame::close("shutting down")).await.ok();
                return Ok(());
            }
            item = outbound_rx.recv() => match item {
                None => return Ok(()),
                Some(Outbound::Pong) => writer.send(Frame::pong()).await?,
                Some(Outbound::Payload(snapshot)) => {
                    match evaluate_configured(
                        &snapshot.configured,
                        &cp_inventory,
                        &peer.dp_inventory,
                    ) {
                        Ok(()) => {
                            *peer.sync_status.write() = SyncStatus::Normal;
                            writer
                                .send(Frame::new(FrameType::Config, snapshot.deflated.to_vec()))
                                .await?;
                            debug!(node = %peer.node_id, "configuration sent");
                        }
                        Err(incompatibility) => {
                            *peer.sync_status.write() = incompatibility.status;
                            warn!(
                                node = %peer.node_id,
                                status = %incompatibility.status,
                                "push suppressed: {}",
                                incompatibility.reason
                            );
                        }
                    }
                }
            },
        }
    }
}

async fn next_frame<T>(
    reader: &mut FramedRead<T, FrameCodec>,
) -> Result<Frame, SessionError>
where
    T: AsyncRead + Unpin,
{
    match timeout(CLUSTERING_TIMEOUT, reader.next()).await {
        Err(_) => Err(SessionError::Timeout),
        Ok(None) => Err(SessionError::ClosedByPeer),
        Ok(Some(result)) => Ok(result?),
    }
}

fn log_note(node_id: &str, note: &CompatNote) {
    match note.level {
        NoteLevel::Debug => debug!(node = %node_id, "{}", note.message),
        NoteLevel::Info | NoteLevel::Notice => info!(node = %node_id, "{}", note.message),
        NoteLevel::Warn => warn!(node = %node_id, "{}", note.message),
    }
}
