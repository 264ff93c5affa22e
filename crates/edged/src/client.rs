//! Data-plane peer session
//!
//! One connection to the control plane at a time, re-established with
//! jittered backoff. Inside an established channel three tasks cooperate:
//! the read loop (sole reader) stages incoming snapshots, the heartbeat
//! task (sole writer) advertises the applied fingerprint, and the apply
//! task feeds staged snapshots through the apply path. Any of the three
//! exiting tears the connection down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, Notify};
use tokio::time::{sleep, timeout};
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

use fleetsync_core::PluginInventory;
use fleetsync_net::framing::{Frame, FrameCodec, FrameError, FrameType};
use fleetsync_net::handshake::{decode_ack, HandshakeError, HandshakeRequest, STATUS_OK};
use fleetsync_net::message::{BasicInfo, MessageError, Reconfigure};
use fleetsync_net::tls::{self, TlsError, TlsMode};
use fleetsync_net::{CLUSTERING_TIMEOUT, MAX_PAYLOAD};

use crate::apply::{Applied, Applier};
use crate::config::Config;

/// Bound on one inflated snapshot.
const INFLATE_LIMIT: usize = 16 * MAX_PAYLOAD;

/// Client errors
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
    #[error("handshake error: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("message error: {0}")]
    Message(#[from] MessageError),
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
    #[error("handshake rejected with status {0}")]
    Rejected(u16),
    #[error("channel closed by control plane")]
    Closed,
    #[error("no handshake ack within the channel timeout")]
    Timeout,
    #[error("protocol violation: unexpected {0:?} frame")]
    UnexpectedFrame(FrameType),
}

/// Everything one established channel needs.
pub struct PeerSession {
    pub handshake: HandshakeRequest,
    pub inventory: PluginInventory,
    pub applier: Arc<Applier>,
    pub ping_interval: Duration,
}

impl PeerSession {
    /// Drive one established channel to completion. Generic over the
    /// stream so tests run it over an in-memory pipe.
    pub async fn run<S>(
        &self,
        stream: S,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<(), ClientError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (read_half, write_half) = tokio::io::split(stream);
        let mut reader = FramedRead::new(read_half, FrameCodec::new());
        let mut writer = FramedWrite::new(write_half, FrameCodec::new());

        // Hello, ack, then our plugin inventory.
        writer
            .send(Frame::new(
                FrameType::Hello,
                self.handshake.to_uri().into_bytes(),
            ))
            .await?;
        let ack = match timeout(CLUSTERING_TIMEOUT, reader.next()).await {
            Err(_) => return Err(ClientError::Timeout),
            Ok(None) => return Err(ClientError::Closed),
            Ok(Some(result)) => result?,
        };
        if ack.frame_type != FrameType::HelloAck {
            return Err(ClientError::UnexpectedFrame(ack.frame_type));
        }
        let status = decode_ack(&ack.payload)?;
        if status != STATUS_OK {
            return Err(ClientError::Rejected(status));
        }
        writer
            .send(BasicInfo::from_inventory(&self.inventory).to_frame()?)
            .await?;

        // Shared state between the three tasks. `next_config` holds only
        // the latest staged tree; intermediates may be skipped.
        let next_config: Arc<Mutex<Option<Value>>> = Arc::new(Mutex::new(None));
        let config_notify = Arc::new(Notify::new());
        let ping_immediately = Arc::new(AtomicBool::new(false));

        let mut ping_handle = tokio::spawn(ping_loop(
            writer,
            self.applier.clone(),
            self.ping_interval,
            ping_immediately.clone(),
            shutdown.subscribe(),
        ));
        let mut apply_handle = tokio::spawn(apply_loop(
            self.applier.clone(),
            next_config.clone(),
            config_notify.clone(),
            ping_immediately.clone(),
            shutdown.subscribe(),
        ));

        let mut shutdown_rx = shutdown.subscribe();
        let result = loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break Ok(()),
                joined = &mut ping_handle => {
                    break match joined {
                        Ok(result) => result,
                        Err(_) => Ok(()),
                    };
                }
                joined = &mut apply_handle => {
                    let _ = joined;
                    break Ok(());
                }
                received = reader.next() => match received {
                    None => break Err(ClientError::Closed),
                    Some(Err(e)) => break Err(e.into()),
                    Some(Ok(frame)) => match frame.frame_type {
                        FrameType::Config => {
                            match Reconfigure::decode(&frame.payload, INFLATE_LIMIT) {
                                Ok(envelope) => {
                                    debug!("configuration push received");
                                    *next_config.lock() = Some(envelope.config_table);
                                    config_notify.notify_one();
                                }
                                Err(e) => {
                                    error!(error = %e, "undecodable configuration push");
                                    break Err(e.into());
                                }
                            }
                        }
                        FrameType::Pong => debug!("heartbeat acknowledged"),
                        FrameType::Close => {
                            info!("control plane closed the channel");
                            break Ok(());
                        }
                        other => {
                            error!("protocol violation: {other:?} frame");
                            break Err(ClientError::UnexpectedFrame(other));
                        }
                    },
                },
            }
        };

        ping_handle.abort();
        apply_handle.abort();
        result
    }
}

/// Sole writer: a heartbeat every `ping_interval`, sleeping in one-second
/// steps so shutdown and a fresh apply both shorten the wait. The first
/// heartbeat goes out immediately after the handshake.
async fn ping_loop<W>(
    mut writer: FramedWrite<WriteHalf<W>, FrameCodec>,
    applier: Arc<Applier>,
    ping_interval: Duration,
    ping_immediately: Arc<AtomicBool>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<(), ClientError>
where
    W: AsyncRead + AsyncWrite + Send + 'static,
{
    loop {
        writer.send(Frame::ping(&applier.applied_hash())).await?;
        debug!("heartbeat sent");

        let mut waited = Duration::ZERO;
        while waited < ping_interval {
            let step = Duration::from_secs(1).min(ping_interval - waited);
            tokio::select! {
                _ = sleep(step) => {}
                _ = shutdown_rx.recv() => {
                    writer.send(Frame::close("shutting down")).await.ok();
                    return Ok(());
                }
            }
            waited += step;
            if ping_immediately.swap(false, Ordering::Relaxed) {
                break;
            }
        }
    }
}

/// Applies staged snapshots; a successful apply requests an immediate
/// heartbeat so the control plane sees the new fingerprint promptly.
async fn apply_loop(
    applier: Arc<Applier>,
    next_config: Arc<Mutex<Option<Value>>>,
    config_notify: Arc<Notify>,
    ping_immediately: Arc<AtomicBool>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = config_notify.notified() => {}
            _ = shutdown_rx.recv() => return,
        }

        let Some(tree) = next_config.lock().take() else {
            continue;
        };
        match applier.update(&tree, true) {
            Ok(Applied::Fresh) => ping_immediately.store(true, Ordering::Relaxed),
            Ok(Applied::Unchanged) => {}
            // The staged tree is dropped; the previous config stays applied.
            Err(e) => error!(error = %e, "configuration apply failed"),
        }
    }
}

/// Reconnecting control-plane client.
pub struct Client {
    addr: String,
    connector: TlsConnector,
    server_name: ServerName<'static>,
    session: PeerSession,
}

impl Client {
    pub fn new(config: &Config, applier: Arc<Applier>) -> Result<Self, ClientError> {
        let mode: TlsMode = config.cluster_mtls.parse()?;
        let tls_config = tls::client_config(
            mode,
            &config.cluster_cert,
            &config.cluster_cert_key,
            config.cluster_ca_cert.as_deref(),
        )?;
        let host = config
            .cluster_control_plane
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(config.cluster_control_plane.as_str());
        let server_name =
            tls::client_server_name(mode, config.cluster_server_name.as_deref(), host)?;

        let session = PeerSession {
            handshake: HandshakeRequest::new(
                config.node_id.clone(),
                config.node_hostname.clone(),
                config.node_version.clone(),
            ),
            inventory: config.inventory().unwrap_or_default(),
            applier,
            ping_interval: Duration::from_secs(config.ping_interval),
        };

        Ok(Self {
            addr: config.cluster_control_plane.clone(),
            connector: TlsConnector::from(tls_config),
            server_name,
            session,
        })
    }

    /// Reconnect loop; returns once shutdown is signalled.
    pub async fn run(&self, shutdown: broadcast::Sender<()>) {
        let mut shutdown_rx = shutdown.subscribe();
        loop {
            match self.connect_once(&shutdown).await {
                Ok(()) => info!("session ended"),
                Err(e) => warn!(error = %e, "session failed"),
            }
            if shutdown_rx.try_recv().is_ok() {
                return;
            }

            let delay = Duration::from_secs(rand::thread_rng().gen_range(5..10));
            info!(seconds = delay.as_secs(), "reconnecting after delay");
            tokio::select! {
                _ = sleep(delay) => {}
                _ = shutdown_rx.recv() => return,
            }
        }
    }

    async fn connect_once(&self, shutdown: &broadcast::Sender<()>) -> Result<(), ClientError> {
        let tcp = TcpStream::connect(&self.addr).await?;
        let stream = self
            .connector
            .connect(self.server_name.clone(), tcp)
            .await?;
        info!(addr = %self.addr, "connected to control plane");
        self.session.run(stream, shutdown).await
    }
}
