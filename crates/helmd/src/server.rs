//! helmd server - accept loop and TLS identity gate
//!
//! Admission order: TLS handshake (which always demands a client
//! certificate), then the mode-specific identity gate (fingerprint pinning
//! in shared mode, CA validation plus the OCSP policy in pki mode), and
//! only then the application-level session.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::interval;
use tokio_rustls::rustls::pki_types::CertificateDer;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use fleetsync_core::plugin::{inventory_from, PluginInventory};
use fleetsync_core::PluginDescriptor;
use fleetsync_net::ocsp::{OcspClient, OcspError, OcspPolicy, OcspVerdict};
use fleetsync_net::tls::{self, TlsError, TlsMode};

use crate::broadcast::Broadcaster;
use crate::config::Config;
use crate::registry::PeerRegistry;
use crate::session::{self, SessionContext, SessionError};
use crate::snapshot::SnapshotBuilder;
use crate::source::JsonFileSource;
use crate::status::{StatusError, StatusStore};

/// Server errors
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),
    #[error("OCSP error: {0}")]
    Ocsp(#[from] OcspError),
    #[error("status store error: {0}")]
    Status(#[from] StatusError),
    #[error("sled error: {0}")]
    Sled(#[from] sled::Error),
    #[error("session error: {0}")]
    Session(#[from] SessionError),
    #[error("plugin inventory error: {0}")]
    Plugin(#[from] fleetsync_core::Error),
    #[error("peer presented no client certificate")]
    NoClientCertificate,
    #[error("client certificate fingerprint mismatch")]
    IdentityMismatch,
    #[error("client certificate is revoked")]
    CertificateRevoked,
    #[error("OCSP verification failed: {0}")]
    OcspFailed(String),
}

/// Server state
pub struct Server {
    config: Config,
    tls_mode: TlsMode,
    ocsp_policy: OcspPolicy,
    acceptor: TlsAcceptor,
    /// Expected peer leaf fingerprint in shared mode (the shared cert's own).
    shared_fingerprint: Option<String>,
    ocsp: Option<OcspClient>,
    registry: Arc<PeerRegistry>,
    snapshots: Arc<SnapshotBuilder>,
    status: Arc<StatusStore>,
    broadcaster: Arc<Broadcaster>,
    cp_inventory: Arc<PluginInventory>,
    shutdown_tx: broadcast::Sender<()>,
    _db: sled::Db,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Result<Self, ServerError> {
        let tls_mode: TlsMode = config.cluster_mtls.parse()?;
        let ocsp_policy: OcspPolicy = config.cluster_ocsp.parse()?;

        let server_tls = tls::server_config(
            tls_mode,
            &config.cluster_cert,
            &config.cluster_cert_key,
            config.cluster_ca_cert.as_deref(),
        )?;
        let acceptor = TlsAcceptor::from(server_tls);

        let shared_fingerprint = match tls_mode {
            TlsMode::Shared => Some(tls::leaf_fingerprint(
                &tls::load_certs(&config.cluster_cert)?[0],
            )),
            TlsMode::Pki => None,
        };
        let ocsp = if tls_mode == TlsMode::Pki && ocsp_policy != OcspPolicy::Off {
            Some(OcspClient::new()?)
        } else {
            None
        };

        let db = sled::open(&config.data_dir)?;
        let status = Arc::new(StatusStore::open(
            &db,
            Duration::from_secs(config.cluster_data_plane_purge_delay),
        )?);

        let source = Arc::new(JsonFileSource::new(&config.export));
        let snapshots = Arc::new(SnapshotBuilder::new(source));
        let registry = Arc::new(PeerRegistry::new());
        let broadcaster = Arc::new(Broadcaster::new(
            registry.clone(),
            snapshots.clone(),
            Duration::from_secs(config.db_update_frequency),
        ));

        let descriptors = config
            .plugins
            .iter()
            .map(|spec| PluginDescriptor::parse_spec(spec))
            .collect::<Result<Vec<_>, _>>()?;
        let cp_inventory = Arc::new(inventory_from(descriptors));

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            tls_mode,
            ocsp_policy,
            acceptor,
            shared_fingerprint,
            ocsp,
            registry,
            snapshots,
            status,
            broadcaster,
            cp_inventory,
            shutdown_tx,
            _db: db,
        })
    }

    pub fn broadcaster(&self) -> Arc<Broadcaster> {
        self.broadcaster.clone()
    }

    pub fn status(&self) -> Arc<StatusStore> {
        self.status.clone()
    }

    pub fn registry(&self) -> Arc<PeerRegistry> {
        self.registry.clone()
    }

    /// Signal every task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve.
    pub async fn run(self: Arc<Self>) -> Result<(), ServerError> {
        let listener = TcpListener::bind(self.config.listen).await?;
        self.run_on(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn run_on(self: Arc<Self>, listener: TcpListener) -> Result<(), ServerError> {
        info!(
            "helmd listening on {} ({:?} mode)",
            listener.local_addr()?,
            self.tls_mode
        );

        let push_handle = {
            let broadcaster = self.broadcaster.clone();
            let shutdown_rx = self.shutdown_tx.subscribe();
            tokio::spawn(async move { broadcaster.run(shutdown_rx).await })
        };
        let prune_handle = self.spawn_prune_task();

        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok((stream, addr)) => {
                        debug!("accepted connection from {addr}");
                        let server = self.clone();
                        tokio::spawn(async move {
                            if let Err(e) = server.handle_connection(stream, addr).await {
                                warn!(peer = %addr, error = %e, "connection ended with error");
                            }
                        });
                    }
                    Err(e) => error!(error = %e, "accept error"),
                },
                _ = shutdown_rx.recv() => {
                    info!("shutting down");
                    break;
                }
            }
        }

        push_handle.abort();
        prune_handle.abort();
        Ok(())
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
    ) -> Result<(), ServerError> {
        let tls_stream = self.acceptor.accept(stream).await?;

        let chain: Vec<CertificateDer<'static>> = {
            let (_, connection) = tls_stream.get_ref();
            connection
                .peer_certificates()
                .map(|certs| certs.to_vec())
                .unwrap_or_default()
        };
        let Some(leaf) = chain.first() else {
            return Err(ServerError::NoClientCertificate);
        };

        match self.tls_mode {
            TlsMode::Shared => {
                let expected = self.shared_fingerprint.as_deref().unwrap_or_default();
                let presented = tls::leaf_fingerprint(leaf);
                if !tls::fingerprints_match(expected, &presented) {
                    error!(peer = %addr, fingerprint = %presented, "fingerprint mismatch");
                    return Err(ServerError::IdentityMismatch);
                }
            }
            TlsMode::Pki => {
                // Chain validity was established by the CA verifier during
                // the handshake; only revocation remains.
                if let Some(ocsp) = &self.ocsp {
                    let verdict = match ocsp.check(&chain).await {
                        Ok(verdict) => verdict,
                        Err(e) => OcspVerdict::Unverified(e.to_string()),
                    };
                    match (verdict, self.ocsp_policy) {
                        (OcspVerdict::Good, _) => {}
                        (OcspVerdict::Revoked, _) => {
                            error!(peer = %addr, "client certificate is revoked");
                            return Err(ServerError::CertificateRevoked);
                        }
                        (OcspVerdict::Unverified(reason), OcspPolicy::On) => {
                            error!(peer = %addr, reason = %reason, "OCSP verification failed");
                            return Err(ServerError::OcspFailed(reason));
                        }
                        (OcspVerdict::Unverified(reason), _) => {
                            warn!(peer = %addr, reason = %reason, "OCSP unverified, proceeding");
                        }
                    }
                }
            }
        }

        let ctx = SessionContext {
            registry: self.registry.clone(),
            snapshots: self.snapshots.clone(),
            status: self.status.clone(),
            cp_version: self.config.node_version.clone(),
            cp_inventory: self.cp_inventory.clone(),
            ping_interval: Duration::from_secs(self.config.ping_interval),
            shutdown: self.shutdown_tx.clone(),
        };
        session::run(tls_stream, addr.ip().to_string(), ctx).await?;
        Ok(())
    }

    /// Periodically drop expired peer records.
    fn spawn_prune_task(&self) -> tokio::task::JoinHandle<()> {
        let status = self.status.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = ticker.tick() => match status.prune() {
                        Ok(0) => {}
                        Ok(removed) => info!(removed, "purged expired peer records"),
                        Err(e) => error!(error = %e, "record prune failed"),
                    },
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }
}
