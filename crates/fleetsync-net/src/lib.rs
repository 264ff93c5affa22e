//! Fleetsync wire level
//!
//! Everything the control plane and data plane share on the wire: the
//! length-prefixed frame codec, the channel handshake, the application
//! messages with their gzip payloads, TLS identity for both cluster modes,
//! and OCSP revocation checks.
//!
//! # Modules
//!
//! - [`framing`]: Length-prefixed frames and the codec
//! - [`handshake`]: `/v1/outlet` handshake request and ack
//! - [`message`]: `basic_info` / `reconfigure` bodies, ping fingerprints
//! - [`tls`]: rustls configuration for `shared` and `pki` modes
//! - [`ocsp`]: revocation checks for pki-mode peers

pub mod framing;
pub mod handshake;
pub mod message;
pub mod ocsp;
pub mod tls;

use std::time::Duration;

/// Per-operation channel I/O timeout.
pub const CLUSTERING_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frame payload (4 MiB).
pub const MAX_PAYLOAD: usize = 4 * 1024 * 1024;

/// Default heartbeat interval.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Bound on one OCSP round trip.
pub const OCSP_TIMEOUT: Duration = Duration::from_secs(10);

/// Liveness window: a peer is considered dead after one and a half ping
/// intervals without a heartbeat.
pub fn ping_wait(ping_interval: Duration) -> Duration {
    ping_interval + ping_interval / 2
}
