//! helmd - Fleetsync Control-Plane Daemon
//!
//! This daemon provides:
//! - mTLS-gated sessions for data-plane peers
//! - Snapshot building and the byte-payload cache
//! - Coalesced configuration broadcast to attached peers
//! - Peer liveness tracking and status records

pub mod broadcast;
pub mod config;
pub mod registry;
pub mod server;
pub mod session;
pub mod snapshot;
pub mod source;
pub mod status;

pub use broadcast::Broadcaster;
pub use config::Config;
pub use registry::{Outbound, PeerHandle, PeerRegistry};
pub use server::Server;
pub use snapshot::{Snapshot, SnapshotBuilder};
pub use source::{ConfigSource, JsonFileSource};
pub use status::{PeerRecord, StatusStore};
