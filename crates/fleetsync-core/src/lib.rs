//! Fleetsync Core Library
//!
//! Pure types and algorithms shared by the control-plane and data-plane
//! daemons.
//!
//! # Modules
//!
//! - [`version`]: Dotted gateway version tuples
//! - [`plugin`]: Plugin descriptors and inventories
//! - [`compat`]: Version and configuration compatibility evaluation
//! - [`fingerprint`]: Canonical configuration fingerprints
//! - [`status`]: Peer sync status codes
//! - [`error`]: Error types

pub mod compat;
pub mod error;
pub mod fingerprint;
pub mod plugin;
pub mod status;
pub mod version;

pub use error::{Error, Result};
pub use fingerprint::{config_hash, UNAPPLIED_HASH};
pub use plugin::{ConfiguredPlugins, PluginDescriptor, PluginInventory};
pub use status::SyncStatus;
pub use version::Version;
