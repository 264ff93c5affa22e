//! edged - Fleetsync Data-Plane Daemon
//!
//! This daemon provides:
//! - A persistent mTLS session to the control plane, with jittered
//!   reconnects
//! - Atomic application of received configuration snapshots
//! - An on-disk snapshot cache for cold starts
//! - Heartbeats advertising the applied-config fingerprint

pub mod apply;
pub mod cache;
pub mod client;
pub mod config;

pub use apply::{Applied, Applier, ConfigSink, MemorySink};
pub use cache::LocalCache;
pub use client::{Client, PeerSession};
pub use config::Config;
