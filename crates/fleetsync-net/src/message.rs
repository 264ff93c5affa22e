//! Application messages and payload compression
//!
//! Two JSON bodies cross the channel: the data plane's `basic_info`
//! inventory (first application message, `Info` frame) and the control
//! plane's gzip-deflated `reconfigure` envelope (`Config` frame). Heartbeat
//! frames carry the 32-hex applied fingerprint as their raw body.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use fleetsync_core::plugin::{inventory_from, PluginInventory};
use fleetsync_core::PluginDescriptor;

use crate::framing::{Frame, FrameType};

/// Message errors
#[derive(Debug, Error)]
pub enum MessageError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unexpected message type {got:?} (expected {expected:?})")]
    WrongType { expected: &'static str, got: String },
    #[error("inflated payload exceeds {0} bytes")]
    InflatedTooLarge(usize),
    #[error("heartbeat body is not a fingerprint")]
    MalformedFingerprint,
}

/// One plugin entry of a `basic_info` message. Versions travel as strings;
/// an unparsable version downgrades to "version unknown" on the far side.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PluginEntry {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

/// First application message sent by the data plane.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BasicInfo {
    #[serde(rename = "type")]
    pub kind: String,
    pub plugins: Vec<PluginEntry>,
}

impl BasicInfo {
    pub const KIND: &'static str = "basic_info";

    pub fn from_inventory(inventory: &PluginInventory) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            plugins: inventory
                .values()
                .map(|plugin| PluginEntry {
                    name: plugin.name.clone(),
                    version: plugin.version.map(|v| v.to_string()),
                })
                .collect(),
        }
    }

    pub fn to_inventory(&self) -> PluginInventory {
        inventory_from(self.plugins.iter().map(|entry| {
            PluginDescriptor::new(
                entry.name.clone(),
                entry.version.as_deref().and_then(|v| v.parse().ok()),
            )
        }))
    }

    pub fn to_frame(&self) -> Result<Frame, MessageError> {
        Ok(Frame::new(FrameType::Info, serde_json::to_vec(self)?))
    }

    pub fn from_frame(frame: &Frame) -> Result<Self, MessageError> {
        let info: Self = serde_json::from_slice(&frame.payload)?;
        if info.kind != Self::KIND {
            return Err(MessageError::WrongType {
                expected: Self::KIND,
                got: info.kind,
            });
        }
        Ok(info)
    }
}

/// Envelope around every configuration push.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Reconfigure {
    #[serde(rename = "type")]
    pub kind: String,
    /// Wall-clock seconds at export time.
    pub timestamp: f64,
    pub config_table: Value,
}

impl Reconfigure {
    pub const KIND: &'static str = "reconfigure";

    pub fn new(config_table: Value, timestamp: f64) -> Self {
        Self {
            kind: Self::KIND.to_string(),
            timestamp,
            config_table,
        }
    }

    /// JSON-encode and gzip the envelope into a `Config` frame payload.
    pub fn encode(&self) -> Result<Vec<u8>, MessageError> {
        Ok(deflate(&serde_json::to_vec(self)?)?)
    }

    /// Inflate and decode a `Config` frame payload, bounding the inflated
    /// size.
    pub fn decode(payload: &[u8], limit: usize) -> Result<Self, MessageError> {
        let raw = inflate(payload, limit)?;
        let envelope: Self = serde_json::from_slice(&raw)?;
        if envelope.kind != Self::KIND {
            return Err(MessageError::WrongType {
                expected: Self::KIND,
                got: envelope.kind,
            });
        }
        Ok(envelope)
    }
}

/// Gzip-compress a byte buffer.
pub fn deflate(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Gzip-decompress a byte buffer, erroring past `limit` inflated bytes.
pub fn inflate(bytes: &[u8], limit: usize) -> Result<Vec<u8>, MessageError> {
    let mut out = Vec::new();
    let mut decoder = GzDecoder::new(bytes).take(limit as u64 + 1);
    decoder.read_to_end(&mut out)?;
    if out.len() > limit {
        return Err(MessageError::InflatedTooLarge(limit));
    }
    Ok(out)
}

/// Parse a heartbeat body: exactly 32 ASCII hex characters.
pub fn parse_ping(payload: &[u8]) -> Result<String, MessageError> {
    if payload.len() != 32 || !payload.iter().all(u8::is_ascii_hexdigit) {
        return Err(MessageError::MalformedFingerprint);
    }
    Ok(payload.iter().map(|&b| b as char).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetsync_core::{Version, UNAPPLIED_HASH};
    use serde_json::json;

    #[test]
    fn test_basic_info_roundtrip() {
        let inventory = inventory_from(vec![
            PluginDescriptor::new("key-auth", Some(Version::new(3, 0, 0))),
            PluginDescriptor::new("custom", None),
        ]);
        let frame = BasicInfo::from_inventory(&inventory).to_frame().unwrap();
        assert_eq!(frame.frame_type, FrameType::Info);

        let parsed = BasicInfo::from_frame(&frame).unwrap();
        assert_eq!(parsed.to_inventory(), inventory);
    }

    #[test]
    fn test_basic_info_wire_shape() {
        let info = BasicInfo::from_inventory(&inventory_from(vec![PluginDescriptor::new(
            "key-auth",
            Some(Version::new(3, 0, 0)),
        )]));
        let wire: Value = serde_json::from_slice(&info.to_frame().unwrap().payload).unwrap();
        assert_eq!(
            wire,
            json!({"type": "basic_info", "plugins": [{"name": "key-auth", "version": "3.0.0"}]})
        );
    }

    #[test]
    fn test_basic_info_rejects_other_kinds() {
        let frame = Frame::new(
            FrameType::Info,
            br#"{"type": "reconfigure", "plugins": []}"#.to_vec(),
        );
        assert!(matches!(
            BasicInfo::from_frame(&frame),
            Err(MessageError::WrongType { .. })
        ));
    }

    #[test]
    fn test_unparsable_plugin_version_downgrades() {
        let frame = Frame::new(
            FrameType::Info,
            br#"{"type": "basic_info", "plugins": [{"name": "p", "version": "dev"}]}"#.to_vec(),
        );
        let inventory = BasicInfo::from_frame(&frame).unwrap().to_inventory();
        assert!(inventory["p"].version.is_none());
    }

    #[test]
    fn test_reconfigure_roundtrip() {
        let envelope = Reconfigure::new(json!({"services": [{"name": "s1"}]}), 1700000000.5);
        let payload = envelope.encode().unwrap();

        let decoded = Reconfigure::decode(&payload, 1 << 20).unwrap();
        assert_eq!(decoded.kind, "reconfigure");
        assert_eq!(decoded.timestamp, 1700000000.5);
        assert_eq!(decoded.config_table, envelope.config_table);
    }

    #[test]
    fn test_reconfigure_inflate_bound() {
        let big = json!({"blob": "x".repeat(4096)});
        let payload = Reconfigure::new(big, 0.0).encode().unwrap();
        assert!(matches!(
            Reconfigure::decode(&payload, 128),
            Err(MessageError::InflatedTooLarge(128))
        ));
    }

    #[test]
    fn test_parse_ping() {
        assert_eq!(
            parse_ping(UNAPPLIED_HASH.as_bytes()).unwrap(),
            UNAPPLIED_HASH
        );
        assert!(parse_ping(b"deadbeef").is_err());
        assert!(parse_ping(&[b'z'; 32]).is_err());
    }
}
