//! Channel handshake
//!
//! The data plane opens with a `Hello` frame whose payload is the literal
//! request URI `/v1/outlet?node_id=..&node_hostname=..&node_version=..`.
//! The control plane answers with a `HelloAck` carrying a 2-byte big-endian
//! status: 200 to accept, 400 when a required parameter is missing.

use thiserror::Error;

/// Path the data plane requests on connect.
pub const OUTLET_PATH: &str = "/v1/outlet";

pub const STATUS_OK: u16 = 200;
pub const STATUS_BAD_REQUEST: u16 = 400;

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake URI is not valid UTF-8")]
    NotUtf8,
    #[error("unexpected handshake path: {0:?}")]
    UnknownPath(String),
    #[error("missing required handshake parameter: {0}")]
    MissingParam(&'static str),
    #[error("handshake rejected with status {0}")]
    Rejected(u16),
    #[error("malformed handshake ack")]
    MalformedAck,
}

/// Identity a data plane advertises on connect. `node_id` and
/// `node_version` are required; the hostname is best-effort.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub node_id: String,
    pub node_hostname: String,
    pub node_version: String,
}

impl HandshakeRequest {
    pub fn new(
        node_id: impl Into<String>,
        node_hostname: impl Into<String>,
        node_version: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            node_hostname: node_hostname.into(),
            node_version: node_version.into(),
        }
    }

    /// Render the request URI carried in the `Hello` frame.
    pub fn to_uri(&self) -> String {
        format!(
            "{OUTLET_PATH}?node_id={}&node_hostname={}&node_version={}",
            self.node_id, self.node_hostname, self.node_version
        )
    }

    /// Parse a `Hello` payload.
    pub fn parse(payload: &[u8]) -> Result<Self, HandshakeError> {
        let uri = std::str::from_utf8(payload).map_err(|_| HandshakeError::NotUtf8)?;
        let (path, query) = uri.split_once('?').unwrap_or((uri, ""));
        if path != OUTLET_PATH {
            return Err(HandshakeError::UnknownPath(path.to_string()));
        }

        let mut node_id = None;
        let mut node_hostname = None;
        let mut node_version = None;
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "node_id" => node_id = Some(value.to_string()),
                "node_hostname" => node_hostname = Some(value.to_string()),
                "node_version" => node_version = Some(value.to_string()),
                _ => {}
            }
        }

        let node_id = node_id
            .filter(|v| !v.is_empty())
            .ok_or(HandshakeError::MissingParam("node_id"))?;
        let node_version = node_version
            .filter(|v| !v.is_empty())
            .ok_or(HandshakeError::MissingParam("node_version"))?;

        Ok(Self {
            node_id,
            node_hostname: node_hostname.unwrap_or_default(),
            node_version,
        })
    }
}

/// Encode a `HelloAck` status.
pub fn encode_ack(status: u16) -> Vec<u8> {
    status.to_be_bytes().to_vec()
}

/// Decode a `HelloAck` payload.
pub fn decode_ack(payload: &[u8]) -> Result<u16, HandshakeError> {
    let bytes: [u8; 2] = payload.try_into().map_err(|_| HandshakeError::MalformedAck)?;
    Ok(u16::from_be_bytes(bytes))
}
