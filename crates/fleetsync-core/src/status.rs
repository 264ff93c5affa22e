//! Peer sync status codes

use serde::{Deserialize, Serialize};
use std::fmt;

/// Why (if) a data plane is out of sync. The serialized codes are part of
/// the persisted peer-record format and must not change.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
    #[serde(rename = "UNKNOWN")]
    Unknown,
    #[serde(rename = "NORMAL")]
    Normal,
    #[serde(rename = "KONG_VERSION_INCOMPATIBLE")]
    VersionIncompatible,
    #[serde(rename = "PLUGIN_SET_INCOMPATIBLE")]
    PluginSetIncompatible,
    #[serde(rename = "PLUGIN_VERSION_INCOMPATIBLE")]
    PluginVersionIncompatible,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Unknown => "UNKNOWN",
            SyncStatus::Normal => "NORMAL",
            SyncStatus::VersionIncompatible => "KONG_VERSION_INCOMPATIBLE",
            SyncStatus::PluginSetIncompatible => "PLUGIN_SET_INCOMPATIBLE",
            SyncStatus::PluginVersionIncompatible => "PLUGIN_VERSION_INCOMPATIBLE",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
