//! Version and configuration compatibility evaluation
//!
//! Two evaluations with different severities: the version check runs once at
//! handshake and may reject the peer outright; the configuration check runs
//! before each push and only ever suppresses that push. Both are pure.
//! Observations come back as structured notes so the session layer decides
//! how to log them.

use crate::plugin::{ConfiguredPlugins, PluginInventory};
use crate::status::SyncStatus;
use crate::version::Version;

/// Severity of a non-fatal compatibility observation.
///
/// `Notice` has no direct `tracing` level and renders at info.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum NoteLevel {
    Debug,
    Info,
    Notice,
    Warn,
}

/// A non-fatal observation from a compatibility evaluation.
#[derive(Clone, Debug)]
pub struct CompatNote {
    pub level: NoteLevel,
    pub message: String,
}

/// A fatal compatibility verdict.
#[derive(Clone, Debug)]
pub struct Incompatibility {
    pub status: SyncStatus,
    pub reason: String,
}

/// Outcome of the handshake-time version evaluation.
#[derive(Clone, Debug, Default)]
pub struct VersionReport {
    pub fatal: Option<Incompatibility>,
    pub notes: Vec<CompatNote>,
}

impl VersionReport {
    fn fatal(status: SyncStatus, reason: String) -> Self {
        Self {
            fatal: Some(Incompatibility { status, reason }),
            notes: Vec::new(),
        }
    }

    pub fn is_compatible(&self) -> bool {
        self.fatal.is_none()
    }
}

/// Log level for a gateway minor-version distance. No note at distance 0.
fn gateway_minor_level(distance: u64) -> Option<NoteLevel> {
    match distance {
        0 => None,
        1 => Some(NoteLevel::Debug),
        2 => Some(NoteLevel::Info),
        3 => Some(NoteLevel::Notice),
        _ => Some(NoteLevel::Warn),
    }
}

/// Log level for a plugin minor-version distance. No note at distance 0.
fn plugin_minor_level(distance: u64) -> Option<NoteLevel> {
    match distance {
        0 => None,
        1 => Some(NoteLevel::Debug),
        2 => Some(NoteLevel::Info),
        _ => Some(NoteLevel::Notice),
    }
}

/// Handshake-time version check.
///
/// Fatal on an unparsable version or a major mismatch; minor drift and
/// plugin inventory differences only produce notes.
pub fn evaluate_versions(
    cp_version: &str,
    dp_version: &str,
    cp_inventory: &PluginInventory,
    dp_inventory: &PluginInventory,
) -> VersionReport {
    let cp: Version = match cp_version.parse() {
        Ok(v) => v,
        Err(_) => {
            return VersionReport::fatal(
                SyncStatus::VersionIncompatible,
                format!("unable to parse control plane version {cp_version:?}"),
            )
        }
    };
    let dp: Version = match dp_version.parse() {
        Ok(v) => v,
        Err(_) => {
            return VersionReport::fatal(
                SyncStatus::VersionIncompatible,
                format!("unable to parse data plane version {dp_version:?}"),
            )
        }
    };

    if cp.major != dp.major {
        return VersionReport::fatal(
            SyncStatus::VersionIncompatible,
            format!("data plane version {dp} is incompatible with control plane version {cp}"),
        );
    }

    let mut report = VersionReport::default();

    if let Some(level) = gateway_minor_level(cp.minor_distance(&dp)) {
        report.notes.push(CompatNote {
            level,
            message: format!(
                "data plane minor version {dp} differs from control plane minor version {cp}"
            ),
        });
    }

    for (name, cp_plugin) in cp_inventory {
        let Some(dp_plugin) = dp_inventory.get(name) else {
            report.notes.push(CompatNote {
                level: NoteLevel::Warn,
                message: format!("plugin {name} is missing from the data plane"),
            });
            continue;
        };

        match (cp_plugin.version, dp_plugin.version) {
            (Some(cp_v), Some(dp_v)) => {
                if cp_v.major != dp_v.major {
                    report.notes.push(CompatNote {
                        level: NoteLevel::Warn,
                        message: format!(
                            "data plane plugin {name} version {dp_v} differs from \
                             control plane version {cp_v}"
                        ),
                    });
                } else if let Some(level) = plugin_minor_level(cp_v.minor_distance(&dp_v)) {
                    report.notes.push(CompatNote {
                        level,
                        message: format!(
                            "data plane plugin {name} minor version {dp_v} differs from \
                             control plane version {cp_v}"
                        ),
                    });
                }
            }
            _ => {
                report.notes.push(CompatNote {
                    level: NoteLevel::Notice,
                    message: format!("plugin {name} has no version on one side of the channel"),
                });
            }
        }
    }

    report
}

/// Pre-push configuration check over the configured-plugin set.
///
/// Unlike [`evaluate_versions`], a failure here never closes an established
/// connection; the caller suppresses the push and the peer keeps pinging.
pub fn evaluate_configured(
    configured: &ConfiguredPlugins,
    cp_inventory: &PluginInventory,
    dp_inventory: &PluginInventory,
) -> Result<(), Incompatibility> {
    for name in configured {
        let Some(dp_plugin) = dp_inventory.get(name) else {
            return Err(Incompatibility {
                status: SyncStatus::PluginSetIncompatible,
                reason: format!("configured plugin {name} is missing from the data plane"),
            });
        };

        if let (Some(cp_v), Some(dp_v)) = (
            cp_inventory.get(name).and_then(|p| p.version),
            dp_plugin.version,
        ) {
            if cp_v.major != dp_v.major {
                return Err(Incompatibility {
                    status: SyncStatus::PluginVersionIncompatible,
                    reason: format!(
                        "configured plugin {name} version {dp_v} on the data plane is \
                         incompatible with control plane version {cp_v}"
                    ),
                });
            }
        }
    }

    Ok(())
}
