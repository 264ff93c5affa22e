//! Plugin descriptors and inventories

use std::collections::{BTreeMap, BTreeSet};

use crate::error::Error;
use crate::version::Version;

/// A plugin known to one side of the channel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PluginDescriptor {
    pub name: String,
    pub version: Option<Version>,
}

impl PluginDescriptor {
    pub fn new(name: impl Into<String>, version: Option<Version>) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }

    /// Parse an inventory entry of the form `name` or `name@1.2.3`.
    pub fn parse_spec(spec: &str) -> Result<Self, Error> {
        match spec.split_once('@') {
            Some((name, version)) if !name.is_empty() => Ok(Self {
                name: name.to_string(),
                version: Some(version.parse()?),
            }),
            Some(_) => Err(Error::InvalidPluginSpec(spec.to_string())),
            None if !spec.is_empty() => Ok(Self {
                name: spec.to_string(),
                version: None,
            }),
            None => Err(Error::InvalidPluginSpec(spec.to_string())),
        }
    }
}

/// Plugins known to one side, keyed by name.
pub type PluginInventory = BTreeMap<String, PluginDescriptor>;

/// Names of the plugins referenced by the current configuration.
pub type ConfiguredPlugins = BTreeSet<String>;

/// Build an inventory from descriptors. A later duplicate name wins.
pub fn inventory_from(
    descriptors: impl IntoIterator<Item = PluginDescriptor>,
) -> PluginInventory {
    descriptors
        .into_iter()
        .map(|d| (d.name.clone(), d))
        .collect()
}
