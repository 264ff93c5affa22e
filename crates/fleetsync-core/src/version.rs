//! Dotted gateway version tuples

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// A `major.minor.patch` version. Only major and minor participate in
/// compatibility decisions; anything after the third component is ignored.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Version {
    pub major: u64,
    pub minor: u64,
    pub patch: u64,
}

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Absolute distance between the minor components.
    pub fn minor_distance(&self, other: &Version) -> u64 {
        self.minor.abs_diff(other.minor)
    }
}

impl FromStr for Version {
    type Err = Error;

    /// Parse a dotted version string. `major.minor` must both be numeric;
    /// a missing or non-numeric patch component defaults to 0.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.trim().split('.');
        let major = parts.next().and_then(|p| p.parse().ok());
        let minor = parts.next().and_then(|p| p.parse().ok());
        match (major, minor) {
            (Some(major), Some(minor)) => {
                let patch = parts.next().and_then(|p| p.parse().ok()).unwrap_or(0);
                Ok(Self {
                    major,
                    minor,
                    patch,
                })
            }
            _ => Err(Error::InvalidVersion(s.to_string())),
        }
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}
