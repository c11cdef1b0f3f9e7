// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Questions about what the target hypervisor build supports.

use std::collections::BTreeSet;
use std::fmt::Display;
use std::str::FromStr;

use semver::Version;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use thiserror::Error;

mod probe;

pub use probe::{CommandProbe, ProbeBackend, QemuProbe, Query};

#[cfg(test)]
pub use probe::MockProbeBackend;

/// A feature whose presence changes the shape of the compiled spec.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumIter,
)]
pub enum Capability {
    /// Layered block nodes (`-blockdev`).
    Blockdev,
    /// A bare protocol node can be attached to a device without a format
    /// node on top.
    RawProtocolAttach,
    /// `-machine memory-backend=`.
    MachineMemoryBackend,
    SmpDies,
    SmpClusters,
    SmpBooks,
    SmpDrawers,
    /// The topology solver prefers cores over sockets.
    SmpPreferCores,
    PcieRootPort,
    PciePciBridge,
}

/// How the presence of a capability is determined.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Gate {
    /// The `--help` text mentions this option.
    HelpText(&'static str),
    /// The hypervisor version lies in this interval.
    Version(&'static str),
    /// The hypervisor lists this device model.
    Device(&'static str),
}

impl Capability {
    pub fn gate(&self) -> Gate {
        match self {
            Capability::Blockdev => Gate::HelpText("-blockdev"),
            Capability::RawProtocolAttach => Gate::Version("[4.2.0, )"),
            Capability::MachineMemoryBackend => Gate::Version("[5.0.0, )"),
            Capability::SmpDies => Gate::Version("[4.1.0, )"),
            Capability::SmpClusters => Gate::Version("[7.0.0, )"),
            Capability::SmpBooks | Capability::SmpDrawers => {
                Gate::Version("[8.2.0, )")
            }
            Capability::SmpPreferCores => Gate::Version("[6.2.0, )"),
            Capability::PcieRootPort => Gate::Device("pcie-root-port"),
            Capability::PciePciBridge => Gate::Device("pcie-pci-bridge"),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum VersionParseError {
    #[error("malformed version interval {0:?}")]
    MalformedInterval(String),

    #[error("malformed version {0:?}")]
    MalformedVersion(String),
}

/// Parses a version, padding two-component versions such as `6.2` to
/// `6.2.0`.
pub fn parse_version(raw: &str) -> Result<Version, VersionParseError> {
    let raw = raw.trim();
    let padded = match raw.split('.').count() {
        1 => format!("{raw}.0.0"),
        2 => format!("{raw}.0"),
        _ => raw.to_owned(),
    };
    Version::parse(&padded)
        .map_err(|_| VersionParseError::MalformedVersion(raw.to_owned()))
}

#[derive(Clone, Debug, PartialEq, Eq)]
struct Bound {
    version: Version,
    inclusive: bool,
}

/// A range of versions written as `[4.1.0, )`, `(, 6.2.0)` or
/// `[2.12.0, 8.0.0]`. Brackets are inclusive, parentheses exclusive and an
/// empty side is unbounded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VersionInterval {
    lower: Option<Bound>,
    upper: Option<Bound>,
}

impl VersionInterval {
    pub fn contains(&self, version: &Version) -> bool {
        let above = match &self.lower {
            None => true,
            Some(b) if b.inclusive => *version >= b.version,
            Some(b) => *version > b.version,
        };
        let below = match &self.upper {
            None => true,
            Some(b) if b.inclusive => *version <= b.version,
            Some(b) => *version < b.version,
        };
        above && below
    }
}

impl FromStr for VersionInterval {
    type Err = VersionParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || VersionParseError::MalformedInterval(s.to_owned());
        let s = s.trim();
        let mut chars = s.chars();
        let lower_inclusive = match chars.next() {
            Some('[') => true,
            Some('(') => false,
            _ => return Err(malformed()),
        };
        let upper_inclusive = match chars.next_back() {
            Some(']') => true,
            Some(')') => false,
            _ => return Err(malformed()),
        };

        let (lower, upper) =
            chars.as_str().split_once(',').ok_or_else(malformed)?;
        let bound = |raw: &str, inclusive| -> Result<_, VersionParseError> {
            let raw = raw.trim();
            if raw.is_empty() {
                Ok(None)
            } else {
                Ok(Some(Bound { version: parse_version(raw)?, inclusive }))
            }
        };

        Ok(Self {
            lower: bound(lower, lower_inclusive)?,
            upper: bound(upper, upper_inclusive)?,
        })
    }
}

impl Display for VersionInterval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.lower {
            Some(b) => {
                let open = if b.inclusive { '[' } else { '(' };
                write!(f, "{open}{}, ", b.version)?
            }
            None => f.write_str("(, ")?,
        }
        match &self.upper {
            Some(b) => {
                let close = if b.inclusive { ']' } else { ')' };
                write!(f, "{}{close}", b.version)
            }
            None => f.write_str(")"),
        }
    }
}

/// Answers questions about the target hypervisor.
pub trait CapabilityOracle {
    fn probe(&self, capability: Capability) -> bool;

    fn probe_version_interval(&self, interval: &VersionInterval) -> bool;

    fn has_device(&self, name: &str) -> bool;

    fn has_object(&self, name: &str) -> bool;

    fn version(&self) -> Option<Version>;
}

/// Evaluates a version gate against an optional version. An unknown version
/// satisfies no interval.
pub(crate) fn version_gate(
    version: Option<&Version>,
    interval: &VersionInterval,
) -> bool {
    version.is_some_and(|v| interval.contains(v))
}

/// Parses one of the interval literals in [`Capability::gate`].
pub(crate) fn gate_interval(raw: &'static str) -> Option<VersionInterval> {
    raw.parse().ok()
}

/// A static snapshot of a hypervisor's capabilities.
///
/// Flags named in `flags` are always present. Version- and device-gated
/// capabilities are additionally derived from `version` and `devices`, so a
/// snapshot only needs to list the flags it cannot derive.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CapabilitySet {
    #[serde(default)]
    pub version: Option<Version>,

    #[serde(default)]
    pub flags: BTreeSet<Capability>,

    #[serde(default)]
    pub devices: BTreeSet<String>,

    #[serde(default)]
    pub objects: BTreeSet<String>,
}

impl CapabilitySet {
    pub fn new(version: Version) -> Self {
        Self { version: Some(version), ..Default::default() }
    }

    pub fn with_flag(mut self, capability: Capability) -> Self {
        self.flags.insert(capability);
        self
    }

    pub fn with_devices<I, S>(mut self, devices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.devices.extend(devices.into_iter().map(Into::into));
        self
    }

    pub fn with_objects<I, S>(mut self, objects: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.objects.extend(objects.into_iter().map(Into::into));
        self
    }

    /// Captures every answer `oracle` gives for the capabilities and names
    /// it is asked about.
    pub fn snapshot<'a>(
        oracle: &dyn CapabilityOracle,
        devices: impl IntoIterator<Item = &'a str>,
        objects: impl IntoIterator<Item = &'a str>,
    ) -> Self {
        Self {
            version: oracle.version(),
            flags: Capability::iter().filter(|c| oracle.probe(*c)).collect(),
            devices: devices
                .into_iter()
                .filter(|d| oracle.has_device(d))
                .map(str::to_owned)
                .collect(),
            objects: objects
                .into_iter()
                .filter(|o| oracle.has_object(o))
                .map(str::to_owned)
                .collect(),
        }
    }

    pub fn from_toml_str(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }
}

impl CapabilityOracle for CapabilitySet {
    fn probe(&self, capability: Capability) -> bool {
        if self.flags.contains(&capability) {
            return true;
        }

        match capability.gate() {
            Gate::HelpText(_) => false,
            Gate::Version(raw) => gate_interval(raw)
                .is_some_and(|i| version_gate(self.version.as_ref(), &i)),
            Gate::Device(name) => self.has_device(name),
        }
    }

    fn probe_version_interval(&self, interval: &VersionInterval) -> bool {
        version_gate(self.version.as_ref(), interval)
    }

    fn has_device(&self, name: &str) -> bool {
        self.devices.contains(name)
    }

    fn has_object(&self, name: &str) -> bool {
        self.objects.contains(name)
    }

    fn version(&self) -> Option<Version> {
        self.version.clone()
    }
}
