// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bus identifiers and the coordinates devices occupy on them.

use std::fmt::Display;
use std::str::FromStr;

use schemars::JsonSchema;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

pub const PCI_SLOTS_PER_BUS: u8 = 32;
pub const PCI_FUNCTIONS_PER_SLOT: u8 = 8;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("PCI slot {0:#x} outside range of 0-{max:#x}", max = PCI_SLOTS_PER_BUS - 1)]
    SlotOutOfRange(u8),

    #[error("PCI function {0} outside range of 0-{max}", max = PCI_FUNCTIONS_PER_SLOT - 1)]
    FunctionOutOfRange(u8),

    #[error("failed to parse PCI address {0:?}")]
    Malformed(String),
}

/// A PCI slot/function pair on some bus. Supports conversion from a string
/// formatted as `slot[.function]` with a hexadecimal slot, e.g. `0x1f.2` or
/// `3`.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, JsonSchema,
)]
pub struct PciAddress {
    slot: u8,
    function: u8,
}

impl PciAddress {
    pub fn new(slot: u8, function: u8) -> Result<Self, AddressParseError> {
        if slot >= PCI_SLOTS_PER_BUS {
            return Err(AddressParseError::SlotOutOfRange(slot));
        }

        if function >= PCI_FUNCTIONS_PER_SLOT {
            return Err(AddressParseError::FunctionOutOfRange(function));
        }

        Ok(Self { slot, function })
    }

    #[inline]
    pub fn slot(&self) -> u8 {
        self.slot
    }

    #[inline]
    pub fn function(&self) -> u8 {
        self.function
    }
}

impl FromStr for PciAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || AddressParseError::Malformed(s.to_owned());
        let (slot, function) = match s.split_once('.') {
            Some((slot, function)) => (slot, Some(function)),
            None => (s, None),
        };

        let slot = slot.trim();
        let slot = slot
            .strip_prefix("0x")
            .or_else(|| slot.strip_prefix("0X"))
            .unwrap_or(slot);
        let slot = u8::from_str_radix(slot, 16).map_err(|_| malformed())?;
        let function = match function {
            Some(f) => f.trim().parse::<u8>().map_err(|_| malformed())?,
            None => 0,
        };

        Self::new(slot, function)
    }
}

impl Display for PciAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#04x}.{}", self.slot, self.function)
    }
}

impl Serialize for PciAddress {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(format!("{}", self).as_str())
    }
}

impl<'d> Deserialize<'d> for PciAddress {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'d>,
    {
        let s = String::deserialize(deserializer)?;
        FromStr::from_str(&s).map_err(de::Error::custom)
    }
}

/// The name of a bus, e.g. `pcie.0` or `virtio_scsi_pci0.0`.
#[derive(
    Clone,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
#[serde(transparent)]
pub struct BusId(String);

impl BusId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BusId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The family of a bus, which determines the shape of its address space.
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
    JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum BusKind {
    /// A conventional PCI root bus.
    PciRoot,
    /// A PCI Express root complex.
    PcieRoot,
    /// The single-slot downstream bus of a PCIe root port.
    PcieRootPort,
    /// The conventional PCI bus behind a PCI-PCI bridge.
    PciBridge,
    /// The conventional PCI bus behind a PCIe-to-PCI bridge.
    PciePciBridge,
    /// The s390 channel subsystem.
    Ccw,
    /// Virtio MMIO transports on machines without PCI.
    VirtioMmio,
    Scsi,
    Ide,
    Usb,
    Floppy,
    IsaSerial,
    VirtioSerial,
}

impl BusKind {
    /// Returns true for buses whose coordinates are PCI slots.
    pub fn is_pci(&self) -> bool {
        matches!(
            self,
            BusKind::PciRoot
                | BusKind::PcieRoot
                | BusKind::PcieRootPort
                | BusKind::PciBridge
                | BusKind::PciePciBridge
        )
    }
}

/// A position on a bus.
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
    JsonSchema,
)]
#[serde(deny_unknown_fields, rename_all = "snake_case", tag = "type")]
pub enum Coordinate {
    Pci { addr: PciAddress },
    /// A CCW device number in the `fe.0.xxxx` subchannel set.
    Ccw { devno: u16 },
    Mmio { transport: u8 },
    Scsi { target: u16, lun: u16 },
    Unit { unit: u8 },
    Port { port: u8 },
}

impl Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Coordinate::Pci { addr } => write!(f, "addr {addr}"),
            Coordinate::Ccw { devno } => write!(f, "devno fe.0.{devno:04x}"),
            Coordinate::Mmio { transport } => {
                write!(f, "transport {transport}")
            }
            Coordinate::Scsi { target, lun } => {
                write!(f, "scsi-id {target} lun {lun}")
            }
            Coordinate::Unit { unit } => write!(f, "unit {unit}"),
            Coordinate::Port { port } => write!(f, "port {port}"),
        }
    }
}

/// Where a device sits: the bus it is attached to and its coordinate there.
#[derive(
    Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(deny_unknown_fields)]
pub struct Placement {
    pub bus: BusId,
    pub coordinate: Coordinate,
}

impl Display for Placement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.bus, self.coordinate)
    }
}

/// A bus exposed by the machine or by one of its controllers.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Bus {
    pub id: BusId,
    pub kind: BusKind,

    /// The number of distinct coordinates devices can occupy on this bus.
    pub capacity: u32,

    /// The controller providing this bus; `None` for buses built into the
    /// machine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub controller: Option<String>,
}
