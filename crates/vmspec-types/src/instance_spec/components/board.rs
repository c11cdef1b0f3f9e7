// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Machine-level components: the machine type, firmware, CPUs and memory.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::backends::StorageBackend;
use super::devices::DeviceNode;

/// The transport virtio devices use on a given machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum VirtioTransport {
    Pci,
    Ccw,
    Mmio,
}

impl VirtioTransport {
    /// The suffix QEMU appends to a virtio device's base name for this
    /// transport, e.g. `virtio-blk` + `pci`.
    pub fn suffix(&self) -> &'static str {
        match self {
            VirtioTransport::Pci => "pci",
            VirtioTransport::Ccw => "ccw",
            VirtioTransport::Mmio => "device",
        }
    }

    pub fn driver(&self, base: &str) -> String {
        format!("{base}-{}", self.suffix())
    }
}

/// A family of machine types that share a bus layout.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, rename_all = "snake_case", tag = "type")]
pub enum MachineFamily {
    /// Intel 440FX with a flat PCI bus.
    I440fx,
    /// Intel Q35 with a PCI Express root complex.
    Q35,
    /// The Arm `virt` board, either with a PCIe host bridge or with virtio
    /// MMIO transports only.
    ArmVirt { mmio: bool },
    Pseries,
    S390Ccw,
    Microvm,
}

impl MachineFamily {
    pub fn is_x86(&self) -> bool {
        matches!(
            self,
            MachineFamily::I440fx | MachineFamily::Q35 | MachineFamily::Microvm
        )
    }

    pub fn is_mmio_only(&self) -> bool {
        matches!(
            self,
            MachineFamily::Microvm | MachineFamily::ArmVirt { mmio: true }
        )
    }

    pub fn is_express(&self) -> bool {
        matches!(
            self,
            MachineFamily::Q35 | MachineFamily::ArmVirt { mmio: false }
        )
    }

    pub fn virtio_transport(&self) -> VirtioTransport {
        match self {
            MachineFamily::S390Ccw => VirtioTransport::Ccw,
            f if f.is_mmio_only() => VirtioTransport::Mmio,
            _ => VirtioTransport::Pci,
        }
    }
}

/// The legacy `-mem-path` machine flags used when a hypervisor cannot take a
/// memory backend object as machine memory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct LegacyMemPath {
    pub path: String,
    pub prealloc: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Machine {
    /// The machine type passed to the hypervisor, e.g. `pc-q35-8.2` or `virt`.
    pub machine_type: String,

    pub family: MachineFamily,

    /// The accelerator, e.g. `kvm` or `tcg`.
    pub accel: String,

    /// The ID of the memory backend object that provides guest RAM.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_backend: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub legacy_mem_path: Option<LegacyMemPath>,

    /// Set when the machine hosts NVDIMM devices.
    pub nvdimm: bool,

    /// Set when the firmware requires system management mode (secure boot).
    pub smm: bool,

    /// Block node names of the UEFI code and variable stores, when flash
    /// images are attached as storage nodes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pflash0: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pflash1: Option<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

/// A firmware flash image (UEFI code or variables).
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FlashImage {
    pub path: String,
    pub backend: StorageBackend,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, rename_all = "snake_case", tag = "type")]
pub enum Firmware {
    /// Legacy BIOS, optionally loaded from a specific image.
    Bios {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
    },
    /// UEFI with separate code and variable flash images.
    Uefi { code: FlashImage, vars: FlashImage, secure_boot: bool },
    /// Firmware built into the hypervisor for this machine family (SLOF,
    /// the s390 IPL loader, qboot).
    Builtin { name: String },
}

/// One `+flag` or `-flag` entry in a CPU model specification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct CpuFlag {
    pub name: String,
    pub enabled: bool,
}

/// A fully-solved CPU topology.
///
/// Dimensions the target hypervisor does not support are `None` and are
/// treated as 1.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(deny_unknown_fields)]
pub struct CpuTopology {
    /// Logical CPUs present at boot.
    pub smp: u32,

    /// The maximum number of logical CPUs, including hot-pluggable ones.
    pub maxcpus: u32,

    pub sockets: u32,
    pub cores: u32,
    pub threads: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dies: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clusters: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub books: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drawers: Option<u32>,
}

impl CpuTopology {
    /// The product of every dimension, which equals `maxcpus` in a solved
    /// topology.
    pub fn product(&self) -> u64 {
        [
            Some(self.sockets),
            Some(self.cores),
            Some(self.threads),
            self.dies,
            self.clusters,
            self.books,
            self.drawers,
        ]
        .into_iter()
        .map(|d| u64::from(d.unwrap_or(1)))
        .product()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Cpu {
    pub model: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub flags: Vec<CpuFlag>,

    pub topology: CpuTopology,

    /// IDs of CPU devices reserved for hot-plug after boot.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hotplug_devices: Vec<String>,
}

/// The flavor of a memory backend object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, tag = "type")]
pub enum MemoryBackendKind {
    #[serde(rename = "memory-backend-ram")]
    Ram,
    #[serde(rename = "memory-backend-file")]
    File { mem_path: String, pmem: bool },
    #[serde(rename = "memory-backend-memfd")]
    Memfd { hugetlb: bool },
}

impl MemoryBackendKind {
    pub fn object_type(&self) -> &'static str {
        match self {
            MemoryBackendKind::Ram => "memory-backend-ram",
            MemoryBackendKind::File { .. } => "memory-backend-file",
            MemoryBackendKind::Memfd { .. } => "memory-backend-memfd",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MemoryBackend {
    pub id: String,
    pub size_mib: u64,
    pub kind: MemoryBackendKind,
    pub share: bool,
    pub prealloc: bool,
}

/// A memory device plugged next to the machine's base memory.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MemoryDevice {
    pub name: String,
    pub backend: MemoryBackend,
    pub device: DeviceNode,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Memory {
    pub size_mib: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maxmem_mib: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slots: Option<u32>,

    /// The backend providing base memory, if one was requested.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<MemoryBackend>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub devices: Vec<MemoryDevice>,
}
