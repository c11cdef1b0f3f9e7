// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Device front ends and the controllers that provide buses for them.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::address::{BusId, Placement};

/// A device visible to the guest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DeviceNode {
    pub id: String,

    /// The hypervisor driver name, e.g. `virtio-blk-pci`.
    pub driver: String,

    /// The bus and coordinate the device occupies. Devices built into the
    /// machine (or with no bus, such as `isa-debugcon`) have none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<Placement>,

    pub props: DeviceProps,

    /// Driver properties with no typed counterpart, passed through verbatim.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DiskProps {
    /// The node name (layered) or drive id (legacy) backing this device.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drive: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootindex: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial: Option<String>,

    pub read_only: bool,
    pub removable: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct NicProps {
    pub netdev: String,
    pub mac: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bootindex: Option<u32>,

    /// Set for multi-queue virtio NICs.
    pub mq: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vectors: Option<u32>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct RngProps {
    pub rng: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub period_ms: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct TpmProps {
    /// The `tpm-emulator` or `tpm-passthrough` backend id.
    pub tpmdev: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SerialProps {
    pub chardev: String,

    /// The port name advertised to the guest by virtio serial ports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct VsockProps {
    pub guest_cid: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct BalloonProps {
    pub deflate_on_oom: bool,
    pub free_page_reporting: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct WatchdogProps {
    /// The action taken when the watchdog fires, e.g. `reset`.
    pub action: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct DimmProps {
    pub memdev: String,
    pub slot: u32,
    pub nvdimm: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct VirtioMemProps {
    pub memdev: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requested_size_mib: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_size_mib: Option<u64>,

    /// Properties MMIO transports do not accept.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prealloc: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dynamic_memslots: Option<bool>,
}

/// Typed properties, one variant per device family.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, rename_all = "snake_case", tag = "kind")]
pub enum DeviceProps {
    Disk(DiskProps),
    Nic(NicProps),
    Rng(RngProps),
    Tpm(TpmProps),
    Serial(SerialProps),
    Vsock(VsockProps),
    Balloon(BalloonProps),
    Watchdog(WatchdogProps),
    Input,
    Sound {
        /// The codec attached to an `intel-hda` controller.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        codec: Option<String>,
    },
    Usb,
    Display,
    Dimm(DimmProps),
    VirtioMem(VirtioMemProps),
}

/// The family of a SCSI host bus adapter.
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
pub enum HbaFamily {
    VirtioScsi,
    Lsi,
}

impl HbaFamily {
    /// The default (targets, luns) address space of one adapter.
    pub fn default_geometry(&self) -> (u16, u16) {
        match self {
            HbaFamily::VirtioScsi => (256, 16384),
            HbaFamily::Lsi => (7, 1),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, rename_all = "snake_case", tag = "type")]
pub enum ControllerKind {
    PcieRootPort { chassis: u8, port: u8 },
    PciePciBridge,
    PciBridge { chassis_nr: u8 },
    ScsiHba { family: HbaFamily, max_targets: u16, max_luns: u16 },
    Ahci,
    Usb { model: String },
    Fdc,
    VirtioSerial { max_ports: u8 },
}

/// A device whose purpose is to provide one or more buses for other devices.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Controller {
    pub id: String,
    pub driver: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<Placement>,

    pub kind: ControllerKind,

    /// The buses this controller exposes.
    pub buses: Vec<BusId>,
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::address::{Coordinate, PciAddress};

    #[test]
    fn device_props_are_tagged_by_kind() {
        let dev = DeviceNode {
            id: "image1".to_owned(),
            driver: "virtio-blk-pci".to_owned(),
            placement: Some(Placement {
                bus: BusId::new("pcie-root-port-0"),
                coordinate: Coordinate::Pci {
                    addr: PciAddress::new(0, 0).unwrap(),
                },
            }),
            props: DeviceProps::Disk(DiskProps {
                drive: Some("drive_image1".to_owned()),
                bootindex: Some(0),
                serial: None,
                read_only: false,
                removable: false,
            }),
            extra: BTreeMap::new(),
        };

        let json = serde_json::to_value(&dev).unwrap();
        assert_eq!(json["props"]["kind"], "disk");
        assert_eq!(json["props"]["drive"], "drive_image1");
        assert!(json.get("extra").is_none());

        let back: DeviceNode = serde_json::from_value(json).unwrap();
        assert_eq!(back, dev);
    }

    #[test]
    fn unit_props_variants() {
        let json = serde_json::to_value(DeviceProps::Input).unwrap();
        assert_eq!(json, serde_json::json!({ "kind": "input" }));
    }
}
