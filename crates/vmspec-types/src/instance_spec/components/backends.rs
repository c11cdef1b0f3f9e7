// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Host-side backends: block node graphs, legacy drives, network backends,
//! character devices and auxiliary objects.

use std::collections::BTreeMap;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// The host page cache policy for a block backend.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum CacheMode {
    Writeback,
    None,
    Writethrough,
    Directsync,
    Unsafe,
}

impl CacheMode {
    pub const ALL: [CacheMode; 5] = [
        CacheMode::Writeback,
        CacheMode::None,
        CacheMode::Writethrough,
        CacheMode::Directsync,
        CacheMode::Unsafe,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            CacheMode::Writeback => "writeback",
            CacheMode::None => "none",
            CacheMode::Writethrough => "writethrough",
            CacheMode::Directsync => "directsync",
            CacheMode::Unsafe => "unsafe",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|mode| mode.name() == name)
    }

    /// Whether host I/O bypasses the page cache (`O_DIRECT`).
    pub fn direct(&self) -> bool {
        matches!(self, CacheMode::None | CacheMode::Directsync)
    }

    /// Whether flush requests from the guest are ignored.
    pub fn no_flush(&self) -> bool {
        matches!(self, CacheMode::Unsafe)
    }

    /// Whether the device advertises a volatile write cache to the guest.
    pub fn write_cache(&self) -> bool {
        !matches!(self, CacheMode::Writethrough | CacheMode::Directsync)
    }

    pub fn node_cache(&self) -> NodeCache {
        NodeCache { direct: self.direct(), no_flush: self.no_flush() }
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Aio {
    Threads,
    Native,
    IoUring,
}

impl Aio {
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "threads" => Some(Aio::Threads),
            "native" => Some(Aio::Native),
            "io_uring" => Some(Aio::IoUring),
            _ => None,
        }
    }
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    Raw,
    Qcow2,
    Qed,
    Luks,
    Vmdk,
    Vdi,
    Vhdx,
    Vpc,
}

impl ImageFormat {
    pub const ALL: [ImageFormat; 8] = [
        ImageFormat::Raw,
        ImageFormat::Qcow2,
        ImageFormat::Qed,
        ImageFormat::Luks,
        ImageFormat::Vmdk,
        ImageFormat::Vdi,
        ImageFormat::Vhdx,
        ImageFormat::Vpc,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ImageFormat::Raw => "raw",
            ImageFormat::Qcow2 => "qcow2",
            ImageFormat::Qed => "qed",
            ImageFormat::Luks => "luks",
            ImageFormat::Vmdk => "vmdk",
            ImageFormat::Vdi => "vdi",
            ImageFormat::Vhdx => "vhdx",
            ImageFormat::Vpc => "vpc",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|fmt| fmt.name() == name)
    }
}

/// Cache flags carried by each block node.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(deny_unknown_fields)]
pub struct NodeCache {
    pub direct: bool,
    pub no_flush: bool,
}

/// The address of a network block server.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, rename_all = "snake_case", tag = "type")]
pub enum ServerAddress {
    Inet {
        host: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        port: Option<u16>,
    },
    Unix { path: String },
}

/// The curl family of read-only network protocols.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum CurlProtocol {
    Http,
    Https,
    Ftp,
    Ftps,
}

impl CurlProtocol {
    pub fn from_scheme(scheme: &str) -> Option<Self> {
        match scheme {
            "http" => Some(CurlProtocol::Http),
            "https" => Some(CurlProtocol::Https),
            "ftp" => Some(CurlProtocol::Ftp),
            "ftps" => Some(CurlProtocol::Ftps),
            _ => None,
        }
    }
}

/// The bottom node of an image's graph, which reaches the actual data.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, rename_all = "snake_case", tag = "driver")]
pub enum ProtocolNode {
    File {
        filename: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        aio: Option<Aio>,
    },
    HostDevice {
        filename: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        aio: Option<Aio>,
    },
    Nbd {
        server: ServerAddress,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        export: Option<String>,
    },
    Iscsi {
        portal: String,
        target: String,
        lun: u32,
    },
    Gluster {
        server: ServerAddress,
        volume: String,
        path: String,
    },
    Rbd {
        pool: String,
        image: String,
    },
    Curl {
        protocol: CurlProtocol,
        url: String,
    },
    Ssh {
        server: ServerAddress,
        path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user: Option<String>,
    },
    /// A fault-injection layer over another protocol node.
    Blkdebug {
        config: String,
        image: String,
    },
}

impl ProtocolNode {
    pub fn driver(&self) -> &'static str {
        match self {
            ProtocolNode::File { .. } => "file",
            ProtocolNode::HostDevice { .. } => "host_device",
            ProtocolNode::Nbd { .. } => "nbd",
            ProtocolNode::Iscsi { .. } => "iscsi",
            ProtocolNode::Gluster { .. } => "gluster",
            ProtocolNode::Rbd { .. } => "rbd",
            ProtocolNode::Curl { protocol, .. } => match protocol {
                CurlProtocol::Http => "http",
                CurlProtocol::Https => "https",
                CurlProtocol::Ftp => "ftp",
                CurlProtocol::Ftps => "ftps",
            },
            ProtocolNode::Ssh { .. } => "ssh",
            ProtocolNode::Blkdebug { .. } => "blkdebug",
        }
    }

    /// The AIO engine, for protocols that do local I/O.
    pub fn aio(&self) -> Option<Aio> {
        match self {
            ProtocolNode::File { aio, .. }
            | ProtocolNode::HostDevice { aio, .. } => *aio,
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct FormatNode {
    pub format: ImageFormat,

    /// The node this format driver reads from.
    pub file: String,

    /// The secret object that unlocks an encrypted image.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_secret: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, rename_all = "snake_case", tag = "driver")]
pub enum FilterNode {
    CopyOnRead { file: String },
    Throttle { file: String, throttle_group: String },
}

impl FilterNode {
    pub fn file(&self) -> &str {
        match self {
            FilterNode::CopyOnRead { file }
            | FilterNode::Throttle { file, .. } => file,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, rename_all = "snake_case", tag = "layer")]
pub enum StorageNodeKind {
    Protocol { protocol: ProtocolNode },
    Format(FormatNode),
    Filter { filter: FilterNode },
}

/// One node of a layered block graph.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct StorageNode {
    pub node_name: String,
    pub read_only: bool,
    pub cache: NodeCache,
    pub kind: StorageNodeKind,
}

impl StorageNode {
    /// The node this one reads from, if any.
    pub fn child(&self) -> Option<&str> {
        match &self.kind {
            StorageNodeKind::Protocol {
                protocol: ProtocolNode::Blkdebug { image, .. },
            } => Some(image),
            StorageNodeKind::Protocol { .. } => None,
            StorageNodeKind::Format(format) => Some(&format.file),
            StorageNodeKind::Filter { filter } => Some(filter.file()),
        }
    }
}

/// How a legacy drive is exposed before a front-end device claims it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, rename_all = "snake_case", tag = "if")]
pub enum DriveInterface {
    /// Claimed by a `-device` front end.
    None,
    Pflash { unit: u8 },
}

/// A flat drive record for hypervisors without layered block nodes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct LegacyDrive {
    pub id: String,

    /// The image locator as the hypervisor accepts it.
    pub file: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<ImageFormat>,

    pub interface: DriveInterface,
    pub cache: CacheMode,
    pub read_only: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aio: Option<Aio>,

    pub copy_on_read: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttling_group: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_secret: Option<String>,
}

/// The host side of one image.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, rename_all = "snake_case", tag = "mode")]
pub enum StorageBackend {
    /// Nodes in bottom-up order; the last node is attached to the device.
    Layered { nodes: Vec<StorageNode>, cache: CacheMode },
    Legacy { drive: LegacyDrive },
    /// A removable drive with no medium inserted.
    Empty,
}

impl StorageBackend {
    /// The name the front end references: the top node or the drive id.
    pub fn top(&self) -> Option<&str> {
        match self {
            StorageBackend::Layered { nodes, .. } => {
                nodes.last().map(|n| n.node_name.as_str())
            }
            StorageBackend::Legacy { drive } => Some(&drive.id),
            StorageBackend::Empty => None,
        }
    }

    pub fn cache(&self) -> Option<CacheMode> {
        match self {
            StorageBackend::Layered { cache, .. } => Some(*cache),
            StorageBackend::Legacy { drive } => Some(drive.cache),
            StorageBackend::Empty => None,
        }
    }

    /// A layered image is read-only when any node of its chain is.
    pub fn read_only(&self) -> bool {
        match self {
            StorageBackend::Layered { nodes, .. } => {
                nodes.iter().any(|n| n.read_only)
            }
            StorageBackend::Legacy { drive } => drive.read_only,
            StorageBackend::Empty => true,
        }
    }

    pub fn aio(&self) -> Option<Aio> {
        match self {
            StorageBackend::Layered { nodes, .. } => {
                nodes.iter().find_map(|node| match &node.kind {
                    StorageNodeKind::Protocol { protocol } => protocol.aio(),
                    _ => None,
                })
            }
            StorageBackend::Legacy { drive } => drive.aio,
            StorageBackend::Empty => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, rename_all = "snake_case", tag = "type")]
pub enum NetdevBackend {
    User,
    Tap {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ifname: Option<String>,
        vhost: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        queues: Option<u32>,
    },
    Bridge { br: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Netdev {
    pub id: String,
    pub backend: NetdevBackend,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, rename_all = "snake_case", tag = "backend")]
pub enum ChardevBackend {
    UnixSocket { path: String, server: bool, wait: bool },
    TcpSocket { host: String, port: u16, server: bool, wait: bool },
    File { path: String },
    Pty,
    Null,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Chardev {
    pub id: String,
    pub backend: ChardevBackend,
}

#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum MonitorProtocol {
    Qmp,
    Hmp,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Monitor {
    pub name: String,
    pub protocol: MonitorProtocol,
    pub chardev: String,
}

/// I/O limits for a throttle group. Keys with no typed field are kept in
/// `extra`.
#[derive(
    Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "kebab-case")]
pub struct ThrottleLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops_total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops_read: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iops_write: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bps_total: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bps_read: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bps_write: Option<u64>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, String>,
}

/// A `secret` object. The data is redacted from debug output.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct SecretObject {
    pub data: String,
    pub format: String,
}

impl std::fmt::Debug for SecretObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretObject")
            .field("data", &"<redacted>")
            .field("format", &self.format)
            .finish()
    }
}

/// A user-creatable object referenced by devices or backends.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields, tag = "qom_type")]
pub enum ObjectKind {
    #[serde(rename = "secret")]
    Secret(SecretObject),
    #[serde(rename = "throttle-group")]
    ThrottleGroup { limits: ThrottleLimits },
    #[serde(rename = "rng-random")]
    RngRandom { filename: String },
    #[serde(rename = "rng-builtin")]
    RngBuiltin,
    #[serde(rename = "rng-egd")]
    RngEgd { chardev: String },
    #[serde(rename = "tpm-emulator")]
    TpmEmulator { chardev: String },
    #[serde(rename = "tpm-passthrough")]
    TpmPassthrough { path: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ObjectSpec {
    pub id: String,
    pub kind: ObjectKind,
}

#[cfg(test)]
mod test {
    use super::*;

    /// Every cache mode is distinguished by its three component flags.
    fn from_parts(
        direct: bool,
        no_flush: bool,
        write_cache: bool,
    ) -> Option<CacheMode> {
        CacheMode::ALL.into_iter().find(|mode| {
            mode.direct() == direct
                && mode.no_flush() == no_flush
                && mode.write_cache() == write_cache
        })
    }

    #[test]
    fn cache_mode_table() {
        const TABLE: &[(CacheMode, bool, bool, bool)] = &[
            (CacheMode::Writeback, false, false, true),
            (CacheMode::None, true, false, true),
            (CacheMode::Writethrough, false, false, false),
            (CacheMode::Directsync, true, false, false),
            (CacheMode::Unsafe, false, true, true),
        ];

        for &(mode, direct, no_flush, write_cache) in TABLE {
            assert_eq!(mode.direct(), direct, "{mode:?}");
            assert_eq!(mode.no_flush(), no_flush, "{mode:?}");
            assert_eq!(mode.write_cache(), write_cache, "{mode:?}");
            assert_eq!(from_parts(direct, no_flush, write_cache), Some(mode));
            assert_eq!(CacheMode::from_name(mode.name()), Some(mode));
        }

        assert_eq!(from_parts(true, true, true), None);
    }

    #[test]
    fn secret_debug_is_redacted() {
        let secret = SecretObject {
            data: "hunter2".to_owned(),
            format: "raw".to_owned(),
        };
        let dbg = format!("{secret:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("redacted"));
    }

    #[test]
    fn throttle_limits_keep_unknown_keys() {
        let limits: ThrottleLimits = serde_json::from_str(
            r#"{"iops-total": 100, "bps-read": 4096, "iops-size": "4096"}"#,
        )
        .unwrap();
        assert_eq!(limits.iops_total, Some(100));
        assert_eq!(limits.bps_read, Some(4096));
        assert_eq!(
            limits.extra.get("iops-size").map(String::as_str),
            Some("4096")
        );
    }

    #[test]
    fn storage_node_children() {
        let format = StorageNode {
            node_name: "drive_image1".to_owned(),
            read_only: false,
            cache: CacheMode::None.node_cache(),
            kind: StorageNodeKind::Format(FormatNode {
                format: ImageFormat::Qcow2,
                file: "file_image1".to_owned(),
                key_secret: None,
            }),
        };
        assert_eq!(format.child(), Some("file_image1"));

        let json = serde_json::to_value(&format).unwrap();
        assert_eq!(json["kind"]["layer"], "format");
        assert_eq!(json["kind"]["format"], "qcow2");
    }
}
