// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Storage backends for disks, optical media and floppies.
//!
//! When the hypervisor accepts `-blockdev`, each image becomes a chain of
//! nodes built bottom-up: a protocol node that reaches the data, an optional
//! format node that interprets it, and optional filter nodes on top. The
//! front-end device names the topmost node. Older hypervisors get one flat
//! `-drive` record carrying the same cache, read-only and AIO settings.

mod locator;

pub use locator::{classify, Locator, StorageClassificationError};

use std::collections::BTreeMap;

use slog::{debug, info, Logger};
use vmspec_params::{ParamError, ParameterSet};
use vmspec_types::instance_spec::components::backends::{
    Aio, CacheMode, DriveInterface, FilterNode, FormatNode, ImageFormat,
    LegacyDrive, NodeCache, ObjectKind, ObjectSpec, ProtocolNode,
    SecretObject, StorageBackend, StorageNode, StorageNodeKind,
    ThrottleLimits,
};
use vmspec_types::instance_spec::components::board::MachineFamily;
use vmspec_types::instance_spec::components::devices::{
    DeviceNode, DeviceProps, DiskProps, HbaFamily,
};
use vmspec_types::instance_spec::Media;

use crate::bus::{BusRequest, DeviceRequest, PciKind};
use crate::capability::Capability;
use crate::devices::UnplacedDevice;
use crate::error::{CompileError, UnsupportedDeviceError};
use crate::machine::Target;

/// A disk whose front end has not been placed on a bus yet.
#[derive(Clone, Debug)]
pub struct UnplacedDisk {
    pub name: String,
    pub media: Media,
    pub backend: StorageBackend,
    pub device: UnplacedDevice,
}

/// Everything the storage builder produces for one instance.
#[derive(Clone, Debug, Default)]
pub struct StoragePlan {
    pub disks: Vec<UnplacedDisk>,
    /// Throttle groups and secrets the backends refer to.
    pub objects: Vec<ObjectSpec>,
}

/// Settings shared by both storage modes.
#[derive(Clone, Debug, PartialEq, Eq)]
struct ImageOptions {
    format: ImageFormat,
    cache: CacheMode,
    read_only: bool,
    aio: Aio,
    copy_on_read: bool,
    throttle_group: Option<String>,
    secret: Option<String>,
}

fn scoped(key: &str, image: &str) -> String {
    format!("{key}_{image}")
}

impl ImageOptions {
    fn from_params(
        image: &str,
        media: Media,
        params: &ParameterSet,
        groups: &BTreeMap<String, ObjectSpec>,
    ) -> Result<Self, CompileError> {
        let format = match media {
            Media::Disk => {
                let raw = params.get_or("image_format", "qcow2");
                ImageFormat::from_name(raw).ok_or_else(|| {
                    ParamError::invalid(
                        &scoped("image_format", image),
                        raw,
                        "an image format",
                    )
                })?
            }
            Media::Cdrom | Media::Floppy => ImageFormat::Raw,
        };

        let raw = params.get_or("drive_cache", "none");
        let cache = CacheMode::from_name(raw).ok_or_else(|| {
            let key = scoped("drive_cache", image);
            ParamError::invalid(&key, raw, "a cache mode")
        })?;

        let raw = params.get_or("image_aio", "threads");
        let aio = Aio::from_name(raw).ok_or_else(|| {
            ParamError::invalid(
                &scoped("image_aio", image),
                raw,
                "threads, native or io_uring",
            )
        })?;

        let throttle_group =
            params.get("image_throttle_group").map(str::to_owned);
        if let Some(group) = &throttle_group {
            if !groups.contains_key(group) {
                return Err(ParamError::invalid(
                    &scoped("image_throttle_group", image),
                    group,
                    "a group listed in throttle_groups",
                )
                .into());
            }
        }

        Ok(Self {
            format,
            cache,
            read_only: media == Media::Cdrom
                || params.get_bool_or("image_readonly", false)?,
            aio,
            copy_on_read: params.get_bool_or("image_copy_on_read", false)?,
            throttle_group,
            secret: params.get("image_secret").map(str::to_owned),
        })
    }

    /// Rejects combinations the hypervisor would refuse.
    fn validate(
        &self,
        image: &str,
        protocol: &ProtocolNode,
    ) -> Result<(), UnsupportedDeviceError> {
        let conflict = |reason| UnsupportedDeviceError::conflict(image, reason);
        if self.copy_on_read && self.read_only {
            return Err(conflict("copy-on-read requires a writable image"));
        }
        if self.format == ImageFormat::Luks && self.secret.is_none() {
            return Err(conflict("luks images require image_secret"));
        }
        if aio_applies(protocol)
            && self.aio == Aio::Native
            && !self.cache.direct()
        {
            return Err(conflict(
                "native AIO requires cache=none or cache=directsync",
            ));
        }
        Ok(())
    }
}

/// AIO is a property of the local file protocols only.
fn aio_applies(protocol: &ProtocolNode) -> bool {
    matches!(
        protocol,
        ProtocolNode::File { .. } | ProtocolNode::HostDevice { .. }
    )
}

fn with_aio(protocol: ProtocolNode, aio: Aio) -> ProtocolNode {
    match protocol {
        ProtocolNode::File { filename, .. } => {
            ProtocolNode::File { filename, aio: Some(aio) }
        }
        ProtocolNode::HostDevice { filename, .. } => {
            ProtocolNode::HostDevice { filename, aio: Some(aio) }
        }
        other => other,
    }
}

/// Node graph of one image, appended bottom-up.
struct NodeChain {
    read_only: bool,
    cache: NodeCache,
    nodes: Vec<StorageNode>,
}

impl NodeChain {
    fn new(read_only: bool, cache: CacheMode) -> Self {
        Self { read_only, cache: cache.node_cache(), nodes: Vec::new() }
    }

    fn push(&mut self, node_name: String, kind: StorageNodeKind) {
        self.nodes.push(StorageNode {
            node_name,
            read_only: self.read_only,
            cache: self.cache,
            kind,
        });
    }

    fn top(&self) -> String {
        self.nodes.last().map(|n| n.node_name.clone()).unwrap_or_default()
    }

    fn protocol(&mut self, node_name: String, protocol: ProtocolNode) {
        self.push(node_name, StorageNodeKind::Protocol { protocol });
    }

    fn format(
        &mut self,
        node_name: String,
        format: ImageFormat,
        key_secret: Option<String>,
    ) {
        let file = self.top();
        self.push(
            node_name,
            StorageNodeKind::Format(FormatNode { format, file, key_secret }),
        );
    }

    fn filter(
        &mut self,
        node_name: String,
        make: impl FnOnce(String) -> FilterNode,
    ) {
        let filter = make(self.top());
        self.push(node_name, StorageNodeKind::Filter { filter });
    }
}

fn layered_backend(
    image: &str,
    locator: Locator,
    options: &ImageOptions,
    raw_attach: bool,
    secret_id: Option<String>,
) -> StorageBackend {
    let mut chain = NodeChain::new(options.read_only, options.cache);
    let file_node = format!("file_{image}");
    match locator {
        Locator::Plain(protocol) => {
            chain.protocol(file_node, with_aio(protocol, options.aio));
        }
        Locator::Blkdebug { config, inner } => {
            chain.protocol(file_node.clone(), with_aio(inner, options.aio));
            chain.protocol(
                format!("blkdebug_{image}"),
                ProtocolNode::Blkdebug { config, image: file_node },
            );
        }
    }

    if !(options.format == ImageFormat::Raw && raw_attach) {
        chain.format(format!("drive_{image}"), options.format, secret_id);
    }
    if options.copy_on_read {
        chain.filter(format!("cor_{image}"), |file| FilterNode::CopyOnRead {
            file,
        });
    }
    if let Some(group) = &options.throttle_group {
        chain.filter(format!("throttle_{image}"), |file| FilterNode::Throttle {
            file,
            throttle_group: group.clone(),
        });
    }

    StorageBackend::Layered { nodes: chain.nodes, cache: options.cache }
}

fn legacy_backend(
    image: &str,
    file: &str,
    locator: &Locator,
    options: &ImageOptions,
    secret_id: Option<String>,
) -> StorageBackend {
    let aio = aio_applies(locator.data_protocol()).then_some(options.aio);
    StorageBackend::Legacy {
        drive: LegacyDrive {
            id: format!("drive_{image}"),
            file: file.to_owned(),
            format: Some(options.format),
            interface: DriveInterface::None,
            cache: options.cache,
            read_only: options.read_only,
            aio,
            copy_on_read: options.copy_on_read,
            throttling_group: options.throttle_group.clone(),
            key_secret: secret_id,
        },
    }
}

/// Backend of a firmware flash image, attached either as a raw node pair
/// named `<id>` or as an `if=pflash` drive.
pub fn flash_backend(
    id: &str,
    path: &str,
    read_only: bool,
    unit: u8,
    layered: bool,
) -> StorageBackend {
    let cache = CacheMode::Writeback;
    if layered {
        let mut chain = NodeChain::new(read_only, cache);
        chain.protocol(
            format!("file_{id}"),
            ProtocolNode::File { filename: path.to_owned(), aio: None },
        );
        chain.format(id.to_owned(), ImageFormat::Raw, None);
        StorageBackend::Layered { nodes: chain.nodes, cache }
    } else {
        StorageBackend::Legacy {
            drive: LegacyDrive {
                id: id.to_owned(),
                file: path.to_owned(),
                format: Some(ImageFormat::Raw),
                interface: DriveInterface::Pflash { unit },
                cache,
                read_only,
                aio: None,
                copy_on_read: false,
                throttling_group: None,
                key_secret: None,
            },
        }
    }
}

/// Parses the JSON limits of one throttle group.
fn throttle_limits(
    group: &str,
    params: &ParameterSet,
) -> Result<ThrottleLimits, ParamError> {
    let key = scoped("throttle_group_parameters", group);
    let raw = params.get("throttle_group_parameters").unwrap_or("{}");
    let invalid = || ParamError::invalid(&key, raw, "a JSON object of limits");
    let map: serde_json::Map<String, serde_json::Value> =
        serde_json::from_str(raw).map_err(|_| invalid())?;

    let mut limits = ThrottleLimits::default();
    for (name, value) in map {
        let number = || match &value {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        };
        let slot = match name.as_str() {
            "iops-total" => &mut limits.iops_total,
            "iops-read" => &mut limits.iops_read,
            "iops-write" => &mut limits.iops_write,
            "bps-total" => &mut limits.bps_total,
            "bps-read" => &mut limits.bps_read,
            "bps-write" => &mut limits.bps_write,
            _ => {
                let text = match &value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                limits.extra.insert(name, text);
                continue;
            }
        };
        *slot = Some(number().ok_or_else(invalid)?);
    }
    Ok(limits)
}

fn throttle_groups(
    params: &ParameterSet,
    target: &Target<'_>,
) -> Result<BTreeMap<String, ObjectSpec>, CompileError> {
    let mut groups = BTreeMap::new();
    for group in params.objects("throttle_groups") {
        target.require_object("throttle-group")?;
        let limits = throttle_limits(group, &params.object_params(group))?;
        groups.insert(
            group.to_owned(),
            ObjectSpec {
                id: group.to_owned(),
                kind: ObjectKind::ThrottleGroup { limits },
            },
        );
    }
    Ok(groups)
}

/// Picks the front-end driver and the bus it needs.
fn front_end(
    image: &str,
    media: Media,
    params: &ParameterSet,
    target: &Target<'_>,
) -> Result<(String, BusRequest), CompileError> {
    let usb = || BusRequest::Usb {
        controller: params.get("usb_controller").map(str::to_owned),
    };

    let (key, raw) = match media {
        Media::Disk => {
            ("drive_format", params.get_or("drive_format", "virtio"))
        }
        Media::Cdrom => {
            let default = match target.family {
                MachineFamily::I440fx => "ide-cd",
                MachineFamily::Q35 => "ahci",
                _ => "scsi-cd",
            };
            ("cd_format", params.get_or("cd_format", default))
        }
        Media::Floppy => return Ok(("floppy".to_owned(), BusRequest::Floppy)),
    };

    let scsi = BusRequest::Scsi(HbaFamily::VirtioScsi);
    let chosen = match (media, raw) {
        (Media::Disk, "virtio") => {
            (target.virtio("virtio-blk"), BusRequest::Virtio)
        }
        (Media::Disk, "scsi-hd") => ("scsi-hd".to_owned(), scsi),
        (Media::Disk, "lsi-scsi") => {
            ("scsi-hd".to_owned(), BusRequest::Scsi(HbaFamily::Lsi))
        }
        (Media::Disk, "ide") => ("ide-hd".to_owned(), BusRequest::Ide),
        (Media::Disk, "ahci") => ("ide-hd".to_owned(), BusRequest::Ahci),
        (Media::Disk, "usb2" | "usb3") => ("usb-storage".to_owned(), usb()),
        (Media::Disk, "nvme") => {
            ("nvme".to_owned(), BusRequest::Pci(PciKind::Express))
        }
        (Media::Disk, "floppy") => ("floppy".to_owned(), BusRequest::Floppy),
        (Media::Cdrom, "scsi-cd") => ("scsi-cd".to_owned(), scsi),
        (Media::Cdrom, "ide-cd") => ("ide-cd".to_owned(), BusRequest::Ide),
        (Media::Cdrom, "ahci") => ("ide-cd".to_owned(), BusRequest::Ahci),
        (Media::Cdrom, "usb2") => ("usb-storage".to_owned(), usb()),
        _ => {
            return Err(ParamError::invalid(
                &scoped(key, image),
                raw,
                "a supported drive format",
            )
            .into())
        }
    };
    Ok(chosen)
}

/// Where the image data lives. `None` means the drive has no medium.
fn image_locator(
    image: &str,
    media: Media,
    params: &ParameterSet,
    format: ImageFormat,
) -> Result<Option<String>, ParamError> {
    let file = match media {
        Media::Cdrom => return Ok(params.get("cdrom").map(str::to_owned)),
        Media::Floppy => {
            return Ok(params.get("floppy_name").map(str::to_owned))
        }
        Media::Disk => {
            if let Some(explicit) = params.get("image_filename") {
                return Ok(Some(explicit.to_owned()));
            }
            let name = params.get_or("image_name", image);
            if params.get_bool_or("image_raw_device", false)? {
                name.to_owned()
            } else {
                format!("{name}.{}", format.name())
            }
        }
    };

    Ok(Some(match params.get("images_base_dir") {
        Some(dir) if !file.starts_with('/') && !file.contains("://") => {
            format!("{}/{file}", dir.trim_end_matches('/'))
        }
        _ => file,
    }))
}

/// Builds the storage of every image, cdrom and floppy in declaration order.
pub fn build(
    log: &Logger,
    params: &ParameterSet,
    target: &Target<'_>,
) -> Result<StoragePlan, CompileError> {
    let layered = target.layered_storage();
    let raw_attach = target.oracle.probe(Capability::RawProtocolAttach);
    info!(log, "building storage";
          "mode" => if layered { "layered" } else { "legacy" },
          "raw_protocol_attach" => raw_attach);

    let groups = throttle_groups(params, target)?;
    let mut plan = StoragePlan::default();
    let images = params
        .objects("images")
        .into_iter()
        .map(|i| (i, Media::Disk))
        .chain(params.objects("cdroms").into_iter().map(|c| (c, Media::Cdrom)))
        .chain(
            params.objects("floppies").into_iter().map(|f| (f, Media::Floppy)),
        );

    for (image, media) in images {
        let image_params = params.object_params(image);
        let (disk, secret) = build_image(
            log,
            image,
            media,
            &image_params,
            target,
            &groups,
            layered,
            raw_attach,
        )?;
        plan.objects.extend(secret);
        plan.disks.push(disk);
    }

    // Groups first, in declaration order, so the objects exist before any
    // filter node references them.
    let mut objects: Vec<ObjectSpec> = params
        .objects("throttle_groups")
        .into_iter()
        .filter_map(|g| groups.get(g).cloned())
        .collect();
    objects.append(&mut plan.objects);
    plan.objects = objects;
    Ok(plan)
}

#[allow(clippy::too_many_arguments)]
fn build_image(
    log: &Logger,
    image: &str,
    media: Media,
    params: &ParameterSet,
    target: &Target<'_>,
    groups: &BTreeMap<String, ObjectSpec>,
    layered: bool,
    raw_attach: bool,
) -> Result<(UnplacedDisk, Option<ObjectSpec>), CompileError> {
    let options = ImageOptions::from_params(image, media, params, groups)?;
    let (driver, bus) = front_end(image, media, params, target)?;
    target.require_device(&driver)?;

    let mut secret = None;
    let backend = match image_locator(image, media, params, options.format)? {
        None => StorageBackend::Empty,
        Some(file) => {
            let locator = classify(image, &file)?;
            options.validate(image, locator.data_protocol())?;
            debug!(log, "classified image";
                   "image" => image,
                   "protocol" => locator.data_protocol().driver(),
                   "format" => options.format.name());

            let secret_id = match &options.secret {
                Some(data) if options.format == ImageFormat::Luks => {
                    target.require_object("secret")?;
                    let id = format!("sec_{image}");
                    secret = Some(ObjectSpec {
                        id: id.clone(),
                        kind: ObjectKind::Secret(SecretObject {
                            data: data.clone(),
                            format: "raw".to_owned(),
                        }),
                    });
                    Some(id)
                }
                _ => None,
            };

            if layered {
                layered_backend(image, locator, &options, raw_attach, secret_id)
            } else {
                legacy_backend(image, &file, &locator, &options, secret_id)
            }
        }
    };

    let serial = params
        .get("drive_serial")
        .map(str::to_owned)
        .or_else(|| (driver == "nvme").then(|| image.to_owned()));
    let node = DeviceNode {
        id: image.to_owned(),
        driver,
        placement: None,
        props: DeviceProps::Disk(DiskProps {
            drive: backend.top().map(str::to_owned),
            bootindex: None,
            serial,
            read_only: options.read_only,
            removable: params.get_bool_or("image_removable", false)?,
        }),
        extra: params.extra_props("blk_extra_params")?,
    };

    let disk = UnplacedDisk {
        name: image.to_owned(),
        media,
        backend,
        device: UnplacedDevice::new(
            node,
            DeviceRequest::with_params(bus, params)?,
        ),
    };
    Ok((disk, secret))
}
