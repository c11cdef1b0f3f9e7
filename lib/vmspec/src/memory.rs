// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Guest memory sizing, the machine memory backend and memory devices.

use std::collections::BTreeMap;

use slog::{info, warn, Logger};
use vmspec_params::{ParamError, ParameterSet};
use vmspec_types::instance_spec::components::board::{
    LegacyMemPath, Memory, MemoryBackend, MemoryBackendKind, VirtioTransport,
};
use vmspec_types::instance_spec::components::devices::{
    DeviceNode, DeviceProps, DimmProps, VirtioMemProps,
};

use crate::bus::{BusRequest, DeviceRequest};
use crate::capability::Capability;
use crate::devices::UnplacedDevice;
use crate::error::{CompileError, ResourceLimitError, UnsupportedDeviceError};
use crate::machine::Target;

const DEFAULT_MEM_MIB: u64 = 1024;
const DEFAULT_MIN_MIB: u64 = 512;
const DEFAULT_AUTO_RATIO: f64 = 0.5;
const DEFAULT_HUGEPAGE_PATH: &str = "/mnt/kvm_hugepage";

/// The ID of the backend object providing base memory.
pub const MACHINE_BACKEND_ID: &str = "mem-machine_mem";

/// A memory device whose front end has not been placed yet.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnplacedMemoryDevice {
    pub name: String,
    pub backend: MemoryBackend,
    pub device: UnplacedDevice,
}

/// Everything the memory builder contributes to an instance.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemoryPlan {
    /// Guest memory; `devices` is left empty until placement.
    pub memory: Memory,
    pub legacy_mem_path: Option<LegacyMemPath>,
    pub nvdimm: bool,
    pub devices: Vec<UnplacedMemoryDevice>,
}

impl MemoryPlan {
    /// The ID to put in the machine's `memory-backend` option.
    pub fn machine_backend(&self) -> Option<String> {
        self.memory.backend.as_ref().map(|b| b.id.clone())
    }
}

/// Resolves the guest memory size in MiB.
fn resolve_size(
    log: &Logger,
    params: &ParameterSet,
    host_mib: u64,
) -> Result<u64, CompileError> {
    let size = match params.get("mem").map(str::trim) {
        Some("auto") => {
            let ratio: f64 =
                params.get_numeric_or("auto_mem_ratio", DEFAULT_AUTO_RATIO)?;
            if !(ratio > 0.0 && ratio <= 1.0) {
                return Err(ParamError::invalid(
                    "auto_mem_ratio",
                    params.get_or("auto_mem_ratio", ""),
                    "a ratio in (0, 1]",
                )
                .into());
            }
            let size = (host_mib as f64 * ratio) as u64;
            info!(log, "sized guest memory from host";
                  "host_mib" => host_mib, "ratio" => ratio, "mem_mib" => size);
            size
        }
        _ => {
            let size =
                params.get_size_mib("mem")?.unwrap_or(DEFAULT_MEM_MIB);
            if size > host_mib {
                warn!(log, "guest memory exceeds host usable memory";
                      "mem_mib" => size, "host_mib" => host_mib);
            }
            size
        }
    };

    let size = match params.get_size_mib("vm_mem_limit")? {
        Some(limit) if limit < size => {
            info!(log, "clamping guest memory to limit";
                  "mem_mib" => size, "limit_mib" => limit);
            limit
        }
        _ => size,
    };

    let minimum =
        params.get_size_mib("vm_mem_minimum")?.unwrap_or(DEFAULT_MIN_MIB);
    if size < minimum {
        return Err(ResourceLimitError::MemoryBelowMinimum {
            requested: size,
            minimum,
        }
        .into());
    }
    Ok(size)
}

/// Picks the base memory backend kind, if any was asked for.
fn machine_backend_kind(
    params: &ParameterSet,
) -> Result<Option<MemoryBackendKind>, ParamError> {
    let hugepage = params.get_bool_or("hugepage", false)?;
    let mem_path = if hugepage {
        Some(params.get_or("hugepage_path", DEFAULT_HUGEPAGE_PATH))
    } else {
        params.get("mem_path")
    };

    let default = match mem_path {
        Some(_) => "memory-backend-file",
        None => "",
    };
    let kind = match params.get("vm_mem_backend").unwrap_or(default) {
        "" => None,
        "memory-backend-ram" => Some(MemoryBackendKind::Ram),
        "memory-backend-memfd" => {
            Some(MemoryBackendKind::Memfd { hugetlb: hugepage })
        }
        "memory-backend-file" => Some(MemoryBackendKind::File {
            mem_path: mem_path
                .ok_or_else(|| ParamError::missing("mem_path"))?
                .to_owned(),
            pmem: false,
        }),
        other => {
            return Err(ParamError::invalid(
                "vm_mem_backend",
                other,
                "a memory backend type",
            ))
        }
    };
    Ok(kind)
}

/// Builds the backend object for memory device `name`.
fn device_backend(
    name: &str,
    params: &ParameterSet,
    size_mib: u64,
    pmem: bool,
) -> Result<MemoryBackend, ParamError> {
    let raw = params.get_or(
        "backend_mem",
        if pmem { "memory-backend-file" } else { "memory-backend-ram" },
    );
    let kind = match raw {
        "memory-backend-ram" if !pmem => MemoryBackendKind::Ram,
        "memory-backend-memfd" if !pmem => MemoryBackendKind::Memfd {
            hugetlb: params.get_bool_or("hugepage", false)?,
        },
        "memory-backend-file" => MemoryBackendKind::File {
            mem_path: params.require("mem-path")?.to_owned(),
            pmem,
        },
        other => {
            let expected = if pmem {
                "memory-backend-file for persistent memory"
            } else {
                "a memory backend type"
            };
            return Err(ParamError::invalid(
                &format!("backend_mem_{name}"),
                other,
                expected,
            ));
        }
    };

    Ok(MemoryBackend {
        id: format!("mem-{name}"),
        size_mib,
        kind,
        share: params.get_bool_or("share_mem", false)?,
        prealloc: params.get_bool_or("prealloc_mem", false)?,
    })
}

fn device_node(id: String, driver: &str, props: DeviceProps) -> DeviceNode {
    DeviceNode {
        id,
        driver: driver.to_owned(),
        placement: None,
        props,
        extra: BTreeMap::new(),
    }
}

/// Builds the memory section for the instance.
pub fn build(
    log: &Logger,
    params: &ParameterSet,
    target: &Target<'_>,
    host_mib: u64,
) -> Result<MemoryPlan, CompileError> {
    let size_mib = resolve_size(log, params, host_mib)?;

    let mut backend = None;
    let mut legacy_mem_path = None;
    if let Some(kind) = machine_backend_kind(params)? {
        let share = params.get_bool_or("vm_mem_share", false)?;
        let prealloc = params.get_bool_or("vm_mem_prealloc", false)?;
        if target.oracle.probe(Capability::MachineMemoryBackend) {
            target.require_object(kind.object_type())?;
            backend = Some(MemoryBackend {
                id: MACHINE_BACKEND_ID.to_owned(),
                size_mib,
                kind,
                share,
                prealloc,
            });
        } else {
            match kind {
                MemoryBackendKind::File { mem_path, .. } => {
                    legacy_mem_path =
                        Some(LegacyMemPath { path: mem_path, prealloc });
                }
                MemoryBackendKind::Ram => {}
                MemoryBackendKind::Memfd { .. } => {
                    return Err(UnsupportedDeviceError::MissingCapability {
                        what: "memory-backend-memfd as machine memory"
                            .to_owned(),
                        capability: Capability::MachineMemoryBackend,
                    }
                    .into())
                }
            }
        }
    }

    let mut devices = Vec::new();
    let mut nvdimm = false;
    let mut dimm_slot = 0u32;
    let mut device_total_mib = 0u64;
    for name in params.objects("mem_devs") {
        let p = params.object_params(name);
        let dev_size = p
            .get_size_mib("size_mem")?
            .ok_or_else(|| ParamError::missing(&format!("size_mem_{name}")))?;
        let pmem = p.get_bool_or("pmem", false)?;

        let device = match p.get_or("mem_devtype", "dimm") {
            "dimm" => {
                let backend = device_backend(name, &p, dev_size, pmem)?;
                let (prefix, driver) = match pmem {
                    true => ("nvdimm", "nvdimm"),
                    false => ("dimm", "pc-dimm"),
                };
                nvdimm |= pmem;
                let props = DimmProps {
                    memdev: backend.id.clone(),
                    slot: dimm_slot,
                    nvdimm: pmem,
                };
                dimm_slot += 1;
                let node = device_node(
                    format!("{prefix}-{name}"),
                    driver,
                    DeviceProps::Dimm(props),
                );
                (backend, node, BusRequest::None)
            }
            "virtio-mem" => {
                let transport = target.family.virtio_transport();
                if transport == VirtioTransport::Ccw {
                    return Err(target.unsupported("virtio-mem"));
                }
                let backend = device_backend(name, &p, dev_size, false)?;
                // MMIO transports take neither node nor the memslot options.
                let full = transport == VirtioTransport::Pci;
                let props = VirtioMemProps {
                    memdev: backend.id.clone(),
                    requested_size_mib: p.get_size_mib("requested_size")?,
                    block_size_mib: p.get_size_mib("block_size")?,
                    node: p.get_numeric("node_mem")?.filter(|_| full),
                    prealloc: p.get_bool("prealloc_mem")?.filter(|_| full),
                    dynamic_memslots: p
                        .get_bool("dynamic-memslots_mem")?
                        .filter(|_| full),
                };
                let node = device_node(
                    format!("virtio_mem-{name}"),
                    &target.virtio("virtio-mem"),
                    DeviceProps::VirtioMem(props),
                );
                (backend, node, BusRequest::Virtio)
            }
            other => {
                return Err(ParamError::invalid(
                    &format!("mem_devtype_{name}"),
                    other,
                    "dimm or virtio-mem",
                )
                .into())
            }
        };

        let (backend, node, bus) = device;
        target.require_object(backend.kind.object_type())?;
        target.require_device(&node.driver)?;
        device_total_mib += dev_size;
        devices.push(UnplacedMemoryDevice {
            name: name.to_owned(),
            backend,
            device: UnplacedDevice::new(node, DeviceRequest::new(bus)),
        });
    }

    let maxmem_mib = params.get_size_mib("maxmem_mem")?;
    let slots: Option<u32> = params.get_numeric("slots_mem")?;
    let (maxmem_mib, slots) = if devices.is_empty() {
        (maxmem_mib, slots)
    } else {
        let needed = size_mib + device_total_mib;
        let maxmem = match maxmem_mib {
            Some(maxmem) if needed > maxmem => {
                return Err(ResourceLimitError::MaxMemExceeded {
                    requested: needed,
                    available: maxmem,
                }
                .into())
            }
            Some(maxmem) => maxmem,
            None => needed,
        };
        let slots = match slots {
            Some(available) if dimm_slot > available => {
                return Err(ResourceLimitError::MemorySlotsExhausted {
                    requested: dimm_slot,
                    available,
                }
                .into())
            }
            Some(available) => available,
            None => dimm_slot.max(1),
        };
        (Some(maxmem), Some(slots))
    };

    info!(log, "resolved guest memory";
          "mem_mib" => size_mib,
          "maxmem_mib" => ?maxmem_mib,
          "devices" => devices.len());

    Ok(MemoryPlan {
        memory: Memory {
            size_mib,
            maxmem_mib,
            slots,
            backend,
            devices: Vec::new(),
        },
        legacy_mem_path,
        nvdimm,
        devices,
    })
}
