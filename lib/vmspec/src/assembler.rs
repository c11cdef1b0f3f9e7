// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Assembles a complete [`InstanceSpec`] from a parameter set.
//!
//! Every builder produces unplaced device requests. The assembler then runs
//! them through one [`BusAllocator`] in a fixed order: USB host controllers,
//! memory devices, disks, NICs and finally all other devices. Boot indices
//! are claimed afterwards, explicit ones first, so that an explicit index is
//! never taken by an earlier `image_boot` request.

use slog::{info, o, Logger};
use uuid::Uuid;
use vmspec_params::{ParamError, ParameterSet};
use vmspec_types::instance_spec::components::board::MemoryDevice;
use vmspec_types::instance_spec::components::devices::DeviceNode;
use vmspec_types::instance_spec::{Disk, InstanceSpec};

use crate::bus::{AllocatorConfig, BootRequest, BusAllocator};
use crate::capability::{Capability, CapabilityOracle};
use crate::chardev::build_monitors;
use crate::devices::{boot_request, set_bootindex, DeviceBuilder};
use crate::error::CompileError;
use crate::host::{HostLeases, HostResources};
use crate::ids::IdSource;
use crate::machine::{build_cpu, build_firmware, build_machine, Target};
use crate::{memory, storage};

/// Compiles parameter sets against one hypervisor and host.
///
/// A `Compiler` holds no per-run state, so one instance can compile any
/// number of specs, including from several threads when the oracle and host
/// are shared.
pub struct Compiler<'a> {
    log: Logger,
    oracle: &'a dyn CapabilityOracle,
    host: &'a dyn HostResources,
}

/// Occupancy tables for a single compilation.
struct RunState<'h> {
    alloc: BusAllocator,
    leases: HostLeases<'h>,
}

/// Identifies a device front end that asked for a boot index.
#[derive(Clone, Copy)]
enum BootSlot {
    Disk(usize),
    Nic(usize),
}

impl<'a> Compiler<'a> {
    pub fn new(
        log: Logger,
        oracle: &'a dyn CapabilityOracle,
        host: &'a dyn HostResources,
    ) -> Self {
        Self { log, oracle, host }
    }

    fn allocator_config(
        &self,
        params: &ParameterSet,
    ) -> Result<AllocatorConfig, ParamError> {
        Ok(AllocatorConfig {
            root_ports: self.oracle.probe(Capability::PcieRootPort),
            pcie_pci_bridge: self.oracle.probe(Capability::PciePciBridge),
            scsi_max_targets: params.get_numeric("scsi_hba_max_targets")?,
            scsi_max_luns: params.get_numeric("scsi_hba_max_luns")?,
        })
    }

    /// Compiles the instance `vm_name`. A failed compilation returns the
    /// first error encountered and no partial spec.
    pub fn compile(
        &self,
        vm_name: &str,
        params: &ParameterSet,
        ids: &mut dyn IdSource,
    ) -> Result<InstanceSpec, CompileError> {
        let log = self.log.new(o!("vm" => vm_name.to_owned()));
        let target = Target::from_params(self.oracle, params)?;
        info!(log, "compiling instance spec";
              "machine_type" => &target.machine_type,
              "hypervisor" => ?self.oracle.version());

        let mut run = RunState {
            alloc: BusAllocator::new(
                &log,
                target.family,
                &target.machine_type,
                self.allocator_config(params)?,
            ),
            leases: HostLeases::new(self.host),
        };

        let firmware = build_firmware(&log, params, &target)?;
        let mut machine = build_machine(params, &target, &firmware)?;
        let cpu = build_cpu(&log, params, &target)?;
        let mem_plan = memory::build(
            &log,
            params,
            &target,
            run.leases.usable_memory_mib(),
        )?;
        let storage_plan = storage::build(&log, params, &target)?;
        let monitors = build_monitors(&log, vm_name, params, &mut run.leases)?;
        let device_plan =
            DeviceBuilder::new(&log, params, &target, vm_name, &mut run.leases)
                .build(ids)?;

        let uuid = match params.get("vm_uuid") {
            Some(raw) => Uuid::parse_str(raw).map_err(|_| {
                ParamError::invalid("vm_uuid", raw, "a UUID")
            })?,
            None => ids.instance_uuid(),
        };

        for usb in &device_plan.usb_controllers {
            run.alloc.add_usb_controller(
                &usb.id,
                &usb.model,
                usb.ports,
                &usb.hint,
            )?;
        }

        machine.memory_backend = mem_plan.machine_backend();
        machine.legacy_mem_path = mem_plan.legacy_mem_path;
        machine.nvdimm = mem_plan.nvdimm;
        let mut memory = mem_plan.memory;
        for dev in mem_plan.devices {
            memory.devices.push(MemoryDevice {
                name: dev.name,
                backend: dev.backend,
                device: dev.device.place(&mut run.alloc)?,
            });
        }

        let mut boot = Vec::new();
        let mut disks = Vec::with_capacity(storage_plan.disks.len());
        for disk in storage_plan.disks {
            let slot = BootSlot::Disk(disks.len());
            boot.push((slot, boot_request(&disk.device)));
            disks.push(Disk {
                name: disk.name,
                media: disk.media,
                backend: disk.backend,
                device: disk.device.place(&mut run.alloc)?,
            });
        }

        let mut network = Vec::with_capacity(device_plan.nics.len());
        for nic in device_plan.nics {
            let slot = BootSlot::Nic(network.len());
            boot.push((slot, boot_request(&nic.device)));
            network.push(nic.place(&mut run.alloc)?);
        }

        let devices = device_plan
            .devices
            .into_iter()
            .map(|d| d.place(&mut run.alloc))
            .collect::<Result<Vec<DeviceNode>, _>>()?;

        let explicit = boot
            .iter()
            .filter(|(_, req)| matches!(req, BootRequest::Explicit(_)));
        let next = boot.iter().filter(|(_, req)| *req == BootRequest::Next);
        for (slot, request) in explicit.chain(next) {
            let node = match *slot {
                BootSlot::Disk(i) => &mut disks[i].device,
                BootSlot::Nic(i) => &mut network[i].device,
            };
            if let Some(index) = run.alloc.claim_boot_index(&node.id, *request)?
            {
                set_bootindex(node, index);
            }
        }

        let mut objects = storage_plan.objects;
        objects.extend(device_plan.objects);
        let mut chardevs = Vec::new();
        let mut monitor_specs = Vec::new();
        for (monitor, chardev) in monitors {
            chardevs.push(chardev);
            monitor_specs.push(monitor);
        }
        chardevs.extend(device_plan.chardevs);

        let (buses, controllers) = run.alloc.into_parts();
        info!(log, "compiled instance spec";
              "uuid" => %uuid,
              "buses" => buses.len(),
              "controllers" => controllers.len(),
              "disks" => disks.len(),
              "nics" => network.len(),
              "devices" => devices.len());

        Ok(InstanceSpec {
            name: vm_name.to_owned(),
            uuid,
            machine,
            firmware,
            cpu,
            memory,
            buses,
            controllers,
            objects,
            storage: disks,
            network,
            devices,
            chardevs,
            monitors: monitor_specs,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::capability::CapabilitySet;
    use crate::host::StaticHost;
    use crate::ids::SequentialIds;
    use crate::test_logger;
    use semver::Version;
    use vmspec_types::instance_spec::components::devices::DeviceProps;

    fn caps() -> CapabilitySet {
        CapabilitySet::new(Version::new(8, 2, 0))
            .with_flag(Capability::Blockdev)
            .with_devices([
                "pcie-root-port",
                "pcie-pci-bridge",
                "virtio-blk-pci",
                "virtio-net-pci",
                "ide-cd",
                "ide-hd",
                "VGA",
            ])
    }

    fn compile(pairs: &[(&str, &str)]) -> Result<InstanceSpec, CompileError> {
        let caps = caps();
        let host = StaticHost::default();
        let params: ParameterSet = pairs.iter().copied().collect();
        Compiler::new(test_logger(), &caps, &host).compile(
            "vm1",
            &params,
            &mut SequentialIds::new(),
        )
    }

    #[test]
    fn explicit_boot_index_wins_over_image_boot() {
        let spec = compile(&[
            ("images", "image1 image2"),
            ("image_boot_image1", "yes"),
            ("bootindex_image2", "0"),
            ("nics", "nic1"),
            ("image_boot_nic1", "yes"),
        ])
        .unwrap();

        let bootindex = |id: &str| match &spec.device(id).unwrap().props {
            DeviceProps::Disk(p) => p.bootindex,
            DeviceProps::Nic(p) => p.bootindex,
            other => panic!("unexpected props {other:?}"),
        };
        assert_eq!(bootindex("image2"), Some(0));
        assert_eq!(bootindex("image1"), Some(1));
        assert_eq!(bootindex("nic1"), Some(2));
    }

    #[test]
    fn duplicate_boot_index() {
        let err = compile(&[("images", "image1 image2"), ("bootindex", "1")])
            .unwrap_err();
        assert!(matches!(err, CompileError::AddressCollision(_)), "{err}");
    }

    #[test]
    fn uuid_from_params_or_id_source() {
        let spec = compile(&[]).unwrap();
        assert_eq!(spec.uuid, Uuid::from_u128(1));

        let spec =
            compile(&[("vm_uuid", "6a4bd4a9-4bd3-4a5c-9b58-3e1f1c8a2f10")])
                .unwrap();
        assert_eq!(
            spec.uuid.to_string(),
            "6a4bd4a9-4bd3-4a5c-9b58-3e1f1c8a2f10"
        );

        assert!(matches!(
            compile(&[("vm_uuid", "not-a-uuid")]),
            Err(CompileError::Param(_))
        ));
    }
}
