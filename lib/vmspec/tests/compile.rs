// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end compilation scenarios.

use std::collections::BTreeSet;

use semver::Version;
use slog::{o, Logger};
use vmspec::capability::{Capability, CapabilitySet};
use vmspec::host::StaticHost;
use vmspec::ids::SequentialIds;
use vmspec::bus::AddressCollisionError;
use vmspec::{CompileError, Compiler, ResourceLimitError};
use vmspec_params::ParameterSet;
use vmspec_types::instance_spec::components::backends::{
    CacheMode, StorageBackend,
};
use vmspec_types::instance_spec::components::devices::{
    ControllerKind, DeviceProps,
};
use vmspec_types::instance_spec::InstanceSpec;

fn logger() -> Logger {
    Logger::root(slog::Discard, o!())
}

fn caps(version: Version) -> CapabilitySet {
    CapabilitySet::new(version)
        .with_devices([
            "pcie-root-port",
            "pcie-pci-bridge",
            "pci-bridge",
            "virtio-blk-pci",
            "virtio-scsi-pci",
            "scsi-hd",
            "scsi-cd",
            "ide-hd",
            "ide-cd",
            "virtio-net-pci",
            "e1000",
            "virtio-rng-pci",
            "virtio-balloon-pci",
            "vhost-vsock-pci",
            "isa-serial",
            "virtserialport",
            "qemu-xhci",
            "usb-tablet",
            "usb-storage",
            "pc-dimm",
            "i6300esb",
            "VGA",
        ])
        .with_objects(["rng-random", "memory-backend-ram", "secret"])
}

fn layered(version: Version) -> CapabilitySet {
    caps(version).with_flag(Capability::Blockdev)
}

fn params(pairs: &[(&str, &str)]) -> ParameterSet {
    pairs.iter().copied().collect()
}

fn compile(
    caps: &CapabilitySet,
    pairs: &[(&str, &str)],
) -> Result<InstanceSpec, CompileError> {
    let host = StaticHost::default();
    Compiler::new(logger(), caps, &host).compile(
        "vm1",
        &params(pairs),
        &mut SequentialIds::new(),
    )
}

#[test]
fn scenario_sockets_preferred_before_6_2() {
    let spec = compile(&caps(Version::new(6, 1, 0)), &[("smp", "4")]).unwrap();
    let topo = &spec.cpu.topology;
    assert_eq!(topo.smp, 4);
    assert_eq!(topo.sockets, 4);
    assert_eq!(topo.cores, 1);
    assert_eq!(topo.threads, 1);
}

#[test]
fn scenario_cores_preferred_from_6_2() {
    let spec = compile(&caps(Version::new(6, 2, 0)), &[("smp", "4")]).unwrap();
    let topo = &spec.cpu.topology;
    assert_eq!(topo.sockets, 1);
    assert_eq!(topo.cores, 4);
    assert_eq!(topo.threads, 1);
}

#[test]
fn scenario_second_scsi_hba_when_first_is_full() {
    let spec = compile(
        &layered(Version::new(8, 2, 0)),
        &[
            ("images", "image1 image2"),
            ("drive_format", "scsi-hd"),
            ("scsi_hba_max_targets", "1"),
            ("scsi_hba_max_luns", "1"),
        ],
    )
    .unwrap();

    let hbas: Vec<&str> = spec
        .controllers
        .iter()
        .filter(|c| matches!(c.kind, ControllerKind::ScsiHba { .. }))
        .map(|c| c.id.as_str())
        .collect();
    assert_eq!(hbas, vec!["virtio_scsi_pci0", "virtio_scsi_pci1"]);

    let bus = |image: &str| {
        spec.disk(image).unwrap().device.placement.as_ref().unwrap().bus.clone()
    };
    assert_eq!(bus("image1").to_string(), "virtio_scsi_pci0.0");
    assert_eq!(bus("image2").to_string(), "virtio_scsi_pci1.0");
}

#[test]
fn scenario_nbd_without_blockdev_is_one_legacy_drive() {
    let spec = compile(
        &caps(Version::new(8, 2, 0)),
        &[
            ("images", "image1"),
            ("image_filename", "nbd://storage.example.com/export"),
            ("image_format", "raw"),
        ],
    )
    .unwrap();

    assert_eq!(spec.storage.len(), 1);
    let disk = &spec.storage[0];
    let StorageBackend::Legacy { drive } = &disk.backend else {
        panic!("expected a legacy drive, got {:?}", disk.backend);
    };
    assert_eq!(drive.id, "drive_image1");
    assert_eq!(drive.file, "nbd://storage.example.com/export");
    let DeviceProps::Disk(props) = &disk.device.props else {
        panic!("not a disk");
    };
    assert_eq!(props.drive.as_deref(), Some("drive_image1"));
}

#[test]
fn scenario_memory_below_minimum_produces_no_spec() {
    let err = compile(&caps(Version::new(8, 2, 0)), &[("mem", "64")])
        .unwrap_err();
    assert_eq!(
        err,
        CompileError::ResourceLimit(ResourceLimitError::MemoryBelowMinimum {
            requested: 64,
            minimum: 512,
        })
    );
}

fn busy_machine() -> Vec<(&'static str, &'static str)> {
    vec![
        ("smp", "8"),
        ("vcpu_maxcpus", "16"),
        ("mem", "4G"),
        ("mem_devs", "mem1"),
        ("size_mem", "1G"),
        ("images", "image1 image2 image3 image4"),
        ("drive_format_image2", "scsi-hd"),
        ("drive_format_image3", "ide"),
        ("drive_format_image4", "usb3"),
        ("image_boot_image1", "yes"),
        ("cdroms", "cd1"),
        ("cdrom_cd1", "/isos/install.iso"),
        ("cd_format_cd1", "scsi-cd"),
        ("nics", "nic1 nic2"),
        ("nic_model_nic2", "e1000"),
        ("virtio_rngs", "rng0"),
        ("balloon", "balloon0"),
        ("vsocks", "vsock0"),
        ("serials", "serial0 vs1"),
        ("serial_type_vs1", "virtserialport"),
        ("usb_devices", "tablet1"),
        ("enable_watchdog", "yes"),
        ("monitors", "qmpmonitor1"),
    ]
}

#[test]
fn placements_are_unique() {
    let spec = compile(&layered(Version::new(8, 2, 0)), &busy_machine())
        .unwrap();

    let placements = spec.placements();
    let unique: BTreeSet<_> = placements
        .iter()
        .map(|(_, p)| (p.bus.to_string(), p.coordinate.to_string()))
        .collect();
    assert_eq!(unique.len(), placements.len(), "{placements:#?}");

    // Every placement names a bus that the instance declares.
    let buses: BTreeSet<String> =
        spec.buses.iter().map(|b| b.id.to_string()).collect();
    for (owner, placement) in &placements {
        assert!(
            buses.contains(&placement.bus.to_string()),
            "{owner} sits on unknown bus {}",
            placement.bus
        );
    }

    // The conventional e1000 and the watchdog go behind the bridge.
    assert!(spec.controller("pcie-pci-bridge-0").is_some());
    assert_eq!(spec.memory.maxmem_mib, Some(5120));
    assert_eq!(spec.memory.devices[0].device.id, "dimm-mem1");
}

#[test]
fn identical_inputs_give_identical_json() {
    let caps = layered(Version::new(8, 2, 0));
    let a = serde_json::to_string(&compile(&caps, &busy_machine()).unwrap())
        .unwrap();
    let b = serde_json::to_string(&compile(&caps, &busy_machine()).unwrap())
        .unwrap();
    assert_eq!(a, b);

    let spec: InstanceSpec = serde_json::from_str(&a).unwrap();
    assert_eq!(spec, compile(&caps, &busy_machine()).unwrap());
}

#[test]
fn cache_modes_agree_between_layered_and_legacy() {
    for cache in ["none", "writeback", "writethrough", "directsync", "unsafe"]
    {
        let pairs = [("images", "image1"), ("drive_cache", cache)];
        let new = compile(&layered(Version::new(8, 2, 0)), &pairs).unwrap();
        let old = compile(&caps(Version::new(8, 2, 0)), &pairs).unwrap();

        let new = &new.storage[0].backend;
        let old = &old.storage[0].backend;
        assert!(matches!(new, StorageBackend::Layered { .. }));
        assert!(matches!(old, StorageBackend::Legacy { .. }));
        assert_eq!(new.cache(), old.cache(), "{cache}");
        assert_eq!(new.read_only(), old.read_only(), "{cache}");
    }

    let spec = compile(
        &layered(Version::new(8, 2, 0)),
        &[("images", "image1"), ("drive_cache", "writethrough")],
    )
    .unwrap();
    assert_eq!(
        spec.storage[0].backend.cache(),
        Some(CacheMode::Writethrough)
    );
}

#[test]
fn unavailable_device_fails_compilation() {
    let err = compile(
        &caps(Version::new(8, 2, 0)),
        &[("images", "image1"), ("drive_format", "nvme")],
    )
    .unwrap_err();
    assert!(matches!(err, CompileError::UnsupportedDevice(_)), "{err}");
}

#[test]
fn serials_cannot_share_a_host_port() {
    let err = compile(
        &caps(Version::new(8, 2, 0)),
        &[
            ("serials", "s0 s1"),
            ("chardev_backend", "tcp_socket"),
            ("chardev_port", "5000"),
        ],
    )
    .unwrap_err();
    assert!(
        matches!(
            err,
            CompileError::AddressCollision(AddressCollisionError::PortInUse {
                port: 5000,
                ..
            })
        ),
        "{err}"
    );
}

#[test]
fn explicit_scsi_coordinates_collide_across_hbas() {
    let err = compile(
        &layered(Version::new(8, 2, 0)),
        &[
            ("images", "a b c"),
            ("drive_format", "scsi-hd"),
            ("drive_bus_c", "1"),
            ("drive_unit_a", "0"),
            ("drive_port_a", "0"),
            ("drive_unit_b", "0"),
            ("drive_port_b", "0"),
        ],
    )
    .unwrap_err();
    assert!(
        matches!(
            err,
            CompileError::AddressCollision(AddressCollisionError::InUse { .. })
        ),
        "{err}"
    );
}
