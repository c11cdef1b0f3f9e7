// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bus and address allocation.
//!
//! A [`BusAllocator`] owns every bus of one compilation and the coordinates
//! claimed on each. Devices are placed in the order they are declared; when a
//! device needs a bus that does not exist yet (a PCIe root port, a SCSI HBA, a
//! USB controller) the allocator inserts the controller that provides it.

use std::collections::BTreeMap;

use slog::{debug, info, Logger};
use thiserror::Error;
use vmspec_params::{ParamError, ParameterSet};
use vmspec_types::address::{
    Bus, BusId, BusKind, Coordinate, PciAddress, Placement, PCI_SLOTS_PER_BUS,
};
use vmspec_types::instance_spec::components::board::{
    MachineFamily, VirtioTransport,
};
use vmspec_types::instance_spec::components::devices::{
    Controller, ControllerKind, HbaFamily,
};

use crate::error::{CompileError, ResourceLimitError, UnsupportedDeviceError};

/// Errors raised when an explicit placement cannot be honored.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum AddressCollisionError {
    #[error("{device} cannot use {placement}: already used by {owner}")]
    InUse { device: String, placement: Placement, owner: String },

    #[error("{device}: {coordinate} is outside the address space of {bus}")]
    OutOfRange { device: String, bus: BusId, coordinate: Coordinate },

    #[error("{device}: unit {unit} is outside the address space of {bus}")]
    UnitOutOfRange { device: String, bus: BusId, unit: u16 },

    #[error("{device}: no bus named {bus}")]
    UnknownBus { device: String, bus: String },

    #[error("{device} cannot use boot index {index}: already used by {owner}")]
    BootIndexInUse { device: String, index: u32, owner: String },

    #[error("{device} cannot use vsock CID {cid}: already used by {owner}")]
    CidInUse { device: String, cid: u32, owner: String },

    #[error("{device} cannot use host port {port}: already used by {owner}")]
    PortInUse { device: String, port: u16, owner: String },
}

/// How a PCI device attaches to a PCI Express hierarchy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PciKind {
    /// An express endpoint, which gets a root port of its own.
    Express,
    /// A conventional PCI device, which sits behind a PCIe-to-PCI bridge.
    Conventional,
    /// A device integrated into the root complex.
    Integrated,
}

/// The kind of bus a device needs.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BusRequest {
    /// The device has no bus (built into the machine, or a sysbus device).
    None,
    Pci(PciKind),
    /// Whatever transport the machine uses for virtio.
    Virtio,
    Scsi(HbaFamily),
    Ide,
    Ahci,
    Usb {
        /// Only controllers whose model contains this string are considered.
        controller: Option<String>,
    },
    Floppy,
    IsaSerial,
    VirtioSerial,
}

/// Explicit coordinates taken from a device's parameters.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PlacementHint {
    pub pci_bus: Option<String>,
    pub pci_addr: Option<PciAddress>,
    /// The index of the controller (SCSI HBA, IDE bus) to use.
    pub drive_bus: Option<u32>,
    /// The SCSI target or IDE/floppy unit.
    pub drive_unit: Option<u16>,
    /// The SCSI LUN.
    pub drive_port: Option<u16>,
    pub usb_bus: Option<String>,
    pub usb_port: Option<u8>,
}

impl PlacementHint {
    pub fn from_params(params: &ParameterSet) -> Result<Self, ParamError> {
        let pci_addr = match params.get("pci_addr") {
            Some(raw) => Some(raw.parse().map_err(|_| {
                ParamError::invalid("pci_addr", raw, "a PCI slot[.function]")
            })?),
            None => None,
        };

        Ok(Self {
            pci_bus: params.get("pci_bus").map(str::to_owned),
            pci_addr,
            drive_bus: params.get_numeric("drive_bus")?,
            drive_unit: params.get_numeric("drive_unit")?,
            drive_port: params.get_numeric("drive_port")?,
            usb_bus: params.get("usb_bus").map(str::to_owned),
            usb_port: params.get_numeric("usb_port")?,
        })
    }
}

/// How a device asks for a boot index.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum BootRequest {
    #[default]
    None,
    /// The lowest index not yet used.
    Next,
    Explicit(u32),
}

impl BootRequest {
    /// Reads `bootindex`, falling back to `image_boot` for the next free index.
    pub fn from_params(params: &ParameterSet) -> Result<Self, ParamError> {
        if let Some(index) = params.get_numeric("bootindex")? {
            return Ok(BootRequest::Explicit(index));
        }
        if params.get_bool_or("image_boot", false)? {
            return Ok(BootRequest::Next);
        }
        Ok(BootRequest::None)
    }
}

/// Everything the allocator needs to place one device.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceRequest {
    pub bus: BusRequest,
    pub hint: PlacementHint,
    pub boot: BootRequest,
}

impl DeviceRequest {
    pub fn new(bus: BusRequest) -> Self {
        Self { bus, hint: PlacementHint::default(), boot: BootRequest::None }
    }

    pub fn with_params(
        bus: BusRequest,
        params: &ParameterSet,
    ) -> Result<Self, ParamError> {
        Ok(Self {
            bus,
            hint: PlacementHint::from_params(params)?,
            boot: BootRequest::from_params(params)?,
        })
    }
}

/// The coordinates a bus accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Shape {
    Pci { slots: u8 },
    Ccw,
    Mmio { transports: u8 },
    Units { count: u8 },
    /// Ports numbered from 1.
    Ports { count: u8 },
    Scsi { targets: u16, luns: u16 },
}

impl Shape {
    fn capacity(&self) -> u32 {
        match *self {
            Shape::Pci { slots } => u32::from(slots),
            Shape::Ccw => 0xffff,
            Shape::Mmio { transports } => u32::from(transports),
            Shape::Units { count } | Shape::Ports { count } => u32::from(count),
            Shape::Scsi { targets, luns } => {
                u32::from(targets) * u32::from(luns)
            }
        }
    }

    fn contains(&self, coordinate: &Coordinate) -> bool {
        match (*self, coordinate) {
            (Shape::Pci { slots }, Coordinate::Pci { addr }) => {
                addr.slot() < slots
            }
            (Shape::Ccw, Coordinate::Ccw { devno }) => *devno <= 0xfffe,
            (Shape::Mmio { transports }, Coordinate::Mmio { transport }) => {
                *transport < transports
            }
            (Shape::Units { count }, Coordinate::Unit { unit }) => {
                *unit < count
            }
            (Shape::Ports { count }, Coordinate::Port { port }) => {
                (1..=count).contains(port)
            }
            (
                Shape::Scsi { targets, luns },
                Coordinate::Scsi { target, lun },
            ) => *target < targets && *lun < luns,
            _ => false,
        }
    }
}

struct BusNode {
    bus: Bus,
    shape: Shape,
    claims: BTreeMap<Coordinate, String>,
}

impl BusNode {
    fn new(bus: Bus, shape: Shape) -> Self {
        Self { bus, shape, claims: BTreeMap::new() }
    }

    fn slot_used(&self, slot: u8) -> Option<&str> {
        (0..8)
            .filter_map(|f| PciAddress::new(slot, f).ok())
            .find_map(|addr| self.claims.get(&Coordinate::Pci { addr }))
            .map(String::as_str)
    }

    /// The device occupying `coordinate`. A PCI slot whose function 0 is
    /// claimed by a multi-function-incapable owner is treated as occupied
    /// for every function.
    fn holder(&self, coordinate: &Coordinate) -> Option<&str> {
        if let Some(owner) = self.claims.get(coordinate) {
            return Some(owner);
        }
        match coordinate {
            Coordinate::Pci { addr } if addr.function() != 0 => {
                let addr = PciAddress::new(addr.slot(), 0).ok()?;
                self.claims.get(&Coordinate::Pci { addr }).map(String::as_str)
            }
            _ => None,
        }
    }

    fn free_pci_slots(&self) -> Vec<u8> {
        match self.shape {
            Shape::Pci { slots } => {
                (0..slots).filter(|s| self.slot_used(*s).is_none()).collect()
            }
            _ => Vec::new(),
        }
    }

    fn first_free(&self) -> Option<Coordinate> {
        self.first_free_where(|_| true)
    }

    fn first_free_where(
        &self,
        accept: impl Fn(&Coordinate) -> bool,
    ) -> Option<Coordinate> {
        let free = |c: &Coordinate| !self.claims.contains_key(c) && accept(c);
        match self.shape {
            Shape::Pci { .. } => self
                .free_pci_slots()
                .into_iter()
                .filter_map(|s| PciAddress::new(s, 0).ok())
                .map(|addr| Coordinate::Pci { addr })
                .find(|c| accept(c)),
            Shape::Ccw => (0..=0xfffe)
                .map(|devno| Coordinate::Ccw { devno })
                .find(free),
            Shape::Mmio { transports } => (0..transports)
                .map(|transport| Coordinate::Mmio { transport })
                .find(free),
            Shape::Units { count } => {
                (0..count).map(|unit| Coordinate::Unit { unit }).find(free)
            }
            Shape::Ports { count } => {
                (1..=count).map(|port| Coordinate::Port { port }).find(free)
            }
            Shape::Scsi { targets, luns } => (0..luns)
                .flat_map(|lun| {
                    (0..targets)
                        .map(move |target| Coordinate::Scsi { target, lun })
                })
                .find(free),
        }
    }
}

/// Capabilities and limits that shape allocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// `pcie-root-port` is available.
    pub root_ports: bool,
    /// `pcie-pci-bridge` is available.
    pub pcie_pci_bridge: bool,
    pub scsi_max_targets: Option<u16>,
    pub scsi_max_luns: Option<u16>,
}

const ISA_BUS: &str = "isa.0";
const PIIX_FLOPPY_BUS: &str = "floppy-bus.0";
const MAX_PCI_BRIDGES: u32 = 255;

/// Per-compilation bus occupancy and controller insertion.
pub struct BusAllocator {
    log: Logger,
    family: MachineFamily,
    machine: String,
    config: AllocatorConfig,
    buses: Vec<BusNode>,
    controllers: Vec<Controller>,
    root: BusId,

    /// Flat PCI buses in chain order: the root bus, then each `pci-bridge-N`.
    pci_chain: Vec<BusId>,
    root_ports: u32,
    pcie_pci_bridge: Option<BusId>,

    /// SCSI HBA buses per driver, in instance order.
    hbas: BTreeMap<String, Vec<BusId>>,
    ide_buses: Vec<BusId>,
    ahci_buses: Vec<BusId>,
    usb: Vec<(String, BusId)>,
    floppy_bus: Option<BusId>,
    virtio_serial_bus: Option<BusId>,

    boot_indices: BTreeMap<u32, String>,
}

impl BusAllocator {
    pub fn new(
        log: &Logger,
        family: MachineFamily,
        machine: &str,
        config: AllocatorConfig,
    ) -> Self {
        let root = match family {
            MachineFamily::I440fx | MachineFamily::Pseries => {
                BusId::new("pci.0")
            }
            MachineFamily::Q35 | MachineFamily::ArmVirt { mmio: false } => {
                BusId::new("pcie.0")
            }
            MachineFamily::S390Ccw => BusId::new("virtual-css"),
            MachineFamily::ArmVirt { mmio: true } | MachineFamily::Microvm => {
                BusId::new("virtio-mmio-bus")
            }
        };

        let mut alloc = Self {
            log: log.new(slog::o!("component" => "bus-allocator")),
            family,
            machine: machine.to_owned(),
            config,
            buses: Vec::new(),
            controllers: Vec::new(),
            root: root.clone(),
            pci_chain: Vec::new(),
            root_ports: 0,
            pcie_pci_bridge: None,
            hbas: BTreeMap::new(),
            ide_buses: Vec::new(),
            ahci_buses: Vec::new(),
            usb: Vec::new(),
            floppy_bus: None,
            virtio_serial_bus: None,
            boot_indices: BTreeMap::new(),
        };

        let slots = Shape::Pci { slots: PCI_SLOTS_PER_BUS };
        match family {
            MachineFamily::I440fx => {
                alloc.add_bus(root.clone(), BusKind::PciRoot, slots, None);
                alloc.reserve_slot(&root, 0, "i440fx-host");
                alloc.reserve_slot(&root, 1, "piix3");
                alloc.pci_chain.push(root);
                for n in 0..2 {
                    let id = BusId::new(format!("ide.{n}"));
                    alloc.add_bus(
                        id.clone(),
                        BusKind::Ide,
                        Shape::Units { count: 2 },
                        None,
                    );
                    alloc.ide_buses.push(id);
                }
                let fdc = BusId::new(PIIX_FLOPPY_BUS);
                alloc.add_bus(
                    fdc.clone(),
                    BusKind::Floppy,
                    Shape::Units { count: 2 },
                    None,
                );
                alloc.floppy_bus = Some(fdc);
                alloc.add_isa_bus();
            }
            MachineFamily::Q35 => {
                alloc.add_bus(root.clone(), BusKind::PcieRoot, slots, None);
                alloc.reserve_slot(&root, 0, "q35-host");
                alloc.reserve_slot(&root, 0x1f, "ich9-lpc");
                for n in 0..6 {
                    let id = BusId::new(format!("ide.{n}"));
                    alloc.add_bus(
                        id.clone(),
                        BusKind::Ide,
                        Shape::Units { count: 1 },
                        None,
                    );
                    alloc.ide_buses.push(id);
                }
                alloc.ahci_buses = alloc.ide_buses.clone();
                alloc.add_isa_bus();
            }
            MachineFamily::ArmVirt { mmio: false } => {
                alloc.add_bus(root.clone(), BusKind::PcieRoot, slots, None);
                alloc.reserve_slot(&root, 0, "gpex-pcihost");
            }
            MachineFamily::Pseries => {
                alloc.add_bus(root.clone(), BusKind::PciRoot, slots, None);
                alloc.reserve_slot(&root, 0, "spapr-pci-host-bridge");
                alloc.pci_chain.push(root);
            }
            MachineFamily::S390Ccw => {
                alloc.add_bus(root, BusKind::Ccw, Shape::Ccw, None);
            }
            MachineFamily::ArmVirt { mmio: true } => {
                alloc.add_bus(
                    root,
                    BusKind::VirtioMmio,
                    Shape::Mmio { transports: 32 },
                    None,
                );
            }
            MachineFamily::Microvm => {
                alloc.add_bus(
                    root,
                    BusKind::VirtioMmio,
                    Shape::Mmio { transports: 24 },
                    None,
                );
                alloc.add_isa_bus();
            }
        }

        alloc
    }

    fn add_isa_bus(&mut self) {
        self.add_bus(
            BusId::new(ISA_BUS),
            BusKind::IsaSerial,
            Shape::Units { count: 4 },
            None,
        );
    }

    fn add_bus(
        &mut self,
        id: BusId,
        kind: BusKind,
        shape: Shape,
        controller: Option<&str>,
    ) {
        let bus = Bus {
            id,
            kind,
            capacity: shape.capacity(),
            controller: controller.map(str::to_owned),
        };
        self.buses.push(BusNode::new(bus, shape));
    }

    fn reserve_slot(&mut self, bus: &BusId, slot: u8, owner: &str) {
        if let (Some(node), Ok(addr)) =
            (self.node_mut(bus), PciAddress::new(slot, 0))
        {
            node.claims.insert(Coordinate::Pci { addr }, owner.to_owned());
        }
    }

    fn node(&self, bus: &BusId) -> Option<&BusNode> {
        self.buses.iter().find(|n| n.bus.id == *bus)
    }

    fn node_mut(&mut self, bus: &BusId) -> Option<&mut BusNode> {
        self.buses.iter_mut().find(|n| n.bus.id == *bus)
    }

    fn unknown_bus(device: &str, bus: &str) -> CompileError {
        AddressCollisionError::UnknownBus {
            device: device.to_owned(),
            bus: bus.to_owned(),
        }
        .into()
    }

    fn unsupported(&self, what: impl Into<String>) -> CompileError {
        UnsupportedDeviceError::machine(what, &self.machine).into()
    }

    /// Claims `coordinate` on `bus` for `owner`.
    fn claim(
        &mut self,
        owner: &str,
        bus: &BusId,
        coordinate: Coordinate,
    ) -> Result<Placement, CompileError> {
        let node = self
            .node_mut(bus)
            .ok_or_else(|| Self::unknown_bus(owner, bus.as_str()))?;
        if !node.shape.contains(&coordinate) {
            return Err(AddressCollisionError::OutOfRange {
                device: owner.to_owned(),
                bus: bus.clone(),
                coordinate,
            }
            .into());
        }

        let placement = Placement { bus: bus.clone(), coordinate };
        if let Some(holder) = node.holder(&coordinate) {
            return Err(AddressCollisionError::InUse {
                device: owner.to_owned(),
                placement,
                owner: holder.to_owned(),
            }
            .into());
        }

        node.claims.insert(coordinate, owner.to_owned());
        Ok(placement)
    }

    /// Claims an explicitly requested IDE or floppy unit.
    fn claim_unit(
        &mut self,
        owner: &str,
        bus: &BusId,
        unit: u16,
    ) -> Result<Placement, CompileError> {
        match u8::try_from(unit) {
            Ok(unit) => self.claim(owner, bus, Coordinate::Unit { unit }),
            Err(_) => Err(AddressCollisionError::UnitOutOfRange {
                device: owner.to_owned(),
                bus: bus.clone(),
                unit,
            }
            .into()),
        }
    }

    /// Claims the first free coordinate on `bus`.
    fn claim_next(
        &mut self,
        owner: &str,
        bus: &BusId,
    ) -> Result<Placement, CompileError> {
        let coordinate = self
            .node(bus)
            .ok_or_else(|| Self::unknown_bus(owner, bus.as_str()))?
            .first_free()
            .ok_or_else(|| ResourceLimitError::BusExhausted {
                bus: bus.to_string(),
            })?;
        self.claim(owner, bus, coordinate)
    }

    fn add_controller(
        &mut self,
        id: &str,
        driver: &str,
        placement: Option<Placement>,
        kind: ControllerKind,
        buses: Vec<(BusId, BusKind, Shape)>,
    ) {
        info!(self.log, "inserting controller";
              "id" => id, "driver" => driver);
        let ids = buses.iter().map(|(id, _, _)| id.clone()).collect();
        for (bus, kind, shape) in buses {
            self.add_bus(bus, kind, shape, Some(id));
        }
        self.controllers.push(Controller {
            id: id.to_owned(),
            driver: driver.to_owned(),
            placement,
            kind,
            buses: ids,
        });
    }

    /// Places `owner` according to `request`, returning `None` for devices
    /// that do not sit on a bus.
    pub fn place(
        &mut self,
        owner: &str,
        request: &BusRequest,
        hint: &PlacementHint,
    ) -> Result<Option<Placement>, CompileError> {
        let placement = match request {
            BusRequest::None => return Ok(None),
            BusRequest::Pci(kind) => self.place_pci(owner, *kind, hint)?,
            BusRequest::Virtio => self.place_virtio(owner, hint)?,
            BusRequest::Scsi(family) => self.place_scsi(owner, *family, hint)?,
            BusRequest::Ide => self.place_ide(owner, false, hint)?,
            BusRequest::Ahci => self.place_ide(owner, true, hint)?,
            BusRequest::Usb { controller } => {
                self.place_usb(owner, controller.as_deref(), hint)?
            }
            BusRequest::Floppy => self.place_floppy(owner, hint)?,
            BusRequest::IsaSerial => self.place_isa_serial(owner)?,
            BusRequest::VirtioSerial => self.place_virtio_serial(owner)?,
        };

        debug!(self.log, "placed device";
               "device" => owner,
               "bus" => %placement.bus,
               "coordinate" => %placement.coordinate);
        Ok(Some(placement))
    }

    fn has_pci(&self) -> bool {
        !matches!(
            self.family,
            MachineFamily::S390Ccw
                | MachineFamily::Microvm
                | MachineFamily::ArmVirt { mmio: true }
        )
    }

    fn place_virtio(
        &mut self,
        owner: &str,
        hint: &PlacementHint,
    ) -> Result<Placement, CompileError> {
        match self.family.virtio_transport() {
            VirtioTransport::Pci => {
                self.place_pci(owner, PciKind::Express, hint)
            }
            VirtioTransport::Ccw | VirtioTransport::Mmio => {
                let root = self.root.clone();
                self.claim_next(owner, &root)
            }
        }
    }

    fn place_pci(
        &mut self,
        owner: &str,
        kind: PciKind,
        hint: &PlacementHint,
    ) -> Result<Placement, CompileError> {
        if !self.has_pci() {
            return Err(self.unsupported(format!("PCI device {owner}")));
        }

        if hint.pci_bus.is_some() || hint.pci_addr.is_some() {
            let bus = hint
                .pci_bus
                .as_deref()
                .map(BusId::new)
                .unwrap_or_else(|| self.root.clone());
            let is_pci = self
                .node(&bus)
                .ok_or_else(|| Self::unknown_bus(owner, bus.as_str()))?
                .bus
                .kind
                .is_pci();
            if !is_pci {
                return Err(Self::unknown_bus(owner, bus.as_str()));
            }
            return match hint.pci_addr {
                Some(addr) => self.claim(owner, &bus, Coordinate::Pci { addr }),
                None => self.claim_next(owner, &bus),
            };
        }

        if !self.family.is_express() {
            return self.place_flat(owner);
        }

        let root = self.root.clone();
        match kind {
            PciKind::Express if self.config.root_ports => {
                let port = self.add_root_port()?;
                self.claim_next(owner, &port)
            }
            PciKind::Conventional if self.config.pcie_pci_bridge => {
                let bridge = self.pcie_pci_bridge()?;
                self.claim_next(owner, &bridge)
            }
            _ => self.claim_next(owner, &root),
        }
    }

    /// Inserts `pcie-root-port-N` on the root complex and returns its bus.
    fn add_root_port(&mut self) -> Result<BusId, CompileError> {
        let n = self.root_ports;
        let id = format!("pcie-root-port-{n}");
        let root = self.root.clone();
        let placement = self.claim_next(&id, &root)?;
        let chassis = u8::try_from(n + 1).map_err(|_| {
            ResourceLimitError::BusExhausted { bus: root.to_string() }
        })?;
        self.root_ports += 1;

        let bus = BusId::new(id.as_str());
        self.add_controller(
            &id,
            "pcie-root-port",
            Some(placement),
            ControllerKind::PcieRootPort { chassis, port: chassis },
            vec![(bus.clone(), BusKind::PcieRootPort, Shape::Pci { slots: 1 })],
        );
        Ok(bus)
    }

    /// Returns the bus of the machine's PCIe-to-PCI bridge, inserting the
    /// bridge (behind a root port of its own) on first use.
    fn pcie_pci_bridge(&mut self) -> Result<BusId, CompileError> {
        if let Some(bus) = &self.pcie_pci_bridge {
            return Ok(bus.clone());
        }

        let id = "pcie-pci-bridge-0";
        let parent = if self.config.root_ports {
            self.add_root_port()?
        } else {
            self.root.clone()
        };
        let placement = self.claim_next(id, &parent)?;
        let bus = BusId::new(id);
        self.add_controller(
            id,
            "pcie-pci-bridge",
            Some(placement),
            ControllerKind::PciePciBridge,
            vec![(
                bus.clone(),
                BusKind::PciePciBridge,
                Shape::Pci { slots: PCI_SLOTS_PER_BUS },
            )],
        );
        self.reserve_slot(&bus, 0, id);
        self.pcie_pci_bridge = Some(bus.clone());
        Ok(bus)
    }

    /// Places a device on a flat PCI hierarchy. The last free slot of the
    /// newest bus is kept for the bridge that extends the chain.
    fn place_flat(&mut self, owner: &str) -> Result<Placement, CompileError> {
        let newest =
            self.pci_chain.last().cloned().unwrap_or(self.root.clone());
        let mut target = None;
        for bus in self.pci_chain.iter() {
            let free = self.node(bus).map(BusNode::free_pci_slots);
            let Some(free) = free else { continue };
            if free.is_empty() || (*bus == newest && free.len() == 1) {
                continue;
            }
            target = Some(bus.clone());
            break;
        }

        if let Some(bus) = target {
            return self.claim_next(owner, &bus);
        }

        let n = self.pci_chain.len() as u32 - 1;
        let last_slot = self
            .node(&newest)
            .and_then(|node| node.free_pci_slots().last().copied())
            .filter(|_| n < MAX_PCI_BRIDGES)
            .ok_or_else(|| ResourceLimitError::BusExhausted {
                bus: newest.to_string(),
            })?;
        let chassis_nr = u8::try_from(n + 1).map_err(|_| {
            ResourceLimitError::BusExhausted { bus: newest.to_string() }
        })?;

        let id = format!("pci-bridge-{n}");
        let addr = PciAddress::new(last_slot, 0).map_err(|_| {
            ResourceLimitError::BusExhausted { bus: newest.to_string() }
        })?;
        let placement = self.claim(&id, &newest, Coordinate::Pci { addr })?;
        let bus = BusId::new(id.as_str());
        self.add_controller(
            &id,
            "pci-bridge",
            Some(placement),
            ControllerKind::PciBridge { chassis_nr },
            vec![(
                bus.clone(),
                BusKind::PciBridge,
                Shape::Pci { slots: PCI_SLOTS_PER_BUS },
            )],
        );
        self.reserve_slot(&bus, 0, &id);
        self.pci_chain.push(bus.clone());
        self.claim_next(owner, &bus)
    }

    fn hba_driver(&self, family: HbaFamily) -> Result<String, CompileError> {
        match family {
            HbaFamily::VirtioScsi => {
                Ok(self.family.virtio_transport().driver("virtio-scsi"))
            }
            HbaFamily::Lsi if self.has_pci() => Ok("lsi53c895a".to_owned()),
            HbaFamily::Lsi => Err(self.unsupported("lsi53c895a")),
        }
    }

    fn add_hba(
        &mut self,
        family: HbaFamily,
        driver: &str,
    ) -> Result<BusId, CompileError> {
        let n = self.hbas.get(driver).map_or(0, Vec::len);
        let id = format!("{}{n}", driver.replace('-', "_"));
        let parent = match family {
            HbaFamily::VirtioScsi => BusRequest::Virtio,
            HbaFamily::Lsi => BusRequest::Pci(PciKind::Conventional),
        };
        let placement = self.place(&id, &parent, &PlacementHint::default())?;

        let (default_targets, default_luns) = family.default_geometry();
        let max_targets =
            self.config.scsi_max_targets.unwrap_or(default_targets);
        let max_luns = self.config.scsi_max_luns.unwrap_or(default_luns);
        let bus = BusId::new(format!("{id}.0"));
        self.add_controller(
            &id,
            driver,
            placement,
            ControllerKind::ScsiHba { family, max_targets, max_luns },
            vec![(
                bus.clone(),
                BusKind::Scsi,
                Shape::Scsi { targets: max_targets, luns: max_luns },
            )],
        );
        self.hbas.entry(driver.to_owned()).or_default().push(bus.clone());
        Ok(bus)
    }

    fn place_scsi(
        &mut self,
        owner: &str,
        family: HbaFamily,
        hint: &PlacementHint,
    ) -> Result<Placement, CompileError> {
        let driver = self.hba_driver(family)?;
        let target = hint.drive_unit;
        let lun = hint.drive_port;

        // Explicit coordinates without a controller index refer to HBA 0.
        let pinned = hint
            .drive_bus
            .or_else(|| (target.is_some() || lun.is_some()).then_some(0));
        let candidates = match pinned {
            Some(index) => {
                while self.hbas.get(&driver).map_or(0, Vec::len)
                    <= index as usize
                {
                    self.add_hba(family, &driver)?;
                }
                let bus = self
                    .hbas
                    .get(&driver)
                    .and_then(|buses| buses.get(index as usize))
                    .cloned()
                    .ok_or_else(|| Self::unknown_bus(owner, &driver))?;
                vec![bus]
            }
            None => self.hbas.get(&driver).cloned().unwrap_or_default(),
        };

        if let (Some(target), Some(lun), [bus]) =
            (target, lun, candidates.as_slice())
        {
            return self.claim(owner, bus, Coordinate::Scsi { target, lun });
        }

        let accept = |c: &Coordinate| match c {
            Coordinate::Scsi { target: t, lun: l } => {
                target.map_or(true, |v| v == *t)
                    && lun.map_or(true, |v| v == *l)
            }
            _ => false,
        };

        for bus in candidates.iter() {
            let free = self.node(bus).and_then(|n| n.first_free_where(accept));
            if let Some(coordinate) = free {
                return self.claim(owner, bus, coordinate);
            }
        }

        if pinned.is_some() {
            let bus = candidates.first().cloned().unwrap_or(self.root.clone());
            return Err(ResourceLimitError::BusExhausted {
                bus: bus.to_string(),
            }
            .into());
        }

        let bus = self.add_hba(family, &driver)?;
        let coordinate = self
            .node(&bus)
            .and_then(|n| n.first_free_where(accept))
            .ok_or_else(|| {
                CompileError::from(AddressCollisionError::OutOfRange {
                    device: owner.to_owned(),
                    bus: bus.clone(),
                    coordinate: Coordinate::Scsi {
                        target: target.unwrap_or(0),
                        lun: lun.unwrap_or(0),
                    },
                })
            })?;
        self.claim(owner, &bus, coordinate)
    }

    fn place_ide(
        &mut self,
        owner: &str,
        ahci: bool,
        hint: &PlacementHint,
    ) -> Result<Placement, CompileError> {
        let buses = match self.family {
            MachineFamily::Q35 | MachineFamily::I440fx if !ahci => {
                self.ide_buses.clone()
            }
            MachineFamily::Q35 => self.ahci_buses.clone(),
            MachineFamily::I440fx | MachineFamily::ArmVirt { mmio: false }
                if ahci =>
            {
                self.ahci_buses()?
            }
            _ => {
                let what = if ahci { "AHCI" } else { "IDE" };
                return Err(self.unsupported(format!("{what} drive {owner}")));
            }
        };

        if let Some(index) = hint.drive_bus {
            let bus = buses
                .get(index as usize)
                .cloned()
                .ok_or_else(|| {
                    Self::unknown_bus(owner, &format!("ide.{index}"))
                })?;
            return match hint.drive_unit {
                Some(unit) => self.claim_unit(owner, &bus, unit),
                None => self.claim_next(owner, &bus),
            };
        }

        let free = buses.iter().find_map(|bus| {
            self.node(bus)?.first_free().map(|c| (bus.clone(), c))
        });
        match free {
            Some((bus, coordinate)) => self.claim(owner, &bus, coordinate),
            None => Err(ResourceLimitError::BusExhausted {
                bus: if ahci { "ahci" } else { "ide" }.to_owned(),
            }
            .into()),
        }
    }

    /// Returns the buses of the AHCI controller, inserting `ahci0` on
    /// machines without a built-in one.
    fn ahci_buses(&mut self) -> Result<Vec<BusId>, CompileError> {
        if !self.ahci_buses.is_empty() {
            return Ok(self.ahci_buses.clone());
        }

        let id = "ahci0";
        let placement = self.place(
            id,
            &BusRequest::Pci(PciKind::Integrated),
            &PlacementHint::default(),
        )?;
        let buses: Vec<BusId> =
            (0..6).map(|n| BusId::new(format!("{id}.{n}"))).collect();
        self.add_controller(
            id,
            "ich9-ahci",
            placement,
            ControllerKind::Ahci,
            buses
                .iter()
                .map(|b| (b.clone(), BusKind::Ide, Shape::Units { count: 1 }))
                .collect(),
        );
        self.ahci_buses = buses.clone();
        Ok(buses)
    }

    /// Adds a USB host controller with `ports` root ports.
    pub fn add_usb_controller(
        &mut self,
        id: &str,
        model: &str,
        ports: u8,
        hint: &PlacementHint,
    ) -> Result<(), CompileError> {
        let kind = if model.contains("xhci") {
            PciKind::Express
        } else {
            PciKind::Conventional
        };
        let placement = self.place(id, &BusRequest::Pci(kind), hint)?;
        let bus = BusId::new(format!("{id}.0"));
        self.add_controller(
            id,
            model,
            placement,
            ControllerKind::Usb { model: model.to_owned() },
            vec![(bus.clone(), BusKind::Usb, Shape::Ports { count: ports })],
        );
        self.usb.push((model.to_owned(), bus));
        Ok(())
    }

    fn place_usb(
        &mut self,
        owner: &str,
        controller: Option<&str>,
        hint: &PlacementHint,
    ) -> Result<Placement, CompileError> {
        if self.usb.is_empty() {
            let hint = PlacementHint::default();
            self.add_usb_controller("usb0", "qemu-xhci", 4, &hint)?;
        }

        let candidates: Vec<BusId> = match &hint.usb_bus {
            Some(bus) => {
                let id = BusId::new(bus.as_str());
                if !self.usb.iter().any(|(_, b)| *b == id) {
                    return Err(Self::unknown_bus(owner, bus));
                }
                vec![id]
            }
            None => self
                .usb
                .iter()
                .filter(|(model, _)| {
                    controller.map_or(true, |c| model.contains(c))
                })
                .map(|(_, bus)| bus.clone())
                .collect(),
        };

        if candidates.is_empty() {
            return Err(self.unsupported(format!(
                "USB device {owner} on a {} controller",
                controller.unwrap_or("USB")
            )));
        }

        if let Some(port) = hint.usb_port {
            return self.claim(owner, &candidates[0], Coordinate::Port { port });
        }

        let free = candidates.iter().find_map(|bus| {
            self.node(bus)?.first_free().map(|c| (bus.clone(), c))
        });
        match free {
            Some((bus, coordinate)) => self.claim(owner, &bus, coordinate),
            None => Err(ResourceLimitError::BusExhausted {
                bus: candidates[0].to_string(),
            }
            .into()),
        }
    }

    fn place_floppy(
        &mut self,
        owner: &str,
        hint: &PlacementHint,
    ) -> Result<Placement, CompileError> {
        let bus = if let Some(bus) = self.floppy_bus.clone() {
            bus
        } else if self.family == MachineFamily::Q35 {
            let id = "fdc0";
            let bus = BusId::new(format!("{id}.0"));
            self.add_controller(
                id,
                "isa-fdc",
                None,
                ControllerKind::Fdc,
                vec![(bus.clone(), BusKind::Floppy, Shape::Units { count: 2 })],
            );
            self.floppy_bus = Some(bus.clone());
            bus
        } else {
            return Err(self.unsupported(format!("floppy {owner}")));
        };

        match hint.drive_unit {
            Some(unit) => self.claim_unit(owner, &bus, unit),
            None => self.claim_next(owner, &bus),
        }
    }

    fn place_isa_serial(
        &mut self,
        owner: &str,
    ) -> Result<Placement, CompileError> {
        let bus = BusId::new(ISA_BUS);
        if self.node(&bus).is_none() {
            return Err(self.unsupported(format!("ISA serial port {owner}")));
        }
        self.claim_next(owner, &bus)
    }

    fn place_virtio_serial(
        &mut self,
        owner: &str,
    ) -> Result<Placement, CompileError> {
        let bus = match self.virtio_serial_bus.clone() {
            Some(bus) => bus,
            None => {
                let id = "virtio_serial0";
                let driver =
                    self.family.virtio_transport().driver("virtio-serial");
                let hint = PlacementHint::default();
                let placement = self.place(id, &BusRequest::Virtio, &hint)?;
                let bus = BusId::new(format!("{id}.0"));
                self.add_controller(
                    id,
                    &driver,
                    placement,
                    ControllerKind::VirtioSerial { max_ports: 31 },
                    vec![(
                        bus.clone(),
                        BusKind::VirtioSerial,
                        Shape::Ports { count: 31 },
                    )],
                );
                self.virtio_serial_bus = Some(bus.clone());
                bus
            }
        };
        self.claim_next(owner, &bus)
    }

    /// Assigns a boot index to `owner`.
    pub fn claim_boot_index(
        &mut self,
        owner: &str,
        request: BootRequest,
    ) -> Result<Option<u32>, CompileError> {
        let index = match request {
            BootRequest::None => return Ok(None),
            BootRequest::Next => (0..)
                .find(|i| !self.boot_indices.contains_key(i))
                .unwrap_or(u32::MAX),
            BootRequest::Explicit(index) => {
                if let Some(holder) = self.boot_indices.get(&index) {
                    return Err(AddressCollisionError::BootIndexInUse {
                        device: owner.to_owned(),
                        index,
                        owner: holder.clone(),
                    }
                    .into());
                }
                index
            }
        };

        self.boot_indices.insert(index, owner.to_owned());
        Ok(Some(index))
    }

    /// Consumes the allocator, returning every bus and inserted controller
    /// in creation order.
    pub fn into_parts(self) -> (Vec<Bus>, Vec<Controller>) {
        (self.buses.into_iter().map(|n| n.bus).collect(), self.controllers)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_logger;
    use proptest::prelude::*;
    use std::collections::BTreeSet;

    fn express() -> AllocatorConfig {
        AllocatorConfig {
            root_ports: true,
            pcie_pci_bridge: true,
            ..Default::default()
        }
    }

    fn q35(config: AllocatorConfig) -> BusAllocator {
        BusAllocator::new(&test_logger(), MachineFamily::Q35, "q35", config)
    }

    fn pci(slot: u8) -> Coordinate {
        Coordinate::Pci { addr: PciAddress::new(slot, 0).unwrap() }
    }

    fn place(
        alloc: &mut BusAllocator,
        owner: &str,
        request: BusRequest,
    ) -> Placement {
        alloc
            .place(owner, &request, &PlacementHint::default())
            .unwrap()
            .unwrap()
    }

    #[test]
    fn express_endpoints_get_root_ports() {
        let mut alloc = q35(express());
        let a = place(&mut alloc, "disk0", BusRequest::Virtio);
        let b = place(&mut alloc, "nic0", BusRequest::Virtio);
        assert_eq!(a.bus.as_str(), "pcie-root-port-0");
        assert_eq!(a.coordinate, pci(0));
        assert_eq!(b.bus.as_str(), "pcie-root-port-1");

        let (_, controllers) = alloc.into_parts();
        assert_eq!(controllers.len(), 2);
        assert_eq!(
            controllers[1].kind,
            ControllerKind::PcieRootPort { chassis: 2, port: 2 }
        );
        assert_eq!(
            controllers[0].placement.as_ref().unwrap().coordinate,
            pci(1)
        );
    }

    #[test]
    fn conventional_devices_share_one_bridge() {
        let mut alloc = q35(express());
        let conventional = BusRequest::Pci(PciKind::Conventional);
        let a = place(&mut alloc, "nic0", conventional.clone());
        let b = place(&mut alloc, "nic1", conventional);
        assert_eq!(a.bus.as_str(), "pcie-pci-bridge-0");
        assert_eq!(a.coordinate, pci(1));
        assert_eq!(b.bus.as_str(), "pcie-pci-bridge-0");
        assert_eq!(b.coordinate, pci(2));

        let (_, controllers) = alloc.into_parts();
        let bridges = controllers
            .iter()
            .filter(|c| c.kind == ControllerKind::PciePciBridge)
            .count();
        assert_eq!(bridges, 1);
    }

    #[test]
    fn flat_root_chains_bridges() {
        let mut alloc = BusAllocator::new(
            &test_logger(),
            MachineFamily::I440fx,
            "pc",
            AllocatorConfig::default(),
        );

        // Slots 2-30 of pci.0; slot 31 is kept for the first bridge.
        for n in 0..29 {
            let p = place(&mut alloc, &format!("dev{n}"), BusRequest::Virtio);
            assert_eq!(p.bus.as_str(), "pci.0");
            assert_eq!(p.coordinate, pci(n + 2));
        }

        let p = place(&mut alloc, "dev29", BusRequest::Virtio);
        assert_eq!(p.bus.as_str(), "pci-bridge-0");
        assert_eq!(p.coordinate, pci(1));

        let (buses, controllers) = alloc.into_parts();
        let bridge =
            controllers.iter().find(|c| c.id == "pci-bridge-0").unwrap();
        assert_eq!(bridge.placement.as_ref().unwrap().coordinate, pci(31));
        assert_eq!(bridge.kind, ControllerKind::PciBridge { chassis_nr: 1 });
        assert!(buses.iter().any(|b| b.id.as_str() == "pci-bridge-0"));
    }

    #[test]
    fn explicit_addresses_are_validated() {
        let mut alloc = BusAllocator::new(
            &test_logger(),
            MachineFamily::I440fx,
            "pc",
            AllocatorConfig::default(),
        );
        let hint = PlacementHint {
            pci_addr: Some(PciAddress::new(5, 0).unwrap()),
            ..Default::default()
        };
        let p = alloc.place("a", &BusRequest::Virtio, &hint).unwrap().unwrap();
        assert_eq!(p.coordinate, pci(5));

        let err = alloc.place("b", &BusRequest::Virtio, &hint).unwrap_err();
        assert!(matches!(
            err,
            CompileError::AddressCollision(AddressCollisionError::InUse { .. })
        ));

        let host = PlacementHint {
            pci_addr: Some(PciAddress::new(0, 3).unwrap()),
            ..Default::default()
        };
        assert!(alloc.place("c", &BusRequest::Virtio, &host).is_err());

        let missing = PlacementHint {
            pci_bus: Some("pci.7".to_owned()),
            ..Default::default()
        };
        assert!(matches!(
            alloc.place("d", &BusRequest::Virtio, &missing),
            Err(CompileError::AddressCollision(
                AddressCollisionError::UnknownBus { .. }
            ))
        ));

        // Auto placement skips the explicitly claimed slot.
        for n in 2..5 {
            let p = place(&mut alloc, "e", BusRequest::Virtio);
            assert_eq!(p.coordinate, pci(n));
        }
        let p = place(&mut alloc, "f", BusRequest::Virtio);
        assert_eq!(p.coordinate, pci(6));
    }

    #[test]
    fn scsi_hbas_are_numbered_per_family() {
        let config = AllocatorConfig {
            scsi_max_targets: Some(1),
            scsi_max_luns: Some(1),
            ..express()
        };
        let mut alloc = q35(config);
        let virtio = BusRequest::Scsi(HbaFamily::VirtioScsi);
        let a = place(&mut alloc, "stg0", virtio.clone());
        let b = place(&mut alloc, "stg1", virtio);
        let c = place(&mut alloc, "stg2", BusRequest::Scsi(HbaFamily::Lsi));
        assert_eq!(a.bus.as_str(), "virtio_scsi_pci0.0");
        assert_eq!(b.bus.as_str(), "virtio_scsi_pci1.0");
        assert_eq!(c.bus.as_str(), "lsi53c895a0.0");
        assert_eq!(a.coordinate, Coordinate::Scsi { target: 0, lun: 0 });

        let (_, controllers) = alloc.into_parts();
        let hba = controllers.iter().find(|c| c.id == "lsi53c895a0").unwrap();
        assert_eq!(
            hba.placement.as_ref().unwrap().bus.as_str(),
            "pcie-pci-bridge-0"
        );
    }

    #[test]
    fn scsi_targets_fill_before_luns() {
        let mut alloc = BusAllocator::new(
            &test_logger(),
            MachineFamily::S390Ccw,
            "s390-ccw-virtio",
            AllocatorConfig::default(),
        );
        let a = place(&mut alloc, "a", BusRequest::Scsi(HbaFamily::VirtioScsi));
        let b = place(&mut alloc, "b", BusRequest::Scsi(HbaFamily::VirtioScsi));
        assert_eq!(a.bus.as_str(), "virtio_scsi_ccw0.0");
        assert_eq!(b.coordinate, Coordinate::Scsi { target: 1, lun: 0 });

        let hint = PlacementHint {
            drive_unit: Some(1),
            drive_port: Some(0),
            ..Default::default()
        };
        assert!(alloc
            .place("c", &BusRequest::Scsi(HbaFamily::VirtioScsi), &hint)
            .is_err());
        assert!(alloc
            .place(
                "d",
                &BusRequest::Scsi(HbaFamily::Lsi),
                &PlacementHint::default()
            )
            .is_err());
    }

    #[test]
    fn explicit_scsi_coordinates_pin_the_first_hba() {
        let mut alloc = q35(express());
        let scsi = BusRequest::Scsi(HbaFamily::VirtioScsi);
        let explicit = PlacementHint {
            drive_unit: Some(0),
            drive_port: Some(0),
            ..Default::default()
        };
        let second = PlacementHint { drive_bus: Some(1), ..Default::default() };

        let a = alloc.place("a", &scsi, &explicit).unwrap().unwrap();
        assert_eq!(a.bus.as_str(), "virtio_scsi_pci0.0");
        let c = alloc.place("c", &scsi, &second).unwrap().unwrap();
        assert_eq!(c.bus.as_str(), "virtio_scsi_pci1.0");

        // Two HBAs exist now; the same coordinates still mean HBA 0.
        let err = alloc.place("b", &scsi, &explicit).unwrap_err();
        let CompileError::AddressCollision(AddressCollisionError::InUse {
            placement,
            owner,
            ..
        }) = err
        else {
            panic!("unexpected error: {err}");
        };
        assert_eq!(placement.bus.as_str(), "virtio_scsi_pci0.0");
        assert_eq!(owner, "a");

        // A target alone stays on HBA 0 as well.
        let target =
            PlacementHint { drive_unit: Some(3), ..Default::default() };
        let d = alloc.place("d", &scsi, &target).unwrap().unwrap();
        assert_eq!(d.bus.as_str(), "virtio_scsi_pci0.0");
        assert_eq!(d.coordinate, Coordinate::Scsi { target: 3, lun: 0 });

        let (_, controllers) = alloc.into_parts();
        let hbas = controllers
            .iter()
            .filter(|c| matches!(c.kind, ControllerKind::ScsiHba { .. }))
            .count();
        assert_eq!(hbas, 2);
    }

    #[test]
    fn unit_out_of_range_reports_requested_unit() {
        let mut alloc = BusAllocator::new(
            &test_logger(),
            MachineFamily::I440fx,
            "pc",
            AllocatorConfig::default(),
        );
        let hint =
            PlacementHint { drive_unit: Some(300), ..Default::default() };
        assert_eq!(
            alloc.place("fd0", &BusRequest::Floppy, &hint).unwrap_err(),
            CompileError::AddressCollision(
                AddressCollisionError::UnitOutOfRange {
                    device: "fd0".to_owned(),
                    bus: BusId::new(PIIX_FLOPPY_BUS),
                    unit: 300,
                }
            )
        );

        let hint = PlacementHint {
            drive_bus: Some(0),
            drive_unit: Some(256),
            ..Default::default()
        };
        assert!(matches!(
            alloc.place("cd0", &BusRequest::Ide, &hint),
            Err(CompileError::AddressCollision(
                AddressCollisionError::UnitOutOfRange { unit: 256, .. }
            ))
        ));
    }

    #[test]
    fn ide_usb_and_floppy() {
        let mut alloc = BusAllocator::new(
            &test_logger(),
            MachineFamily::I440fx,
            "pc",
            AllocatorConfig::default(),
        );
        let cd = place(&mut alloc, "cd0", BusRequest::Ide);
        assert_eq!(cd.bus.as_str(), "ide.0");
        assert_eq!(cd.coordinate, Coordinate::Unit { unit: 0 });

        let sata = place(&mut alloc, "sata0", BusRequest::Ahci);
        assert_eq!(sata.bus.as_str(), "ahci0.0");

        let fd = place(&mut alloc, "fd0", BusRequest::Floppy);
        assert_eq!(fd.bus.as_str(), PIIX_FLOPPY_BUS);

        let tablet =
            place(&mut alloc, "tablet", BusRequest::Usb { controller: None });
        assert_eq!(tablet.bus.as_str(), "usb0.0");
        assert_eq!(tablet.coordinate, Coordinate::Port { port: 1 });

        let hint = PlacementHint { usb_port: Some(1), ..Default::default() };
        assert!(alloc
            .place("kbd", &BusRequest::Usb { controller: None }, &hint)
            .is_err());

        let (_, controllers) = alloc.into_parts();
        let ids: Vec<_> = controllers.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["ahci0", "usb0"]);
    }

    #[test]
    fn q35_inserts_fdc_and_mmio_rejects_pci() {
        let mut alloc = q35(express());
        let fd = place(&mut alloc, "fd0", BusRequest::Floppy);
        assert_eq!(fd.bus.as_str(), "fdc0.0");

        let mut alloc = BusAllocator::new(
            &test_logger(),
            MachineFamily::Microvm,
            "microvm",
            AllocatorConfig::default(),
        );
        let v = place(&mut alloc, "v", BusRequest::Virtio);
        assert_eq!(v.coordinate, Coordinate::Mmio { transport: 0 });
        assert!(matches!(
            alloc.place(
                "n",
                &BusRequest::Pci(PciKind::Express),
                &PlacementHint::default()
            ),
            Err(CompileError::UnsupportedDevice(_))
        ));
    }

    #[test]
    fn mmio_transports_run_out() {
        let mut alloc = BusAllocator::new(
            &test_logger(),
            MachineFamily::Microvm,
            "microvm",
            AllocatorConfig::default(),
        );
        for n in 0..24 {
            place(&mut alloc, &format!("d{n}"), BusRequest::Virtio);
        }
        assert!(matches!(
            alloc.place("d24", &BusRequest::Virtio, &PlacementHint::default()),
            Err(CompileError::ResourceLimit(
                ResourceLimitError::BusExhausted { .. }
            ))
        ));
    }

    #[test]
    fn boot_indices() {
        let mut alloc = BusAllocator::new(
            &test_logger(),
            MachineFamily::Q35,
            "q35",
            AllocatorConfig::default(),
        );
        let mut claim = |owner: &str, request: BootRequest| {
            alloc.claim_boot_index(owner, request).unwrap()
        };
        assert_eq!(claim("a", BootRequest::Explicit(0)), Some(0));
        assert_eq!(claim("b", BootRequest::Next), Some(1));
        assert_eq!(claim("c", BootRequest::None), None);
        assert!(matches!(
            alloc.claim_boot_index("d", BootRequest::Explicit(1)),
            Err(CompileError::AddressCollision(
                AddressCollisionError::BootIndexInUse { .. }
            ))
        ));
    }

    fn request_strategy() -> impl Strategy<Value = BusRequest> {
        prop_oneof![
            Just(BusRequest::Virtio),
            Just(BusRequest::Pci(PciKind::Express)),
            Just(BusRequest::Pci(PciKind::Conventional)),
            Just(BusRequest::Pci(PciKind::Integrated)),
            Just(BusRequest::Scsi(HbaFamily::VirtioScsi)),
            Just(BusRequest::Scsi(HbaFamily::Lsi)),
            Just(BusRequest::Ide),
            Just(BusRequest::Ahci),
            Just(BusRequest::Usb { controller: None }),
            Just(BusRequest::VirtioSerial),
            Just(BusRequest::IsaSerial),
            Just(BusRequest::Floppy),
        ]
    }

    proptest! {
        #[test]
        fn placements_never_collide(
            requests in prop::collection::vec(request_strategy(), 1..48),
            q35 in any::<bool>(),
            small_hba in any::<bool>(),
        ) {
            let family =
                if q35 { MachineFamily::Q35 } else { MachineFamily::I440fx };
            let config = AllocatorConfig {
                scsi_max_targets: small_hba.then_some(2),
                scsi_max_luns: small_hba.then_some(1),
                ..express()
            };
            let mut alloc =
                BusAllocator::new(&test_logger(), family, "m", config);
            let mut placed = Vec::new();
            for (n, request) in requests.iter().enumerate() {
                let hint = PlacementHint::default();
                if let Ok(Some(p)) =
                    alloc.place(&format!("dev{n}"), request, &hint)
                {
                    placed.push(p);
                }
            }

            let (_, controllers) = alloc.into_parts();
            placed.extend(controllers.into_iter().filter_map(|c| c.placement));
            let unique: BTreeSet<_> = placed
                .iter()
                .map(|p| (p.bus.clone(), p.coordinate))
                .collect();
            prop_assert_eq!(unique.len(), placed.len());
        }
    }
}
