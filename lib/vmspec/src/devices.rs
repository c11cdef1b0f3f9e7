// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Network and auxiliary devices.

use std::collections::BTreeMap;

use slog::{debug, Logger};
use vmspec_params::{ParamError, ParameterSet};
use vmspec_types::instance_spec::components::backends::{
    Chardev, Netdev, NetdevBackend, ObjectKind, ObjectSpec,
};
use vmspec_types::instance_spec::components::board::{
    MachineFamily, VirtioTransport,
};
use vmspec_types::instance_spec::components::devices::{
    BalloonProps, DeviceNode, DeviceProps, NicProps, RngProps, SerialProps,
    TpmProps, VsockProps, WatchdogProps,
};
use vmspec_types::instance_spec::Nic;

use crate::bus::{
    BootRequest, BusAllocator, BusRequest, DeviceRequest, PciKind,
    PlacementHint,
};
use crate::chardev::build_chardev;
use crate::error::CompileError;
use crate::host::{HostLeases, MIN_GUEST_CID};
use crate::ids::IdSource;
use crate::machine::Target;

/// A device together with the bus it asks for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnplacedDevice {
    pub node: DeviceNode,
    pub request: DeviceRequest,
}

impl UnplacedDevice {
    pub fn new(node: DeviceNode, request: DeviceRequest) -> Self {
        Self { node, request }
    }

    /// Places the device. Boot indices are assigned separately.
    pub fn place(
        self,
        alloc: &mut BusAllocator,
    ) -> Result<DeviceNode, CompileError> {
        let mut node = self.node;
        node.placement =
            alloc.place(&node.id, &self.request.bus, &self.request.hint)?;
        Ok(node)
    }
}

/// Stores a boot index on a device that can carry one.
pub fn set_bootindex(node: &mut DeviceNode, index: u32) {
    match &mut node.props {
        DeviceProps::Disk(props) => props.bootindex = Some(index),
        DeviceProps::Nic(props) => props.bootindex = Some(index),
        _ => {
            node.extra.insert("bootindex".to_owned(), index.to_string());
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnplacedNic {
    pub name: String,
    pub netdev: Netdev,
    pub device: UnplacedDevice,
}

/// A USB host controller declared in `usbs`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsbControllerRequest {
    pub id: String,
    pub model: String,
    pub ports: u8,
    pub hint: PlacementHint,
}

#[derive(Clone, Debug, Default)]
pub struct DevicePlan {
    pub usb_controllers: Vec<UsbControllerRequest>,
    pub nics: Vec<UnplacedNic>,
    pub devices: Vec<UnplacedDevice>,
    pub objects: Vec<ObjectSpec>,
    pub chardevs: Vec<Chardev>,
}

/// State shared by the per-family builders below.
pub struct DeviceBuilder<'a, 'b> {
    log: &'a Logger,
    params: &'a ParameterSet,
    target: &'a Target<'a>,
    vm_name: &'a str,
    leases: &'a mut HostLeases<'b>,
    plan: DevicePlan,
}

fn node(id: &str, driver: &str, props: DeviceProps) -> DeviceNode {
    DeviceNode {
        id: id.to_owned(),
        driver: driver.to_owned(),
        placement: None,
        props,
        extra: BTreeMap::new(),
    }
}

fn invalid(
    key: &str,
    object: &str,
    value: &str,
    expected: &'static str,
) -> CompileError {
    ParamError::invalid(&format!("{key}_{object}"), value, expected).into()
}

impl<'a, 'b> DeviceBuilder<'a, 'b> {
    pub fn new(
        log: &'a Logger,
        params: &'a ParameterSet,
        target: &'a Target<'a>,
        vm_name: &'a str,
        leases: &'a mut HostLeases<'b>,
    ) -> Self {
        let plan = DevicePlan::default();
        Self { log, params, target, vm_name, leases, plan }
    }

    /// Builds every device family in a fixed order and returns the plan.
    pub fn build(
        mut self,
        ids: &mut dyn IdSource,
    ) -> Result<DevicePlan, CompileError> {
        self.usb_controllers()?;
        self.nics(ids)?;
        self.serials()?;
        self.rngs()?;
        self.tpms()?;
        self.vsocks()?;
        self.balloons()?;
        self.watchdog()?;
        self.inputs()?;
        self.soundcards()?;
        self.usb_devices()?;
        self.display()?;
        Ok(self.plan)
    }

    fn add(
        &mut self,
        node: DeviceNode,
        bus: BusRequest,
        params: &ParameterSet,
    ) -> Result<(), CompileError> {
        self.target.require_device(&node.driver)?;
        debug!(self.log, "adding device";
               "id" => &node.id, "driver" => &node.driver);
        let request = DeviceRequest::with_params(bus, params)?;
        self.plan.devices.push(UnplacedDevice::new(node, request));
        Ok(())
    }

    fn chardev(
        &mut self,
        owner: &str,
        params: &ParameterSet,
    ) -> Result<String, CompileError> {
        let chardev = build_chardev(
            self.log,
            format!("chardev_{owner}"),
            owner,
            self.vm_name,
            params,
            self.leases,
        )?;
        let id = chardev.id.clone();
        self.plan.chardevs.push(chardev);
        Ok(id)
    }

    fn usb_controllers(&mut self) -> Result<(), CompileError> {
        for id in self.params.objects("usbs") {
            let p = self.params.object_params(id);
            let model = p.get_or("usb_type", "qemu-xhci");
            let default_ports = match model {
                m if m.contains("uhci") => 2,
                m if m.contains("ehci") => 6,
                m if m.contains("xhci") => 4,
                other => {
                    return Err(invalid(
                        "usb_type",
                        id,
                        other,
                        "a USB host controller model",
                    ))
                }
            };
            self.target.require_device(model)?;
            self.plan.usb_controllers.push(UsbControllerRequest {
                id: id.to_owned(),
                model: model.to_owned(),
                ports: p.get_numeric_or("usb_max_port", default_ports)?,
                hint: PlacementHint::from_params(&p)?,
            });
        }
        Ok(())
    }

    fn nics(&mut self, ids: &mut dyn IdSource) -> Result<(), CompileError> {
        for name in self.params.objects("nics") {
            let p = self.params.object_params(name);
            let model = p.get_or("nic_model", "virtio");
            let (driver, bus) = match model {
                "virtio" => {
                    (self.target.virtio("virtio-net"), BusRequest::Virtio)
                }
                "e1000" | "rtl8139" => {
                    (model.to_owned(), BusRequest::Pci(PciKind::Conventional))
                }
                "e1000e" => {
                    (model.to_owned(), BusRequest::Pci(PciKind::Express))
                }
                "spapr-vlan"
                    if self.target.family == MachineFamily::Pseries =>
                {
                    (model.to_owned(), BusRequest::None)
                }
                "spapr-vlan" => return Err(self.target.unsupported(model)),
                other => {
                    return Err(invalid("nic_model", name, other, "a NIC model"))
                }
            };
            self.target.require_device(&driver)?;

            let queues: Option<u32> =
                p.get_numeric::<u32>("queues")?.filter(|q| *q > 1);
            let netdst = p.get("netdst").map(str::to_owned);
            let backend = match p.get_or("nettype", "user") {
                "user" => NetdevBackend::User,
                "tap" => NetdevBackend::Tap {
                    ifname: netdst,
                    vhost: p.get_bool_or("vhost", false)?,
                    queues,
                },
                "bridge" => NetdevBackend::Bridge {
                    br: netdst.ok_or_else(|| {
                        ParamError::missing(&format!("netdst_{name}"))
                    })?,
                },
                other => {
                    return Err(invalid(
                        "nettype",
                        name,
                        other,
                        "user, tap or bridge",
                    ))
                }
            };

            let mac = match p.get("nic_mac") {
                Some(mac) => mac.to_owned(),
                None => ids.mac_address(name),
            };
            let multiqueue = model == "virtio" && queues.is_some();
            let netdev = format!("hostnet_{name}");
            let mut device = node(
                name,
                &driver,
                DeviceProps::Nic(NicProps {
                    netdev: netdev.clone(),
                    mac,
                    bootindex: None,
                    mq: multiqueue,
                    vectors: queues.filter(|_| multiqueue).map(|q| 2 * q + 2),
                }),
            );
            device.extra = p.extra_props("nic_extra_params")?;

            self.plan.nics.push(UnplacedNic {
                name: name.to_owned(),
                netdev: Netdev { id: netdev, backend },
                device: UnplacedDevice::new(
                    device,
                    DeviceRequest::with_params(bus, &p)?,
                ),
            });
        }
        Ok(())
    }

    fn serials(&mut self) -> Result<(), CompileError> {
        for name in self.params.objects("serials") {
            let p = self.params.object_params(name);
            let default = match self.target.family {
                MachineFamily::I440fx
                | MachineFamily::Q35
                | MachineFamily::Microvm => "isa-serial",
                MachineFamily::Pseries => "spapr-vty",
                MachineFamily::S390Ccw => "sclpconsole",
                MachineFamily::ArmVirt { .. } => "pl011",
            };
            let serial_type = p.get_or("serial_type", default);
            let (driver, bus, port_name) = match serial_type {
                "isa-serial" => {
                    (serial_type.to_owned(), BusRequest::IsaSerial, None)
                }
                "spapr-vty" | "sclpconsole" | "pl011" => {
                    (serial_type.to_owned(), BusRequest::None, None)
                }
                "virtconsole" | "virtserialport" => (
                    serial_type.to_owned(),
                    BusRequest::VirtioSerial,
                    Some(p.get_or("serial_name", name).to_owned()),
                ),
                other => {
                    return Err(invalid(
                        "serial_type",
                        name,
                        other,
                        "a serial port type",
                    ))
                }
            };

            let chardev = self.chardev(name, &p)?;
            let props = SerialProps { chardev, name: port_name };
            self.add(node(name, &driver, DeviceProps::Serial(props)), bus, &p)?;
        }
        Ok(())
    }

    fn rngs(&mut self) -> Result<(), CompileError> {
        for name in self.params.objects("virtio_rngs") {
            let p = self.params.object_params(name);
            let rng = format!("rng_{name}");
            let kind = match p.get_or("backend_rng", "rng-random") {
                "rng-random" => ObjectKind::RngRandom {
                    filename: p
                        .get_or("filename_rng", "/dev/urandom")
                        .to_owned(),
                },
                "rng-builtin" => ObjectKind::RngBuiltin,
                "rng-egd" => {
                    let mut egd = p.clone();
                    egd.insert("chardev_backend", "tcp_socket");
                    ObjectKind::RngEgd { chardev: self.chardev(name, &egd)? }
                }
                other => {
                    return Err(invalid(
                        "backend_rng",
                        name,
                        other,
                        "rng-random, rng-builtin or rng-egd",
                    ))
                }
            };
            let qom_type = match &kind {
                ObjectKind::RngRandom { .. } => "rng-random",
                ObjectKind::RngBuiltin => "rng-builtin",
                _ => "rng-egd",
            };
            self.target.require_object(qom_type)?;
            self.plan.objects.push(ObjectSpec { id: rng.clone(), kind });

            let props = RngProps {
                rng,
                max_bytes: p.get_numeric("max-bytes_rng")?,
                period_ms: p.get_numeric("period_rng")?,
            };
            let driver = self.target.virtio("virtio-rng");
            self.add(
                node(name, &driver, DeviceProps::Rng(props)),
                BusRequest::Virtio,
                &p,
            )?;
        }
        Ok(())
    }

    fn tpms(&mut self) -> Result<(), CompileError> {
        for name in self.params.objects("tpms") {
            let p = self.params.object_params(name);
            let tpmdev = format!("tpm_{name}");
            let kind = match p.get_or("tpm_type", "emulator") {
                "emulator" => {
                    let mut socket = p.clone();
                    socket.insert("chardev_backend", "unix_socket");
                    socket.insert("chardev_server", "no");
                    if let Some(path) = p.get("tpm_socket_path") {
                        socket.insert("chardev_path", path);
                    }
                    ObjectKind::TpmEmulator {
                        chardev: self.chardev(name, &socket)?,
                    }
                }
                "passthrough" => ObjectKind::TpmPassthrough {
                    path: p.get_or("tpm_device_path", "/dev/tpm0").to_owned(),
                },
                other => {
                    return Err(invalid(
                        "tpm_type",
                        name,
                        other,
                        "emulator or passthrough",
                    ))
                }
            };

            let default_model = match self.target.family {
                MachineFamily::I440fx
                | MachineFamily::Q35
                | MachineFamily::Microvm => "tpm-crb",
                MachineFamily::ArmVirt { .. } => "tpm-tis-device",
                MachineFamily::Pseries => "tpm-spapr",
                MachineFamily::S390Ccw => {
                    return Err(self.target.unsupported(format!("TPM {name}")))
                }
            };
            let model = p.get_or("tpm_model", default_model).to_owned();
            self.plan.objects.push(ObjectSpec { id: tpmdev.clone(), kind });
            self.add(
                node(name, &model, DeviceProps::Tpm(TpmProps { tpmdev })),
                BusRequest::None,
                &p,
            )?;
        }
        Ok(())
    }

    fn vsocks(&mut self) -> Result<(), CompileError> {
        for name in self.params.objects("vsocks") {
            let p = self.params.object_params(name);
            let explicit: Option<u32> = p.get_numeric("guest_cid")?;
            if let Some(cid) = explicit.filter(|c| *c < MIN_GUEST_CID) {
                return Err(invalid(
                    "guest_cid",
                    name,
                    &cid.to_string(),
                    "a context ID of at least 3",
                ));
            }
            let guest_cid = self.leases.vsock_cid(self.log, name, explicit)?;
            let driver = self.target.virtio("vhost-vsock");
            let props = DeviceProps::Vsock(VsockProps { guest_cid });
            self.add(node(name, &driver, props), BusRequest::Virtio, &p)?;
        }
        Ok(())
    }

    fn balloons(&mut self) -> Result<(), CompileError> {
        for name in self.params.objects("balloon") {
            let p = self.params.object_params(name);
            let id = p.get_or("balloon_dev_devid", name).to_owned();
            let props = BalloonProps {
                deflate_on_oom: p
                    .get_bool_or("balloon_opt_deflate_on_oom", false)?,
                free_page_reporting: p
                    .get_bool_or("balloon_opt_free_page_reporting", false)?,
            };
            let driver = self.target.virtio("virtio-balloon");
            self.add(
                node(&id, &driver, DeviceProps::Balloon(props)),
                BusRequest::Virtio,
                &p,
            )?;
        }
        Ok(())
    }

    fn watchdog(&mut self) -> Result<(), CompileError> {
        if !self.params.get_bool_or("enable_watchdog", false)? {
            return Ok(());
        }

        let p = self.params;
        let default = match self.target.family {
            MachineFamily::I440fx | MachineFamily::Q35 => Some("i6300esb"),
            MachineFamily::S390Ccw => Some("diag288"),
            _ => None,
        };
        let model = match p.get("watchdog_device_type").or(default) {
            Some(model) => model,
            None => {
                return Err(ParamError::missing("watchdog_device_type").into())
            }
        };
        let bus = match model {
            "i6300esb" => BusRequest::Pci(PciKind::Conventional),
            "ib700" | "diag288" => BusRequest::None,
            other => {
                return Err(ParamError::invalid(
                    "watchdog_device_type",
                    other,
                    "i6300esb, ib700 or diag288",
                )
                .into())
            }
        };
        let props = WatchdogProps {
            action: p.get_or("watchdog_action", "reset").to_owned(),
        };
        self.add(node("watchdog0", model, DeviceProps::Watchdog(props)), bus, p)
    }

    fn inputs(&mut self) -> Result<(), CompileError> {
        for name in self.params.objects("inputs") {
            let p = self.params.object_params(name);
            let kind = match p.get_or("input_dev_type", "tablet") {
                "mouse" => "mouse",
                "keyboard" => "keyboard",
                "tablet" => "tablet",
                other => {
                    return Err(invalid(
                        "input_dev_type",
                        name,
                        other,
                        "mouse, keyboard or tablet",
                    ))
                }
            };
            let (driver, bus) = match p.get_or("input_dev_bus_type", "usb") {
                "usb" => {
                    let driver = match kind {
                        "keyboard" => "usb-kbd".to_owned(),
                        k => format!("usb-{k}"),
                    };
                    (driver, BusRequest::Usb { controller: None })
                }
                "virtio" => (
                    self.target.virtio(&format!("virtio-{kind}")),
                    BusRequest::Virtio,
                ),
                other => {
                    return Err(invalid(
                        "input_dev_bus_type",
                        name,
                        other,
                        "usb or virtio",
                    ))
                }
            };
            self.add(node(name, &driver, DeviceProps::Input), bus, &p)?;
        }
        Ok(())
    }

    fn soundcards(&mut self) -> Result<(), CompileError> {
        for (index, model) in
            self.params.objects("soundcards").into_iter().enumerate()
        {
            let p = self.params.object_params(model);
            let (driver, codec) = match model {
                "ac97" => ("AC97", None),
                "es1370" => ("ES1370", None),
                "intel-hda" => ("intel-hda", Some("hda-duplex".to_owned())),
                other => {
                    return Err(ParamError::invalid(
                        "soundcards",
                        other,
                        "ac97, es1370 or intel-hda",
                    )
                    .into())
                }
            };
            if let Some(codec) = &codec {
                self.target.require_device(codec)?;
            }
            let id = format!("{}_{index}", model.replace('-', "_"));
            self.add(
                node(&id, driver, DeviceProps::Sound { codec }),
                BusRequest::Pci(PciKind::Conventional),
                &p,
            )?;
        }
        Ok(())
    }

    fn usb_devices(&mut self) -> Result<(), CompileError> {
        for name in self.params.objects("usb_devices") {
            let p = self.params.object_params(name);
            let driver = p.get_or("usb_type", "usb-tablet");
            let bus = BusRequest::Usb {
                controller: p.get("usb_controller").map(str::to_owned),
            };
            self.add(node(name, driver, DeviceProps::Usb), bus, &p)?;
        }
        Ok(())
    }

    fn display(&mut self) -> Result<(), CompileError> {
        let default = match self.target.family {
            MachineFamily::I440fx | MachineFamily::Q35 => "std",
            _ => "none",
        };
        let driver = match self.params.get_or("vga", default) {
            "none" => return Ok(()),
            "std" => "VGA".to_owned(),
            "cirrus" => "cirrus-vga".to_owned(),
            "qxl" => "qxl-vga".to_owned(),
            "virtio" => match self.target.family.virtio_transport() {
                VirtioTransport::Pci => "virtio-vga".to_owned(),
                _ => self.target.virtio("virtio-gpu"),
            },
            other => {
                return Err(ParamError::invalid(
                    "vga",
                    other,
                    "std, cirrus, qxl, virtio or none",
                )
                .into())
            }
        };
        let bus = if driver.starts_with("virtio-gpu") {
            BusRequest::Virtio
        } else {
            BusRequest::Pci(PciKind::Integrated)
        };
        let params = self.params;
        self.add(node("video0", &driver, DeviceProps::Display), bus, params)
    }
}

/// Boot requests of devices other than disks and NICs are ignored.
pub fn boot_request(device: &UnplacedDevice) -> BootRequest {
    match device.node.props {
        DeviceProps::Disk(_) | DeviceProps::Nic(_) => device.request.boot,
        _ => BootRequest::None,
    }
}

impl UnplacedNic {
    pub fn place(self, alloc: &mut BusAllocator) -> Result<Nic, CompileError> {
        Ok(Nic {
            name: self.name,
            netdev: self.netdev,
            device: self.device.place(alloc)?,
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
    use vmspec_types::instance_spec::components::backends::ChardevBackend;

    fn caps() -> CapabilitySet {
        CapabilitySet::new(Version::new(8, 2, 0))
            .with_devices([
                "virtio-net-pci",
                "e1000",
                "isa-serial",
                "virtserialport",
                "virtio-rng-pci",
                "tpm-crb",
                "vhost-vsock-pci",
                "virtio-balloon-pci",
                "i6300esb",
                "usb-tablet",
                "virtio-keyboard-pci",
                "intel-hda",
                "hda-duplex",
                "qemu-xhci",
                "VGA",
            ])
            .with_objects(["rng-random", "rng-egd"])
    }

    fn build(
        caps: &CapabilitySet,
        host: &StaticHost,
        pairs: &[(&str, &str)],
    ) -> Result<DevicePlan, CompileError> {
        let log = test_logger();
        let params: ParameterSet = pairs.iter().copied().collect();
        let target = Target::from_params(caps, &params)?;
        let mut leases = HostLeases::new(host);
        let mut ids = SequentialIds::new();
        DeviceBuilder::new(&log, &params, &target, "vm1", &mut leases)
            .build(&mut ids)
    }

    #[test]
    fn nics() {
        let plan = build(
            &caps(),
            &StaticHost::default(),
            &[
                ("vga", "none"),
                ("nics", "nic1 nic2"),
                ("nettype_nic1", "tap"),
                ("netdst_nic1", "tap0"),
                ("vhost_nic1", "on"),
                ("queues_nic1", "4"),
                ("nic_model_nic2", "e1000"),
                ("nic_mac_nic2", "52:54:00:12:34:56"),
                ("bootindex_nic2", "1"),
            ],
        )
        .unwrap();

        let [nic1, nic2] = &plan.nics[..] else {
            panic!("expected two NICs");
        };
        assert_eq!(nic1.netdev.id, "hostnet_nic1");
        assert_eq!(
            nic1.netdev.backend,
            NetdevBackend::Tap {
                ifname: Some("tap0".to_owned()),
                vhost: true,
                queues: Some(4)
            }
        );
        let DeviceProps::Nic(props) = &nic1.device.node.props else {
            panic!("not a NIC");
        };
        assert!(props.mq);
        assert_eq!(props.vectors, Some(10));
        assert_eq!(props.mac, "9a:00:00:00:00:01");

        assert_eq!(nic2.device.node.driver, "e1000");
        assert_eq!(
            nic2.device.request.bus,
            BusRequest::Pci(PciKind::Conventional)
        );
        assert_eq!(nic2.device.request.boot, BootRequest::Explicit(1));
        let DeviceProps::Nic(props) = &nic2.device.node.props else {
            panic!("not a NIC");
        };
        assert_eq!(props.mac, "52:54:00:12:34:56");
    }

    #[test]
    fn auxiliary_devices() {
        let host = StaticHost {
            busy_cids: [3].into_iter().collect(),
            ..Default::default()
        };
        let plan = build(
            &caps(),
            &host,
            &[
                ("serials", "serial0 vs1"),
                ("serial_type_vs1", "virtserialport"),
                ("virtio_rngs", "rng0 rng1"),
                ("backend_rng_rng1", "rng-egd"),
                ("tpms", "tpm0"),
                ("vsocks", "vsock0"),
                ("balloon", "balloon0"),
                ("balloon_opt_free_page_reporting", "yes"),
                ("enable_watchdog", "yes"),
                ("inputs", "input1"),
                ("input_dev_bus_type", "virtio"),
                ("input_dev_type", "keyboard"),
                ("soundcards", "intel-hda"),
                ("usb_devices", "tablet1"),
            ],
        )
        .unwrap();

        let drivers: Vec<&str> =
            plan.devices.iter().map(|d| d.node.driver.as_str()).collect();
        assert_eq!(
            drivers,
            vec![
                "isa-serial",
                "virtserialport",
                "virtio-rng-pci",
                "virtio-rng-pci",
                "tpm-crb",
                "vhost-vsock-pci",
                "virtio-balloon-pci",
                "i6300esb",
                "virtio-keyboard-pci",
                "intel-hda",
                "usb-tablet",
                "VGA",
            ]
        );

        let vsock = &plan.devices[5].node;
        assert_eq!(
            vsock.props,
            DeviceProps::Vsock(VsockProps { guest_cid: 4 })
        );

        let ids: Vec<&str> =
            plan.objects.iter().map(|o| o.id.as_str()).collect();
        assert_eq!(ids, vec!["rng_rng0", "rng_rng1", "tpm_tpm0"]);
        let chardevs: Vec<&str> =
            plan.chardevs.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(
            chardevs,
            vec![
                "chardev_serial0",
                "chardev_vs1",
                "chardev_rng1",
                "chardev_tpm0"
            ]
        );
        assert!(matches!(
            plan.chardevs[2].backend,
            ChardevBackend::TcpSocket { port: 5000, .. }
        ));
        assert!(matches!(
            plan.chardevs[3].backend,
            ChardevBackend::UnixSocket { server: false, .. }
        ));
    }

    #[test]
    fn soundcards_of_one_model_get_distinct_ids() {
        let plan = build(
            &caps(),
            &StaticHost::default(),
            &[("soundcards", "intel-hda intel-hda"), ("vga", "none")],
        )
        .unwrap();
        let ids: Vec<&str> =
            plan.devices.iter().map(|d| d.node.id.as_str()).collect();
        assert_eq!(ids, vec!["intel_hda_0", "intel_hda_1"]);
    }

    #[test]
    fn unavailable_and_unsupported() {
        let host = StaticHost::default();
        assert!(matches!(
            build(
                &caps(),
                &host,
                &[("nics", "nic1"), ("nic_model", "rtl8139")]
            ),
            Err(CompileError::UnsupportedDevice(_))
        ));
        assert!(matches!(
            build(
                &caps(),
                &host,
                &[("machine_type", "s390-ccw-virtio"), ("tpms", "tpm0")]
            ),
            Err(CompileError::UnsupportedDevice(_))
        ));
        assert!(matches!(
            build(&caps(), &host, &[("vsocks", "v0"), ("guest_cid", "2")]),
            Err(CompileError::Param(_))
        ));
        assert!(matches!(
            build(
                &caps(),
                &host,
                &[("nics", "nic1"), ("nettype", "bridge")]
            ),
            Err(CompileError::Param(ParamError::Missing { .. }))
        ));
    }
}
