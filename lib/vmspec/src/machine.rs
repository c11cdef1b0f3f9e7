// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Machine type, firmware and CPU.

use slog::{info, Logger};
use vmspec_params::{ParamError, ParameterSet};
use vmspec_types::instance_spec::components::backends::StorageBackend;
use vmspec_types::instance_spec::components::board::{
    Cpu, CpuFlag, Firmware, FlashImage, Machine, MachineFamily,
};

use crate::capability::{Capability, CapabilityOracle};
use crate::error::{CompileError, UnsupportedDeviceError};
use crate::storage;
use crate::topology::{self, TopologyRequest, TopologyRules};

/// The machine being compiled for, as seen by every builder.
pub struct Target<'a> {
    pub oracle: &'a dyn CapabilityOracle,
    pub family: MachineFamily,
    pub machine_type: String,
}

impl<'a> Target<'a> {
    pub fn from_params(
        oracle: &'a dyn CapabilityOracle,
        params: &ParameterSet,
    ) -> Result<Self, ParamError> {
        let raw = params.get_or("machine_type", "q35");
        let (machine_type, family) = parse_machine_type(raw)
            .ok_or_else(|| {
                ParamError::invalid("machine_type", raw, "a known machine type")
            })?;
        Ok(Self { oracle, family, machine_type })
    }

    /// Fails unless the hypervisor provides device `driver`.
    pub fn require_device(&self, driver: &str) -> Result<(), CompileError> {
        if self.oracle.has_device(driver) {
            Ok(())
        } else {
            Err(UnsupportedDeviceError::device(driver).into())
        }
    }

    /// Fails unless the hypervisor provides object type `qom_type`.
    pub fn require_object(&self, qom_type: &str) -> Result<(), CompileError> {
        if self.oracle.has_object(qom_type) {
            Ok(())
        } else {
            Err(UnsupportedDeviceError::object(qom_type).into())
        }
    }

    /// An error for something this machine type cannot carry.
    pub fn unsupported(&self, what: impl Into<String>) -> CompileError {
        UnsupportedDeviceError::machine(what, &self.machine_type).into()
    }

    /// The virtio driver for `base` on this machine's transport.
    pub fn virtio(&self, base: &str) -> String {
        self.family.virtio_transport().driver(base)
    }

    pub fn layered_storage(&self) -> bool {
        self.oracle.probe(Capability::Blockdev)
    }
}

/// Maps a machine type name onto its family. `arm64-pci:` and `arm64-mmio:`
/// prefixes select the Arm `virt` bus layout explicitly.
pub fn parse_machine_type(raw: &str) -> Option<(String, MachineFamily)> {
    if let Some(name) = raw.strip_prefix("arm64-pci:") {
        return Some((name.to_owned(), MachineFamily::ArmVirt { mmio: false }));
    }
    if let Some(name) = raw.strip_prefix("arm64-mmio:") {
        return Some((name.to_owned(), MachineFamily::ArmVirt { mmio: true }));
    }

    let family = match raw {
        "pc" => MachineFamily::I440fx,
        "q35" => MachineFamily::Q35,
        "microvm" => MachineFamily::Microvm,
        r if r.starts_with("pc-i440fx-") => MachineFamily::I440fx,
        r if r.starts_with("pc-q35-") => MachineFamily::Q35,
        r if r.starts_with("virt") => MachineFamily::ArmVirt { mmio: false },
        r if r.starts_with("pseries") => MachineFamily::Pseries,
        r if r.starts_with("s390-ccw-virtio") => MachineFamily::S390Ccw,
        _ => return None,
    };
    Some((raw.to_owned(), family))
}

/// Builds the machine section. Memory-related fields are filled in later by
/// the memory builder.
pub fn build_machine(
    params: &ParameterSet,
    target: &Target<'_>,
    firmware: &Firmware,
) -> Result<Machine, CompileError> {
    let secure_boot =
        matches!(firmware, Firmware::Uefi { secure_boot: true, .. });
    let smm = (secure_boot && target.family.is_x86())
        || params.get_bool_or("smm", false)?;
    if smm && !target.family.is_x86() {
        return Err(target.unsupported("smm"));
    }

    // Legacy flash drives attach themselves with `if=pflash`.
    let (pflash0, pflash1) = match firmware {
        Firmware::Uefi { code, vars, .. }
            if matches!(code.backend, StorageBackend::Layered { .. }) =>
        {
            (code.backend.top(), vars.backend.top())
        }
        _ => (None, None),
    };

    Ok(Machine {
        machine_type: target.machine_type.clone(),
        family: target.family,
        accel: params.get_or("vm_accel", "kvm").to_owned(),
        memory_backend: None,
        legacy_mem_path: None,
        nvdimm: false,
        smm,
        pflash0: pflash0.map(str::to_owned),
        pflash1: pflash1.map(str::to_owned),
        extra: params.extra_props("machine_extra_params")?,
    })
}

fn default_flash(family: MachineFamily) -> (&'static str, &'static str) {
    match family {
        MachineFamily::ArmVirt { .. } => (
            "/usr/share/AAVMF/AAVMF_CODE.fd",
            "/usr/share/AAVMF/AAVMF_VARS.fd",
        ),
        _ => ("/usr/share/OVMF/OVMF_CODE.fd", "/usr/share/OVMF/OVMF_VARS.fd"),
    }
}

/// Selects firmware. UEFI flash images become storage backends so they
/// follow the same layered/legacy choice as disks.
pub fn build_firmware(
    log: &Logger,
    params: &ParameterSet,
    target: &Target<'_>,
) -> Result<Firmware, CompileError> {
    let default = match target.family {
        MachineFamily::I440fx | MachineFamily::Q35 => "bios",
        MachineFamily::ArmVirt { .. } => "uefi",
        MachineFamily::Pseries => "slof",
        MachineFamily::S390Ccw => "s390-ccw.img",
        MachineFamily::Microvm => "qboot.rom",
    };
    let kind = params.get_or("firmware", default);

    let firmware = match kind {
        "bios" if target.family.is_x86() => Firmware::Bios {
            path: params.get("bios_path").map(str::to_owned),
        },
        "uefi"
            if !matches!(
                target.family,
                MachineFamily::Pseries | MachineFamily::S390Ccw
            ) =>
        {
            let (code, vars) = default_flash(target.family);
            let code = params.get_or("ovmf_code_filename", code);
            let vars = params.get_or("ovmf_vars_filename", vars);
            let layered = target.layered_storage();
            Firmware::Uefi {
                code: FlashImage {
                    path: code.to_owned(),
                    backend: storage::flash_backend(
                        "ovmf_code", code, true, 0, layered,
                    ),
                },
                vars: FlashImage {
                    path: vars.to_owned(),
                    backend: storage::flash_backend(
                        "ovmf_vars", vars, false, 1, layered,
                    ),
                },
                secure_boot: params.get_bool_or("secure_boot", false)?,
            }
        }
        "bios" | "uefi" => {
            return Err(target.unsupported(format!("{kind} firmware")))
        }
        name if name == default => Firmware::Builtin { name: name.to_owned() },
        other => {
            return Err(ParamError::invalid(
                "firmware",
                other,
                "bios, uefi or the machine's built-in firmware",
            )
            .into())
        }
    };

    info!(log, "selected firmware"; "firmware" => kind);
    Ok(firmware)
}

/// Parses `+vmx,-svm,pcid` style flag lists.
fn parse_cpu_flags(raw: &str) -> Vec<CpuFlag> {
    raw.split(',')
        .map(str::trim)
        .filter(|f| !f.is_empty())
        .map(|f| {
            if let Some(name) = f.strip_prefix('-') {
                CpuFlag { name: name.to_owned(), enabled: false }
            } else {
                let name = f.strip_prefix('+').unwrap_or(f);
                CpuFlag { name: name.to_owned(), enabled: true }
            }
        })
        .collect()
}

pub fn build_cpu(
    log: &Logger,
    params: &ParameterSet,
    target: &Target<'_>,
) -> Result<Cpu, CompileError> {
    let request = TopologyRequest::from_params(params)?;
    // sPAPR hot-plugs whole cores.
    let rules = TopologyRules::from_oracle(
        target.oracle,
        target.family == MachineFamily::Pseries,
    );
    let topology = topology::solve(&request, &rules)?;
    info!(log, "solved CPU topology";
          "smp" => topology.smp,
          "maxcpus" => topology.maxcpus,
          "sockets" => topology.sockets,
          "cores" => topology.cores,
          "threads" => topology.threads);

    let accel = params.get_or("vm_accel", "kvm");
    let default_model = if accel == "kvm" { "host" } else { "max" };
    Ok(Cpu {
        model: params.get_or("cpu_model", default_model).to_owned(),
        flags: params
            .get("cpu_model_flags")
            .map(parse_cpu_flags)
            .unwrap_or_default(),
        topology,
        hotplug_devices: request.hotplug_devices,
    })
}
