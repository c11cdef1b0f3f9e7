// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Capability probing by running the hypervisor binary.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::process::Command;
use std::sync::{Mutex, PoisonError};

use semver::Version;
use slog::{debug, warn, Logger};

use super::{
    gate_interval, parse_version, version_gate, Capability, CapabilityOracle,
    Gate, VersionInterval,
};

/// A query whose output the probe parses.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Query {
    Version,
    Help,
    DeviceHelp,
    ObjectHelp,
}

impl Query {
    pub fn args(&self) -> &'static [&'static str] {
        match self {
            Query::Version => &["--version"],
            Query::Help => &["--help"],
            Query::DeviceHelp => &["-machine", "none", "-device", "help"],
            Query::ObjectHelp => &["-machine", "none", "-object", "help"],
        }
    }
}

/// Runs the hypervisor binary and returns what it printed.
#[cfg_attr(test, mockall::automock)]
pub trait ProbeBackend: Send + Sync {
    fn query(&self, binary: &str, query: Query) -> io::Result<String>;
}

/// Runs queries as child processes.
#[derive(Clone, Copy, Debug, Default)]
pub struct CommandProbe;

impl ProbeBackend for CommandProbe {
    fn query(&self, binary: &str, query: Query) -> io::Result<String> {
        let output = Command::new(binary).args(query.args()).output()?;
        if !output.status.success() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("{binary} exited with {}", output.status),
            ));
        }

        // `-device help` prints to stderr on some builds.
        let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok(text)
    }
}

/// Extracts the version from `QEMU emulator version 8.2.2 (Debian ...)`.
fn parse_version_banner(text: &str) -> Option<Version> {
    let (_, rest) = text.split_once("version ")?;
    let raw: String = rest
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    parse_version(raw.trim_end_matches('.')).ok()
}

/// Collects device names from lines like `name "virtio-blk-pci", bus PCI`.
fn parse_device_help(text: &str) -> BTreeSet<String> {
    text.lines()
        .filter_map(|line| line.trim().strip_prefix("name \""))
        .filter_map(|rest| rest.split_once('"').map(|(name, _)| name))
        .map(str::to_owned)
        .collect()
}

/// Collects object types from the indented list printed by `-object help`.
fn parse_object_help(text: &str) -> BTreeSet<String> {
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.ends_with(':'))
        .filter(|l| !l.contains(char::is_whitespace))
        .map(str::to_owned)
        .collect()
}

/// A capability oracle backed by the hypervisor binary itself.
///
/// Raw query output is cached per (binary, query) and capability answers per
/// (binary, capability), so each query runs at most once no matter how many
/// compilations share the probe. A query that fails is cached as failed and
/// every capability that depends on it is reported unsupported.
pub struct QemuProbe<B: ProbeBackend = CommandProbe> {
    log: Logger,
    binary: String,
    backend: B,
    outputs: Mutex<BTreeMap<(String, Query), Option<String>>>,
    answers: Mutex<BTreeMap<(String, Capability), bool>>,
}

impl QemuProbe<CommandProbe> {
    pub fn new(log: Logger, binary: impl Into<String>) -> Self {
        Self::with_backend(log, binary, CommandProbe)
    }
}

impl<B: ProbeBackend> QemuProbe<B> {
    pub fn with_backend(
        log: Logger,
        binary: impl Into<String>,
        backend: B,
    ) -> Self {
        Self {
            log,
            binary: binary.into(),
            backend,
            outputs: Mutex::new(BTreeMap::new()),
            answers: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn binary(&self) -> &str {
        &self.binary
    }

    fn output(&self, query: Query) -> Option<String> {
        let key = (self.binary.clone(), query);
        let mut outputs =
            self.outputs.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = outputs.get(&key) {
            return cached.clone();
        }

        let result = match self.backend.query(&self.binary, query) {
            Ok(text) => {
                debug!(self.log, "probed hypervisor";
                       "binary" => &self.binary,
                       "query" => ?query,
                       "bytes" => text.len());
                Some(text)
            }
            Err(e) => {
                warn!(self.log, "hypervisor probe failed";
                      "binary" => &self.binary,
                      "query" => ?query,
                      "error" => %e);
                None
            }
        };
        outputs.insert(key, result.clone());
        result
    }

    fn evaluate(&self, capability: Capability) -> bool {
        match capability.gate() {
            Gate::HelpText(option) => self
                .output(Query::Help)
                .is_some_and(|text| help_mentions(&text, option)),
            Gate::Version(raw) => gate_interval(raw)
                .is_some_and(|i| self.probe_version_interval(&i)),
            Gate::Device(name) => self.has_device(name),
        }
    }
}

/// Returns true if `option` appears as a whole word in `--help` output.
fn help_mentions(text: &str, option: &str) -> bool {
    text.split(|c: char| c.is_whitespace() || c == ',' || c == '[')
        .any(|word| word == option)
}

impl<B: ProbeBackend> CapabilityOracle for QemuProbe<B> {
    fn probe(&self, capability: Capability) -> bool {
        let key = (self.binary.clone(), capability);
        if let Some(answer) = self
            .answers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            return *answer;
        }

        // Evaluated without holding the answer lock, since evaluation may
        // consult other capabilities.
        let answer = self.evaluate(capability);
        debug!(self.log, "capability probed";
               "capability" => %capability, "supported" => answer);
        self.answers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, answer);
        answer
    }

    fn probe_version_interval(&self, interval: &VersionInterval) -> bool {
        version_gate(self.version().as_ref(), interval)
    }

    fn has_device(&self, name: &str) -> bool {
        self.output(Query::DeviceHelp)
            .is_some_and(|text| parse_device_help(&text).contains(name))
    }

    fn has_object(&self, name: &str) -> bool {
        self.output(Query::ObjectHelp)
            .is_some_and(|text| parse_object_help(&text).contains(name))
    }

    fn version(&self) -> Option<Version> {
        self.output(Query::Version)
            .and_then(|text| parse_version_banner(&text))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_logger as logger;

    const VERSION: &str = "\
QEMU emulator version 8.2.2 (Debian 1:8.2.2+ds-0ubuntu1)
Copyright (c) 2003-2023 Fabrice Bellard and the QEMU Project developers
";

    const HELP: &str = "\
usage: qemu-system-x86_64 [options] [disk_image]
-drive [file=file][,if=type][,bus=n][,unit=m][,media=d][,index=i]
-blockdev [driver=]driver[,node-name=N][,discard=ignore|unmap]
";

    const DEVICE_HELP: &str = r#"Controller/Bridge/Hub devices:
name "pcie-root-port", bus PCI, desc "PCI Express Root Port"
name "pcie-pci-bridge", bus PCI

Storage devices:
name "virtio-blk-pci", bus PCI, alias "virtio-blk"
"#;

    const OBJECT_HELP: &str = "List of user creatable objects:
  memory-backend-file
  memory-backend-ram
  rng-random
";

    fn answer(query: Query) -> io::Result<String> {
        Ok(match query {
            Query::Version => VERSION,
            Query::Help => HELP,
            Query::DeviceHelp => DEVICE_HELP,
            Query::ObjectHelp => OBJECT_HELP,
        }
        .to_owned())
    }

    #[test]
    fn parses_probe_output() {
        assert_eq!(parse_version_banner(VERSION), Some(Version::new(8, 2, 2)));
        assert_eq!(
            parse_version_banner("QEMU emulator version 6.2\n"),
            Some(Version::new(6, 2, 0))
        );
        assert!(help_mentions(HELP, "-blockdev"));
        assert!(!help_mentions(HELP, "-blockde"));

        let devices = parse_device_help(DEVICE_HELP);
        assert!(devices.contains("virtio-blk-pci"));
        assert!(devices.contains("pcie-root-port"));
        assert_eq!(devices.len(), 3);

        let objects = parse_object_help(OBJECT_HELP);
        assert!(objects.contains("rng-random"));
        assert!(!objects.iter().any(|o| o.starts_with("List")));
    }

    #[test]
    fn each_query_runs_once() {
        let mut backend = MockProbeBackend::new();
        for query in
            [Query::Version, Query::Help, Query::DeviceHelp, Query::ObjectHelp]
        {
            backend
                .expect_query()
                .withf(move |binary, q| {
                    binary == "qemu-system-x86_64" && *q == query
                })
                .times(1)
                .returning(|_, q| answer(q));
        }

        let probe =
            QemuProbe::with_backend(logger(), "qemu-system-x86_64", backend);
        for _ in 0..3 {
            assert!(probe.probe(Capability::Blockdev));
            assert!(probe.probe(Capability::SmpDrawers));
            assert!(probe.probe(Capability::PcieRootPort));
            assert!(probe.has_device("virtio-blk-pci"));
            assert!(!probe.has_device("virtio-blk-ccw"));
            assert!(probe.has_object("memory-backend-file"));
            assert_eq!(probe.version(), Some(Version::new(8, 2, 2)));
        }
    }

    #[test]
    fn failed_probe_reports_unsupported() {
        let mut backend = MockProbeBackend::new();
        backend.expect_query().times(4).returning(|_, _| {
            Err(io::Error::new(io::ErrorKind::NotFound, "no such binary"))
        });

        let probe = QemuProbe::with_backend(logger(), "missing-qemu", backend);
        assert!(!probe.probe(Capability::Blockdev));
        assert!(!probe.probe(Capability::SmpDies));
        assert!(!probe.probe(Capability::PcieRootPort));
        assert!(!probe.has_object("memory-backend-ram"));
        assert_eq!(probe.version(), None);
        assert!(!probe.probe(Capability::Blockdev));
    }

    #[test]
    fn probe_is_shareable_between_threads() {
        fn assert_sync<T: Sync>() {}
        assert_sync::<QemuProbe<CommandProbe>>();
    }
}
