// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Resources owned by the host that will run the instance.

use std::collections::{BTreeMap, BTreeSet};
use std::net::{Ipv4Addr, TcpListener};

use slog::{debug, warn, Logger};

use crate::bus::AddressCollisionError;
use crate::error::{CompileError, ResourceLimitError};

/// Ports handed to TCP chardevs.
pub const CHARDEV_PORTS: (u16, u16) = (5000, 5899);

/// The lowest context ID a guest may use.
pub const MIN_GUEST_CID: u32 = 3;

/// Answers questions about host resources the compiled spec will consume.
///
/// Implementations never reserve anything; the compiler passes the values it
/// has already handed out in the current run as `exclude`.
pub trait HostResources {
    /// Memory available to guests, in MiB.
    fn usable_memory_mib(&self) -> u64;

    /// Returns the first port in `[start, end]` that is free on the host and
    /// not in `exclude`.
    fn find_free_port(
        &self,
        start: u16,
        end: u16,
        exclude: &BTreeSet<u16>,
    ) -> Option<u16>;

    /// Returns the first vsock context ID at or above `start` that is free on
    /// the host and not in `exclude`.
    fn find_free_vsock_cid(
        &self,
        start: u32,
        exclude: &BTreeSet<u32>,
    ) -> Option<u32>;
}

/// A host with fixed, caller-supplied resources.
#[derive(Clone, Debug)]
pub struct StaticHost {
    pub usable_memory_mib: u64,
    pub busy_ports: BTreeSet<u16>,
    pub busy_cids: BTreeSet<u32>,
}

impl Default for StaticHost {
    fn default() -> Self {
        Self {
            usable_memory_mib: 16 * 1024,
            busy_ports: BTreeSet::new(),
            busy_cids: BTreeSet::new(),
        }
    }
}

impl StaticHost {
    pub fn with_memory_mib(usable_memory_mib: u64) -> Self {
        Self { usable_memory_mib, ..Default::default() }
    }
}

impl HostResources for StaticHost {
    fn usable_memory_mib(&self) -> u64 {
        self.usable_memory_mib
    }

    fn find_free_port(
        &self,
        start: u16,
        end: u16,
        exclude: &BTreeSet<u16>,
    ) -> Option<u16> {
        (start..=end)
            .find(|p| !exclude.contains(p) && !self.busy_ports.contains(p))
    }

    fn find_free_vsock_cid(
        &self,
        start: u32,
        exclude: &BTreeSet<u32>,
    ) -> Option<u32> {
        (start..=u32::MAX - 1)
            .find(|c| !exclude.contains(c) && !self.busy_cids.contains(c))
    }
}

/// The host the compiler is running on.
pub struct LocalHost {
    log: Logger,
}

impl LocalHost {
    pub fn new(log: Logger) -> Self {
        Self { log }
    }
}

/// Reads `MemAvailable` from a `/proc/meminfo`-formatted string.
fn parse_meminfo_available_mib(meminfo: &str) -> Option<u64> {
    let line = meminfo.lines().find(|l| l.starts_with("MemAvailable:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib / 1024)
}

impl HostResources for LocalHost {
    fn usable_memory_mib(&self) -> u64 {
        let available = std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|raw| parse_meminfo_available_mib(&raw));
        match available {
            Some(mib) => mib,
            None => {
                warn!(self.log, "cannot read available host memory");
                0
            }
        }
    }

    fn find_free_port(
        &self,
        start: u16,
        end: u16,
        exclude: &BTreeSet<u16>,
    ) -> Option<u16> {
        (start..=end).filter(|p| !exclude.contains(p)).find(|p| {
            TcpListener::bind((Ipv4Addr::LOCALHOST, *p)).is_ok()
        })
    }

    // Context IDs in use by other guests are not discoverable without
    // opening the vhost-vsock device, so only this run's IDs are skipped.
    fn find_free_vsock_cid(
        &self,
        start: u32,
        exclude: &BTreeSet<u32>,
    ) -> Option<u32> {
        (start..=u32::MAX - 1).find(|c| !exclude.contains(c))
    }
}

/// Host ports and vsock context IDs handed out during one compilation.
pub struct HostLeases<'a> {
    host: &'a dyn HostResources,
    ports: BTreeMap<u16, String>,
    cids: BTreeMap<u32, String>,
}

impl<'a> HostLeases<'a> {
    pub fn new(host: &'a dyn HostResources) -> Self {
        Self { host, ports: BTreeMap::new(), cids: BTreeMap::new() }
    }

    pub fn usable_memory_mib(&self) -> u64 {
        self.host.usable_memory_mib()
    }

    /// Records an explicitly configured port, or leases a free one from
    /// [`CHARDEV_PORTS`].
    pub fn tcp_port(
        &mut self,
        log: &Logger,
        owner: &str,
        explicit: Option<u16>,
    ) -> Result<u16, CompileError> {
        if let Some(port) = explicit {
            if let Some(holder) = self.ports.get(&port) {
                return Err(AddressCollisionError::PortInUse {
                    device: owner.to_owned(),
                    port,
                    owner: holder.clone(),
                }
                .into());
            }
            self.ports.insert(port, owner.to_owned());
            return Ok(port);
        }

        let (start, end) = CHARDEV_PORTS;
        let exclude: BTreeSet<u16> = self.ports.keys().copied().collect();
        let port = self.host.find_free_port(start, end, &exclude).ok_or(
            ResourceLimitError::HostExhausted {
                what: "TCP port",
                start: u32::from(start),
                end: u32::from(end),
            },
        )?;
        debug!(log, "leased host port"; "owner" => owner, "port" => port);
        self.ports.insert(port, owner.to_owned());
        Ok(port)
    }

    /// Records an explicitly configured context ID, or leases the first free
    /// one at or above [`MIN_GUEST_CID`].
    pub fn vsock_cid(
        &mut self,
        log: &Logger,
        owner: &str,
        explicit: Option<u32>,
    ) -> Result<u32, CompileError> {
        if let Some(cid) = explicit {
            if let Some(holder) = self.cids.get(&cid) {
                return Err(AddressCollisionError::CidInUse {
                    device: owner.to_owned(),
                    cid,
                    owner: holder.clone(),
                }
                .into());
            }
            self.cids.insert(cid, owner.to_owned());
            return Ok(cid);
        }

        let exclude: BTreeSet<u32> = self.cids.keys().copied().collect();
        let cid = self
            .host
            .find_free_vsock_cid(MIN_GUEST_CID, &exclude)
            .ok_or(ResourceLimitError::HostExhausted {
                what: "vsock CID",
                start: MIN_GUEST_CID,
                end: u32::MAX - 1,
            })?;
        debug!(log, "leased vsock CID"; "owner" => owner, "cid" => cid);
        self.cids.insert(cid, owner.to_owned());
        Ok(cid)
    }
}
