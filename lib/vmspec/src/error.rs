// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Errors raised while compiling an instance spec.

use thiserror::Error;
use vmspec_params::ParamError;

use crate::bus::AddressCollisionError;
use crate::capability::Capability;
use crate::storage::StorageClassificationError;
use crate::topology::TopologyError;

/// A requested device, backend or option the target cannot provide.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum UnsupportedDeviceError {
    #[error("{kind} {name:?} is not available in the target hypervisor")]
    NotAvailable { kind: &'static str, name: String },

    #[error("{what} cannot be used on {machine} machines")]
    Machine { what: String, machine: String },

    #[error("{what} requires capability {capability}")]
    MissingCapability { what: String, capability: Capability },

    #[error("{object}: {reason}")]
    Conflict { object: String, reason: &'static str },
}

impl UnsupportedDeviceError {
    pub(crate) fn device(name: &str) -> Self {
        Self::NotAvailable { kind: "device", name: name.to_owned() }
    }

    pub(crate) fn object(name: &str) -> Self {
        Self::NotAvailable { kind: "object", name: name.to_owned() }
    }

    pub(crate) fn machine(what: impl Into<String>, machine: &str) -> Self {
        Self::Machine { what: what.into(), machine: machine.to_owned() }
    }

    pub(crate) fn conflict(object: &str, reason: &'static str) -> Self {
        Self::Conflict { object: object.to_owned(), reason }
    }
}

/// A request that exceeds a finite resource: guest memory limits, bus address
/// spaces or host ports.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ResourceLimitError {
    #[error(
        "requested memory of {requested} MiB is below the minimum of {minimum} MiB"
    )]
    MemoryBelowMinimum { requested: u64, minimum: u64 },

    #[error(
        "memory devices need {requested} MiB of maxmem, but maxmem is {available} MiB"
    )]
    MaxMemExceeded { requested: u64, available: u64 },

    #[error("{requested} DIMMs requested, but only {available} slots exist")]
    MemorySlotsExhausted { requested: u32, available: u32 },

    #[error("bus {bus} has no free coordinate")]
    BusExhausted { bus: String },

    #[error("no free {what} in {start}-{end}")]
    HostExhausted { what: &'static str, start: u32, end: u32 },
}

/// Errors that abort a compilation.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CompileError {
    #[error(transparent)]
    Param(#[from] ParamError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    AddressCollision(#[from] AddressCollisionError),

    #[error(transparent)]
    UnsupportedDevice(#[from] UnsupportedDeviceError),

    #[error(transparent)]
    StorageClassification(#[from] StorageClassificationError),

    #[error(transparent)]
    ResourceLimit(#[from] ResourceLimitError),
}
