// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compiles flat test parameters into a fully-resolved [`InstanceSpec`].
//!
//! The entry point is [`Compiler`]. It consults a [`CapabilityOracle`] about
//! the target hypervisor, a [`HostResources`] oracle about the host, and an
//! [`IdSource`] for identifiers, and produces one immutable spec per call.
//!
//! [`InstanceSpec`]: vmspec_types::InstanceSpec
//! [`CapabilityOracle`]: capability::CapabilityOracle
//! [`HostResources`]: host::HostResources
//! [`IdSource`]: ids::IdSource

pub mod assembler;
pub mod bus;
pub mod capability;
pub mod chardev;
pub mod devices;
pub mod error;
pub mod host;
pub mod ids;
pub mod machine;
pub mod memory;
pub mod storage;
pub mod topology;

pub use assembler::Compiler;
pub use error::{CompileError, ResourceLimitError, UnsupportedDeviceError};

#[cfg(test)]
pub(crate) fn test_logger() -> slog::Logger {
    use slog::Drain;

    let dec = slog_term::PlainSyncDecorator::new(slog_term::TestStdoutWriter);
    let drain = slog_term::FullFormat::new(dec).build().fuse();
    slog::Logger::root(drain, slog::o!())
}
