// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Types describing a fully-resolved virtual machine: buses and coordinates,
//! devices, storage graphs and the [`InstanceSpec`] document that ties them
//! together.

pub mod address;
pub mod instance_spec;

pub use address::{Bus, BusId, BusKind, Coordinate, PciAddress, Placement};
pub use instance_spec::InstanceSpec;
