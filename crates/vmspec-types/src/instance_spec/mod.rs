// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A fully-composed instance specification.
//!
//! An [`InstanceSpec`] is produced once per compilation and never mutated
//! afterwards. Every device that occupies a bus coordinate carries its
//! [`Placement`]; no two placements in one spec are equal.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::address::{Bus, Placement};

pub mod components;

use components::backends::{
    Chardev, Monitor, Netdev, ObjectSpec, StorageBackend,
};
use components::board::{Cpu, Firmware, Machine, Memory};
use components::devices::{Controller, DeviceNode};

/// The kind of medium an image provides.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum Media {
    Disk,
    Cdrom,
    Floppy,
}

/// An image: its backend graph and the front end that exposes it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Disk {
    pub name: String,
    pub media: Media,
    pub backend: StorageBackend,
    pub device: DeviceNode,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct Nic {
    pub name: String,
    pub netdev: Netdev,
    pub device: DeviceNode,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct InstanceSpec {
    pub name: String,
    pub uuid: Uuid,
    pub machine: Machine,
    pub firmware: Firmware,
    pub cpu: Cpu,
    pub memory: Memory,
    pub buses: Vec<Bus>,
    pub controllers: Vec<Controller>,
    pub objects: Vec<ObjectSpec>,
    pub storage: Vec<Disk>,
    pub network: Vec<Nic>,
    pub devices: Vec<DeviceNode>,
    pub chardevs: Vec<Chardev>,
    pub monitors: Vec<Monitor>,
}

impl InstanceSpec {
    /// Every placement claimed in this spec, paired with the ID of the
    /// device or controller that claims it.
    pub fn placements(&self) -> Vec<(&str, &Placement)> {
        let controllers = self
            .controllers
            .iter()
            .filter_map(|c| c.placement.as_ref().map(|p| (c.id.as_str(), p)));
        let disks = self.storage.iter().map(|d| &d.device);
        let nics = self.network.iter().map(|n| &n.device);
        let mem = self.memory.devices.iter().map(|m| &m.device);
        let devices = disks
            .chain(nics)
            .chain(mem)
            .chain(self.devices.iter())
            .filter_map(|d| d.placement.as_ref().map(|p| (d.id.as_str(), p)));

        controllers.chain(devices).collect()
    }

    /// Looks up a device front end by ID across every section.
    pub fn device(&self, id: &str) -> Option<&DeviceNode> {
        self.storage
            .iter()
            .map(|d| &d.device)
            .chain(self.network.iter().map(|n| &n.device))
            .chain(self.memory.devices.iter().map(|m| &m.device))
            .chain(self.devices.iter())
            .find(|d| d.id == id)
    }

    pub fn controller(&self, id: &str) -> Option<&Controller> {
        self.controllers.iter().find(|c| c.id == id)
    }

    pub fn disk(&self, name: &str) -> Option<&Disk> {
        self.storage.iter().find(|d| d.name == name)
    }
}
