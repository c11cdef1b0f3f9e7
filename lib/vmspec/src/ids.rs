// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Sources of instance UUIDs and MAC addresses.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use uuid::Uuid;

/// Locally administered, unicast.
const MAC_PREFIX: u8 = 0x9a;

fn format_mac(bytes: [u8; 6]) -> String {
    bytes.map(|b| format!("{b:02x}")).join(":")
}

/// Supplies identifiers the compiler cannot derive from parameters.
pub trait IdSource {
    fn instance_uuid(&mut self) -> Uuid;

    fn mac_address(&mut self, nic: &str) -> String;
}

/// Hands out identifiers in a fixed sequence.
#[derive(Clone, Debug, Default)]
pub struct SequentialIds {
    uuid: u128,
    mac: u32,
}

impl SequentialIds {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdSource for SequentialIds {
    fn instance_uuid(&mut self) -> Uuid {
        self.uuid += 1;
        Uuid::from_u128(self.uuid)
    }

    fn mac_address(&mut self, _nic: &str) -> String {
        self.mac += 1;
        let [_, a, b, c] = self.mac.to_be_bytes();
        format_mac([MAC_PREFIX, 0, 0, a, b, c])
    }
}

/// Random identifiers drawn from a seeded generator.
pub struct SeededIds {
    rng: StdRng,
}

impl SeededIds {
    pub fn new(seed: u64) -> Self {
        Self { rng: StdRng::seed_from_u64(seed) }
    }
}

impl IdSource for SeededIds {
    fn instance_uuid(&mut self) -> Uuid {
        uuid::Builder::from_random_bytes(self.rng.gen()).into_uuid()
    }

    fn mac_address(&mut self, _nic: &str) -> String {
        let tail: [u8; 5] = self.rng.gen();
        format_mac([MAC_PREFIX, tail[0], tail[1], tail[2], tail[3], tail[4]])
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sequential_ids() {
        let mut ids = SequentialIds::new();
        assert_eq!(ids.mac_address("nic1"), "9a:00:00:00:00:01");
        assert_eq!(ids.mac_address("nic2"), "9a:00:00:00:00:02");
        assert_eq!(ids.instance_uuid(), Uuid::from_u128(1));
    }

    #[test]
    fn seeded_ids_repeat_per_seed() {
        let mut a = SeededIds::new(7);
        let mut b = SeededIds::new(7);
        assert_eq!(a.instance_uuid(), b.instance_uuid());
        let mac = a.mac_address("nic1");
        assert_eq!(mac, b.mac_address("nic1"));
        assert!(mac.starts_with("9a:"));
        assert_eq!(mac.len(), 17);
        assert_eq!(a.instance_uuid().get_version_num(), 4);
    }
}
