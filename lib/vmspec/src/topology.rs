// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Completion of partially-specified CPU topologies.
//!
//! The solver mirrors the hypervisor's own `-smp` parsing: unset dimensions are
//! filled in with a preference order that changed in QEMU 6.2 from sockets
//! first to cores first.

use thiserror::Error;
use vmspec_params::{ParamError, ParameterSet};
use vmspec_types::instance_spec::components::board::CpuTopology;

use crate::capability::{Capability, CapabilityOracle};

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    #[error(
        "cannot solve {dimension}: {total} CPUs are not divisible by {product}"
    )]
    Indivisible { dimension: &'static str, total: u32, product: u64 },

    #[error("topology product {product} does not match {total} CPUs")]
    ProductMismatch { product: u64, total: u32 },

    #[error("smp {smp} exceeds maxcpus {maxcpus}")]
    SmpExceedsMax { smp: u32, maxcpus: u32 },

    #[error("{hotplug} hot-pluggable CPUs leave no boot CPUs out of {total}")]
    NoBootCpus { total: u32, hotplug: u64 },
}

/// The requested topology. `None` marks an unset dimension.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TopologyRequest {
    pub smp: Option<u32>,
    pub maxcpus: Option<u32>,
    pub sockets: Option<u32>,
    pub dies: Option<u32>,
    pub clusters: Option<u32>,
    pub cores: Option<u32>,
    pub threads: Option<u32>,
    pub books: Option<u32>,
    pub drawers: Option<u32>,

    /// Names of CPU devices that are hot-plugged after boot.
    pub hotplug_devices: Vec<String>,
}

impl TopologyRequest {
    pub fn from_params(params: &ParameterSet) -> Result<Self, ParamError> {
        let dim = |key: &str| -> Result<Option<u32>, ParamError> {
            Ok(params.get_numeric::<u32>(key)?.filter(|v| *v != 0))
        };

        Ok(Self {
            smp: dim("smp")?,
            maxcpus: dim("vcpu_maxcpus")?,
            sockets: dim("vcpu_sockets")?,
            dies: dim("vcpu_dies")?,
            clusters: dim("vcpu_clusters")?,
            cores: dim("vcpu_cores")?,
            threads: dim("vcpu_threads")?,
            books: dim("vcpu_books")?,
            drawers: dim("vcpu_drawers")?,
            hotplug_devices: params
                .objects("vcpu_devices")
                .into_iter()
                .map(str::to_owned)
                .collect(),
        })
    }
}

/// Which optional dimensions the target accepts and which preference order it
/// uses.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TopologyRules {
    pub dies: bool,
    pub clusters: bool,
    pub books: bool,
    pub drawers: bool,
    pub prefer_cores: bool,

    /// CPUs are hot-plugged a core at a time rather than a thread at a time.
    pub hotplug_whole_cores: bool,
}

impl TopologyRules {
    pub fn from_oracle(
        oracle: &dyn CapabilityOracle,
        hotplug_whole_cores: bool,
    ) -> Self {
        Self {
            dies: oracle.probe(Capability::SmpDies),
            clusters: oracle.probe(Capability::SmpClusters),
            books: oracle.probe(Capability::SmpBooks),
            drawers: oracle.probe(Capability::SmpDrawers),
            prefer_cores: oracle.probe(Capability::SmpPreferCores),
            hotplug_whole_cores,
        }
    }
}

fn product(dims: &[Option<u32>]) -> u64 {
    dims.iter().map(|d| u64::from(d.unwrap_or(1))).product()
}

/// Sets `target` to `total / product(others)`, which must divide exactly.
fn divide(
    dimension: &'static str,
    total: u32,
    others: &[Option<u32>],
) -> Result<u32, TopologyError> {
    let product = product(others);
    let indivisible =
        || TopologyError::Indivisible { dimension, total, product };
    if product == 0 || u64::from(total) % product != 0 {
        return Err(indivisible());
    }
    match u32::try_from(u64::from(total) / product) {
        Ok(0) | Err(_) => Err(indivisible()),
        Ok(v) => Ok(v),
    }
}

/// Completes `req` under `rules`.
pub fn solve(
    req: &TopologyRequest,
    rules: &TopologyRules,
) -> Result<CpuTopology, TopologyError> {
    let legal =
        |allowed: bool, v: Option<u32>| if allowed { v } else { Some(1) };
    let mut sockets = req.sockets;
    let mut cores = req.cores;
    let mut threads = req.threads;
    let mut dies = legal(rules.dies, req.dies);
    let mut clusters = legal(rules.clusters, req.clusters);
    let mut books = legal(rules.books, req.books);
    let mut drawers = legal(rules.drawers, req.drawers);

    let unset = [sockets, cores, threads, dies, clusters, books, drawers]
        .iter()
        .filter(|d| d.is_none())
        .count();

    let total = match (req.maxcpus, req.smp) {
        (Some(max), _) => max,
        (None, Some(smp)) => smp,
        (None, None) if unset == 0 => {
            let all = [sockets, cores, threads, dies, clusters, books, drawers];
            u32::try_from(product(&all)).map_err(|_| {
                TopologyError::ProductMismatch {
                    product: product(&all),
                    total: 0,
                }
            })?
        }
        (None, None) => 1,
    };

    if req.maxcpus.is_some() && unset == 1 {
        // Exactly one dimension is unknown; the total pins it down.
        let all = [sockets, cores, threads, dies, clusters, books, drawers];
        let (name, idx) = [
            ("sockets", 0),
            ("cores", 1),
            ("threads", 2),
            ("dies", 3),
            ("clusters", 4),
            ("books", 5),
            ("drawers", 6),
        ]
        .into_iter()
        .find(|(_, i)| all[*i].is_none())
        .unwrap_or(("sockets", 0));
        let value = divide(name, total, &all)?;
        match idx {
            0 => sockets = Some(value),
            1 => cores = Some(value),
            2 => threads = Some(value),
            3 => dies = Some(value),
            4 => clusters = Some(value),
            5 => books = Some(value),
            _ => drawers = Some(value),
        }
    } else if unset > 1
        && req.maxcpus == Some(1)
        && [sockets, cores, threads, dies, clusters, books, drawers]
            .iter()
            .flatten()
            .all(|v| *v <= 1)
    {
        sockets.get_or_insert(1);
        cores.get_or_insert(1);
        threads.get_or_insert(1);
        dies.get_or_insert(1);
        clusters.get_or_insert(1);
        books.get_or_insert(1);
        drawers.get_or_insert(1);
    } else {
        dies.get_or_insert(1);
        clusters.get_or_insert(1);
        books.get_or_insert(1);
        drawers.get_or_insert(1);
        let gated = [dies, clusters, books, drawers];
        let rest = |a: Option<u32>, b: Option<u32>| -> Vec<Option<u32>> {
            gated.iter().copied().chain([a, b]).collect()
        };

        if rules.prefer_cores {
            if cores.is_none() {
                sockets.get_or_insert(1);
                threads.get_or_insert(1);
                cores = Some(divide("cores", total, &rest(sockets, threads))?);
            } else if sockets.is_none() {
                threads.get_or_insert(1);
                sockets =
                    Some(divide("sockets", total, &rest(cores, threads))?);
            }
        } else if sockets.is_none() {
            cores.get_or_insert(1);
            threads.get_or_insert(1);
            sockets = Some(divide("sockets", total, &rest(cores, threads))?);
        } else if cores.is_none() {
            threads.get_or_insert(1);
            cores = Some(divide("cores", total, &rest(sockets, threads))?);
        }

        if threads.is_none() {
            threads = Some(divide("threads", total, &rest(sockets, cores))?);
        }
    }

    let one = |v: Option<u32>| v.unwrap_or(1);
    let topology = CpuTopology {
        smp: 0,
        maxcpus: total,
        sockets: one(sockets),
        cores: one(cores),
        threads: one(threads),
        dies: rules.dies.then(|| one(dies)),
        clusters: rules.clusters.then(|| one(clusters)),
        books: rules.books.then(|| one(books)),
        drawers: rules.drawers.then(|| one(drawers)),
    };

    let product = topology.product();
    if product != u64::from(total) {
        return Err(TopologyError::ProductMismatch { product, total });
    }

    let smp = match (req.smp, req.maxcpus) {
        (Some(smp), Some(maxcpus)) => {
            if smp > maxcpus {
                return Err(TopologyError::SmpExceedsMax { smp, maxcpus });
            }
            smp
        }
        _ => {
            let unit = if rules.hotplug_whole_cores {
                u64::from(topology.threads)
            } else {
                1
            };
            let hotplug = req.hotplug_devices.len() as u64 * unit;
            match u64::from(total).checked_sub(hotplug) {
                Some(boot) if boot > 0 => boot as u32,
                _ => return Err(TopologyError::NoBootCpus { total, hotplug }),
            }
        }
    };

    Ok(CpuTopology { smp, ..topology })
}

#[cfg(test)]
mod test {
    use super::*;
    use proptest::prelude::*;

    fn smp(n: u32) -> TopologyRequest {
        TopologyRequest { smp: Some(n), ..Default::default() }
    }

    #[test]
    fn sockets_preferred_before_6_2() {
        let topo = solve(&smp(4), &TopologyRules::default()).unwrap();
        assert_eq!((topo.sockets, topo.cores, topo.threads), (4, 1, 1));
        assert_eq!((topo.smp, topo.maxcpus), (4, 4));
    }

    #[test]
    fn cores_preferred_from_6_2() {
        let rules = TopologyRules { prefer_cores: true, ..Default::default() };
        let topo = solve(&smp(4), &rules).unwrap();
        assert_eq!((topo.sockets, topo.cores, topo.threads), (1, 4, 1));
    }

    #[test]
    fn illegal_dimensions_are_fixed_and_omitted() {
        let req = TopologyRequest {
            smp: Some(8),
            dies: Some(2),
            ..Default::default()
        };
        let topo = solve(&req, &TopologyRules::default()).unwrap();
        assert_eq!(topo.dies, None);
        assert_eq!(topo.sockets, 8);

        let rules = TopologyRules { dies: true, ..Default::default() };
        let topo = solve(&req, &rules).unwrap();
        assert_eq!(topo.dies, Some(2));
        assert_eq!(topo.sockets, 4);
    }

    #[test]
    fn single_unset_dimension_solved_from_maxcpus() {
        let req = TopologyRequest {
            maxcpus: Some(16),
            sockets: Some(2),
            threads: Some(2),
            ..Default::default()
        };
        let topo = solve(&req, &TopologyRules::default()).unwrap();
        assert_eq!(topo.cores, 4);

        let req = TopologyRequest { maxcpus: Some(10), ..req };
        assert!(matches!(
            solve(&req, &TopologyRules::default()),
            Err(TopologyError::Indivisible { dimension: "cores", .. })
        ));
    }

    #[test]
    fn single_cpu_fills_every_unset_dimension() {
        let req = TopologyRequest { maxcpus: Some(1), ..Default::default() };
        let rules = TopologyRules {
            dies: true,
            clusters: true,
            prefer_cores: true,
            ..Default::default()
        };
        let topo = solve(&req, &rules).unwrap();
        assert_eq!(topo.product(), 1);
        assert_eq!(topo.dies, Some(1));
        assert_eq!(topo.smp, 1);
    }

    #[test]
    fn fully_specified_topology_must_match() {
        let req = TopologyRequest {
            smp: Some(6),
            sockets: Some(2),
            cores: Some(2),
            threads: Some(2),
            ..Default::default()
        };
        assert_eq!(
            solve(&req, &TopologyRules::default()),
            Err(TopologyError::ProductMismatch { product: 8, total: 6 })
        );
    }

    #[test]
    fn boot_cpus_exclude_hotplug() {
        let req = TopologyRequest {
            maxcpus: Some(8),
            sockets: Some(1),
            threads: Some(2),
            hotplug_devices: vec!["vcpu1".to_owned(), "vcpu2".to_owned()],
            ..Default::default()
        };
        let topo = solve(&req, &TopologyRules::default()).unwrap();
        assert_eq!(topo.smp, 6);

        let rules =
            TopologyRules { hotplug_whole_cores: true, ..Default::default() };
        let topo = solve(&req, &rules).unwrap();
        assert_eq!(topo.smp, 4);

        let req = TopologyRequest {
            smp: Some(2),
            hotplug_devices: vec!["a".to_owned(), "b".to_owned()],
            ..Default::default()
        };
        assert!(matches!(
            solve(&req, &TopologyRules::default()),
            Err(TopologyError::NoBootCpus { .. })
        ));
    }

    #[test]
    fn explicit_smp_bounded_by_maxcpus() {
        let req = TopologyRequest {
            smp: Some(4),
            maxcpus: Some(8),
            ..Default::default()
        };
        let topo = solve(&req, &TopologyRules::default()).unwrap();
        assert_eq!((topo.smp, topo.maxcpus, topo.sockets), (4, 8, 8));

        let req = TopologyRequest { smp: Some(9), ..req };
        assert_eq!(
            solve(&req, &TopologyRules::default()),
            Err(TopologyError::SmpExceedsMax { smp: 9, maxcpus: 8 })
        );
    }

    #[test]
    fn from_params_treats_zero_as_unset() {
        let params: ParameterSet =
            [("smp", "4"), ("vcpu_cores", "0"), ("vcpu_devices", "vcpu1")]
                .into_iter()
                .collect();
        let req = TopologyRequest::from_params(&params).unwrap();
        assert_eq!(req.smp, Some(4));
        assert_eq!(req.cores, None);
        assert_eq!(req.hotplug_devices, vec!["vcpu1".to_owned()]);
    }

    proptest! {
        #[test]
        fn single_unset_matches_division(
            maxcpus in 1u32..512,
            sockets in 1u32..16,
            cores in 1u32..16,
            prefer_cores in any::<bool>(),
        ) {
            let req = TopologyRequest {
                maxcpus: Some(maxcpus),
                sockets: Some(sockets),
                cores: Some(cores),
                ..Default::default()
            };
            let rules = TopologyRules { prefer_cores, ..Default::default() };
            let known = sockets * cores;
            match solve(&req, &rules) {
                Ok(topo) => {
                    prop_assert_eq!(maxcpus % known, 0);
                    prop_assert_eq!(topo.threads, maxcpus / known);
                    prop_assert_eq!(topo.product(), u64::from(maxcpus));
                }
                Err(_) => {
                    prop_assert!(maxcpus % known != 0 || maxcpus < known);
                }
            }
        }

        #[test]
        fn solved_topologies_multiply_out(
            smp in 1u32..256,
            threads in prop::option::of(1u32..4),
            prefer_cores in any::<bool>(),
        ) {
            let req = TopologyRequest {
                smp: Some(smp),
                threads,
                ..Default::default()
            };
            let rules = TopologyRules { prefer_cores, ..Default::default() };
            if let Ok(topo) = solve(&req, &rules) {
                prop_assert_eq!(topo.product(), u64::from(smp));
                prop_assert!(topo.smp <= topo.maxcpus);
            }
        }
    }
}
