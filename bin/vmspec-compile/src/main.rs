// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::Parser;
use slog::{o, Drain, Level, Logger};
use vmspec::capability::{CapabilityOracle, CapabilitySet, QemuProbe};
use vmspec::host::{HostResources, LocalHost, StaticHost};
use vmspec::ids::{IdSource, SeededIds, SequentialIds};
use vmspec::Compiler;
use vmspec_types::instance_spec::InstanceSpec;

#[derive(Debug, Parser)]
#[clap(about, version)]
/// Compile a test parameter file into a VM hardware specification
struct Opt {
    /// Parameter file: TOML, or `key = value` lines
    #[clap(action, required_unless_present = "schema")]
    params: Option<PathBuf>,

    /// Capability snapshot (TOML) describing the target hypervisor
    #[clap(long, action, conflicts_with = "qemu")]
    caps: Option<PathBuf>,

    /// Probe this hypervisor binary for capabilities instead
    #[clap(long, action)]
    qemu: Option<String>,

    /// Instance name
    #[clap(long, default_value = "vm1", action)]
    vm_name: String,

    /// Usable host memory (MiB); read from the running host when absent
    #[clap(long, action)]
    host_memory: Option<u64>,

    /// Seed for generated UUIDs and MAC addresses
    #[clap(long, action, conflicts_with = "sequential_ids")]
    seed: Option<u64>,

    /// Generate UUIDs and MAC addresses from a counter
    #[clap(long, action)]
    sequential_ids: bool,

    /// Print the JSON schema of the output and exit
    #[clap(long, action)]
    schema: bool,

    /// Enable debugging
    #[clap(short, long, action)]
    debug: bool,
}

fn create_logger(opt: &Opt) -> Logger {
    let decorator = slog_term::TermDecorator::new().stderr().build();
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let level = if opt.debug { Level::Debug } else { Level::Info };
    let drain = slog::LevelFilter(drain, level).fuse();
    let drain = slog_async::Async::new(drain).build().fuse();

    Logger::root(drain, o!())
}

fn oracle(
    opt: &Opt,
    log: &Logger,
) -> anyhow::Result<Box<dyn CapabilityOracle>> {
    match (&opt.caps, &opt.qemu) {
        (Some(path), _) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            let caps = CapabilitySet::from_toml_str(&raw)
                .with_context(|| format!("parsing {}", path.display()))?;
            Ok(Box::new(caps))
        }
        (None, Some(binary)) => Ok(Box::new(QemuProbe::new(
            log.new(o!("component" => "probe")),
            binary.as_str(),
        ))),
        (None, None) => bail!("one of --caps or --qemu is required"),
    }
}

fn main() -> anyhow::Result<()> {
    let opt = Opt::parse();

    if opt.schema {
        let schema = schemars::schema_for!(InstanceSpec);
        println!("{}", serde_json::to_string_pretty(&schema)?);
        return Ok(());
    }

    let log = create_logger(&opt);
    let Some(params_path) = &opt.params else {
        bail!("a parameter file is required");
    };
    let params = vmspec_params::parse(params_path)
        .with_context(|| format!("loading {}", params_path.display()))?;

    let oracle = oracle(&opt, &log)?;
    let host: Box<dyn HostResources> = match opt.host_memory {
        Some(mib) => Box::new(StaticHost::with_memory_mib(mib)),
        None => Box::new(LocalHost::new(log.new(o!("component" => "host")))),
    };
    let mut ids: Box<dyn IdSource> = match (opt.sequential_ids, opt.seed) {
        (true, _) => Box::new(SequentialIds::new()),
        (false, Some(seed)) => Box::new(SeededIds::new(seed)),
        (false, None) => Box::new(SeededIds::new(rand::random())),
    };

    let compiler = Compiler::new(log.clone(), oracle.as_ref(), host.as_ref());
    let spec = compiler
        .compile(&opt.vm_name, &params, ids.as_mut())
        .with_context(|| format!("compiling {}", opt.vm_name))?;

    println!("{}", serde_json::to_string_pretty(&spec)?);
    Ok(())
}
