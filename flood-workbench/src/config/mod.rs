use crate::config::cli::{AgentKind, RunOpt};
use anyhow::Context;
use emulated_network::Topology;
use emulated_network::network::event::NetworkEvents;
use emulated_network::network::spec::TopologySpec;
use fastrand::Rng;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub mod cli;

pub const FILE_NAME: &str = "file";

pub struct RunConfig {
    pub agent: AgentKind,
    pub workload_bin: PathBuf,
    pub workdir: PathBuf,
    pub source: String,
    pub file_size: u64,
    pub file_seed: u64,
    pub poll_interval: Duration,
    pub report: Option<PathBuf>,
}

impl RunConfig {
    pub fn from_options(options: &RunOpt) -> Self {
        let file_seed = if options.non_deterministic {
            Rng::new().u64(..)
        } else {
            options.file_seed
        };

        Self {
            agent: options.agent,
            workload_bin: options.workload_bin.clone(),
            workdir: options.workdir.clone(),
            source: options.source.clone(),
            file_size: options.file_size,
            file_seed,
            poll_interval: Duration::from_millis(options.poll_interval_ms),
            report: options.report.clone(),
        }
    }

    /// The private directory of `host`
    pub fn host_dir(&self, host: &str) -> PathBuf {
        self.workdir.join(host)
    }

    /// Where `host` keeps (or should end up having) the distributed file
    pub fn file_path(&self, host: &str) -> PathBuf {
        self.host_dir(host).join(FILE_NAME)
    }
}

pub fn load_topology(path: Option<&Path>) -> anyhow::Result<Topology> {
    let spec = match path {
        Some(path) => {
            let description = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read topology from {}", path.display()))?;
            description
                .parse::<TopologySpec>()
                .with_context(|| format!("invalid topology file {}", path.display()))?
        }
        None => TopologySpec::default_topology(),
    };

    Topology::from_spec(spec).context("invalid topology")
}

pub fn load_trace(path: Option<&Path>) -> anyhow::Result<NetworkEvents> {
    let Some(path) = path else {
        return Ok(NetworkEvents::default());
    };

    let trace = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read trace from {}", path.display()))?;
    trace
        .parse::<NetworkEvents>()
        .with_context(|| format!("invalid trace file {}", path.display()))
}
