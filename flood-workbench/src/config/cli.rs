use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(about = "Measures file distribution over emulated multi-path networks")]
pub struct CliOpt {
    /// Path to the topology description
    ///
    /// If not provided, a minimal topology is used: hosts `src` and `d1` joined by switch `s1`
    #[arg(long, global = true)]
    pub topology: Option<PathBuf>,

    /// Log debug messages (including every command run on a node)
    #[arg(long, global = true, conflicts_with = "warning")]
    pub debug: bool,

    /// Only log warnings and errors
    #[arg(long, global = true)]
    pub warning: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Build the network, distribute a file from the source to every other host and report the
    /// job completion times (requires root)
    Run(RunOpt),
    /// Print the routing updates the topology needs, without building anything
    PlanRoutes,
}

#[derive(Parser, Debug, Clone)]
pub struct RunOpt {
    /// Path to the trace of link-condition changes applied during the run
    #[arg(long)]
    pub trace_file: Option<PathBuf>,

    /// The agent distributing the file
    #[arg(long, value_enum, default_value_t = AgentKind::Flood)]
    pub agent: AgentKind,

    /// Path to the external workload binary (used by the `flood` agent)
    #[arg(long, default_value = "/floodclone/floodclone")]
    pub workload_bin: PathBuf,

    /// Directory holding one private directory per host
    #[arg(long, default_value = "/var/mn")]
    pub workdir: PathBuf,

    /// The host that owns the file at the start of the run
    #[arg(long, default_value = "src")]
    pub source: String,

    /// The size of the distributed file, in bytes
    #[arg(long, default_value_t = 1024 * 1024)]
    pub file_size: u64,

    /// The random seed used to generate the contents of the distributed file
    #[arg(long, default_value_t = 42)]
    pub file_seed: u64,

    /// Whether the file contents should be non-deterministic, i.e. generated with a random seed
    #[arg(long)]
    pub non_deterministic: bool,

    /// How often to check whether a workload has signaled completion
    #[arg(long, default_value_t = 50)]
    pub poll_interval_ms: u64,

    /// Path where a JSON report of the run should be stored
    #[arg(long)]
    pub report: Option<PathBuf>,
}

#[derive(ValueEnum, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    /// Every destination downloads the file straight from the source over HTTP
    Naive,
    /// Every host runs the external workload binary
    Flood,
}
