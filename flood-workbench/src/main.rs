use crate::agent::flood::FloodAgent;
use crate::agent::naive::NaiveAgent;
use crate::config::cli::{AgentKind, CliOpt, Command, RunOpt};
use crate::config::{RunConfig, load_topology, load_trace};
use crate::controller::Controller;
use crate::report::RunReport;
use anyhow::Context;
use clap::Parser;
use emulated_network::Topology;
use emulated_network::fabric::netns::NetnsFabric;
use emulated_network::routing::plan_routing_updates;
use tracing_subscriber::EnvFilter;

mod agent;
mod completion;
mod config;
mod controller;
mod jct;
mod report;
mod util;

fn main() -> anyhow::Result<()> {
    let options = CliOpt::parse();
    init_logging(&options);

    let topology = load_topology(options.topology.as_deref())?;
    match &options.command {
        Command::PlanRoutes => plan_routes(&topology),
        Command::Run(run_options) => {
            let rt = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("failed to initialize tokio")?;
            rt.block_on(run(run_options, topology))
        }
    }
}

/// Logs go to stderr, so stdout only carries the run's results
fn init_logging(options: &CliOpt) {
    let level = if options.debug {
        "debug"
    } else if options.warning {
        "warn"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn plan_routes(topology: &Topology) -> anyhow::Result<()> {
    util::print_topology(topology);
    let updates = plan_routing_updates(topology).context("failed to plan routing")?;
    util::print_routing_updates(&updates);
    Ok(())
}

async fn run(options: &RunOpt, topology: Topology) -> anyhow::Result<()> {
    let events = load_trace(options.trace_file.as_deref())?;
    let config = RunConfig::from_options(options);

    println!("--- Params ---");
    println!("* Agent: {:?}", config.agent);
    println!("* Source: {}", config.source);
    println!("* File size: {} bytes", config.file_size);
    println!("* File seed: {}", config.file_seed);
    println!("* Link events: {}", events.len());
    util::print_topology(&topology);

    let controller = Controller::start(NetnsFabric::new(), topology, events, config).await?;
    let topology = controller.topology().clone();
    let config = controller.config().clone();
    let outcome = match config.agent {
        AgentKind::Naive => controller.run::<NaiveAgent<NetnsFabric>>().await?,
        AgentKind::Flood => controller.run::<FloodAgent<NetnsFabric>>().await?,
    };

    util::print_results(&outcome.agents, outcome.final_jct);

    if let Some(path) = &config.report {
        RunReport::new(&outcome, &config, &topology).save(path)?;
        println!("* Report saved to {}", path.display());
    }

    Ok(())
}
