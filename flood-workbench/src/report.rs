use crate::agent::AgentState;
use crate::config::RunConfig;
use crate::config::cli::AgentKind;
use crate::controller::RunOutcome;
use anyhow::Context;
use emulated_network::Topology;
use serde::Serialize;
use serde_with::{DurationSecondsWithFrac, TimestampMicroSecondsWithFrac, serde_as};
use std::path::Path;
use std::time::{Duration, SystemTime};
use uuid::Uuid;

#[serde_as]
#[derive(Serialize)]
pub struct RunReport {
    pub run_id: Uuid,
    pub agent: AgentKind,
    pub source: String,
    pub file_size: u64,
    pub file_seed: u64,
    pub source_sha256: String,
    pub hosts: usize,
    pub switches: usize,
    pub links: usize,
    pub link_events_applied: usize,
    pub agents: Vec<AgentReport>,
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    pub final_jct: Option<Duration>,
}

#[serde_as]
#[derive(Serialize)]
pub struct AgentReport {
    pub id: usize,
    pub node: String,
    #[serde_as(as = "Option<TimestampMicroSecondsWithFrac<f64>>")]
    pub start_time: Option<SystemTime>,
    #[serde_as(as = "Option<TimestampMicroSecondsWithFrac<f64>>")]
    pub end_time: Option<SystemTime>,
    #[serde_as(as = "Option<DurationSecondsWithFrac<f64>>")]
    pub jct: Option<Duration>,
}

impl From<&AgentState> for AgentReport {
    fn from(state: &AgentState) -> Self {
        Self {
            id: state.id,
            node: state.node.clone(),
            start_time: state.start_time,
            end_time: state.end_time,
            jct: state.jct(),
        }
    }
}

impl RunReport {
    pub fn new(outcome: &RunOutcome, config: &RunConfig, topology: &Topology) -> Self {
        Self {
            run_id: outcome.run_id,
            agent: config.agent,
            source: config.source.clone(),
            file_size: config.file_size,
            file_seed: config.file_seed,
            source_sha256: outcome.source_hash.clone(),
            hosts: topology.hosts().count(),
            switches: topology.switches().count(),
            links: topology.links().len(),
            link_events_applied: outcome.scheduler.applied,
            agents: outcome.agents.iter().map(AgentReport::from).collect(),
            final_jct: outcome.final_jct,
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self).context("failed to serialize run report")?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write run report to {}", path.display()))
    }
}
