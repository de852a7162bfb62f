pub mod flood;
pub mod naive;

use crate::config::RunConfig;
use emulated_network::NetworkFabric;
use emulated_network::discovery::NetworkInfo;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Shared, read-only state every agent of a run has access to
pub struct AgentContext<F> {
    pub fabric: Arc<F>,
    pub config: Arc<RunConfig>,
    pub network_info: Arc<NetworkInfo>,
}

#[derive(Clone, Debug)]
pub struct AgentState {
    pub id: usize,
    pub node: String,
    pub source: String,
    /// Set right before the workload is launched, possibly refined by the workload itself
    pub start_time: Option<SystemTime>,
    /// Set once completion has been observed
    pub end_time: Option<SystemTime>,
}

impl AgentState {
    pub fn new(id: usize, node: &str, source: &str) -> Self {
        Self {
            id,
            node: node.to_string(),
            source: source.to_string(),
            start_time: None,
            end_time: None,
        }
    }

    pub fn is_source(&self) -> bool {
        self.node == self.source
    }

    /// Job completion time, undefined until both timestamps are known
    pub fn jct(&self) -> Option<Duration> {
        let start = self.start_time?;
        let end = self.end_time?;
        Some(end.duration_since(start).unwrap_or_default())
    }
}

pub trait Agent<F: NetworkFabric>: Send + Sized + 'static {
    fn new(state: AgentState, context: Arc<AgentContext<F>>) -> Self;

    /// Launches the agent's work on its node, returning as soon as the node's command channel is
    /// free again
    fn start_download(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Waits until the agent's work is done and records its end time
    fn wait_output(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send;

    fn state(&self) -> &AgentState;

    fn jct(&self) -> Option<Duration> {
        self.state().jct()
    }
}
