pub mod mock;
pub mod netns;

use crate::network::ip;
use crate::network::link::{LinkParams, LinkParamsUpdate};
use crate::network::spec::NodeKind;
use crate::network::topology::{Topology, TopologyLink};
use anyhow::{Context, anyhow};
use async_lock::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Nodes and links are declared first and only come to life in [`NetworkFabric::start`], which is
/// also when interfaces get their addresses. Every node has a single command channel: at most one
/// command runs on a given node at any time, across all callers.
pub trait NetworkFabric: Send + Sync + 'static {
    fn add_node(&mut self, name: &str, kind: NodeKind) -> anyhow::Result<()>;

    fn add_link(&mut self, link: &TopologyLink) -> anyhow::Result<()>;

    fn start(&mut self) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Runs `command` on `node` through the node's command channel, returning its output
    ///
    /// Waits for any command already running on the same node to finish first.
    fn cmd(&self, node: &str, command: &str) -> impl Future<Output = anyhow::Result<String>> + Send;

    /// Reconfigures the conditions of `interface` (which belongs to `node`), merging `update` over
    /// its current parameters, and returns the resulting parameters
    fn configure_interface(
        &self,
        node: &str,
        interface: &str,
        update: &LinkParamsUpdate,
    ) -> impl Future<Output = anyhow::Result<LinkParams>> + Send;

    fn stop(&self) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Queries the current (first) IPv4 address of `interface`
    fn interface_ip(
        &self,
        node: &str,
        interface: &str,
    ) -> impl Future<Output = anyhow::Result<Option<Ipv4Addr>>> + Send {
        async move {
            let output = self
                .cmd(node, &ip::show_interface_addresses(interface))
                .await?;
            Ok(ip::parse_interface_addresses(&output)
                .into_iter()
                .find(|(name, _)| name == interface)
                .map(|(_, address)| address))
        }
    }
}

/// Declares every node and link of `topology` on `fabric` and starts it
pub async fn build<F: NetworkFabric>(fabric: &mut F, topology: &Topology) -> anyhow::Result<()> {
    for node in topology.nodes() {
        fabric
            .add_node(&node.name, node.kind)
            .with_context(|| format!("failed to add node `{}`", node.name))?;
    }
    for link in topology.links() {
        fabric.add_link(link).with_context(|| {
            format!("failed to add link between `{}` and `{}`", link.node1, link.node2)
        })?;
    }

    fabric.start().await.context("failed to start the fabric")
}

/// One command channel per node
#[derive(Default)]
pub struct CommandChannels {
    channels: HashMap<Arc<str>, Mutex<()>>,
}

impl CommandChannels {
    pub fn register(&mut self, node: &str) {
        self.channels.entry(node.into()).or_default();
    }

    pub async fn acquire(&self, node: &str) -> anyhow::Result<MutexGuard<'_, ()>> {
        let channel = self
            .channels
            .get(node)
            .ok_or_else(|| anyhow!("node `{node}` does not exist"))?;
        Ok(channel.lock().await)
    }
}
