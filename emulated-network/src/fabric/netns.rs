use crate::fabric::{CommandChannels, NetworkFabric};
use crate::interface_name;
use crate::network::link::{LinkParams, LinkParamsUpdate};
use crate::network::spec::NodeKind;
use crate::network::topology::TopologyLink;
use anyhow::{Context, bail};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::process::Command;

const BRIDGE: &str = "br0";

/// Namespace per node (`fw-<node>`), bridges for switches and `tc netem` on both veth ends.
#[derive(Default)]
pub struct NetnsFabric {
    channels: CommandChannels,
    nodes: Vec<(Arc<str>, NodeKind)>,
    links: Vec<TopologyLink>,
    link_params: Mutex<HashMap<String, LinkParams>>,
    started: bool,
}

fn namespace(node: &str) -> String {
    format!("fw-{node}")
}

/// Runs `command` on the controlling host, failing if it exits unsuccessfully
async fn run_on_host(command: &str) -> anyhow::Result<String> {
    tracing::debug!(command, "running host command");
    let output = Command::new("sh")
        .arg("-c")
        .arg(command)
        .output()
        .await
        .with_context(|| format!("failed to spawn `{command}`"))?;

    if !output.status.success() {
        bail!(
            "`{command}` exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl NetnsFabric {
    pub fn new() -> Self {
        Self::default()
    }

    fn kind_of(&self, node: &str) -> Option<NodeKind> {
        self.nodes
            .iter()
            .find(|(name, _)| &**name == node)
            .map(|(_, kind)| *kind)
    }

    async fn create_node(&self, node: &str, kind: NodeKind) -> anyhow::Result<()> {
        let ns = namespace(node);
        run_on_host(&format!("ip netns add {ns}")).await?;
        run_on_host(&format!("ip -n {ns} link set lo up")).await?;
        if kind == NodeKind::Switch {
            run_on_host(&format!("ip -n {ns} link add {BRIDGE} type bridge")).await?;
            run_on_host(&format!("ip -n {ns} link set {BRIDGE} up")).await?;
        }
        Ok(())
    }

    async fn create_link(&self, link: &TopologyLink) -> anyhow::Result<()> {
        let ends = [(&link.node1, link.port1), (&link.node2, link.port2)];
        let [(node1, port1), (node2, port2)] = ends;
        run_on_host(&format!(
            "ip link add {} netns {} type veth peer name {} netns {}",
            interface_name(node1, port1),
            namespace(node1),
            interface_name(node2, port2),
            namespace(node2),
        ))
        .await?;

        for (node, port) in ends {
            let ns = namespace(node);
            let interface = interface_name(node, port);
            run_on_host(&format!("ip -n {ns} link set {interface} up")).await?;
            if self.kind_of(node) == Some(NodeKind::Switch) {
                run_on_host(&format!("ip -n {ns} link set {interface} master {BRIDGE}")).await?;
            }

            // Offloading would let the kernel hand netem super-sized segments
            run_on_host(&format!(
                "ip netns exec {ns} ethtool -K {interface} tso off gso off gro off"
            ))
            .await?;
            run_on_host(&format!(
                "ip netns exec {ns} {}",
                link.params.to_tc_command(&interface)
            ))
            .await?;
            self.link_params.lock().insert(interface, link.params.clone());
        }

        Ok(())
    }
}

impl NetworkFabric for NetnsFabric {
    fn add_node(&mut self, name: &str, kind: NodeKind) -> anyhow::Result<()> {
        if self.kind_of(name).is_some() {
            bail!("node `{name}` already exists");
        }
        self.nodes.push((name.into(), kind));
        self.channels.register(name);
        Ok(())
    }

    fn add_link(&mut self, link: &TopologyLink) -> anyhow::Result<()> {
        for node in [&link.node1, &link.node2] {
            if self.kind_of(node).is_none() {
                bail!("node `{node}` does not exist");
            }
        }
        self.links.push(link.clone());
        Ok(())
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        for (node, kind) in &self.nodes {
            self.create_node(node, *kind)
                .await
                .with_context(|| format!("failed to create namespace for `{node}`"))?;
        }

        for link in &self.links {
            self.create_link(link).await.with_context(|| {
                format!("failed to link `{}` and `{}`", link.node1, link.node2)
            })?;
        }

        let hosts = self
            .nodes
            .iter()
            .filter(|(_, kind)| *kind == NodeKind::Host);
        for (i, (host, _)) in hosts.enumerate() {
            let primary = interface_name(host, 0);
            if !self.link_params.lock().contains_key(&primary) {
                tracing::warn!("host `{host}` is not connected to anything");
                continue;
            }

            let address = Ipv4Addr::from_bits(u32::from(Ipv4Addr::new(10, 0, 0, 1)) + i as u32);
            run_on_host(&format!(
                "ip -n {} addr add {address}/8 dev {primary}",
                namespace(host)
            ))
            .await?;
        }

        self.started = true;
        tracing::info!(
            nodes = self.nodes.len(),
            links = self.links.len(),
            "network namespaces are up"
        );
        Ok(())
    }

    async fn cmd(&self, node: &str, command: &str) -> anyhow::Result<String> {
        if !self.started {
            bail!("cannot run `{command}` on `{node}`: the fabric has not been started");
        }

        let _channel = self.channels.acquire(node).await?;
        tracing::debug!(node, command, "running node command");

        let output = Command::new("ip")
            .args(["netns", "exec", &namespace(node), "sh", "-c", command])
            .output()
            .await
            .with_context(|| format!("failed to run `{command}` on `{node}`"))?;

        if !output.status.success() {
            tracing::warn!(
                node,
                command,
                status = %output.status,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "node command failed"
            );
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn configure_interface(
        &self,
        node: &str,
        interface: &str,
        update: &LinkParamsUpdate,
    ) -> anyhow::Result<LinkParams> {
        let Some(mut params) = self.link_params.lock().get(interface).cloned() else {
            bail!("interface `{interface}` does not exist");
        };
        params.apply(update);

        self.cmd(node, &params.to_tc_command(interface)).await?;
        self.link_params
            .lock()
            .insert(interface.to_string(), params.clone());

        Ok(params)
    }

    async fn stop(&self) -> anyhow::Result<()> {
        let mut failed = false;
        for (node, _) in &self.nodes {
            let ns = namespace(node);
            let teardown = format!("ip netns pids {ns} | xargs -r kill -9; ip netns del {ns}");
            if let Err(e) = run_on_host(&teardown).await {
                tracing::warn!("failed to tear down `{node}`: {e:?}");
                failed = true;
            }
        }

        if failed {
            bail!("some network namespaces could not be removed");
        }
        Ok(())
    }
}
