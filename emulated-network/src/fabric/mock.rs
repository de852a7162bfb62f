use crate::fabric::{CommandChannels, NetworkFabric};
use crate::interface_name;
use crate::network::ip::Ipv4Cidr;
use crate::network::link::{LinkParams, LinkParamsUpdate};
use crate::network::spec::NodeKind;
use crate::network::topology::TopologyLink;
use anyhow::{anyhow, bail};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet};
use std::fmt::Write;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

const MAX_HOPS: usize = 30;

type CommandHook = dyn Fn(&str, &str) + Send + Sync;

#[derive(Default)]
pub struct MockFabric {
    channels: CommandChannels,
    state: Mutex<MockState>,
    command_delay: Duration,
    hooks: Mutex<Vec<Arc<CommandHook>>>,
}

#[derive(Clone, Debug)]
pub struct RecordedCommand {
    pub at: Instant,
    pub node: String,
    pub command: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MockRoute {
    pub destination: Ipv4Addr,
    pub device: Option<String>,
    pub gateway: Option<Ipv4Addr>,
}

#[derive(Default)]
struct MockState {
    nodes: Vec<(Arc<str>, NodeKind)>,
    links: Vec<TopologyLink>,
    started: bool,
    stopped: bool,
    /// Interfaces of each node, in port order
    node_interfaces: HashMap<String, Vec<String>>,
    addresses: HashMap<String, Vec<Ipv4Cidr>>,
    routes: HashMap<String, Vec<MockRoute>>,
    ip_forwarding: HashSet<String>,
    link_params: HashMap<String, LinkParams>,
    commands: Vec<RecordedCommand>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

impl MockFabric {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every command take `delay` to complete (while holding the node's command channel)
    pub fn with_command_delay(mut self, delay: Duration) -> Self {
        self.command_delay = delay;
        self
    }

    /// Registers a callback invoked with `(node, command)` for every command, before it is
    /// interpreted
    ///
    /// Useful to emulate the side effects of external programs launched on a node.
    pub fn on_command(&self, hook: impl Fn(&str, &str) + Send + Sync + 'static) {
        self.hooks.lock().push(Arc::new(hook));
    }

    pub fn commands(&self) -> Vec<RecordedCommand> {
        self.state.lock().commands.clone()
    }

    pub fn commands_on(&self, node: &str) -> Vec<String> {
        self.state
            .lock()
            .commands
            .iter()
            .filter(|c| c.node == node)
            .map(|c| c.command.clone())
            .collect()
    }

    pub fn addresses(&self, interface: &str) -> Vec<Ipv4Addr> {
        self.state
            .lock()
            .addresses
            .get(interface)
            .map(|a| a.iter().map(|c| c.address).collect())
            .unwrap_or_default()
    }

    pub fn routes(&self, node: &str) -> Vec<MockRoute> {
        self.state
            .lock()
            .routes
            .get(node)
            .cloned()
            .unwrap_or_default()
    }

    pub fn ip_forwarding(&self, node: &str) -> bool {
        self.state.lock().ip_forwarding.contains(node)
    }

    pub fn link_params(&self, interface: &str) -> Option<LinkParams> {
        self.state.lock().link_params.get(interface).cloned()
    }

    /// The highest number of commands that ever ran at the same time on `node`
    pub fn max_concurrent_commands(&self, node: &str) -> usize {
        self.state
            .lock()
            .max_in_flight
            .get(node)
            .copied()
            .unwrap_or_default()
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }
}

impl NetworkFabric for MockFabric {
    fn add_node(&mut self, name: &str, kind: NodeKind) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        if state.nodes.iter().any(|(n, _)| &**n == name) {
            bail!("node `{name}` already exists");
        }
        state.nodes.push((name.into(), kind));
        state.node_interfaces.insert(name.to_string(), Vec::new());
        self.channels.register(name);
        Ok(())
    }

    fn add_link(&mut self, link: &TopologyLink) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        for (node, port) in [(&link.node1, link.port1), (&link.node2, link.port2)] {
            let interface = interface_name(node, port);
            state
                .node_interfaces
                .get_mut(&**node)
                .ok_or_else(|| anyhow!("node `{node}` does not exist"))?
                .push(interface.clone());
            state.addresses.insert(interface.clone(), Vec::new());
            state.link_params.insert(interface, link.params.clone());
        }
        state.links.push(link.clone());
        Ok(())
    }

    async fn start(&mut self) -> anyhow::Result<()> {
        let mut state = self.state.lock();
        let hosts: Vec<Arc<str>> = state
            .nodes
            .iter()
            .filter(|(_, kind)| *kind == NodeKind::Host)
            .map(|(name, _)| name.clone())
            .collect();

        // Primary interfaces get consecutive addresses in the 10.0.0.0/8 network
        for (i, host) in hosts.iter().enumerate() {
            let primary = interface_name(host, 0);
            if let Some(addresses) = state.addresses.get_mut(&primary) {
                addresses.push(Ipv4Cidr {
                    address: Ipv4Addr::from_bits(u32::from(Ipv4Addr::new(10, 0, 0, 1)) + i as u32),
                    network_prefix: 8,
                });
            }
        }

        state.started = true;
        Ok(())
    }

    async fn cmd(&self, node: &str, command: &str) -> anyhow::Result<String> {
        let _channel = self.channels.acquire(node).await?;

        {
            let mut state = self.state.lock();
            if !state.started {
                bail!("cannot run `{command}` on `{node}`: the fabric has not been started");
            }
            state.commands.push(RecordedCommand {
                at: Instant::now(),
                node: node.to_string(),
                command: command.to_string(),
            });
            let in_flight = state.in_flight.entry(node.to_string()).or_default();
            *in_flight += 1;
            let in_flight = *in_flight;
            let max = state.max_in_flight.entry(node.to_string()).or_default();
            *max = (*max).max(in_flight);
        }

        if !self.command_delay.is_zero() {
            tokio::time::sleep(self.command_delay).await;
        }

        let hooks = self.hooks.lock().clone();
        for hook in hooks {
            hook(node, command);
        }

        let mut state = self.state.lock();
        let output = state.execute(node, command);
        if let Some(in_flight) = state.in_flight.get_mut(node) {
            *in_flight -= 1;
        }
        output
    }

    async fn configure_interface(
        &self,
        node: &str,
        interface: &str,
        update: &LinkParamsUpdate,
    ) -> anyhow::Result<LinkParams> {
        let mut params = {
            let state = self.state.lock();
            state.ensure_interface(node, interface)?;
            state
                .link_params
                .get(interface)
                .cloned()
                .unwrap_or_default()
        };
        params.apply(update);

        self.cmd(node, &params.to_tc_command(interface)).await?;
        self.state
            .lock()
            .link_params
            .insert(interface.to_string(), params.clone());

        Ok(params)
    }

    async fn stop(&self) -> anyhow::Result<()> {
        self.state.lock().stopped = true;
        Ok(())
    }
}

impl MockState {
    fn ensure_interface(&self, node: &str, interface: &str) -> anyhow::Result<()> {
        let owned = self
            .node_interfaces
            .get(node)
            .is_some_and(|interfaces| interfaces.iter().any(|i| i == interface));
        if !owned {
            bail!("Cannot find device \"{interface}\" on `{node}`");
        }
        Ok(())
    }

    fn execute(&mut self, node: &str, command: &str) -> anyhow::Result<String> {
        let parts: Vec<&str> = command.split_whitespace().collect();
        let output = match parts.as_slice() {
            ["ip", "addr", "flush", "dev", dev] => {
                self.ensure_interface(node, dev)?;
                if let Some(addresses) = self.addresses.get_mut(*dev) {
                    addresses.clear();
                }
                String::new()
            }
            ["ip", "addr", "add", cidr, "dev", dev] => {
                self.ensure_interface(node, dev)?;
                let cidr: Ipv4Cidr = cidr.parse()?;
                self.addresses.entry(dev.to_string()).or_default().push(cidr);
                String::new()
            }
            ["ip", "addr", "show"] => self.show_addresses(node),
            ["ip", "-4", "-o", "addr", "show", "dev", dev] => {
                self.ensure_interface(node, dev)?;
                self.show_interface_one_line(dev)
            }
            ["ip", "route", "add", destination, "dev", dev] => {
                self.ensure_interface(node, dev)?;
                self.add_route(node, destination, Some(dev.to_string()), None)?
            }
            ["ip", "route", "add", destination, "via", gateway] => {
                self.add_route(node, destination, None, Some(gateway.parse()?))?
            }
            ["ip", "route", "get", destination] => self.route_get(node, destination.parse()?),
            ["sysctl", "-w", "net.ipv4.ip_forward=1"] => {
                self.ip_forwarding.insert(node.to_string());
                "net.ipv4.ip_forward = 1\n".to_string()
            }
            ["mtr", "-n", "-c", "1", "-r", "-I", dev, destination] => {
                self.trace(node, dev, destination.parse()?)
            }
            ["sha256sum", path] => match std::fs::read(path) {
                Ok(contents) => format!("{}  {path}\n", hex::encode(Sha256::digest(&contents))),
                Err(_) => format!("sha256sum: {path}: No such file or directory\n"),
            },
            // Anything else (shell plumbing, `tc`, launching programs) has no effect on the model
            _ => String::new(),
        };

        Ok(output)
    }

    fn add_route(
        &mut self,
        node: &str,
        destination: &str,
        device: Option<String>,
        gateway: Option<Ipv4Addr>,
    ) -> anyhow::Result<String> {
        let destination: Ipv4Cidr = destination.parse()?;
        self.routes
            .entry(node.to_string())
            .or_default()
            .push(MockRoute {
                destination: destination.address,
                device,
                gateway,
            });
        Ok(String::new())
    }

    fn show_addresses(&self, node: &str) -> String {
        let mut output = String::new();
        _ = writeln!(
            output,
            "1: lo: <LOOPBACK,UP,LOWER_UP> mtu 65536 qdisc noqueue state UNKNOWN\n    inet 127.0.0.1/8 scope host lo"
        );
        let interfaces = self.node_interfaces.get(node).cloned().unwrap_or_default();
        for (i, interface) in interfaces.iter().enumerate() {
            _ = writeln!(
                output,
                "{}: {interface}@if{}: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1500 qdisc netem state UP",
                i + 2,
                i + 100
            );
            for cidr in self.addresses.get(interface).into_iter().flatten() {
                _ = writeln!(output, "    inet {cidr} scope global {interface}");
            }
        }
        output
    }

    fn show_interface_one_line(&self, interface: &str) -> String {
        let mut output = String::new();
        for cidr in self.addresses.get(interface).into_iter().flatten() {
            _ = writeln!(
                output,
                "2: {interface}    inet {cidr} scope global {interface}\\       valid_lft forever preferred_lft forever"
            );
        }
        output
    }

    fn owner_of(&self, address: Ipv4Addr) -> Option<String> {
        self.node_interfaces.iter().find_map(|(node, interfaces)| {
            interfaces
                .iter()
                .any(|i| {
                    self.addresses
                        .get(i)
                        .is_some_and(|a| a.iter().any(|c| c.address == address))
                })
                .then(|| node.clone())
        })
    }

    fn primary_address(&self, interface: &str) -> Option<Ipv4Addr> {
        self.addresses.get(interface)?.first().map(|c| c.address)
    }

    /// Resolves the gateway (if any) and outgoing device `node` uses to reach `destination`
    fn resolve(&self, node: &str, destination: Ipv4Addr) -> Option<(Option<Ipv4Addr>, String)> {
        if let Some(route) = self
            .routes
            .get(node)
            .and_then(|routes| routes.iter().find(|r| r.destination == destination))
        {
            if let Some(device) = &route.device {
                return Some((None, device.clone()));
            }
            if let Some(gateway) = route.gateway {
                let (_, device) = self.connected_device(node, gateway)?;
                return Some((Some(gateway), device));
            }
        }

        self.connected_device(node, destination)
    }

    // Device routes first, then the 10.0.0.0/8 network attached to the primary interface
    fn connected_device(
        &self,
        node: &str,
        destination: Ipv4Addr,
    ) -> Option<(Option<Ipv4Addr>, String)> {
        if let Some(device) = self.routes.get(node).and_then(|routes| {
            routes
                .iter()
                .find(|r| r.destination == destination)
                .and_then(|r| r.device.clone())
        }) {
            return Some((None, device));
        }

        let primary = interface_name(node, 0);
        let in_primary_network = self
            .addresses
            .get(&primary)?
            .iter()
            .any(|c| c.network_prefix == 8 && c.address.octets()[0] == destination.octets()[0]);
        in_primary_network.then_some((None, primary))
    }

    fn route_get(&self, node: &str, destination: Ipv4Addr) -> String {
        match self.resolve(node, destination) {
            Some((gateway, device)) => {
                let source = self
                    .primary_address(&device)
                    .unwrap_or(Ipv4Addr::UNSPECIFIED);
                let via = gateway.map(|g| format!("via {g} ")).unwrap_or_default();
                format!("{destination} {via}dev {device} src {source} uid 0 \n    cache \n")
            }
            None => "RTNETLINK answers: Network is unreachable\n".to_string(),
        }
    }

    fn trace(&self, node: &str, device: &str, destination: Ipv4Addr) -> String {
        let mut hops = Vec::new();
        let mut current = node.to_string();
        let direct_on_device = self.routes.get(node).is_some_and(|routes| {
            routes
                .iter()
                .any(|r| r.destination == destination && r.device.as_deref() == Some(device))
        });

        if direct_on_device {
            hops.push(destination.to_string());
        } else {
            for _ in 0..MAX_HOPS {
                let Some((gateway, _)) = self.resolve(&current, destination) else {
                    hops.push("???".to_string());
                    break;
                };
                let Some(gateway) = gateway else {
                    hops.push(destination.to_string());
                    break;
                };

                hops.push(gateway.to_string());
                match self.owner_of(gateway) {
                    Some(relay) if self.ip_forwarding.contains(&relay) => current = relay,
                    _ => {
                        hops.push("???".to_string());
                        break;
                    }
                }
            }
        }

        let mut output = String::new();
        _ = writeln!(output, "Start: 2026-01-01T00:00:00+0000");
        _ = writeln!(
            output,
            "HOST: {node:<30}Loss%   Snt   Last   Avg  Best  Wrst StDev"
        );
        for (i, hop) in hops.iter().enumerate() {
            _ = writeln!(
                output,
                "  {}.|-- {hop:<26} 0.0%     1    0.1   0.1   0.1   0.1   0.0",
                i + 1
            );
        }
        output
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fabric::build;
    use crate::network::spec::TopologySpec;
    use crate::network::topology::Topology;

    async fn default_fabric(delay: Duration) -> MockFabric {
        let topology = Topology::from_spec(TopologySpec::default_topology()).unwrap();
        let mut fabric = MockFabric::new().with_command_delay(delay);
        build(&mut fabric, &topology).await.unwrap();
        fabric
    }

    #[tokio::test(start_paused = true)]
    async fn test_commands_on_a_node_never_overlap() {
        let fabric = Arc::new(default_fabric(Duration::from_millis(100)).await);
        let start = Instant::now();

        let mut handles = Vec::new();
        for _ in 0..3 {
            let fabric = fabric.clone();
            handles.push(tokio::spawn(async move {
                fabric.cmd("src", "true").await.unwrap();
            }));
        }
        let other = fabric.clone();
        handles.push(tokio::spawn(async move {
            other.cmd("d1", "true").await.unwrap();
        }));

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(fabric.max_concurrent_commands("src"), 1);
        assert_eq!(fabric.max_concurrent_commands("d1"), 1);
        // Commands on `d1` ran alongside the ones on `src`
        assert_eq!(start.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test]
    async fn test_primary_addresses_assigned_on_start() {
        let fabric = default_fabric(Duration::ZERO).await;

        assert_eq!(fabric.addresses("src-eth0"), [Ipv4Addr::new(10, 0, 0, 1)]);
        assert_eq!(fabric.addresses("d1-eth0"), [Ipv4Addr::new(10, 0, 0, 2)]);
        assert!(fabric.addresses("s1-eth1").is_empty());
        assert_eq!(
            fabric.interface_ip("d1", "d1-eth0").await.unwrap(),
            Some(Ipv4Addr::new(10, 0, 0, 2))
        );
    }

    #[tokio::test]
    async fn test_commands_before_start_are_rejected() {
        let mut fabric = MockFabric::new();
        fabric.add_node("h1", NodeKind::Host).unwrap();
        assert!(fabric.cmd("h1", "true").await.is_err());
    }

    #[tokio::test]
    async fn test_sha256sum_hashes_real_files() {
        let fabric = default_fabric(Duration::ZERO).await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file");
        std::fs::write(&path, "hello").unwrap();

        let output = fabric
            .cmd("d1", &format!("sha256sum {}", path.display()))
            .await
            .unwrap();
        assert_eq!(
            crate::network::ip::parse_sha256sum(&output).as_deref(),
            Some("2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824")
        );

        let missing = dir.path().join("missing");
        let output = fabric
            .cmd("d1", &format!("sha256sum {}", missing.display()))
            .await
            .unwrap();
        assert_eq!(crate::network::ip::parse_sha256sum(&output), None);
    }
}
