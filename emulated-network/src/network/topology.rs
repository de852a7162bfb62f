use crate::interface_name;
use crate::network::TopologyError;
use crate::network::link::LinkParams;
use crate::network::spec::{NodeKind, PathSpec, TopologySpec};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// The topology graph, with per-node port bookkeeping
///
/// Ports are numbered the way the emulator names interfaces: host ports start at 0 (so port 0 is
/// the host's primary interface), switch ports start at 1.
pub struct Topology {
    nodes: Vec<TopologyNode>,
    node_index: HashMap<Arc<str>, usize>,
    links: Vec<TopologyLink>,
    paths: Vec<PathSpec>,
}

pub struct TopologyNode {
    pub name: Arc<str>,
    pub kind: NodeKind,
    /// Map from local port number to the node and port at the other side of the link
    pub ports: BTreeMap<u16, PortPeer>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PortPeer {
    pub node: Arc<str>,
    pub port: u16,
}

#[derive(Clone, Debug)]
pub struct TopologyLink {
    pub node1: Arc<str>,
    pub port1: u16,
    pub node2: Arc<str>,
    pub port2: u16,
    pub params: LinkParams,
}

impl TopologyLink {
    /// The port this link occupies on `node`, if `node` is one of its endpoints
    pub fn port_of(&self, node: &str) -> Option<u16> {
        if &*self.node1 == node {
            Some(self.port1)
        } else if &*self.node2 == node {
            Some(self.port2)
        } else {
            None
        }
    }
}

impl TopologyNode {
    pub fn is_switch(&self) -> bool {
        self.kind == NodeKind::Switch
    }

    pub fn is_host(&self) -> bool {
        self.kind == NodeKind::Host
    }

    fn next_port(&self) -> u16 {
        let base = match self.kind {
            NodeKind::Host => 0,
            NodeKind::Switch => 1,
        };
        base + self.ports.len() as u16
    }
}

impl Topology {
    pub fn from_spec(spec: TopologySpec) -> Result<Self, TopologyError> {
        let mut topology = Self {
            nodes: Vec::with_capacity(spec.nodes.len()),
            node_index: HashMap::new(),
            links: Vec::with_capacity(spec.links.len()),
            paths: spec.paths,
        };

        for node in spec.nodes {
            let name: Arc<str> = node.name.into();
            if topology.node_index.contains_key(&name) {
                return Err(TopologyError::DuplicateNode {
                    name: name.to_string(),
                });
            }
            topology
                .node_index
                .insert(name.clone(), topology.nodes.len());
            topology.nodes.push(TopologyNode {
                name,
                kind: node.kind,
                ports: BTreeMap::new(),
            });
        }

        for link in spec.links {
            let i1 = topology.index_of(&link.node1)?;
            let i2 = topology.index_of(&link.node2)?;
            if topology.nodes[i1].is_host() && topology.nodes[i2].is_host() {
                return Err(TopologyError::HostsLinkedDirectly {
                    node1: link.node1,
                    node2: link.node2,
                });
            }

            let port1 = topology.nodes[i1].next_port();
            let port2 = topology.nodes[i2].next_port();
            let node1 = topology.nodes[i1].name.clone();
            let node2 = topology.nodes[i2].name.clone();
            topology.nodes[i1].ports.insert(
                port1,
                PortPeer {
                    node: node2.clone(),
                    port: port2,
                },
            );
            topology.nodes[i2].ports.insert(
                port2,
                PortPeer {
                    node: node1.clone(),
                    port: port1,
                },
            );
            topology.links.push(TopologyLink {
                node1,
                port1,
                node2,
                port2,
                params: link.params,
            });
        }

        Ok(topology)
    }

    fn index_of(&self, name: &str) -> Result<usize, TopologyError> {
        self.node_index
            .get(name)
            .copied()
            .ok_or_else(|| TopologyError::UnknownNode {
                name: name.to_string(),
            })
    }

    pub fn node(&self, name: &str) -> Result<&TopologyNode, TopologyError> {
        Ok(&self.nodes[self.index_of(name)?])
    }

    /// All nodes, in declaration order
    pub fn nodes(&self) -> &[TopologyNode] {
        &self.nodes
    }

    /// All hosts, in declaration order
    pub fn hosts(&self) -> impl Iterator<Item = &TopologyNode> {
        self.nodes.iter().filter(|n| n.is_host())
    }

    pub fn switches(&self) -> impl Iterator<Item = &TopologyNode> {
        self.nodes.iter().filter(|n| n.is_switch())
    }

    pub fn is_switch(&self, name: &str) -> bool {
        self.node(name).is_ok_and(|n| n.is_switch())
    }

    pub fn links(&self) -> &[TopologyLink] {
        &self.links
    }

    pub fn paths(&self) -> &[PathSpec] {
        &self.paths
    }

    /// Links between `node1` and `node2` (in either direction), in declaration order
    pub fn links_between(&self, node1: &str, node2: &str) -> Vec<&TopologyLink> {
        self.links
            .iter()
            .filter(|l| {
                (&*l.node1 == node1 && &*l.node2 == node2)
                    || (&*l.node1 == node2 && &*l.node2 == node1)
            })
            .collect()
    }

    /// The lowest-numbered local port of `node` that leads to `peer`
    pub fn port_towards(&self, node: &str, peer: &str) -> Option<u16> {
        self.node(node)
            .ok()?
            .ports
            .iter()
            .find(|(_, p)| &*p.node == peer)
            .map(|(&port, _)| port)
    }

    pub fn interface_name(&self, node: &str, port: u16) -> String {
        interface_name(node, port)
    }
}
