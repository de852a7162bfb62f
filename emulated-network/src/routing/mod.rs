pub mod apply;

use crate::interface_name;
use crate::network::TopologyError;
use crate::network::spec::PathSpec;
use crate::network::topology::Topology;
use std::collections::HashSet;
use std::fmt::{Display, Formatter};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RoutingUpdate {
    FlushAddress { node: String, port: u16 },
    AddAddress { node: String, port: u16 },
    EnableIpForwarding { node: String },
    /// Installs the pair of routes between two interfaces: each side reaches the other's address
    /// through its own interface
    AddDirectRoute {
        node1: String,
        port1: u16,
        node2: String,
        port2: u16,
    },
    /// Makes `node` reach the primary address of `destination` through the primary address of
    /// `via`
    AddViaRoute {
        node: String,
        destination: String,
        via: String,
    },
}

impl Display for RoutingUpdate {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            RoutingUpdate::FlushAddress { node, port } => {
                write!(f, "flush-address {}", interface_name(node, *port))
            }
            RoutingUpdate::AddAddress { node, port } => {
                write!(f, "add-address {}", interface_name(node, *port))
            }
            RoutingUpdate::EnableIpForwarding { node } => write!(f, "enable-ip-forwarding {node}"),
            RoutingUpdate::AddDirectRoute {
                node1,
                port1,
                node2,
                port2,
            } => write!(
                f,
                "add-direct-route {} <-> {}",
                interface_name(node1, *port1),
                interface_name(node2, *port2)
            ),
            RoutingUpdate::AddViaRoute {
                node,
                destination,
                via,
            } => write!(f, "add-via-route {node} -> {destination} via {via}"),
        }
    }
}

/// Computes the routing updates `topology` needs
///
/// Without declared paths, routes are inferred for every additional port of multi-homed hosts.
/// As soon as one path is declared, only declared paths get routes.
pub fn plan_routing_updates(topology: &Topology) -> Result<Vec<RoutingUpdate>, TopologyError> {
    if topology.paths().is_empty() {
        Ok(plan_missing_routes(topology))
    } else {
        plan_declared_paths(topology)
    }
}

fn plan_missing_routes(topology: &Topology) -> Vec<RoutingUpdate> {
    let hosts: Vec<&str> = topology.hosts().map(|h| &*h.name).collect();
    let mut updates = Vec::new();

    for host in topology.hosts().filter(|h| h.ports.len() > 1) {
        for (&port1, uplink) in host.ports.iter().filter(|(port, _)| **port != 0) {
            let Ok(switch) = topology.node(&uplink.node) else {
                continue;
            };

            for (_, sibling) in switch.ports.iter().filter(|(port, _)| **port != uplink.port) {
                // Only hosts can be paired, and pairing a host with itself is meaningless
                if topology.is_switch(&sibling.node) || sibling.node == host.name {
                    continue;
                }

                updates.extend(bring_link_up(&host.name, &sibling.node, port1, sibling.port));
                updates.extend(update_other_hosts(&hosts, &host.name, &sibling.node));
            }
        }
    }

    updates
}

fn bring_link_up(node1: &str, node2: &str, port1: u16, port2: u16) -> Vec<RoutingUpdate> {
    let mut updates = Vec::new();
    if port1 != 0 {
        updates.extend([
            RoutingUpdate::FlushAddress {
                node: node1.to_string(),
                port: port1,
            },
            RoutingUpdate::AddAddress {
                node: node1.to_string(),
                port: port1,
            },
            RoutingUpdate::EnableIpForwarding {
                node: node1.to_string(),
            },
        ]);
    }
    if port2 != 0 {
        updates.extend([
            RoutingUpdate::FlushAddress {
                node: node2.to_string(),
                port: port2,
            },
            RoutingUpdate::AddAddress {
                node: node2.to_string(),
                port: port2,
            },
        ]);
    }

    updates.push(RoutingUpdate::AddDirectRoute {
        node1: node1.to_string(),
        port1,
        node2: node2.to_string(),
        port2,
    });
    updates
}

fn update_other_hosts(hosts: &[&str], known_host: &str, new_host: &str) -> Vec<RoutingUpdate> {
    let mut updates = Vec::new();
    for &host in hosts {
        if host == known_host || host == new_host {
            continue;
        }

        updates.push(RoutingUpdate::AddViaRoute {
            node: host.to_string(),
            destination: new_host.to_string(),
            via: known_host.to_string(),
        });
        updates.push(RoutingUpdate::AddViaRoute {
            node: new_host.to_string(),
            destination: host.to_string(),
            via: known_host.to_string(),
        });
    }

    updates
}

fn plan_declared_paths(topology: &Topology) -> Result<Vec<RoutingUpdate>, TopologyError> {
    let mut updates = Vec::new();
    let mut addressed = HashSet::new();
    let mut relays = HashSet::new();

    for path in topology.paths() {
        validate_path(topology, path)?;

        let hops = &path.hops;
        let (first, last) = (path.first(), path.last());
        let missing_link = || TopologyError::PathAcrossMissingLink {
            from: first.to_string(),
            to: last.to_string(),
        };
        let port1 = topology
            .port_towards(first, &hops[1])
            .ok_or_else(missing_link)?;
        let port2 = topology
            .port_towards(last, &hops[hops.len() - 2])
            .ok_or_else(missing_link)?;

        let intermediate_hosts: Vec<&str> = path
            .intermediate_hops()
            .iter()
            .map(|hop| hop.as_str())
            .filter(|hop| !topology.is_switch(hop))
            .collect();

        match (intermediate_hosts.first(), intermediate_hosts.last()) {
            (Some(&first_relay), Some(&last_relay)) => {
                updates.push(RoutingUpdate::AddViaRoute {
                    node: first.to_string(),
                    destination: last.to_string(),
                    via: first_relay.to_string(),
                });
                if relays.insert(first_relay) {
                    updates.push(RoutingUpdate::EnableIpForwarding {
                        node: first_relay.to_string(),
                    });
                }

                updates.push(RoutingUpdate::AddViaRoute {
                    node: last.to_string(),
                    destination: first.to_string(),
                    via: last_relay.to_string(),
                });
                if relays.insert(last_relay) {
                    updates.push(RoutingUpdate::EnableIpForwarding {
                        node: last_relay.to_string(),
                    });
                }
            }
            _ => {
                // Only switches in between: the endpoints share a segment, so secondary ports
                // need an address before the direct routes can reference it
                for (node, port) in [(first, port1), (last, port2)] {
                    if port != 0 && addressed.insert((node, port)) {
                        updates.push(RoutingUpdate::FlushAddress {
                            node: node.to_string(),
                            port,
                        });
                        updates.push(RoutingUpdate::AddAddress {
                            node: node.to_string(),
                            port,
                        });
                    }
                }

                updates.push(RoutingUpdate::AddDirectRoute {
                    node1: first.to_string(),
                    port1,
                    node2: last.to_string(),
                    port2,
                });
            }
        }
    }

    Ok(updates)
}

fn validate_path(topology: &Topology, path: &PathSpec) -> Result<(), TopologyError> {
    for hop in &path.hops {
        topology.node(hop)?;
    }

    for pair in path.hops.windows(2) {
        if topology.links_between(&pair[0], &pair[1]).is_empty() {
            return Err(TopologyError::PathAcrossMissingLink {
                from: pair[0].clone(),
                to: pair[1].clone(),
            });
        }
    }

    let endpoints_are_hosts = !topology.is_switch(path.first()) && !topology.is_switch(path.last());
    if !endpoints_are_hosts || path.intermediate_hops().is_empty() {
        return Err(TopologyError::InvalidPath {
            path: path.hops.join(" "),
        });
    }

    Ok(())
}
