use crate::agent::AgentState;
use emulated_network::Topology;
use emulated_network::discovery::NetworkInfo;
use emulated_network::routing::RoutingUpdate;
use std::time::Duration;

/// Quotes `arg` for `sh`, leaving it untouched when it has no special characters
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@,+%".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

pub fn print_topology(topology: &Topology) {
    println!("--- Topology ---");
    let hosts: Vec<&str> = topology.hosts().map(|h| &*h.name).collect();
    let switches: Vec<&str> = topology.switches().map(|s| &*s.name).collect();
    println!("* Hosts: {}", hosts.join(", "));
    println!("* Switches: {}", switches.join(", "));
    println!("* Links:");
    for link in topology.links() {
        println!(
            "  * {} <-> {} ({})",
            topology.interface_name(&link.node1, link.port1),
            topology.interface_name(&link.node2, link.port2),
            link.params
        );
    }

    if !topology.paths().is_empty() {
        println!("* Declared paths:");
        for path in topology.paths() {
            println!("  * {}", path.hops.join(" -> "));
        }
    }
}

pub fn print_routing_updates(updates: &[RoutingUpdate]) {
    println!("--- Routing updates ---");
    if updates.is_empty() {
        println!("* None needed");
    }
    for update in updates {
        println!("* {update}");
    }
}

pub fn print_network_info(info: &NetworkInfo) {
    println!("--- Network ---");
    for (node, aliases) in &info.ip_aliases {
        let aliases: Vec<String> = aliases
            .iter()
            .map(|(interface, address)| format!("{address} ({interface})"))
            .collect();
        println!("* {node}: {}", aliases.join(", "));
    }

    for (node, others) in &info.paths {
        for (other, paths) in others {
            for path in paths {
                println!(
                    "  * {node} -> {other} via {}: {} hops ({})",
                    path.interface(),
                    path.hop_count(),
                    path.hops().join(" -> ")
                );
            }
        }
    }
}

pub fn print_results(agents: &[AgentState], final_jct: Option<Duration>) {
    println!("--- Results ---");
    for agent in agents {
        let role = if agent.is_source() {
            "source"
        } else {
            "destination"
        };
        match agent.jct() {
            Some(jct) => println!(
                "* {} ({role}): {:.3}s",
                agent.node,
                jct.as_secs_f64()
            ),
            None => println!("* {} ({role}): undefined", agent.node),
        }
    }

    match final_jct {
        Some(jct) => println!("* Worst download time: {:.3}s", jct.as_secs_f64()),
        None => println!("* Worst download time: undefined"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/var/mn/d1/file"), "/var/mn/d1/file");
        assert_eq!(shell_quote(""), "''");
        assert_eq!(shell_quote(r#"{"a":1}"#), r#"'{"a":1}'"#);
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
