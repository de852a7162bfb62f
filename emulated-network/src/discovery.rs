use crate::fabric::NetworkFabric;
use crate::network::ip;
use crate::network::topology::Topology;
use anyhow::Context;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct NetworkInfo {
    /// Non-loopback `(interface, address)` pairs of every host
    pub ip_aliases: BTreeMap<String, Vec<(String, Ipv4Addr)>>,
    /// Paths from a host (outer key) to every other host (inner key)
    pub paths: BTreeMap<String, BTreeMap<String, Vec<PathInfo>>>,
}

/// One traced path: the local interface it leaves through, its hop count and the hops themselves
///
/// Hops are node names when the traced address belongs to a known host, raw addresses otherwise.
/// Serialized as a `[interface, hop_count, hops]` array.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct PathInfo(pub String, pub usize, pub Vec<String>);

impl PathInfo {
    pub fn interface(&self) -> &str {
        &self.0
    }

    pub fn hop_count(&self) -> usize {
        self.1
    }

    pub fn hops(&self) -> &[String] {
        &self.2
    }
}

pub async fn discover_network_info<F: NetworkFabric>(
    fabric: &F,
    topology: &Topology,
) -> anyhow::Result<NetworkInfo> {
    let mut info = NetworkInfo::default();

    for host in topology.hosts() {
        let output = fabric
            .cmd(&host.name, ip::SHOW_ALL_ADDRESSES)
            .await
            .with_context(|| format!("failed to list the addresses of `{}`", host.name))?;
        info.ip_aliases.insert(
            host.name.to_string(),
            ip::parse_interface_addresses(&output),
        );
    }

    let owners: HashMap<String, &str> = info
        .ip_aliases
        .iter()
        .flat_map(|(node, aliases)| {
            aliases
                .iter()
                .map(move |(_, address)| (address.to_string(), node.as_str()))
        })
        .collect();

    let mut paths = BTreeMap::new();
    for host in topology.hosts() {
        let mut from_host = BTreeMap::new();
        for other in topology.hosts().filter(|h| h.name != host.name) {
            let mut to_other = Vec::new();
            for (_, address) in info.ip_aliases.get(&*other.name).into_iter().flatten() {
                let route = fabric.cmd(&host.name, &ip::route_get(*address)).await?;
                for interface in ip::parse_route_devices(&route) {
                    let report = fabric
                        .cmd(&host.name, &ip::trace_path(&interface, *address))
                        .await?;
                    let hops: Vec<String> = ip::parse_mtr_report(&report)
                        .into_iter()
                        .map(|hop| owners.get(&hop).map(|n| n.to_string()).unwrap_or(hop))
                        .collect();

                    tracing::debug!(
                        "{} -> {} ({address}) via {interface}: {hops:?}",
                        host.name,
                        other.name
                    );
                    to_other.push(PathInfo(interface, hops.len(), hops));
                }
            }
            from_host.insert(other.name.to_string(), to_other);
        }
        paths.insert(host.name.to_string(), from_host);
    }

    info.paths = paths;
    Ok(info)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fabric::build;
    use crate::fabric::mock::MockFabric;
    use crate::routing::apply::apply_routing_updates;
    use crate::routing::plan_routing_updates;

    async fn discover(description: &str) -> NetworkInfo {
        let topology = Topology::from_spec(description.parse().unwrap()).unwrap();
        let updates = plan_routing_updates(&topology).unwrap();
        let mut fabric = MockFabric::new();
        build(&mut fabric, &topology).await.unwrap();
        apply_routing_updates(&fabric, &topology, &updates)
            .await
            .unwrap();
        discover_network_info(&fabric, &topology).await.unwrap()
    }

    #[tokio::test]
    async fn test_single_switch() {
        let info = discover(
            "
host src
host d1
switch s1
link src s1 100 5ms 100 0
link s1 d1 100 5ms 100 0
",
        )
        .await;

        assert_eq!(
            info.ip_aliases["src"],
            [("src-eth0".to_string(), Ipv4Addr::new(10, 0, 0, 1))]
        );
        assert_eq!(
            info.paths["src"]["d1"],
            [PathInfo("src-eth0".to_string(), 1, vec!["d1".to_string()])]
        );
        assert_eq!(
            info.paths["d1"]["src"],
            [PathInfo("d1-eth0".to_string(), 1, vec!["src".to_string()])]
        );
    }

    #[tokio::test]
    async fn test_hops_through_relay_are_named() {
        let info = discover(
            "
host a
host r
host b
switch s1
switch s2
link a s1 100 5ms 100 0
link r s1 100 5ms 100 0
link r s2 100 5ms 100 0
link b s2 100 5ms 100 0
path a s1 r s2 b
",
        )
        .await;

        let a_to_b = &info.paths["a"]["b"];
        assert_eq!(a_to_b.len(), 1);
        assert_eq!(a_to_b[0].interface(), "a-eth0");
        assert_eq!(a_to_b[0].hop_count(), 2);
        assert_eq!(a_to_b[0].hops(), ["r", "b"]);
    }

    #[tokio::test]
    async fn test_every_address_of_a_multi_homed_host_is_traced() {
        let info = discover(
            "
host a
host b
switch s1
switch s2
link a s1 100 5ms 100 0
link b s1 100 5ms 100 0
link a s2 100 5ms 100 0
link b s2 100 5ms 100 0
",
        )
        .await;

        assert_eq!(info.ip_aliases["b"].len(), 2);
        let interfaces: Vec<&str> = info.paths["a"]["b"]
            .iter()
            .map(|p| p.interface())
            .collect();
        assert_eq!(interfaces, ["a-eth0", "a-eth1"]);
        assert!(info.paths["a"]["b"].iter().all(|p| p.hops() == ["b"]));
    }

    #[test]
    fn test_path_info_serializes_as_array() {
        let path = PathInfo("h1-eth0".to_string(), 2, vec!["h3".to_string(), "10.0.0.9".to_string()]);
        assert_eq!(
            serde_json::to_string(&path).unwrap(),
            r#"["h1-eth0",2,["h3","10.0.0.9"]]"#
        );
    }
}
