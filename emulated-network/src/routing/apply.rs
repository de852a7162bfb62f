use crate::fabric::NetworkFabric;
use crate::interface_name;
use crate::network::ip;
use crate::network::topology::Topology;
use crate::routing::RoutingUpdate;
use anyhow::{Context, anyhow};
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Hands out addresses above every address already present in the network
pub struct AddressAllocator {
    next: Option<Ipv4Addr>,
}

impl AddressAllocator {
    pub fn starting_after(existing: impl IntoIterator<Item = Ipv4Addr>) -> Self {
        let next = match existing.into_iter().max() {
            Some(highest) => highest.to_bits().checked_add(1).map(Ipv4Addr::from_bits),
            None => Some(Ipv4Addr::new(10, 0, 0, 1)),
        };
        Self { next }
    }

    pub fn allocate(&mut self) -> anyhow::Result<Ipv4Addr> {
        let address = self
            .next
            .ok_or_else(|| anyhow!("ran out of IPv4 addresses"))?;
        self.next = address.to_bits().checked_add(1).map(Ipv4Addr::from_bits);
        Ok(address)
    }
}

/// Live addresses of interfaces, keyed by `(node, port)`
///
/// Entries are dropped whenever a command touches the interface, so the next lookup observes the
/// live state again.
struct AddressCache {
    addresses: HashMap<(String, u16), Option<Ipv4Addr>>,
}

impl AddressCache {
    async fn get<F: NetworkFabric>(
        &mut self,
        fabric: &F,
        node: &str,
        port: u16,
    ) -> anyhow::Result<Ipv4Addr> {
        let key = (node.to_string(), port);
        let address = match self.addresses.get(&key) {
            Some(address) => *address,
            None => {
                let address = fabric
                    .interface_ip(node, &interface_name(node, port))
                    .await?;
                self.addresses.insert(key, address);
                address
            }
        };

        let interface = interface_name(node, port);
        address.ok_or_else(|| anyhow!("interface `{interface}` has no address"))
    }

    fn invalidate(&mut self, node: &str, port: u16) {
        self.addresses.remove(&(node.to_string(), port));
    }
}

/// Replays `updates` against the live `fabric`, in order
///
/// New addresses are allocated above the highest address found on any host interface.
pub async fn apply_routing_updates<F: NetworkFabric>(
    fabric: &F,
    topology: &Topology,
    updates: &[RoutingUpdate],
) -> anyhow::Result<()> {
    if updates.is_empty() {
        return Ok(());
    }

    let mut existing = Vec::new();
    for host in topology.hosts() {
        let output = fabric
            .cmd(&host.name, ip::SHOW_ALL_ADDRESSES)
            .await
            .with_context(|| format!("failed to list the addresses of `{}`", host.name))?;
        existing.extend(
            ip::parse_interface_addresses(&output)
                .into_iter()
                .map(|(_, address)| address),
        );
    }

    let mut allocator = AddressAllocator::starting_after(existing);
    let mut cache = AddressCache {
        addresses: HashMap::new(),
    };

    for update in updates {
        tracing::debug!(%update, "applying routing update");
        apply_update(fabric, update, &mut allocator, &mut cache)
            .await
            .with_context(|| format!("failed to apply routing update `{update}`"))?;
    }

    tracing::info!(updates = updates.len(), "routing updates applied");
    Ok(())
}

async fn apply_update<F: NetworkFabric>(
    fabric: &F,
    update: &RoutingUpdate,
    allocator: &mut AddressAllocator,
    cache: &mut AddressCache,
) -> anyhow::Result<()> {
    match update {
        RoutingUpdate::FlushAddress { node, port } => {
            fabric
                .cmd(node, &ip::flush_addresses(&interface_name(node, *port)))
                .await?;
            cache.invalidate(node, *port);
        }
        RoutingUpdate::AddAddress { node, port } => {
            let address = allocator.allocate()?;
            fabric
                .cmd(node, &ip::add_address(address, &interface_name(node, *port)))
                .await?;
            cache.invalidate(node, *port);
        }
        RoutingUpdate::EnableIpForwarding { node } => {
            fabric.cmd(node, ip::ENABLE_IP_FORWARDING).await?;
        }
        RoutingUpdate::AddDirectRoute {
            node1,
            port1,
            node2,
            port2,
        } => {
            let ip1 = cache.get(fabric, node1, *port1).await?;
            let ip2 = cache.get(fabric, node2, *port2).await?;

            fabric
                .cmd(
                    node2,
                    &ip::add_device_route(ip1, &interface_name(node2, *port2)),
                )
                .await?;
            cache.invalidate(node2, *port2);

            fabric
                .cmd(
                    node1,
                    &ip::add_device_route(ip2, &interface_name(node1, *port1)),
                )
                .await?;
            cache.invalidate(node1, *port1);
        }
        RoutingUpdate::AddViaRoute {
            node,
            destination,
            via,
        } => {
            let destination = cache.get(fabric, destination, 0).await?;
            let via = cache.get(fabric, via, 0).await?;
            fabric.cmd(node, &ip::add_via_route(destination, via)).await?;
        }
    }

    Ok(())
}
