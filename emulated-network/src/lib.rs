pub mod cancellation;
pub mod discovery;
pub mod fabric;
pub mod network;
pub mod routing;
pub mod scheduler;

pub use fabric::NetworkFabric;
pub use network::topology::Topology;

/// Name of the interface behind `port` of `node`, following the `<node>-eth<port>` convention
pub fn interface_name(node: &str, port: u16) -> String {
    format!("{node}-eth{port}")
}
