use anyhow::{Context, anyhow, bail};
use std::fmt::{Display, Formatter};
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;

pub const ENABLE_IP_FORWARDING: &str = "sysctl -w net.ipv4.ip_forward=1";
pub const SHOW_ALL_ADDRESSES: &str = "ip addr show";

pub fn flush_addresses(interface: &str) -> String {
    format!("ip addr flush dev {interface}")
}

pub fn add_address(address: Ipv4Addr, interface: &str) -> String {
    format!("ip addr add {address}/32 dev {interface}")
}

pub fn show_interface_addresses(interface: &str) -> String {
    format!("ip -4 -o addr show dev {interface}")
}

pub fn add_device_route(destination: Ipv4Addr, interface: &str) -> String {
    format!("ip route add {destination} dev {interface}")
}

pub fn add_via_route(destination: Ipv4Addr, gateway: Ipv4Addr) -> String {
    format!("ip route add {destination} via {gateway}")
}

pub fn route_get(destination: Ipv4Addr) -> String {
    format!("ip route get {destination}")
}

pub fn trace_path(interface: &str, destination: Ipv4Addr) -> String {
    format!("mtr -n -c 1 -r -I {interface} {destination}")
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ipv4Cidr {
    pub address: Ipv4Addr,
    pub network_prefix: u8,
}

impl Display for Ipv4Cidr {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.address, self.network_prefix)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split('/');
        let base_ip: IpAddr = parts
            .next()
            .ok_or(anyhow!("empty string"))?
            .parse()
            .context("invalid ip address in cidr")?;

        let IpAddr::V4(base_ip) = base_ip else {
            bail!("only IPv4 supported at the moment");
        };

        // A missing network prefix is interpreted as /32 (i.e. a single address)
        let network_prefix: u8 = parts
            .next()
            .unwrap_or("32")
            .parse()
            .context("the provided network prefix is not a valid unsigned integer")?;
        if network_prefix > 32 {
            bail!("network prefix cannot be higher than 32");
        }

        if parts.next().is_some() {
            bail!("cidr contains trailing characters");
        }

        Ok(Self {
            address: base_ip,
            network_prefix,
        })
    }
}

/// Extracts `(interface, address)` pairs from the `inet` lines of `ip addr show` or
/// `ip -o addr show` output, in order of appearance
///
/// Loopback addresses are skipped.
pub fn parse_interface_addresses(output: &str) -> Vec<(String, Ipv4Addr)> {
    let mut addresses = Vec::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(inet) = parts.iter().position(|p| *p == "inet") else {
            continue;
        };
        let Some(cidr) = parts.get(inet + 1).and_then(|c| c.parse::<Ipv4Cidr>().ok()) else {
            continue;
        };

        let Some(interface) = label_after_scope(&parts) else {
            continue;
        };

        if interface == "lo" || cidr.address.is_loopback() {
            continue;
        }
        addresses.push((interface.to_string(), cidr.address));
    }

    addresses
}

// Lines look like `inet 10.0.0.1/8 brd 10.255.255.255 scope global h1-eth0`. In one-line mode the
// label carries a trailing `\` and is followed by lifetime information.
fn label_after_scope<'a>(parts: &[&'a str]) -> Option<&'a str> {
    let scope = parts.iter().position(|p| *p == "scope")?;
    parts
        .get(scope + 2..)?
        .iter()
        .find(|p| !matches!(**p, "secondary" | "dynamic" | "noprefixroute"))
        .copied()
        .map(|label| label.trim_end_matches('\\'))
}

/// Extracts the interfaces named by `dev` in `ip route get` output, without duplicates
pub fn parse_route_devices(output: &str) -> Vec<String> {
    let mut devices = Vec::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if let Some(dev) = parts.iter().position(|p| *p == "dev") {
            if let Some(device) = parts.get(dev + 1) {
                if !devices.iter().any(|d| d == device) {
                    devices.push(device.to_string());
                }
            }
        }
    }

    devices
}

/// Extracts the responding hop of each line of an `mtr -n -r` report
///
/// The first two lines of the report are headers (start time and column titles); every line after
/// that describes one hop, with the hop's address as the second column.
pub fn parse_mtr_report(output: &str) -> Vec<String> {
    output
        .lines()
        .skip(2)
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(|hop| hop.to_string())
        .collect()
}

/// Extracts the digest from `sha256sum <file>` output
pub fn parse_sha256sum(output: &str) -> Option<String> {
    output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .find(|digest| digest.len() == 64 && digest.chars().all(|c| c.is_ascii_hexdigit()))
        .map(|digest| digest.to_ascii_lowercase())
}
