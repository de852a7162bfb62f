use crate::network::TopologyError;
use crate::network::link::{LinkParams, parse_delay};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

/// A topology description, as read from a topology file
///
/// The file is line-oriented:
///
/// ```text
/// host <name>
/// switch <name>
/// link <node1> <node2> <bandwidth-mbps> <delay> <max-queue> <loss-pct> [<link-index>]
/// path <hop1> <hop2> ... <hopN>
/// ```
///
/// Blank lines and lines starting with `#` are ignored.
#[derive(Clone, Debug, PartialEq)]
pub struct TopologySpec {
    pub nodes: Vec<NodeSpec>,
    pub links: Vec<LinkSpec>,
    pub paths: Vec<PathSpec>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeSpec {
    pub name: String,
    pub kind: NodeKind,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum NodeKind {
    Host,
    Switch,
}

#[derive(Clone, Debug, PartialEq)]
pub struct LinkSpec {
    pub node1: String,
    pub node2: String,
    pub params: LinkParams,
}

/// An explicit route between two hosts: the first and last hop are the hosts themselves
#[derive(Clone, Debug, PartialEq)]
pub struct PathSpec {
    pub hops: Vec<String>,
}

impl PathSpec {
    pub fn first(&self) -> &str {
        &self.hops[0]
    }

    pub fn last(&self) -> &str {
        &self.hops[self.hops.len() - 1]
    }

    pub fn intermediate_hops(&self) -> &[String] {
        &self.hops[1..self.hops.len() - 1]
    }
}

impl TopologySpec {
    /// Two hosts (`src` and `d1`) joined by a single switch
    pub fn default_topology() -> Self {
        let params = LinkParams {
            bandwidth_mbps: 100.0,
            delay: Duration::from_millis(5),
            max_queue_size: 100,
            loss_percent: 0.0,
        };

        Self {
            nodes: vec![
                NodeSpec {
                    name: "src".to_string(),
                    kind: NodeKind::Host,
                },
                NodeSpec {
                    name: "d1".to_string(),
                    kind: NodeKind::Host,
                },
                NodeSpec {
                    name: "s1".to_string(),
                    kind: NodeKind::Switch,
                },
            ],
            links: vec![
                LinkSpec {
                    node1: "src".to_string(),
                    node2: "s1".to_string(),
                    params: params.clone(),
                },
                LinkSpec {
                    node1: "s1".to_string(),
                    node2: "d1".to_string(),
                    params,
                },
            ],
            paths: Vec::new(),
        }
    }
}

impl FromStr for TopologySpec {
    type Err = TopologyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut nodes = Vec::new();
        let mut links = Vec::new();
        let mut paths: Vec<PathSpec> = Vec::new();
        let mut seen = HashSet::new();

        for (i, line) in s.lines().enumerate() {
            let line_number = i + 1;
            let parts: Vec<&str> = line.split_whitespace().collect();
            let Some(&directive) = parts.first() else {
                continue;
            };
            if directive.starts_with('#') {
                continue;
            }

            match directive {
                "host" | "switch" => {
                    let [_, name] = parts[..] else {
                        return Err(malformed(line_number, "node", "expected a single name"));
                    };
                    if !seen.insert(name.to_string()) {
                        return Err(TopologyError::DuplicateNode {
                            name: name.to_string(),
                        });
                    }
                    let kind = if directive == "host" {
                        NodeKind::Host
                    } else {
                        NodeKind::Switch
                    };
                    nodes.push(NodeSpec {
                        name: name.to_string(),
                        kind,
                    });
                }
                "link" => {
                    // The trailing link index is optional and only informative: links between the
                    // same pair of nodes are indexed in declaration order
                    if parts.len() != 7 && parts.len() != 8 {
                        return Err(malformed(
                            line_number,
                            "link",
                            "expected `link <node1> <node2> <bw> <delay> <max-queue> <loss> [<index>]`",
                        ));
                    }
                    for node in &parts[1..3] {
                        if !seen.contains(*node) {
                            return Err(TopologyError::UnknownNode {
                                name: node.to_string(),
                            });
                        }
                    }

                    let params = LinkParams {
                        bandwidth_mbps: parse_number(line_number, parts[3], "bandwidth")?,
                        delay: parse_delay(parts[4])
                            .map_err(|e| malformed(line_number, "link", &e.to_string()))?,
                        max_queue_size: parse_number(line_number, parts[5], "max queue size")?,
                        loss_percent: parse_number(line_number, parts[6], "loss")?,
                    };
                    links.push(LinkSpec {
                        node1: parts[1].to_string(),
                        node2: parts[2].to_string(),
                        params,
                    });
                }
                "path" => {
                    let hops: Vec<String> = parts[1..].iter().map(|h| h.to_string()).collect();
                    if hops.len() < 2 {
                        return Err(malformed(line_number, "path", "expected at least two hops"));
                    }
                    let path = PathSpec { hops };

                    // A later path between the same pair of hosts replaces the earlier one
                    match paths
                        .iter_mut()
                        .find(|p| p.first() == path.first() && p.last() == path.last())
                    {
                        Some(existing) => *existing = path,
                        None => paths.push(path),
                    }
                }
                other => {
                    return Err(TopologyError::UnknownDirective {
                        line: line_number,
                        directive: other.to_string(),
                    });
                }
            }
        }

        Ok(Self {
            nodes,
            links,
            paths,
        })
    }
}

fn malformed(line: usize, directive: &'static str, reason: &str) -> TopologyError {
    TopologyError::Malformed {
        line,
        directive,
        reason: reason.to_string(),
    }
}

fn parse_number<T: FromStr>(line: usize, value: &str, what: &str) -> Result<T, TopologyError> {
    value
        .parse()
        .map_err(|_| malformed(line, "link", &format!("invalid {what} `{value}`")))
}
