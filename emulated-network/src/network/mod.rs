//! Static description of the emulated network: nodes, links, declared paths and link-condition
//! traces

pub mod event;
pub mod ip;
pub mod link;
pub mod spec;
pub mod topology;

use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum TopologyError {
    #[error("line {line}: unknown directive `{directive}`")]
    UnknownDirective { line: usize, directive: String },
    #[error("line {line}: malformed `{directive}` entry: {reason}")]
    Malformed {
        line: usize,
        directive: &'static str,
        reason: String,
    },
    #[error("node `{name}` was declared more than once")]
    DuplicateNode { name: String },
    #[error("node `{name}` was referenced but does not exist")]
    UnknownNode { name: String },
    #[error(
        "invalid topology: two hosts (`{node1}`, `{node2}`) are connected together without a switch"
    )]
    HostsLinkedDirectly { node1: String, node2: String },
    #[error("topology has a path across a non-existent link (`{from}` -> `{to}`)")]
    PathAcrossMissingLink { from: String, to: String },
    #[error("declared path `{path}` must start and end at a host and have at least one hop in between")]
    InvalidPath { path: String },
    #[error("link #{index} between `{node1}` and `{node2}` does not exist")]
    UnknownLink {
        node1: String,
        node2: String,
        index: usize,
    },
}
