use crate::network::TopologyError;
use crate::network::link::{LinkParamsUpdate, parse_delay};
use crate::network::topology::Topology;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum TraceError {
    #[error("line {line}: invalid timestamp `{value}`")]
    InvalidTimestamp { line: usize, value: String },
    #[error("line {line}: unknown event type `{event_type}`")]
    UnknownEventType { line: usize, event_type: String },
    #[error("line {line}: unknown link parameter `{key}`")]
    UnknownParameter { line: usize, key: String },
    #[error("line {line}: invalid value `{value}` for `{key}`")]
    InvalidValue {
        line: usize,
        key: String,
        value: String,
    },
    #[error("line {line}: missing `{key}`")]
    MissingParameter { line: usize, key: &'static str },
}

/// Link-condition events, sorted by the time at which they should be applied
#[derive(Clone, Default)]
pub struct NetworkEvents {
    sorted_events: Vec<NetworkEvent>,
}

impl NetworkEvents {
    pub fn new(mut events: Vec<NetworkEvent>) -> Self {
        // Stable, so events sharing a timestamp keep their trace order
        events.sort_by_key(|e| e.relative_time);
        Self {
            sorted_events: events,
        }
    }

    pub fn sorted(&self) -> &[NetworkEvent] {
        &self.sorted_events
    }

    pub fn is_empty(&self) -> bool {
        self.sorted_events.is_empty()
    }

    pub fn len(&self) -> usize {
        self.sorted_events.len()
    }

    /// Ensures every event refers to a link that exists in `topology`
    pub fn validate(&self, topology: &Topology) -> Result<(), TopologyError> {
        for event in &self.sorted_events {
            match &event.payload {
                NetworkEventPayload::Link(link) => {
                    topology.node(&link.node1)?;
                    topology.node(&link.node2)?;
                    let links = topology.links_between(&link.node1, &link.node2);
                    if link.link_number >= links.len() {
                        return Err(TopologyError::UnknownLink {
                            node1: link.node1.clone(),
                            node2: link.node2.clone(),
                            index: link.link_number,
                        });
                    }
                }
            }
        }

        Ok(())
    }
}

/// Parses a trace with one event per line:
///
/// ```text
/// <timestamp-ms> link node1=<name> node2=<name> link_number=<idx> [bw=<val>] [delay=<val>] [max_queue_size=<val>] [loss=<val>]
/// ```
impl FromStr for NetworkEvents {
    type Err = TraceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut events = Vec::new();
        for (i, line) in s.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            events.push(parse_event(i + 1, trimmed)?);
        }

        Ok(NetworkEvents::new(events))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NetworkEvent {
    /// Offset from the start of the experiment
    pub relative_time: Duration,
    pub payload: NetworkEventPayload,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NetworkEventPayload {
    Link(LinkEvent),
}

#[derive(Clone, Debug, PartialEq)]
pub struct LinkEvent {
    pub node1: String,
    pub node2: String,
    /// Index among the links between `node1` and `node2`, in declaration order
    pub link_number: usize,
    pub update: LinkParamsUpdate,
}

fn parse_event(line: usize, text: &str) -> Result<NetworkEvent, TraceError> {
    let mut parts = text.split_whitespace();
    let timestamp = parts.next().unwrap_or_default();
    let relative_ms: f64 = timestamp
        .parse()
        .ok()
        .filter(|ms: &f64| ms.is_finite() && *ms >= 0.0)
        .ok_or_else(|| TraceError::InvalidTimestamp {
            line,
            value: timestamp.to_string(),
        })?;
    let relative_time = Duration::from_micros((relative_ms * 1000.0).round() as u64);

    let event_type = parts.next().unwrap_or_default();
    let payload = match event_type {
        "link" => NetworkEventPayload::Link(parse_link_event(line, parts)?),
        other => {
            return Err(TraceError::UnknownEventType {
                line,
                event_type: other.to_string(),
            });
        }
    };

    Ok(NetworkEvent {
        relative_time,
        payload,
    })
}

fn parse_link_event<'a>(
    line: usize,
    fields: impl Iterator<Item = &'a str>,
) -> Result<LinkEvent, TraceError> {
    let mut node1 = None;
    let mut node2 = None;
    let mut link_number = 0;
    let mut update = LinkParamsUpdate::default();

    for field in fields {
        let Some((key, value)) = field.split_once('=') else {
            return Err(TraceError::UnknownParameter {
                line,
                key: field.to_string(),
            });
        };
        let invalid = || TraceError::InvalidValue {
            line,
            key: key.to_string(),
            value: value.to_string(),
        };

        match key {
            "node1" => node1 = Some(value.to_string()),
            "node2" => node2 = Some(value.to_string()),
            "link_number" => link_number = value.parse().map_err(|_| invalid())?,
            "bw" => update.bandwidth_mbps = Some(value.parse().map_err(|_| invalid())?),
            "delay" => update.delay = Some(parse_delay(value).map_err(|_| invalid())?),
            "max_queue_size" => update.max_queue_size = Some(value.parse().map_err(|_| invalid())?),
            "loss" => update.loss_percent = Some(value.parse().map_err(|_| invalid())?),
            other => {
                return Err(TraceError::UnknownParameter {
                    line,
                    key: other.to_string(),
                });
            }
        }
    }

    Ok(LinkEvent {
        node1: node1.ok_or(TraceError::MissingParameter { line, key: "node1" })?,
        node2: node2.ok_or(TraceError::MissingParameter { line, key: "node2" })?,
        link_number,
        update,
    })
}
