use anyhow::{Context, bail};
use serde::Serialize;
use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Conditions applied to one side of a link
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct LinkParams {
    /// Rate limit, in megabits per second
    pub bandwidth_mbps: f64,
    /// One-way delay added by the interface
    pub delay: Duration,
    /// Maximum number of packets queued by the interface
    pub max_queue_size: u32,
    /// Packet loss, as a percentage between 0 and 100
    pub loss_percent: f64,
}

impl Default for LinkParams {
    fn default() -> Self {
        Self {
            bandwidth_mbps: 100.0,
            delay: Duration::from_millis(5),
            max_queue_size: 100,
            loss_percent: 0.0,
        }
    }
}

impl LinkParams {
    /// Overrides the parameters present in `update`, leaving the rest untouched
    pub fn apply(&mut self, update: &LinkParamsUpdate) {
        if let Some(bandwidth_mbps) = update.bandwidth_mbps {
            self.bandwidth_mbps = bandwidth_mbps;
        }
        if let Some(delay) = update.delay {
            self.delay = delay;
        }
        if let Some(max_queue_size) = update.max_queue_size {
            self.max_queue_size = max_queue_size;
        }
        if let Some(loss_percent) = update.loss_percent {
            self.loss_percent = loss_percent;
        }
    }

    /// Builds the `tc` command that (re)configures `interface` with these parameters
    ///
    /// Uses `replace`, so it works both for the initial configuration and for later updates.
    pub fn to_tc_command(&self, interface: &str) -> String {
        format!(
            "tc qdisc replace dev {interface} root netem delay {}us loss {}% rate {}mbit limit {}",
            self.delay.as_micros(),
            self.loss_percent,
            self.bandwidth_mbps,
            self.max_queue_size,
        )
    }
}

impl Display for LinkParams {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} Mbit/s, {} ms delay, queue {}, {}% loss",
            self.bandwidth_mbps,
            self.delay.as_micros() as f64 / 1000.0,
            self.max_queue_size,
            self.loss_percent
        )
    }
}

/// A partial set of link parameters, as found in trace events
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LinkParamsUpdate {
    pub bandwidth_mbps: Option<f64>,
    pub delay: Option<Duration>,
    pub max_queue_size: Option<u32>,
    pub loss_percent: Option<f64>,
}

/// Parses a delay such as `5ms`, `250us`, `1.5s` or `10` (microseconds when no unit is given,
/// as `tc netem` reads it)
pub fn parse_delay(s: &str) -> anyhow::Result<Duration> {
    let s = s.trim();
    let (number, unit_in_micros) = if let Some(n) = s.strip_suffix("ms") {
        (n, 1e3)
    } else if let Some(n) = s.strip_suffix("us") {
        (n, 1.0)
    } else if let Some(n) = s.strip_suffix('s') {
        (n, 1e6)
    } else {
        (s, 1.0)
    };

    let value: f64 = number
        .parse()
        .with_context(|| format!("invalid delay `{s}`"))?;
    if !value.is_finite() || value < 0.0 {
        bail!("delay must be a non-negative number, got `{s}`");
    }

    Ok(Duration::from_micros((value * unit_in_micros).round() as u64))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_parse_delay() {
        let cases = [
            ("5ms", Duration::from_millis(5)),
            ("250us", Duration::from_micros(250)),
            ("2s", Duration::from_secs(2)),
            ("10", Duration::from_micros(10)),
            ("0ms", Duration::ZERO),
        ];

        for (input, expected) in cases {
            assert_eq!(parse_delay(input).unwrap(), expected, "input: {input}");
        }

        assert!(parse_delay("fast").is_err());
        assert!(parse_delay("-5ms").is_err());
    }

    #[test]
    fn test_partial_update_keeps_absent_params() {
        let mut params = LinkParams::default();
        params.apply(&LinkParamsUpdate {
            loss_percent: Some(2.5),
            ..Default::default()
        });

        assert_eq!(params.loss_percent, 2.5);
        assert_eq!(params.bandwidth_mbps, 100.0);
        assert_eq!(params.delay, Duration::from_millis(5));
        assert_eq!(params.max_queue_size, 100);
    }

    #[test]
    fn test_tc_command() {
        let params = LinkParams {
            bandwidth_mbps: 10.0,
            delay: Duration::from_millis(20),
            max_queue_size: 50,
            loss_percent: 1.5,
        };

        assert_eq!(
            params.to_tc_command("s1-eth2"),
            "tc qdisc replace dev s1-eth2 root netem delay 20000us loss 1.5% rate 10mbit limit 50"
        );
    }
}
