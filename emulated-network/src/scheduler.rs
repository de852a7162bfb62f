use crate::cancellation::CancellationToken;
use crate::fabric::NetworkFabric;
use crate::network::TopologyError;
use crate::network::event::{LinkEvent, NetworkEventPayload, NetworkEvents};
use crate::network::topology::Topology;
use anyhow::Context;
use std::sync::Arc;
use tokio::time::{Instant, sleep_until};

/// Applies trace events at `experiment_start + offset`. Late events are applied right away, and a
/// stop request is only honored between events.
pub struct LinkEventScheduler<F> {
    fabric: Arc<F>,
    topology: Arc<Topology>,
    events: NetworkEvents,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerOutcome {
    /// Number of events applied before the trace ended or the scheduler was stopped
    pub applied: usize,
    pub cancelled: bool,
}

impl<F: NetworkFabric> LinkEventScheduler<F> {
    /// Fails if any event targets a link that is not part of `topology`
    pub fn new(
        fabric: Arc<F>,
        topology: Arc<Topology>,
        events: NetworkEvents,
    ) -> Result<Self, TopologyError> {
        events.validate(&topology)?;
        Ok(Self {
            fabric,
            topology,
            events,
        })
    }

    pub async fn run(self, token: CancellationToken) -> anyhow::Result<SchedulerOutcome> {
        let mut outcome = SchedulerOutcome {
            applied: 0,
            cancelled: false,
        };

        if self.events.is_empty() {
            return Ok(outcome);
        }

        let experiment_start = Instant::now();
        for event in self.events.sorted() {
            let due = experiment_start + event.relative_time;
            if token.run_until_cancelled(sleep_until(due)).await.is_none() {
                outcome.cancelled = true;
                break;
            }

            match &event.payload {
                NetworkEventPayload::Link(link_event) => {
                    let at = event.relative_time;
                    self.apply_link_event(link_event)
                        .await
                        .with_context(|| format!("failed to apply link event at {at:?}"))?;
                }
            }
            outcome.applied += 1;

            if token.is_cancelled() {
                outcome.cancelled = true;
                break;
            }
        }

        tracing::debug!(
            applied = outcome.applied,
            cancelled = outcome.cancelled,
            "link event scheduler finished"
        );
        Ok(outcome)
    }

    /// Reconfigures the switch-facing end of the targeted link
    async fn apply_link_event(&self, event: &LinkEvent) -> anyhow::Result<()> {
        let link = self
            .topology
            .links_between(&event.node1, &event.node2)
            .get(event.link_number)
            .copied()
            .ok_or_else(|| TopologyError::UnknownLink {
                node1: event.node1.clone(),
                node2: event.node2.clone(),
                index: event.link_number,
            })?;

        let switch = if self.topology.is_switch(&event.node1) {
            &event.node1
        } else if self.topology.is_switch(&event.node2) {
            &event.node2
        } else {
            return Err(TopologyError::HostsLinkedDirectly {
                node1: event.node1.clone(),
                node2: event.node2.clone(),
            }
            .into());
        };

        let port = link
            .port_of(switch)
            .context("link does not touch the targeted switch")?;
        let interface = self.topology.interface_name(switch, port);
        let params = self
            .fabric
            .configure_interface(switch, &interface, &event.update)
            .await?;

        tracing::info!(
            "link {}-{}#{} ({interface}) is now {params}",
            event.node1,
            event.node2,
            event.link_number
        );
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::fabric::build;
    use crate::fabric::mock::MockFabric;
    use crate::network::spec::TopologySpec;
    use bon::builder;
    use std::time::Duration;

    #[builder]
    async fn scheduler(
        trace: &str,
        command_delay: Option<Duration>,
    ) -> (Arc<MockFabric>, LinkEventScheduler<MockFabric>) {
        let topology = Topology::from_spec(TopologySpec::default_topology()).unwrap();
        let mut fabric = MockFabric::new().with_command_delay(command_delay.unwrap_or_default());
        build(&mut fabric, &topology).await.unwrap();
        let fabric = Arc::new(fabric);
        let scheduler = LinkEventScheduler::new(
            fabric.clone(),
            Arc::new(topology),
            trace.parse().unwrap(),
        )
        .unwrap();
        (fabric, scheduler)
    }

    fn tc_offsets(fabric: &MockFabric, start: Instant) -> Vec<Duration> {
        fabric
            .commands()
            .iter()
            .filter(|c| c.command.starts_with("tc "))
            .map(|c| c.at - start)
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_applied_at_their_offsets() {
        let (fabric, scheduler) = scheduler()
            .trace(
                "
250 link node1=s1 node2=d1 link_number=0 loss=1
100 link node1=src node2=s1 link_number=0 bw=10
250 link node1=src node2=s1 link_number=0 delay=20ms
",
            )
            .call()
            .await;

        let start = Instant::now();
        let (token, _signal) = CancellationToken::new();
        let outcome = scheduler.run(token).await.unwrap();

        assert_eq!(
            outcome,
            SchedulerOutcome {
                applied: 3,
                cancelled: false
            }
        );
        assert_eq!(
            tc_offsets(&fabric, start),
            [
                Duration::from_millis(100),
                Duration::from_millis(250),
                Duration::from_millis(250)
            ]
        );

        // Partial updates are merged over the current conditions of the switch-facing side
        let s1_towards_src = fabric.link_params("s1-eth1").unwrap();
        assert_eq!(s1_towards_src.bandwidth_mbps, 10.0);
        assert_eq!(s1_towards_src.delay, Duration::from_millis(20));
        assert_eq!(s1_towards_src.loss_percent, 0.0);
        let s1_towards_d1 = fabric.link_params("s1-eth2").unwrap();
        assert_eq!(s1_towards_d1.loss_percent, 1.0);
        assert_eq!(s1_towards_d1.bandwidth_mbps, 100.0);

        // Host-side interfaces are never touched
        assert_eq!(fabric.link_params("src-eth0").unwrap().bandwidth_mbps, 100.0);
        assert!(fabric.commands_on("src").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_events_fire_immediately() {
        let (fabric, scheduler) = scheduler()
            .trace(
                "
0 link node1=src node2=s1 link_number=0 bw=10
100 link node1=src node2=s1 link_number=0 bw=20
400 link node1=src node2=s1 link_number=0 bw=30
",
            )
            .command_delay(Duration::from_millis(300))
            .call()
            .await;

        let start = Instant::now();
        let (token, _signal) = CancellationToken::new();
        scheduler.run(token).await.unwrap();

        // The second event is due at 100ms but the channel is busy until 300ms; the third one is
        // back on schedule
        assert_eq!(
            tc_offsets(&fabric, start),
            [
                Duration::ZERO,
                Duration::from_millis(300),
                Duration::from_millis(600)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_between_events() {
        let (fabric, scheduler) = scheduler()
            .trace(
                "
1000 link node1=src node2=s1 link_number=0 bw=10
2000 link node1=src node2=s1 link_number=0 bw=20
3000 link node1=src node2=s1 link_number=0 bw=30
",
            )
            .call()
            .await;

        let start = Instant::now();
        let (token, signal) = CancellationToken::new();
        let handle = tokio::spawn(scheduler.run(token));

        tokio::time::sleep(Duration::from_millis(1500)).await;
        signal.cancel();
        let outcome = handle.await.unwrap().unwrap();

        assert_eq!(
            outcome,
            SchedulerOutcome {
                applied: 1,
                cancelled: true
            }
        );
        // The scheduler returned promptly instead of waiting for the next event
        assert_eq!(start.elapsed(), Duration::from_millis(1500));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(tc_offsets(&fabric, start), [Duration::from_secs(1)]);
        assert_eq!(fabric.link_params("s1-eth1").unwrap().bandwidth_mbps, 10.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_trace_has_no_side_effects() {
        let (fabric, scheduler) = scheduler()
            .trace("# nothing to see here\n")
            .call()
            .await;

        let start = Instant::now();
        let (token, _signal) = CancellationToken::new();
        let outcome = scheduler.run(token).await.unwrap();

        assert_eq!(outcome.applied, 0);
        assert_eq!(start.elapsed(), Duration::ZERO);
        assert!(fabric.commands().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_link_is_rejected_upfront() {
        let topology = Topology::from_spec(TopologySpec::default_topology()).unwrap();
        let events = "10 link node1=src node2=s1 link_number=1 bw=10"
            .parse()
            .unwrap();

        let result = LinkEventScheduler::new(
            Arc::new(MockFabric::new()),
            Arc::new(topology),
            events,
        );

        assert_eq!(
            result.err(),
            Some(TopologyError::UnknownLink {
                node1: "src".to_string(),
                node2: "s1".to_string(),
                index: 1,
            })
        );
    }
}
