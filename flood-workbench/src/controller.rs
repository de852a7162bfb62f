use crate::agent::{Agent, AgentContext, AgentState};
use crate::config::RunConfig;
use crate::jct::{self, content_hash, verify_content};
use crate::util::print_network_info;
use anyhow::{Context, bail};
use emulated_network::Topology;
use emulated_network::cancellation::CancellationToken;
use emulated_network::discovery::discover_network_info;
use emulated_network::fabric::{self, NetworkFabric};
use emulated_network::network::event::NetworkEvents;
use emulated_network::routing::apply::apply_routing_updates;
use emulated_network::routing::{RoutingUpdate, plan_routing_updates};
use emulated_network::scheduler::{LinkEventScheduler, SchedulerOutcome};
use fastrand::Rng;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Drives a complete run over a fabric
///
/// Phases are sequential up to the moment agents start. Only the agents' completion waiting and
/// the link event scheduler run concurrently, and they share nothing but the fabric.
pub struct Controller<F> {
    fabric: Arc<F>,
    topology: Arc<Topology>,
    config: Arc<RunConfig>,
    updates: Vec<RoutingUpdate>,
    events: NetworkEvents,
}

pub struct RunOutcome {
    pub run_id: Uuid,
    /// Source first, then destinations in declaration order
    pub agents: Vec<AgentState>,
    pub final_jct: Option<Duration>,
    pub source_hash: String,
    pub scheduler: SchedulerOutcome,
}

impl<F: NetworkFabric> Controller<F> {
    /// Configuration errors are reported before anything touches the fabric.
    pub async fn start(
        mut fabric: F,
        topology: Topology,
        events: NetworkEvents,
        config: RunConfig,
    ) -> anyhow::Result<Self> {
        let source = topology
            .node(&config.source)
            .context("invalid source node")?;
        if !source.is_host() {
            bail!("the source (`{}`) must be a host", config.source);
        }

        let updates = plan_routing_updates(&topology).context("failed to plan routing")?;
        events
            .validate(&topology)
            .context("the trace does not match the topology")?;

        let built = fabric::build(&mut fabric, &topology).await;
        let fabric = Arc::new(fabric);
        if let Err(e) = built {
            if let Err(stop_error) = fabric.stop().await {
                tracing::warn!("failed to tear the network down: {stop_error:?}");
            }
            return Err(e);
        }

        Ok(Self {
            fabric,
            topology: Arc::new(topology),
            config: Arc::new(config),
            updates,
            events,
        })
    }

    pub fn fabric(&self) -> &Arc<F> {
        &self.fabric
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    pub fn config(&self) -> &Arc<RunConfig> {
        &self.config
    }

    /// Runs the experiment with one `A` agent per host, tearing the fabric down afterwards
    /// (whatever the outcome)
    pub async fn run<A: Agent<F>>(self) -> anyhow::Result<RunOutcome> {
        let result = self.run_inner::<A>().await;
        if let Err(e) = self.fabric.stop().await {
            tracing::warn!("failed to tear the network down: {e:?}");
        }

        result
    }

    async fn run_inner<A: Agent<F>>(&self) -> anyhow::Result<RunOutcome> {
        let run_id = Uuid::new_v4();

        apply_routing_updates(&*self.fabric, &self.topology, &self.updates)
            .await
            .context("failed to apply routing updates")?;

        // Not part of the measured time
        let network_info = discover_network_info(&*self.fabric, &self.topology)
            .await
            .context("failed to discover the network")?;
        print_network_info(&network_info);

        let source_file = self.prepare_files().await?;
        let source_hash = content_hash(&*self.fabric, &self.config.source, &source_file)
            .await?
            .with_context(|| format!("failed to hash {}", source_file.display()))?;

        let context = Arc::new(AgentContext {
            fabric: self.fabric.clone(),
            config: self.config.clone(),
            network_info: Arc::new(network_info),
        });

        let mut agents = Vec::new();
        let mut source_agent = A::new(
            AgentState::new(0, &self.config.source, &self.config.source),
            context.clone(),
        );
        source_agent
            .start_download()
            .await
            .context("failed to start the source agent")?;
        agents.push(source_agent);

        let (token, signal) = CancellationToken::new();
        let scheduler = LinkEventScheduler::new(
            self.fabric.clone(),
            self.topology.clone(),
            self.events.clone(),
        )?;
        let scheduler_task = tokio::spawn(scheduler.run(token));

        let started = self.start_destinations(&context, &mut agents).await;
        let finished = match started {
            Ok(()) => {
                tracing::info!("Started all downloads");
                join_agents(agents).await
            }
            Err(e) => Err(e),
        };

        signal.cancel();
        let scheduler_outcome = scheduler_task
            .await
            .context("link event scheduler crashed")?
            .context("link event scheduler failed")?;
        let agents = finished?;
        tracing::info!("All hosts finished downloading");

        let destinations = self
            .destinations()
            .map(|node| (node.to_string(), self.config.file_path(node)));
        verify_content(&*self.fabric, &source_hash, destinations).await?;

        jct::debug_log_all_jcts(&agents);
        Ok(RunOutcome {
            run_id,
            final_jct: jct::final_jct(&agents),
            agents,
            source_hash,
            scheduler: scheduler_outcome,
        })
    }

    fn destinations(&self) -> impl Iterator<Item = &str> {
        self.topology
            .hosts()
            .map(|h| &*h.name)
            .filter(|name| *name != self.config.source)
    }

    async fn start_destinations<A: Agent<F>>(
        &self,
        context: &Arc<AgentContext<F>>,
        agents: &mut Vec<A>,
    ) -> anyhow::Result<()> {
        for (i, node) in self.destinations().enumerate() {
            let mut agent = A::new(
                AgentState::new(i + 1, node, &self.config.source),
                context.clone(),
            );
            agent
                .start_download()
                .await
                .with_context(|| format!("failed to start the agent of `{node}`"))?;
            agents.push(agent);
        }

        Ok(())
    }

    async fn prepare_files(&self) -> anyhow::Result<PathBuf> {
        for host in self.topology.hosts() {
            let dir = self.config.host_dir(&host.name);
            tokio::fs::create_dir_all(&dir)
                .await
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }

        // Stale copies from a previous run would pass verification
        for node in self.destinations() {
            let path = self.config.file_path(node);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(e).with_context(|| format!("failed to remove {}", path.display()));
                }
            }
        }

        let mut contents = vec![0; self.config.file_size as usize];
        Rng::with_seed(self.config.file_seed).fill(&mut contents);
        let path = self.config.file_path(&self.config.source);
        tokio::fs::write(&path, contents)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;

        Ok(path)
    }
}

async fn join_agents<F: NetworkFabric, A: Agent<F>>(
    agents: Vec<A>,
) -> anyhow::Result<Vec<AgentState>> {
    let waiters: Vec<JoinHandle<anyhow::Result<A>>> = agents
        .into_iter()
        .map(|mut agent| {
            tokio::spawn(async move {
                agent.wait_output().await?;
                Ok(agent)
            })
        })
        .collect();

    let mut states = Vec::with_capacity(waiters.len());
    let mut first_error = None;
    for waiter in waiters {
        match waiter.await.context("agent task crashed").and_then(|r| r) {
            Ok(agent) => states.push(agent.state().clone()),
            Err(e) => {
                tracing::error!("{e:?}");
                first_error.get_or_insert(e);
            }
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => Ok(states),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::agent::flood::FloodAgent;
    use crate::agent::naive::NaiveAgent;
    use crate::config::cli::AgentKind;
    use crate::jct::RunError;
    use bon::builder;
    use emulated_network::fabric::mock::MockFabric;
    use emulated_network::network::TopologyError;
    use emulated_network::network::spec::TopologySpec;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::SystemTime;
    use tempfile::TempDir;
    use tokio::time::Instant;

    const STAR: &str = "
host src
host d1
host d2
switch s1
link src s1 100 1ms 100 0
link s1 d1 100 1ms 100 0
link s1 d2 100 1ms 100 0
";

    fn config(workdir: &Path, agent: AgentKind) -> RunConfig {
        RunConfig {
            agent,
            workload_bin: "/opt/flood".into(),
            workdir: workdir.to_path_buf(),
            source: "src".to_string(),
            file_size: 4096,
            file_seed: 7,
            poll_interval: Duration::from_millis(10),
            report: None,
        }
    }

    fn topology(description: &str) -> Topology {
        Topology::from_spec(description.parse::<TopologySpec>().unwrap()).unwrap()
    }

    fn arg_after<'a>(parts: &[&'a str], flag: &str) -> Option<&'a str> {
        let i = parts.iter().position(|p| *p == flag)?;
        parts.get(i + 1).copied()
    }

    /// Emulates the workload binary on `fabric`
    ///
    /// Destinations copy the source's file (or write garbage, on the `corrupt` node) and every node
    /// writes `completion` (or default timestamps) into its timestamp file. The `late` node writes
    /// its timestamp file after the given delay.
    #[builder]
    fn emulate_workload(
        fabric: &MockFabric,
        workdir: &Path,
        corrupt: Option<&'static str>,
        completion: Option<&'static str>,
        late: Option<(&'static str, Duration)>,
    ) {
        let source_file = workdir.join("src").join("file");
        fabric.on_command(move |node, command| {
            let parts: Vec<&str> = command.split_whitespace().collect();
            if parts.first() != Some(&"/opt/flood") {
                return;
            }

            let timestamp_file = PathBuf::from(arg_after(&parts, "--timestamp-file").unwrap());
            std::fs::create_dir_all(timestamp_file.parent().unwrap()).unwrap();
            let timestamps = if arg_after(&parts, "--mode") == Some("source") {
                "1000000 2000000"
            } else {
                let file = arg_after(&parts, "--file").unwrap();
                match corrupt {
                    Some(victim) if victim == node => std::fs::write(file, b"garbage").unwrap(),
                    _ => {
                        std::fs::copy(&source_file, file).unwrap();
                    }
                }
                completion.unwrap_or("1000000 2500000")
            };

            match late {
                Some((late_node, delay)) if late_node == node => {
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        std::fs::write(timestamp_file, timestamps).unwrap();
                    });
                }
                _ => std::fs::write(timestamp_file, timestamps).unwrap(),
            }
        });
    }

    async fn start(fabric: MockFabric, workdir: &Path, events: &str) -> Controller<MockFabric> {
        Controller::start(
            fabric,
            topology(STAR),
            events.parse().unwrap(),
            config(workdir, AgentKind::Flood),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_full_run() {
        let workdir = TempDir::new().unwrap();
        let fabric = MockFabric::new();
        emulate_workload()
            .fabric(&fabric)
            .workdir(workdir.path())
            .call();

        let controller = start(fabric, workdir.path(), "").await;
        let fabric = controller.fabric().clone();
        let outcome = controller.run::<FloodAgent<MockFabric>>().await.unwrap();

        let nodes: Vec<_> = outcome.agents.iter().map(|a| a.node.as_str()).collect();
        assert_eq!(nodes, ["src", "d1", "d2"]);
        assert_eq!(outcome.agents[0].jct(), Some(Duration::from_secs(1)));
        assert_eq!(outcome.final_jct, Some(Duration::from_millis(1500)));
        assert_eq!(
            outcome.scheduler,
            SchedulerOutcome {
                applied: 0,
                cancelled: false
            }
        );
        assert!(fabric.is_stopped());

        let contents = std::fs::read(workdir.path().join("d2").join("file")).unwrap();
        assert_eq!(contents.len(), 4096);
    }

    #[tokio::test(start_paused = true)]
    async fn test_link_events_during_run() {
        let workdir = TempDir::new().unwrap();
        let fabric = MockFabric::new();
        emulate_workload()
            .fabric(&fabric)
            .workdir(workdir.path())
            .late(("d2", Duration::from_millis(500)))
            .call();

        let trace = "
100 link node1=s1 node2=d1 link_number=0 bw=10
3600000 link node1=s1 node2=d2 link_number=0 bw=20
";
        let controller = start(fabric, workdir.path(), trace).await;
        let fabric = controller.fabric().clone();
        let outcome = controller.run::<FloodAgent<MockFabric>>().await.unwrap();

        // The second event was still pending when the last download finished
        assert_eq!(
            outcome.scheduler,
            SchedulerOutcome {
                applied: 1,
                cancelled: true
            }
        );
        assert_eq!(fabric.link_params("s1-eth2").unwrap().bandwidth_mbps, 10.0);
        assert_eq!(fabric.link_params("s1-eth3").unwrap().bandwidth_mbps, 100.0);
        assert_eq!(outcome.final_jct, Some(Duration::from_millis(1500)));
    }

    #[tokio::test]
    async fn test_source_file_is_deterministic() {
        let mut hashes = Vec::new();
        for _ in 0..2 {
            let workdir = TempDir::new().unwrap();
            let fabric = MockFabric::new();
            emulate_workload()
                .fabric(&fabric)
                .workdir(workdir.path())
                .call();
            let controller = start(fabric, workdir.path(), "").await;
            let outcome = controller.run::<FloodAgent<MockFabric>>().await.unwrap();
            hashes.push(outcome.source_hash);
        }

        assert_eq!(hashes[0], hashes[1]);
    }

    #[tokio::test]
    async fn test_content_mismatch_fails_the_run() {
        let workdir = TempDir::new().unwrap();
        let fabric = MockFabric::new();
        emulate_workload()
            .fabric(&fabric)
            .workdir(workdir.path())
            .corrupt("d2")
            .call();

        let controller = start(fabric, workdir.path(), "").await;
        let fabric = controller.fabric().clone();
        let err = controller
            .run::<FloodAgent<MockFabric>>()
            .await
            .err()
            .unwrap();

        let Some(RunError::ContentMismatch { node, .. }) = err.downcast_ref::<RunError>() else {
            panic!("unexpected error: {err:?}");
        };
        assert_eq!(node, "d2");
        assert!(fabric.is_stopped());
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_completion_file_leaves_jct_undefined() {
        let workdir = TempDir::new().unwrap();
        let fabric = MockFabric::new();
        emulate_workload()
            .fabric(&fabric)
            .workdir(workdir.path())
            .completion("")
            .call();

        let controller = start(fabric, workdir.path(), "").await;
        let outcome = controller.run::<FloodAgent<MockFabric>>().await.unwrap();

        assert_eq!(outcome.agents[0].jct(), Some(Duration::from_secs(1)));
        assert_eq!(outcome.agents[1].jct(), None);
        assert_eq!(outcome.final_jct, None);
    }

    #[tokio::test]
    async fn test_invalid_trace_fails_before_touching_the_network() {
        let workdir = TempDir::new().unwrap();
        let fabric = MockFabric::new();
        let commands = Arc::new(AtomicUsize::new(0));
        let counter = commands.clone();
        fabric.on_command(move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let events = "10 link node1=src node2=s1 link_number=1 bw=10"
            .parse()
            .unwrap();
        let err = Controller::start(
            fabric,
            topology(STAR),
            events,
            config(workdir.path(), AgentKind::Flood),
        )
        .await
        .err()
        .unwrap();

        assert!(matches!(
            err.downcast_ref::<TopologyError>(),
            Some(TopologyError::UnknownLink { .. })
        ));
        assert_eq!(commands.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_source_must_be_a_host() {
        let workdir = TempDir::new().unwrap();
        let mut config = config(workdir.path(), AgentKind::Flood);
        config.source = "s1".to_string();

        let result = Controller::start(
            MockFabric::new(),
            topology(STAR),
            NetworkEvents::default(),
            config,
        )
        .await;

        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_naive_run() {
        let workdir = TempDir::new().unwrap();
        let fabric = MockFabric::new();
        let source_file = workdir.path().join("src").join("file");
        fabric.on_command(move |_, command| {
            let parts: Vec<&str> = command.split_whitespace().collect();
            if parts.first() == Some(&"wget") {
                let output = arg_after(&parts, "-O").unwrap();
                std::fs::copy(&source_file, output).unwrap();
            }
        });

        let controller = Controller::start(
            fabric,
            topology(STAR),
            NetworkEvents::default(),
            config(workdir.path(), AgentKind::Naive),
        )
        .await
        .unwrap();
        let fabric = controller.fabric().clone();
        let outcome = controller.run::<NaiveAgent<MockFabric>>().await.unwrap();

        assert_eq!(outcome.agents[0].jct(), Some(Duration::ZERO));
        assert!(outcome.final_jct.is_some());
        let downloads = fabric.commands_on("d1");
        assert!(
            downloads
                .iter()
                .any(|c| c.ends_with("http://10.0.0.1:8000/file"))
        );
    }

    const SLOW_NODE: &str = "d1";

    /// Issues one marker command per call on its node, so the order of calls shows up in the
    /// fabric's command history
    struct RecordingAgent {
        state: AgentState,
        context: Arc<AgentContext<MockFabric>>,
    }

    impl Agent<MockFabric> for RecordingAgent {
        fn new(state: AgentState, context: Arc<AgentContext<MockFabric>>) -> Self {
            Self { state, context }
        }

        async fn start_download(&mut self) -> anyhow::Result<()> {
            self.state.start_time = Some(SystemTime::now());
            self.context
                .fabric
                .cmd(&self.state.node, "start-download")
                .await?;
            Ok(())
        }

        async fn wait_output(&mut self) -> anyhow::Result<()> {
            if self.state.node == SLOW_NODE {
                tokio::time::sleep(Duration::from_secs(5)).await;
            }

            let config = &self.context.config;
            if !self.state.is_source() {
                tokio::fs::copy(
                    config.file_path(&self.state.source),
                    config.file_path(&self.state.node),
                )
                .await?;
            }

            self.context
                .fabric
                .cmd(&self.state.node, "wait-output")
                .await?;
            self.state.end_time = Some(SystemTime::now());
            Ok(())
        }

        fn state(&self) -> &AgentState {
            &self.state
        }
    }

    async fn recorded_run(workdir: &Path) -> (Arc<MockFabric>, RunOutcome) {
        let controller = start(MockFabric::new(), workdir, "").await;
        let fabric = controller.fabric().clone();
        let outcome = controller.run::<RecordingAgent>().await.unwrap();
        (fabric, outcome)
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_download_starts_before_any_wait() {
        let workdir = TempDir::new().unwrap();
        let (fabric, outcome) = recorded_run(workdir.path()).await;

        let calls: Vec<(String, String)> = fabric
            .commands()
            .into_iter()
            .filter(|c| c.command == "start-download" || c.command == "wait-output")
            .map(|c| (c.command, c.node))
            .collect();
        let starts: Vec<&str> = calls
            .iter()
            .take_while(|(command, _)| command == "start-download")
            .map(|(_, node)| node.as_str())
            .collect();

        assert_eq!(starts, ["src", "d1", "d2"]);
        assert_eq!(calls.len(), 6);
        assert!(calls[3..].iter().all(|(command, _)| command == "wait-output"));
        assert_eq!(outcome.agents.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_agent_does_not_hold_up_the_others() {
        let workdir = TempDir::new().unwrap();
        let run_start = Instant::now();
        let (fabric, outcome) = recorded_run(workdir.path()).await;

        let finished_at = |node: &str| {
            fabric
                .commands()
                .into_iter()
                .find(|c| c.node == node && c.command == "wait-output")
                .map(|c| c.at - run_start)
                .unwrap()
        };

        // `d2` is joined after the slow `d1`, yet its completion is observed right away
        assert!(finished_at("src") < Duration::from_secs(1));
        assert!(finished_at("d2") < Duration::from_secs(1));
        assert!(finished_at("d1") >= Duration::from_secs(5));
        assert!(outcome.final_jct.is_some());
    }
}
