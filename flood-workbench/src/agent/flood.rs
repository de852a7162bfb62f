use crate::agent::{Agent, AgentContext, AgentState};
use crate::completion;
use crate::util::shell_quote;
use anyhow::Context;
use emulated_network::NetworkFabric;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::SystemTime;

const COMPLETION_FILE: &str = "completion_time";
const LOG_FILE: &str = "workload.log";

/// Runs the external workload binary on the agent's node
///
/// The workload is launched in the background, so the node's command channel is free again right
/// away. Completion is detected through the timestamp file the workload writes when it is done.
pub struct FloodAgent<F> {
    state: AgentState,
    context: Arc<AgentContext<F>>,
    pieces_dir: PathBuf,
}

impl<F: NetworkFabric> FloodAgent<F> {
    fn completion_file(&self) -> PathBuf {
        self.pieces_dir.join(COMPLETION_FILE)
    }

    fn log_file(&self) -> PathBuf {
        self.pieces_dir.join(LOG_FILE)
    }

    fn workload_command(&self) -> anyhow::Result<String> {
        let config = &self.context.config;
        let network_info = serde_json::to_string(&self.context.network_info.paths)
            .context("failed to serialize network info")?;
        let ip_map = serde_json::to_string(&self.context.network_info.ip_aliases)
            .context("failed to serialize ip aliases")?;

        let mut args = vec![
            config.workload_bin.display().to_string(),
            "--mode".to_string(),
        ];
        if self.state.is_source() {
            args.push("source".to_string());
        } else {
            args.push("destination".to_string());
        }
        args.extend([
            "--node-name".to_string(),
            self.state.node.clone(),
            "--file".to_string(),
            config.file_path(&self.state.node).display().to_string(),
        ]);
        if !self.state.is_source() {
            args.extend(["--src-name".to_string(), self.state.source.clone()]);
        }
        args.extend([
            "--pieces-dir".to_string(),
            self.pieces_dir.display().to_string(),
            "--network-info".to_string(),
            network_info,
            "--ip-map".to_string(),
            ip_map,
            "--timestamp-file".to_string(),
            self.completion_file().display().to_string(),
        ]);

        let args: Vec<String> = args.iter().map(|arg| shell_quote(arg)).collect();
        Ok(args.join(" "))
    }
}

impl<F: NetworkFabric> Agent<F> for FloodAgent<F> {
    fn new(state: AgentState, context: Arc<AgentContext<F>>) -> Self {
        let pieces_dir = context.config.host_dir(&state.node).join("pieces");
        Self {
            state,
            context,
            pieces_dir,
        }
    }

    async fn start_download(&mut self) -> anyhow::Result<()> {
        let node = &self.state.node;
        let pieces_dir = shell_quote(&self.pieces_dir.display().to_string());

        // Leftovers from a previous run would signal completion right away
        self.context
            .fabric
            .cmd(node, &format!("rm -rf {pieces_dir} && mkdir -p {pieces_dir}"))
            .await
            .with_context(|| format!("failed to prepare the pieces directory of `{node}`"))?;

        let command = format!(
            "{} > {} 2>&1 < /dev/null &",
            self.workload_command()?,
            shell_quote(&self.log_file().display().to_string())
        );

        self.state.start_time = Some(SystemTime::now());
        self.context
            .fabric
            .cmd(node, &command)
            .await
            .with_context(|| format!("failed to launch the workload on `{node}`"))?;

        Ok(())
    }

    async fn wait_output(&mut self) -> anyhow::Result<()> {
        let completion_file = self.completion_file();
        let timestamps =
            completion::read_completion_file(&completion_file, self.context.config.poll_interval)
                .await?;
        match timestamps {
            Ok(timestamps) => {
                // The workload's timestamps replace the launch time
                self.state.start_time = Some(timestamps.start);
                self.state.end_time = Some(timestamps.end);
            }
            Err(e) => {
                tracing::warn!(
                    "{}: {e}, its job completion time is undefined",
                    self.state.node
                );
            }
        }

        // The workload has exited, so the command channel is ours again
        let log = self
            .context
            .fabric
            .cmd(
                &self.state.node,
                &format!("cat {}", shell_quote(&self.log_file().display().to_string())),
            )
            .await?;
        if !log.trim().is_empty() {
            tracing::debug!("workload output on `{}`:\n{}", self.state.node, log.trim_end());
        }

        Ok(())
    }

    fn state(&self) -> &AgentState {
        &self.state
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::RunConfig;
    use crate::config::cli::AgentKind;
    use emulated_network::discovery::NetworkInfo;
    use emulated_network::fabric::mock::MockFabric;
    use std::time::Duration;

    fn agent(state: AgentState) -> FloodAgent<MockFabric> {
        let config = RunConfig {
            agent: AgentKind::Flood,
            workload_bin: "/opt/flood".into(),
            workdir: "/var/mn".into(),
            source: "src".to_string(),
            file_size: 1024,
            file_seed: 42,
            poll_interval: Duration::from_millis(50),
            report: None,
        };
        let context = AgentContext {
            fabric: Arc::new(MockFabric::new()),
            config: Arc::new(config),
            network_info: Arc::new(NetworkInfo::default()),
        };
        FloodAgent::new(state, Arc::new(context))
    }

    #[test]
    fn test_source_command() {
        let agent = agent(AgentState::new(0, "src", "src"));
        assert_eq!(
            agent.workload_command().unwrap(),
            "/opt/flood --mode source --node-name src --file /var/mn/src/file \
             --pieces-dir /var/mn/src/pieces --network-info '{}' --ip-map '{}' \
             --timestamp-file /var/mn/src/pieces/completion_time"
        );
    }

    #[test]
    fn test_destination_command() {
        let agent = agent(AgentState::new(3, "d2", "src"));
        assert_eq!(
            agent.workload_command().unwrap(),
            "/opt/flood --mode destination --node-name d2 --file /var/mn/d2/file --src-name src \
             --pieces-dir /var/mn/d2/pieces --network-info '{}' --ip-map '{}' \
             --timestamp-file /var/mn/d2/pieces/completion_time"
        );
    }
}
