use crate::agent::{Agent, AgentContext, AgentState};
use crate::config::FILE_NAME;
use crate::util::shell_quote;
use anyhow::Context;
use emulated_network::NetworkFabric;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::task::JoinHandle;

const HTTP_PORT: u16 = 8000;

/// The source serves its private directory over HTTP and every destination downloads the file
/// with `wget`, occupying its own command channel until the download returns
pub struct NaiveAgent<F> {
    state: AgentState,
    context: Arc<AgentContext<F>>,
    download: Option<JoinHandle<anyhow::Result<SystemTime>>>,
}

impl<F: NetworkFabric> NaiveAgent<F> {
    async fn serve(&mut self) -> anyhow::Result<()> {
        let dir = self.context.config.host_dir(&self.state.node);
        let command = format!(
            "python3 -m http.server {HTTP_PORT} --directory {} > /dev/null 2>&1 < /dev/null &",
            shell_quote(&dir.display().to_string())
        );

        self.state.start_time = Some(SystemTime::now());
        self.context.fabric.cmd(&self.state.node, &command).await?;

        // The source already has the file
        self.state.end_time = self.state.start_time;
        Ok(())
    }

    fn download(&mut self) -> anyhow::Result<()> {
        let source_ip = self
            .context
            .network_info
            .ip_aliases
            .get(&self.state.source)
            .and_then(|aliases| aliases.first())
            .map(|(_, address)| *address)
            .with_context(|| format!("source `{}` has no address", self.state.source))?;

        let output = self.context.config.file_path(&self.state.node);
        let command = format!(
            "wget --retry-connrefused --tries=30 --waitretry=1 -q -O {} http://{source_ip}:{HTTP_PORT}/{FILE_NAME}",
            shell_quote(&output.display().to_string())
        );

        let fabric = self.context.fabric.clone();
        let node = self.state.node.clone();
        self.state.start_time = Some(SystemTime::now());
        self.download = Some(tokio::spawn(async move {
            fabric.cmd(&node, &command).await?;
            Ok(SystemTime::now())
        }));

        Ok(())
    }
}

impl<F: NetworkFabric> Agent<F> for NaiveAgent<F> {
    fn new(state: AgentState, context: Arc<AgentContext<F>>) -> Self {
        Self {
            state,
            context,
            download: None,
        }
    }

    async fn start_download(&mut self) -> anyhow::Result<()> {
        if self.state.is_source() {
            self.serve().await
        } else {
            self.download()
        }
    }

    async fn wait_output(&mut self) -> anyhow::Result<()> {
        if let Some(download) = self.download.take() {
            let end_time = download
                .await
                .context("download task crashed")?
                .with_context(|| format!("download on `{}` failed", self.state.node))?;
            self.state.end_time = Some(end_time);
        }

        Ok(())
    }

    fn state(&self) -> &AgentState {
        &self.state
    }
}
