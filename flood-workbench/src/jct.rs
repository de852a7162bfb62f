use crate::agent::AgentState;
use crate::util::shell_quote;
use emulated_network::NetworkFabric;
use emulated_network::network::ip;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum RunError {
    #[error(
        "some files were not distributed properly: `{node}` has sha256 {actual}, the source has {expected}"
    )]
    ContentMismatch {
        node: String,
        expected: String,
        actual: String,
    },
}

/// The worst job completion time of the run, undefined if any agent lacks a timestamp
pub fn final_jct(agents: &[AgentState]) -> Option<Duration> {
    let jcts: Option<Vec<Duration>> = agents.iter().map(|a| a.jct()).collect();
    jcts?.into_iter().max()
}

pub fn debug_log_all_jcts(agents: &[AgentState]) {
    tracing::debug!("Per host download time:");
    for agent in agents {
        tracing::debug!("\t{}: {:?}", agent.node, agent.jct());
    }
}

/// Hashes `path` on `node`, through the node's command channel
///
/// Returns `None` when the file cannot be hashed (e.g. because it does not exist).
pub async fn content_hash<F: NetworkFabric>(
    fabric: &F,
    node: &str,
    path: &Path,
) -> anyhow::Result<Option<String>> {
    let output = fabric
        .cmd(
            node,
            &format!("sha256sum {}", shell_quote(&path.display().to_string())),
        )
        .await?;
    Ok(ip::parse_sha256sum(&output))
}

/// Checks that every destination ended up with the source's content
pub async fn verify_content<F: NetworkFabric>(
    fabric: &F,
    expected: &str,
    destinations: impl IntoIterator<Item = (String, PathBuf)>,
) -> anyhow::Result<BTreeMap<String, String>> {
    let mut hashes = BTreeMap::new();
    for (node, path) in destinations {
        let hash = content_hash(fabric, &node, &path)
            .await?
            .unwrap_or_else(|| "<missing>".to_string());
        hashes.insert(node, hash);
    }
    tracing::debug!("All hashes: {hashes:?}");

    if let Some((node, actual)) = hashes.iter().find(|(_, actual)| *actual != expected) {
        return Err(RunError::ContentMismatch {
            node: node.clone(),
            expected: expected.to_string(),
            actual: actual.clone(),
        }
        .into());
    }

    Ok(hashes)
}
