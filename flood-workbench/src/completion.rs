use anyhow::Context;
use std::path::Path;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio::time::Instant;

/// How long unparseable contents must stay unchanged before the workload is considered done
/// writing them
pub const SETTLE_TIME: Duration = Duration::from_secs(1);

/// Start and end of a workload, in (possibly fractional) microseconds since the Unix epoch,
/// separated by whitespace
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CompletionTimestamps {
    pub start: SystemTime,
    pub end: SystemTime,
}

#[derive(Error, Debug, PartialEq)]
pub enum CompletionError {
    #[error("the completion file is empty")]
    Empty,
    #[error("the completion file is malformed: `{0}`")]
    Malformed(String),
}

impl FromStr for CompletionTimestamps {
    type Err = CompletionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let contents = s.trim();
        if contents.is_empty() {
            return Err(CompletionError::Empty);
        }

        let malformed = || CompletionError::Malformed(contents.to_string());
        let timestamps: Vec<SystemTime> = contents
            .split_whitespace()
            .map(|value| {
                value
                    .parse::<f64>()
                    .ok()
                    .filter(|micros| micros.is_finite() && *micros >= 0.0)
                    .map(|micros| UNIX_EPOCH + Duration::from_micros(micros.round() as u64))
                    .ok_or_else(malformed)
            })
            .collect::<Result<_, _>>()?;

        let [start, end] = timestamps[..] else {
            return Err(malformed());
        };
        Ok(Self { start, end })
    }
}

// No timeout: a workload that never signals completion stalls the caller.
pub async fn wait_for_file(path: &Path, poll_interval: Duration) -> anyhow::Result<()> {
    loop {
        let exists = tokio::fs::try_exists(path)
            .await
            .with_context(|| format!("failed to check for {}", path.display()))?;
        if exists {
            return Ok(());
        }

        tokio::time::sleep(poll_interval).await;
    }
}

/// Waits for the completion file at `path` and parses it
///
/// The file shows up before the workload has written to it, so contents that do not parse are
/// read again every `poll_interval` until they parse or stay the same for [`SETTLE_TIME`].
pub async fn read_completion_file(
    path: &Path,
    poll_interval: Duration,
) -> anyhow::Result<Result<CompletionTimestamps, CompletionError>> {
    wait_for_file(path, poll_interval).await?;

    let mut unchanged_since: Option<(String, Instant)> = None;
    loop {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let parsed = contents.parse::<CompletionTimestamps>();
        if parsed.is_ok() {
            return Ok(parsed);
        }

        match &unchanged_since {
            Some((previous, since)) if *previous == contents => {
                if since.elapsed() >= SETTLE_TIME {
                    return Ok(parsed);
                }
            }
            _ => unchanged_since = Some((contents, Instant::now())),
        }

        tokio::time::sleep(poll_interval).await;
    }
}
