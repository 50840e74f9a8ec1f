//! HTTP client for the relay server.
//!
//! The relay exposes session listing (`GET /session`) and async prompt
//! injection (`POST /session/{id}/prompt_async`). Everything the daemon
//! knows about live sessions comes through this client.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde_json::json;
use thiserror::Error;
use tokio::process::Command;

use crate::types::SessionInfo;

/// How long to keep probing after spawning the relay process.
const SPAWN_WAIT_ATTEMPTS: u32 = 30;
const SPAWN_WAIT_STEP: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum RelayError {
    /// The targeted session no longer exists (HTTP 404).
    #[error("session not found")]
    NotFound,

    /// Connection failure, timeout, or a non-success status: the relay
    /// cannot currently be trusted. Retryable.
    #[error("relay unavailable: {0}")]
    Unavailable(String),

    #[error("invalid relay response: {0}")]
    InvalidResponse(String),
}

impl RelayError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound)
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(err: reqwest::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RelayError>;

#[derive(Debug, Clone)]
pub struct RelayClient {
    client: reqwest::Client,
    base_url: String,
}

impl RelayClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("reqwest client construction cannot fail with static options");
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch the relay's current session list. Non-2xx responses are
    /// `Unavailable`: the listing is all-or-nothing truth.
    pub async fn list_sessions(&self) -> Result<Vec<SessionInfo>> {
        let resp = self
            .client
            .get(format!("{}/session", self.base_url))
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RelayError::Unavailable(format!(
                "session list returned {status}"
            )));
        }
        resp.json::<Vec<SessionInfo>>()
            .await
            .map_err(|e| RelayError::InvalidResponse(e.to_string()))
    }

    /// Inject text into a session via the async prompt endpoint. The relay
    /// accepts with any 2xx; 404 means the session is gone.
    pub async fn inject(&self, session_id: &str, text: &str) -> Result<()> {
        let resp = self
            .client
            .post(format!("{}/session/{session_id}/prompt_async", self.base_url))
            .json(&json!({ "text": text }))
            .send()
            .await?;
        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else if status == reqwest::StatusCode::NOT_FOUND {
            Err(RelayError::NotFound)
        } else {
            Err(RelayError::Unavailable(format!("inject returned {status}")))
        }
    }

    /// Make sure a relay is answering on the configured port, spawning the
    /// external relay process if needed. Returns once `list_sessions`
    /// succeeds; errors if the relay never comes up within the bounded wait.
    pub async fn ensure_relay_running(&self, port: u16) -> anyhow::Result<()> {
        if self.list_sessions().await.is_ok() {
            return Ok(());
        }

        tracing::info!(port, "relay not responding, spawning relay server");
        spawn_relay_process(port).await?;

        for _ in 0..SPAWN_WAIT_ATTEMPTS {
            tokio::time::sleep(SPAWN_WAIT_STEP).await;
            if self.list_sessions().await.is_ok() {
                tracing::info!(port, "relay server is up");
                return Ok(());
            }
        }
        anyhow::bail!("relay did not become reachable on port {port} within the startup wait")
    }
}

/// Spawn `opencode serve` detached, with output appended to log files under
/// the daemon's data directory. The process intentionally outlives the
/// daemon.
async fn spawn_relay_process(port: u16) -> anyhow::Result<()> {
    let log_dir = relay_log_dir();
    std::fs::create_dir_all(&log_dir)?;
    let stdout = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(log_dir.join("relay-stdout.log"))?;
    let stderr = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(log_dir.join("relay-stderr.log"))?;

    let mut cmd = Command::new("opencode");
    cmd.arg("serve")
        .arg("--port")
        .arg(port.to_string())
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr);

    #[cfg(unix)]
    {
        // Detach into its own session so daemon shutdown leaves it running.
        cmd.process_group(0);
    }

    let child = cmd
        .spawn()
        .map_err(|e| anyhow::anyhow!("failed to spawn relay process (`opencode serve`): {e}"))?;
    tracing::info!(pid = child.id(), "relay server spawned");
    Ok(())
}

fn relay_log_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("agent-hub-daemon")
}
