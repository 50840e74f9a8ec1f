//! Hub directory layout and atomic file writes.
//!
//! Everything the daemon persists lives under a single hub directory
//! (default `~/.agent-hub`). The spool and its archive must share a
//! filesystem so rename is the commit primitive.

use std::fs;
use std::io::{Result, Write};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct HubPaths {
    pub root: PathBuf,
    pub messages: PathBuf,
    pub archive: PathBuf,
    pub threads: PathBuf,
    pub agents: PathBuf,
    pub session_agents_file: PathBuf,
    pub oriented_file: PathBuf,
    pub metrics_file: PathBuf,
}

impl HubPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let messages = root.join("messages");
        Self {
            archive: messages.join("archive"),
            threads: root.join("threads"),
            agents: root.join("agents"),
            session_agents_file: root.join("session_agents.json"),
            oriented_file: root.join("oriented_sessions.json"),
            metrics_file: root.join("metrics.prom"),
            messages,
            root,
        }
    }

    /// Default hub root: `$AGENT_HUB_DIR` or `~/.agent-hub`.
    pub fn default_root() -> PathBuf {
        if let Ok(dir) = std::env::var("AGENT_HUB_DIR") {
            if !dir.is_empty() {
                return PathBuf::from(dir);
            }
        }
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".agent-hub")
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.messages, &self.archive, &self.threads, &self.agents] {
            fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

/// Write `contents` to `path` atomically: temp file in the same directory,
/// then rename over the destination.
pub fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(contents)?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
