//! Coordinator orchestration.
//!
//! The coordinator is a daemon-spawned session that brokers introductions
//! between newly arrived agents. It holds the reserved agent id
//! `coordinator` but is otherwise an ordinary peer: NEW_AGENT
//! notifications reach it through the spool like any other message, and
//! its replies flow back through the normal pipeline.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use tokio::process::Command;

use crate::config::CoordinatorConfig;
use crate::relay::RelayClient;
use crate::store::StateStore;
use crate::types::{now_ms, AgentRecord, SessionInfo};

/// Reserved agent id; the registrar never assigns it to anyone else.
pub const COORDINATOR_AGENT_ID: &str = "coordinator";

/// Exact session title used to discover the coordinator in the relay
/// listing.
pub const COORDINATOR_TITLE: &str = "agent-hub-coordinator";

/// Kickoff prompt for a freshly spawned coordinator session.
const KICKOFF_PROMPT: &str = "Read AGENTS.md in this directory. You are the agent-hub \
coordinator: wait for NEW_AGENT notifications and introduce agents that should know \
about each other. Stay silent otherwise.";

const MINIMAL_INSTRUCTIONS: &str = "# Coordinator Agent\n\n\
You are the coordinator for a hub of coding-assistant agents.\n\n\
The daemon sends you `NEW_AGENT: <agent-id> at <directory>` notifications\n\
when agents join. When two agents are likely to collaborate, introduce them\n\
to each other with a short context message to each. Do not relay ordinary\n\
traffic and do not message agents without a reason.\n";

/// How long to wait for the spawned session to appear in the listing.
const DISCOVERY_ATTEMPTS: u32 = 30;
const DISCOVERY_STEP: Duration = Duration::from_secs(1);

pub struct CoordinatorOrchestrator {
    cfg: CoordinatorConfig,
    relay: Arc<RelayClient>,
    store: Arc<StateStore>,
}

impl CoordinatorOrchestrator {
    pub fn new(cfg: CoordinatorConfig, relay: Arc<RelayClient>, store: Arc<StateStore>) -> Self {
        Self { cfg, relay, store }
    }

    /// Ensure a coordinator session exists and is registered. Returns its
    /// session id, or `None` when the coordinator is disabled.
    pub async fn start(&self) -> anyhow::Result<Option<String>> {
        if !self.cfg.enabled {
            return Ok(None);
        }

        self.setup_directory()?;

        if let Some(session_id) = self.find_session().await {
            tracing::info!(session = %session_id, "reusing existing coordinator session");
            self.register(&session_id)?;
            return Ok(Some(session_id));
        }

        self.spawn_session().await?;

        for _ in 0..DISCOVERY_ATTEMPTS {
            tokio::time::sleep(DISCOVERY_STEP).await;
            if let Some(session_id) = self.find_session().await {
                tracing::info!(session = %session_id, "coordinator session discovered");
                self.register(&session_id)?;
                return Ok(Some(session_id));
            }
        }
        anyhow::bail!("coordinator session never appeared in the relay listing")
    }

    async fn find_session(&self) -> Option<String> {
        match self.relay.list_sessions().await {
            Ok(sessions) => match_coordinator(&sessions).map(|s| s.id.clone()),
            Err(error) => {
                tracing::debug!(%error, "coordinator discovery poll failed");
                None
            }
        }
    }

    /// Bind the reserved agent identity to the discovered session and mark
    /// it oriented without injecting anything; the coordinator's
    /// instructions file already covers its role.
    fn register(&self, session_id: &str) -> anyhow::Result<()> {
        self.store.set_coordinator_session(session_id);
        let now = now_ms();
        let record = match self.store.agent(COORDINATOR_AGENT_ID) {
            Some(mut existing) => {
                existing.session_id = session_id.to_string();
                existing.last_seen_at = now;
                existing
            }
            None => AgentRecord {
                agent_id: COORDINATOR_AGENT_ID.to_string(),
                session_id: session_id.to_string(),
                directory: self.cfg.directory.display().to_string(),
                created_at: now,
                last_seen_at: now,
            },
        };
        self.store.upsert_agent(record)?;
        self.store.map_session(session_id, COORDINATOR_AGENT_ID)?;
        self.store.mark_oriented(session_id)?;
        Ok(())
    }

    /// Make sure the coordinator working directory carries an AGENTS.md.
    /// Template precedence: explicit config path, then the user config
    /// dir's AGENTS.md, then its COORDINATOR.md alias, then a minimal
    /// built-in. An existing AGENTS.md is never overwritten.
    fn setup_directory(&self) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.cfg.directory)?;
        let target = self.cfg.directory.join("AGENTS.md");
        if target.exists() {
            return Ok(());
        }

        match find_instructions_template(self.cfg.instructions.as_deref(), &crate::config::config_dir())
        {
            Some(template) => {
                std::fs::copy(&template, &target)?;
                tracing::info!(template = %template.display(), "installed coordinator instructions");
            }
            None => {
                std::fs::write(&target, MINIMAL_INSTRUCTIONS)?;
                tracing::info!("wrote minimal coordinator instructions");
            }
        }
        Ok(())
    }

    /// Spawn the external coordinator session, detached, logging into the
    /// coordinator directory.
    async fn spawn_session(&self) -> anyhow::Result<()> {
        let stdout = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.cfg.directory.join("coordinator-stdout.log"))?;
        let stderr = std::fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(self.cfg.directory.join("coordinator-stderr.log"))?;

        let mut cmd = Command::new("opencode");
        cmd.arg("run")
            .arg("--model")
            .arg(&self.cfg.model)
            .arg("--title")
            .arg(COORDINATOR_TITLE)
            .arg(KICKOFF_PROMPT)
            .current_dir(&self.cfg.directory)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr);

        #[cfg(unix)]
        {
            cmd.process_group(0);
        }

        let child = cmd
            .spawn()
            .map_err(|e| anyhow::anyhow!("failed to spawn coordinator session: {e}"))?;
        tracing::info!(pid = child.id(), model = %self.cfg.model, "coordinator session spawned");
        Ok(())
    }
}

/// Exact-title match against the session listing.
pub fn match_coordinator(sessions: &[SessionInfo]) -> Option<&SessionInfo> {
    sessions
        .iter()
        .find(|s| s.title.as_deref() == Some(COORDINATOR_TITLE))
}

/// Resolve the instructions template to copy, if any.
pub fn find_instructions_template(explicit: Option<&Path>, config_dir: &Path) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        tracing::warn!(path = %path.display(), "configured coordinator instructions not found");
    }
    for name in ["AGENTS.md", "COORDINATOR.md"] {
        let candidate = config_dir.join(name);
        if candidate.exists() {
            return Some(candidate);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str, title: &str) -> SessionInfo {
        SessionInfo {
            id: id.to_string(),
            slug: None,
            title: Some(title.to_string()),
            directory: Some("/p".to_string()),
            time: None,
        }
    }

    #[test]
    fn matches_exact_title_only() {
        let sessions = vec![
            session("ses_1", "Fix bug in auth"),
            session("ses_coord", COORDINATOR_TITLE),
            session("ses_2", "Add feature X"),
        ];
        assert_eq!(match_coordinator(&sessions).unwrap().id, "ses_coord");
    }

    #[test]
    fn ignores_similar_titles() {
        let sessions = vec![
            session("ses_1", "agent-hub-coordinator setup"),
            session("ses_2", "my-agent-hub-coordinator"),
            session("ses_3", "Coordinator agent setup"),
        ];
        assert!(match_coordinator(&sessions).is_none());
        assert!(match_coordinator(&[]).is_none());
    }

    #[test]
    fn explicit_template_wins() {
        let tmp = tempfile::tempdir().unwrap();
        let explicit = tmp.path().join("custom.md");
        std::fs::write(&explicit, "# Custom").unwrap();
        let config_dir = tmp.path().join("config");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join("AGENTS.md"), "# From config").unwrap();

        let found = find_instructions_template(Some(&explicit), &config_dir).unwrap();
        assert_eq!(found, explicit);
    }

    #[test]
    fn missing_explicit_falls_through() {
        let tmp = tempfile::tempdir().unwrap();
        let config_dir = tmp.path().join("config");
        std::fs::create_dir_all(&config_dir).unwrap();
        std::fs::write(config_dir.join("COORDINATOR.md"), "# Alias").unwrap();

        let found =
            find_instructions_template(Some(Path::new("/nonexistent/custom.md")), &config_dir)
                .unwrap();
        assert!(found.ends_with("COORDINATOR.md"));
    }

    #[test]
    fn agents_md_beats_coordinator_md() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("AGENTS.md"), "# wins").unwrap();
        std::fs::write(tmp.path().join("COORDINATOR.md"), "# loses").unwrap();

        let found = find_instructions_template(None, tmp.path()).unwrap();
        assert!(found.ends_with("AGENTS.md"));
    }

    #[test]
    fn no_templates_resolves_none() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(find_instructions_template(None, tmp.path()).is_none());
    }

    #[test]
    fn minimal_instructions_mention_new_agent() {
        assert!(MINIMAL_INSTRUCTIONS.contains("Coordinator Agent"));
        assert!(MINIMAL_INSTRUCTIONS.contains("NEW_AGENT"));
    }
}
