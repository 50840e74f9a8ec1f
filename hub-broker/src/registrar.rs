//! Agent registration and orientation.
//!
//! Every new session gets a stable agent id. `session_agents.json` is the
//! authority: a session that was mapped before keeps its id across daemon
//! restarts. Fresh ids derive from the session's human name; collisions
//! and the reserved `coordinator` id get a short session-id suffix.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::coordinator::COORDINATOR_AGENT_ID;
use crate::metrics::Metrics;
use crate::paths::HubPaths;
use crate::prompt;
use crate::relay::RelayClient;
use crate::store::StateStore;
use crate::types::{now_ms, AgentRecord, Message, MessageType, SessionInfo};

/// Pause between orientation attempts, scaled linearly per attempt.
const ORIENTATION_BACKOFF_STEP: Duration = Duration::from_millis(500);

pub struct Registrar {
    store: Arc<StateStore>,
    relay: Arc<RelayClient>,
    metrics: Metrics,
    paths: HubPaths,
    retries: u32,
    agent_stale_ms: i64,
    coordinator_enabled: bool,
}

impl Registrar {
    pub fn new(
        store: Arc<StateStore>,
        relay: Arc<RelayClient>,
        metrics: Metrics,
        paths: HubPaths,
        retries: u32,
        agent_stale_seconds: u64,
        coordinator_enabled: bool,
    ) -> Self {
        Self {
            store,
            relay,
            metrics,
            paths,
            retries,
            agent_stale_ms: agent_stale_seconds as i64 * 1000,
            coordinator_enabled,
        }
    }

    /// Handle a NEW_SESSION event: assign an identity, write the agent
    /// record, inject the orientation prompt once, and notify the
    /// coordinator. Runs synchronously in the poller so orientation lands
    /// before the session becomes resolvable for message delivery.
    pub async fn handle_new_session(&self, session: &SessionInfo) -> anyhow::Result<()> {
        if self.store.is_coordinator_session(&session.id) {
            // The coordinator registers itself; never orient or re-identify it.
            self.store.mark_oriented(&session.id)?;
            return Ok(());
        }

        let now = now_ms();
        let agent_id = match self.store.agent_for_session(&session.id) {
            Some(existing) => existing,
            None => {
                let mut taken = self.store.agent_ids();
                taken.extend(self.store.session_agents_snapshot().into_values());
                let derived = derive_agent_id(session, &taken);
                self.store.map_session(&session.id, &derived)?;
                self.metrics.inc("agent_hub_agents_auto_created_total");
                tracing::info!(agent = %derived, session = %session.id, "registered new agent");
                derived
            }
        };

        let record = match self.store.agent(&agent_id) {
            Some(mut existing) => {
                existing.session_id = session.id.clone();
                if let Some(dir) = session.directory.clone() {
                    existing.directory = dir;
                }
                existing.last_seen_at = now;
                existing
            }
            None => AgentRecord {
                agent_id: agent_id.clone(),
                session_id: session.id.clone(),
                directory: session.directory.clone().unwrap_or_default(),
                created_at: now,
                last_seen_at: now,
            },
        };
        self.store.upsert_agent(record.clone())?;
        self.metrics
            .set_gauge("agent_hub_active_agents", self.store.agent_count() as f64);

        if !self.store.is_oriented(&session.id) && self.orient(&session.id, &record).await {
            if self.coordinator_enabled {
                self.stage_coordinator_notification(&record)?;
            }
        }
        Ok(())
    }

    /// Inject the orientation prompt with bounded retries. Returns whether
    /// the session ended up oriented. A session whose injection fails on
    /// every attempt stays un-oriented; it is only revisited if it leaves
    /// the relay and comes back.
    async fn orient(&self, session_id: &str, agent: &AgentRecord) -> bool {
        let now = now_ms();
        let others: Vec<String> = self
            .store
            .active_agent_ids(now, self.agent_stale_ms)
            .into_iter()
            .filter(|id| id != &agent.agent_id)
            .collect();
        let text = prompt::orientation(agent, &others);

        for attempt in 0..=self.retries {
            match self.relay.inject(session_id, &text).await {
                Ok(()) => {
                    if let Err(error) = self.store.mark_oriented(session_id) {
                        tracing::warn!(%error, "failed persisting oriented set");
                    }
                    self.metrics.inc("agent_hub_sessions_oriented_total");
                    self.metrics
                        .set_gauge("agent_hub_oriented_sessions", self.store.oriented_count() as f64);
                    tracing::info!(session = session_id, agent = %agent.agent_id, "session oriented");
                    return true;
                }
                Err(error) if error.is_not_found() => {
                    tracing::warn!(session = session_id, "session vanished before orientation");
                    return false;
                }
                Err(error) => {
                    tracing::warn!(session = session_id, attempt, %error, "orientation injection failed");
                }
            }
            if attempt < self.retries {
                tokio::time::sleep(ORIENTATION_BACKOFF_STEP * (attempt + 1)).await;
            }
        }
        tracing::error!(session = session_id, "giving up on orientation after retries");
        false
    }

    /// Drop a NEW_AGENT notification for the coordinator into the spool.
    /// It flows through the normal delivery pipeline like any other
    /// message, staged dot-prefixed then renamed so the watcher only ever
    /// sees complete files.
    fn stage_coordinator_notification(&self, agent: &AgentRecord) -> std::io::Result<()> {
        let mut msg = Message::new(
            "daemon",
            COORDINATOR_AGENT_ID,
            MessageType::Context,
            &prompt::new_agent_notification(&agent.agent_id, &agent.directory),
        );
        msg.thread_id = Some(format!("t-daemon-{}", agent.agent_id));
        stage_message(&self.paths.messages, &msg)
    }
}

/// Write a message into the spool the way producers are required to:
/// staged under a dot-prefixed name, then renamed into place.
pub fn stage_message(messages_dir: &Path, msg: &Message) -> std::io::Result<()> {
    let name = format!("{}-{}-{}.json", msg.from, msg.to, msg.timestamp);
    let staging = messages_dir.join(format!(".{name}"));
    std::fs::write(&staging, serde_json::to_vec_pretty(msg)?)?;
    std::fs::rename(&staging, messages_dir.join(name))
}

/// Derive a stable agent id for a session. Slug (or title) is slugified;
/// a session with no usable name falls back to a truncated session id.
/// Collisions and the reserved coordinator id get a short session-id
/// suffix.
pub fn derive_agent_id(session: &SessionInfo, taken: &HashSet<String>) -> String {
    let candidate = match session.name().map(slugify) {
        Some(slug) if !slug.is_empty() => slug,
        _ => return session_fallback_id(&session.id),
    };

    if candidate != COORDINATOR_AGENT_ID && !taken.contains(&candidate) {
        return candidate;
    }

    let suffixed = format!("{candidate}-{}", short_session_suffix(&session.id));
    if !taken.contains(&suffixed) {
        return suffixed;
    }
    session_fallback_id(&session.id)
}

fn slugify(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_dash = true;
    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_end_matches('-').to_string()
}

fn session_fallback_id(session_id: &str) -> String {
    let bare = bare_session_id(session_id);
    format!("session-{}", &bare[..bare.len().min(12)])
}

fn short_session_suffix(session_id: &str) -> String {
    let bare = bare_session_id(session_id);
    bare[..bare.len().min(6)].to_string()
}

fn bare_session_id(session_id: &str) -> &str {
    session_id.strip_prefix("ses_").unwrap_or(session_id)
}
