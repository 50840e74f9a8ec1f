//! In-memory state tables with JSON snapshots on disk.
//!
//! One mutex per table. When more than one table must be consulted, locks
//! are taken sequentially, never nested; the only sanctioned nesting order
//! is agents → sessions → threads.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use crate::paths::{write_atomic, HubPaths};
use crate::types::{AgentRecord, SessionInfo};

pub struct StateStore {
    paths: HubPaths,
    agents: Mutex<HashMap<String, AgentRecord>>,
    sessions: Mutex<HashMap<String, SessionInfo>>,
    oriented: Mutex<HashSet<String>>,
    session_agents: Mutex<HashMap<String, String>>,
    coordinator_session: Mutex<Option<String>>,
}

impl StateStore {
    /// Load persisted state from the hub directory.
    pub fn load(paths: HubPaths) -> std::io::Result<Self> {
        let mut agents = HashMap::new();
        if paths.agents.is_dir() {
            for entry in std::fs::read_dir(&paths.agents)? {
                let path = entry?.path();
                if path.extension().is_none_or(|e| e != "json") {
                    continue;
                }
                match std::fs::read_to_string(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|text| {
                        serde_json::from_str::<AgentRecord>(&text).map_err(|e| e.to_string())
                    }) {
                    Ok(record) => {
                        agents.insert(record.agent_id.clone(), record);
                    }
                    Err(error) => {
                        tracing::warn!(path = %path.display(), %error, "skipping unreadable agent record");
                    }
                }
            }
        }

        let oriented: HashSet<String> = read_json_or_default(&paths.oriented_file);
        let session_agents: HashMap<String, String> =
            read_json_or_default(&paths.session_agents_file);

        tracing::debug!(
            agents = agents.len(),
            oriented = oriented.len(),
            mappings = session_agents.len(),
            "state loaded"
        );

        Ok(Self {
            paths,
            agents: Mutex::new(agents),
            sessions: Mutex::new(HashMap::new()),
            oriented: Mutex::new(oriented),
            session_agents: Mutex::new(session_agents),
            coordinator_session: Mutex::new(None),
        })
    }

    // ----- agents -----

    pub fn agent(&self, agent_id: &str) -> Option<AgentRecord> {
        self.agents.lock().get(agent_id).cloned()
    }

    pub fn agent_count(&self) -> usize {
        self.agents.lock().len()
    }

    pub fn agent_ids(&self) -> HashSet<String> {
        self.agents.lock().keys().cloned().collect()
    }

    pub fn agents_snapshot(&self) -> Vec<AgentRecord> {
        self.agents.lock().values().cloned().collect()
    }

    /// Insert or replace an agent record and persist its file.
    pub fn upsert_agent(&self, record: AgentRecord) -> std::io::Result<()> {
        let path = self.paths.agents.join(format!("{}.json", record.agent_id));
        let json = serde_json::to_vec_pretty(&record)?;
        self.agents.lock().insert(record.agent_id.clone(), record);
        write_atomic(&path, &json)
    }

    /// Refresh an agent's last-seen timestamp in memory. Persisted by the
    /// next snapshot flush.
    pub fn touch_agent(&self, agent_id: &str, now_ms: i64) {
        if let Some(record) = self.agents.lock().get_mut(agent_id) {
            record.last_seen_at = now_ms;
        }
    }

    /// Remove an agent record and its file.
    pub fn remove_agent(&self, agent_id: &str) {
        self.agents.lock().remove(agent_id);
        let path = self.paths.agents.join(format!("{agent_id}.json"));
        if let Err(error) = std::fs::remove_file(&path) {
            if error.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(agent = agent_id, %error, "failed removing agent file");
            }
        }
    }

    /// Agent ids whose last-seen is within the stale threshold.
    pub fn active_agent_ids(&self, now_ms: i64, stale_ms: i64) -> Vec<String> {
        let mut ids: Vec<String> = self
            .agents
            .lock()
            .values()
            .filter(|a| now_ms - a.last_seen_at < stale_ms)
            .map(|a| a.agent_id.clone())
            .collect();
        ids.sort();
        ids
    }

    // ----- sessions -----

    pub fn session_known(&self, session_id: &str) -> bool {
        self.sessions.lock().contains_key(session_id)
    }

    pub fn known_session_ids(&self) -> HashSet<String> {
        self.sessions.lock().keys().cloned().collect()
    }

    pub fn insert_session(&self, session: SessionInfo) {
        self.sessions.lock().insert(session.id.clone(), session);
    }

    pub fn remove_session(&self, session_id: &str) {
        self.sessions.lock().remove(session_id);
    }

    // ----- session → agent map -----

    pub fn agent_for_session(&self, session_id: &str) -> Option<String> {
        self.session_agents.lock().get(session_id).cloned()
    }

    pub fn session_for_agent(&self, agent_id: &str) -> Option<String> {
        self.session_agents
            .lock()
            .iter()
            .find(|(_, mapped)| mapped.as_str() == agent_id)
            .map(|(session_id, _)| session_id.clone())
    }

    /// Bind a session to an agent id and persist the map. An existing
    /// conflicting binding is an invariant violation; the newest mapping
    /// wins and the conflict is logged.
    pub fn map_session(&self, session_id: &str, agent_id: &str) -> std::io::Result<()> {
        {
            let mut map = self.session_agents.lock();
            if let Some(previous) = map.get(session_id) {
                if previous != agent_id {
                    tracing::error!(
                        session = session_id,
                        previous = %previous,
                        new = agent_id,
                        "session already mapped to a different agent; keeping the newest mapping"
                    );
                }
            }
            map.insert(session_id.to_string(), agent_id.to_string());
        }
        self.save_session_agents()
    }

    pub fn unmap_session(&self, session_id: &str) -> std::io::Result<()> {
        self.session_agents.lock().remove(session_id);
        self.save_session_agents()
    }

    pub fn session_agents_snapshot(&self) -> HashMap<String, String> {
        self.session_agents.lock().clone()
    }

    // ----- oriented-set -----

    pub fn is_oriented(&self, session_id: &str) -> bool {
        self.oriented.lock().contains(session_id)
    }

    pub fn mark_oriented(&self, session_id: &str) -> std::io::Result<()> {
        self.oriented.lock().insert(session_id.to_string());
        self.save_oriented()
    }

    pub fn remove_oriented(&self, session_id: &str) -> std::io::Result<()> {
        self.oriented.lock().remove(session_id);
        self.save_oriented()
    }

    pub fn oriented_count(&self) -> usize {
        self.oriented.lock().len()
    }

    // ----- coordinator -----

    pub fn coordinator_session(&self) -> Option<String> {
        self.coordinator_session.lock().clone()
    }

    pub fn set_coordinator_session(&self, session_id: &str) {
        *self.coordinator_session.lock() = Some(session_id.to_string());
    }

    pub fn is_coordinator_session(&self, session_id: &str) -> bool {
        self.coordinator_session
            .lock()
            .as_deref()
            .is_some_and(|id| id == session_id)
    }

    // ----- persistence -----

    fn save_oriented(&self) -> std::io::Result<()> {
        let mut ids: Vec<String> = self.oriented.lock().iter().cloned().collect();
        ids.sort();
        write_atomic(&self.paths.oriented_file, &serde_json::to_vec(&ids)?)
    }

    fn save_session_agents(&self) -> std::io::Result<()> {
        let map = self.session_agents.lock().clone();
        write_atomic(
            &self.paths.session_agents_file,
            &serde_json::to_vec_pretty(&map)?,
        )
    }

    /// Snapshot every table to disk. Called periodically and at shutdown.
    pub fn flush(&self) -> std::io::Result<()> {
        let agents = self.agents_snapshot();
        for record in agents {
            let path = self.paths.agents.join(format!("{}.json", record.agent_id));
            write_atomic(&path, &serde_json::to_vec_pretty(&record)?)?;
        }
        self.save_oriented()?;
        self.save_session_agents()
    }
}

fn read_json_or_default<T: serde::de::DeserializeOwned + Default>(
    path: &std::path::Path,
) -> T {
    match std::fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).unwrap_or_else(|error| {
            tracing::warn!(path = %path.display(), %error, "ignoring corrupt state file");
            T::default()
        }),
        Err(_) => T::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::now_ms;

    fn store() -> (tempfile::TempDir, StateStore) {
        let tmp = tempfile::tempdir().unwrap();
        let paths = HubPaths::new(tmp.path().join("hub"));
        paths.ensure_dirs().unwrap();
        let store = StateStore::load(paths).unwrap();
        (tmp, store)
    }

    fn agent(id: &str, session: &str) -> AgentRecord {
        let now = now_ms();
        AgentRecord {
            agent_id: id.to_string(),
            session_id: session.to_string(),
            directory: "/work".to_string(),
            created_at: now,
            last_seen_at: now,
        }
    }

    #[test]
    fn upsert_persists_agent_file() {
        let (_tmp, store) = store();
        store.upsert_agent(agent("alice", "ses_a")).unwrap();
        assert!(store.agent("alice").is_some());

        let path = store.paths.agents.join("alice.json");
        let reloaded: AgentRecord =
            serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(reloaded.session_id, "ses_a");
    }

    #[test]
    fn state_survives_reload() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = HubPaths::new(tmp.path().join("hub"));
        paths.ensure_dirs().unwrap();

        {
            let store = StateStore::load(paths.clone()).unwrap();
            store.upsert_agent(agent("alice", "ses_a")).unwrap();
            store.map_session("ses_a", "alice").unwrap();
            store.mark_oriented("ses_a").unwrap();
        }

        let store = StateStore::load(paths).unwrap();
        assert_eq!(store.agent_for_session("ses_a").as_deref(), Some("alice"));
        assert!(store.is_oriented("ses_a"));
        assert_eq!(store.agent("alice").unwrap().session_id, "ses_a");
    }

    #[test]
    fn conflicting_mapping_prefers_newest() {
        let (_tmp, store) = store();
        store.map_session("ses_a", "alice").unwrap();
        store.map_session("ses_a", "bob").unwrap();
        assert_eq!(store.agent_for_session("ses_a").as_deref(), Some("bob"));
    }

    #[test]
    fn reverse_lookup_finds_session() {
        let (_tmp, store) = store();
        store.map_session("ses_a", "alice").unwrap();
        assert_eq!(store.session_for_agent("alice").as_deref(), Some("ses_a"));
        assert!(store.session_for_agent("nobody").is_none());
    }

    #[test]
    fn remove_agent_deletes_file() {
        let (_tmp, store) = store();
        store.upsert_agent(agent("alice", "ses_a")).unwrap();
        let path = store.paths.agents.join("alice.json");
        assert!(path.exists());

        store.remove_agent("alice");
        assert!(!path.exists());
        assert!(store.agent("alice").is_none());
    }

    #[test]
    fn active_agents_excludes_stale() {
        let (_tmp, store) = store();
        let now = now_ms();
        let mut stale = agent("old", "ses_old");
        stale.last_seen_at = now - 10_000;
        store.upsert_agent(stale).unwrap();
        store.upsert_agent(agent("fresh", "ses_new")).unwrap();

        let active = store.active_agent_ids(now, 5_000);
        assert_eq!(active, vec!["fresh".to_string()]);
    }

    #[test]
    fn coordinator_session_tracking() {
        let (_tmp, store) = store();
        assert!(store.coordinator_session().is_none());
        store.set_coordinator_session("ses_coord");
        assert!(store.is_coordinator_session("ses_coord"));
        assert!(!store.is_coordinator_session("ses_other"));
    }

    #[test]
    fn corrupt_state_files_load_as_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = HubPaths::new(tmp.path().join("hub"));
        paths.ensure_dirs().unwrap();
        std::fs::write(&paths.oriented_file, "not json").unwrap();
        std::fs::write(&paths.session_agents_file, "{broken").unwrap();

        let store = StateStore::load(paths).unwrap();
        assert_eq!(store.oriented_count(), 0);
        assert!(store.session_agents_snapshot().is_empty());
    }
}
