//! Session discovery.
//!
//! Polls the relay's session listing, diffs against the known set, and
//! drives the registrar for sessions that appear. Sessions present on the
//! first successful poll are snapshotted as pre-existing and never
//! oriented; a failed poll never marks anything gone.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::MissedTickBehavior;

use crate::metrics::Metrics;
use crate::registrar::Registrar;
use crate::relay::RelayClient;
use crate::session_cache::SessionCache;
use crate::store::StateStore;
use crate::types::{now_ms, SessionInfo};

/// Sessions that appeared and disappeared since the last poll.
pub fn diff_sessions(
    known: &HashSet<String>,
    fetched: &[SessionInfo],
) -> (Vec<SessionInfo>, Vec<String>) {
    let fetched_ids: HashSet<&str> = fetched.iter().map(|s| s.id.as_str()).collect();
    let new = fetched
        .iter()
        .filter(|s| !known.contains(&s.id))
        .cloned()
        .collect();
    let gone = known
        .iter()
        .filter(|id| !fetched_ids.contains(id.as_str()))
        .cloned()
        .collect();
    (new, gone)
}

pub struct SessionPoller {
    relay: Arc<RelayClient>,
    cache: Arc<SessionCache>,
    store: Arc<StateStore>,
    registrar: Arc<Registrar>,
    metrics: Metrics,
    interval: Duration,
    /// Session ids present on the first successful poll. Populated once;
    /// entries fall out when their session goes away.
    preexisting: Mutex<Option<HashSet<String>>>,
}

impl SessionPoller {
    pub fn new(
        relay: Arc<RelayClient>,
        cache: Arc<SessionCache>,
        store: Arc<StateStore>,
        registrar: Arc<Registrar>,
        metrics: Metrics,
        interval: Duration,
    ) -> Self {
        Self {
            relay,
            cache,
            store,
            registrar,
            metrics,
            interval,
            preexisting: Mutex::new(None),
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick().await;
        }
    }

    pub async fn tick(&self) {
        let sessions = match self.cache.list(&self.relay).await {
            Ok(sessions) => sessions,
            Err(error) => {
                // Unavailable polls must not mark sessions gone.
                tracing::debug!(%error, "session poll failed");
                return;
            }
        };

        if self.preexisting.lock().is_none() {
            self.bootstrap(&sessions);
            return;
        }

        let (new, gone) = diff_sessions(&self.store.known_session_ids(), &sessions);

        for session_id in gone {
            tracing::info!(session = %session_id, "session gone");
            self.store.remove_session(&session_id);
            if let Err(error) = self.store.remove_oriented(&session_id) {
                tracing::warn!(%error, "failed persisting oriented set");
            }
            if let Some(set) = self.preexisting.lock().as_mut() {
                set.remove(&session_id);
            }
        }

        for session in new {
            let skip = self
                .preexisting
                .lock()
                .as_ref()
                .is_some_and(|set| set.contains(&session.id));
            if !skip {
                tracing::info!(session = %session.id, name = ?session.name(), "new session");
                if let Err(error) = self.registrar.handle_new_session(&session).await {
                    tracing::error!(session = %session.id, %error, "registration failed");
                }
            }
            // Resolution sees the session only after the registrar ran.
            self.store.insert_session(session);
        }

        self.refresh_last_seen(&sessions);
        self.metrics
            .set_gauge("agent_hub_oriented_sessions", self.store.oriented_count() as f64);
    }

    /// First successful poll: record everything as known without emitting
    /// NEW_SESSION. Sessions that already carry an agent mapping are
    /// marked oriented so a restart never re-orients them.
    fn bootstrap(&self, sessions: &[SessionInfo]) {
        let mut snapshot = HashSet::new();
        let mut bootstrapped = 0usize;
        for session in sessions {
            snapshot.insert(session.id.clone());
            self.store.insert_session(session.clone());
            if self.store.agent_for_session(&session.id).is_some()
                && !self.store.is_oriented(&session.id)
            {
                if let Err(error) = self.store.mark_oriented(&session.id) {
                    tracing::warn!(%error, "failed persisting oriented set");
                } else {
                    bootstrapped += 1;
                }
            }
        }
        tracing::info!(
            sessions = snapshot.len(),
            bootstrapped,
            "snapshotted pre-existing sessions"
        );
        self.refresh_last_seen(sessions);
        *self.preexisting.lock() = Some(snapshot);
    }

    fn refresh_last_seen(&self, sessions: &[SessionInfo]) {
        let now = now_ms();
        for session in sessions {
            if let Some(agent_id) = self.store.agent_for_session(&session.id) {
                self.store.touch_agent(&agent_id, now);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session(id: &str) -> SessionInfo {
        SessionInfo {
            id: id.to_string(),
            slug: None,
            title: None,
            directory: None,
            time: None,
        }
    }

    #[test]
    fn diff_detects_new_and_gone() {
        let known: HashSet<String> = ["ses_a".to_string(), "ses_b".to_string()].into();
        let fetched = vec![session("ses_b"), session("ses_c")];

        let (new, gone) = diff_sessions(&known, &fetched);
        assert_eq!(new.len(), 1);
        assert_eq!(new[0].id, "ses_c");
        assert_eq!(gone, vec!["ses_a".to_string()]);
    }

    #[test]
    fn diff_empty_known_reports_all_new() {
        let (new, gone) = diff_sessions(&HashSet::new(), &[session("ses_a")]);
        assert_eq!(new.len(), 1);
        assert!(gone.is_empty());
    }

    #[test]
    fn diff_identical_sets_report_nothing() {
        let known: HashSet<String> = ["ses_a".to_string()].into();
        let (new, gone) = diff_sessions(&known, &[session("ses_a")]);
        assert!(new.is_empty());
        assert!(gone.is_empty());
    }

    #[test]
    fn diff_empty_fetch_marks_all_gone() {
        let known: HashSet<String> = ["ses_a".to_string()].into();
        let (new, gone) = diff_sessions(&known, &[]);
        assert!(new.is_empty());
        assert_eq!(gone, vec!["ses_a".to_string()]);
    }
}
