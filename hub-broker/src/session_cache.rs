//! TTL cache over the relay's session listing.
//!
//! Avoids hammering `GET /session` from the poller, the workers, and GC
//! at once. Only successful fetches replace the cached list; a failed
//! refresh keeps serving the previous snapshot's absence (callers see the
//! error and decide).

use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::metrics::Metrics;
use crate::relay::{RelayClient, Result};
use crate::types::SessionInfo;

struct CacheSlot {
    fetched_at: Instant,
    sessions: Vec<SessionInfo>,
}

pub struct SessionCache {
    ttl: Duration,
    slot: Mutex<Option<CacheSlot>>,
    metrics: Metrics,
}

impl SessionCache {
    pub fn new(ttl: Duration, metrics: Metrics) -> Self {
        Self {
            ttl,
            slot: Mutex::new(None),
            metrics,
        }
    }

    /// Cached session list, refetching when stale.
    pub async fn list(&self, relay: &RelayClient) -> Result<Vec<SessionInfo>> {
        if let Some(cached) = self.fresh() {
            self.metrics.inc("agent_hub_cache_hits_total");
            return Ok(cached);
        }
        self.metrics.inc("agent_hub_cache_misses_total");
        self.refresh(relay).await
    }

    /// Force a fetch, replacing the cache on success.
    pub async fn refresh(&self, relay: &RelayClient) -> Result<Vec<SessionInfo>> {
        let sessions = relay.list_sessions().await?;
        *self.slot.lock() = Some(CacheSlot {
            fetched_at: Instant::now(),
            sessions: sessions.clone(),
        });
        Ok(sessions)
    }

    /// Drop the cache entirely; next `list` refetches.
    pub fn invalidate(&self) {
        *self.slot.lock() = None;
    }

    /// Remove one session from the cached snapshot (used when an inject
    /// returns 404 for it).
    pub fn evict_session(&self, session_id: &str) {
        if let Some(slot) = self.slot.lock().as_mut() {
            slot.sessions.retain(|s| s.id != session_id);
        }
    }

    /// Whether the cached snapshot contains the session. `None` when
    /// nothing is cached.
    pub fn contains(&self, session_id: &str) -> Option<bool> {
        self.fresh().map(|sessions| sessions.iter().any(|s| s.id == session_id))
    }

    fn fresh(&self) -> Option<Vec<SessionInfo>> {
        let slot = self.slot.lock();
        slot.as_ref()
            .filter(|s| s.fetched_at.elapsed() < self.ttl)
            .map(|s| s.sessions.clone())
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

    fn seeded(ttl: Duration, ids: &[&str]) -> SessionCache {
        let cache = SessionCache::new(ttl, Metrics::new());
        *cache.slot.lock() = Some(CacheSlot {
            fetched_at: Instant::now(),
            sessions: ids.iter().map(|id| session(id)).collect(),
        });
        cache
    }

    #[test]
    fn fresh_cache_is_served() {
        let cache = seeded(Duration::from_secs(10), &["ses_a"]);
        assert_eq!(cache.contains("ses_a"), Some(true));
        assert_eq!(cache.contains("ses_b"), Some(false));
    }

    #[test]
    fn expired_cache_reports_nothing() {
        let cache = seeded(Duration::ZERO, &["ses_a"]);
        assert_eq!(cache.contains("ses_a"), None);
    }

    #[test]
    fn evict_removes_single_session() {
        let cache = seeded(Duration::from_secs(10), &["ses_a", "ses_b"]);
        cache.evict_session("ses_a");
        assert_eq!(cache.contains("ses_a"), Some(false));
        assert_eq!(cache.contains("ses_b"), Some(true));
    }

    #[test]
    fn invalidate_clears_cache() {
        let cache = seeded(Duration::from_secs(10), &["ses_a"]);
        cache.invalidate();
        assert_eq!(cache.contains("ses_a"), None);
    }
}
