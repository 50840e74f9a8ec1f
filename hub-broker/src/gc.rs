//! Periodic garbage collection.
//!
//! Works entirely off the state store and the spool: expired messages are
//! archived, stale agents and orphaned session mappings removed, and aged
//! thread files deleted. "Currently known" means the poller-maintained
//! session table, so a flapping relay never causes a purge.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::metrics::Metrics;
use crate::paths::HubPaths;
use crate::spool::{self, Disposition};
use crate::store::StateStore;
use crate::threads::ThreadTracker;
use crate::types::now_ms;

pub struct GcRunner {
    store: Arc<StateStore>,
    threads: Arc<ThreadTracker>,
    paths: HubPaths,
    metrics: Metrics,
    message_ttl_ms: i64,
    agent_stale_ms: i64,
    interval: Duration,
}

impl GcRunner {
    pub fn new(
        store: Arc<StateStore>,
        threads: Arc<ThreadTracker>,
        paths: HubPaths,
        metrics: Metrics,
        message_ttl_seconds: u64,
        agent_stale_seconds: u64,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            threads,
            paths,
            metrics,
            message_ttl_ms: message_ttl_seconds as i64 * 1000,
            agent_stale_ms: agent_stale_seconds as i64 * 1000,
            interval,
        }
    }

    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.run_once();
            if let Err(error) = self.store.flush() {
                tracing::warn!(%error, "state snapshot flush failed");
            }
        }
    }

    /// One GC pass. Synchronous on purpose: everything it reads is local.
    pub fn run_once(&self) {
        let now = now_ms();

        let archived = self.archive_expired_messages(now);
        let agents_cleaned = self.remove_stale_agents(now);
        let mappings_cleaned = self.remove_orphan_mappings();
        let threads_cleaned = self.remove_stale_threads(now);

        self.metrics.inc("agent_hub_gc_runs_total");
        self.metrics
            .inc_by("agent_hub_gc_messages_archived_total", archived);
        self.metrics
            .inc_by("agent_hub_gc_agents_cleaned_total", agents_cleaned);
        self.metrics
            .inc_by("agent_hub_gc_sessions_cleaned_total", mappings_cleaned);
        self.metrics
            .inc_by("agent_hub_gc_threads_cleaned_total", threads_cleaned);
        self.metrics
            .set_gauge("agent_hub_active_agents", self.store.agent_count() as f64);

        if archived + agents_cleaned + mappings_cleaned + threads_cleaned > 0 {
            tracing::info!(
                archived,
                agents_cleaned,
                mappings_cleaned,
                threads_cleaned,
                "gc pass complete"
            );
        }
    }

    /// Archive spool messages whose own timestamp exceeds the TTL.
    /// Unreadable files are left for the workers' parse handling.
    fn archive_expired_messages(&self, now: i64) -> u64 {
        let pending = match spool::scan(&self.paths.messages) {
            Ok(pending) => pending,
            Err(error) => {
                tracing::warn!(%error, "gc could not scan spool");
                return 0;
            }
        };

        let mut archived = 0;
        for path in pending {
            let Ok(msg) = spool::read_message(&path) else {
                continue;
            };
            if msg.age_ms(now) > self.message_ttl_ms {
                match spool::archive(&path, &self.paths.archive, msg, Disposition::Expired) {
                    Ok(_) => archived += 1,
                    Err(error) => {
                        tracing::warn!(path = %path.display(), %error, "gc failed archiving message");
                    }
                }
            }
        }
        archived
    }

    fn remove_stale_agents(&self, now: i64) -> u64 {
        let mut cleaned = 0;
        for agent in self.store.agents_snapshot() {
            let stale = now - agent.last_seen_at > self.agent_stale_ms;
            let session_known =
                !agent.session_id.is_empty() && self.store.session_known(&agent.session_id);
            if stale && !session_known {
                let age_min = (now - agent.last_seen_at) / 60_000;
                tracing::info!(agent = %agent.agent_id, age_min, "removing stale agent");
                self.store.remove_agent(&agent.agent_id);
                cleaned += 1;
            }
        }
        cleaned
    }

    /// Drop session-map entries whose session is gone and whose agent
    /// record no longer exists.
    fn remove_orphan_mappings(&self) -> u64 {
        let mut cleaned = 0;
        for (session_id, agent_id) in self.store.session_agents_snapshot() {
            if !self.store.session_known(&session_id) && self.store.agent(&agent_id).is_none() {
                if let Err(error) = self.store.unmap_session(&session_id) {
                    tracing::warn!(session = %session_id, %error, "failed removing session mapping");
                } else {
                    cleaned += 1;
                }
            }
        }
        cleaned
    }

    fn remove_stale_threads(&self, now: i64) -> u64 {
        let mut cleaned = 0;
        for thread in self.threads.snapshot() {
            if now - thread.last_activity_at > self.message_ttl_ms {
                tracing::debug!(thread = %thread.thread_id, closed = thread.closed, "removing aged thread");
                self.threads.remove(&thread.thread_id);
                cleaned += 1;
            }
        }
        cleaned
    }
}
