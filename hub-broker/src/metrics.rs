//! Metrics collection for the daemon.
//!
//! Counters and gauges accumulate in memory and are rendered to a
//! Prometheus text exposition file on an interval, plus a one-line
//! human summary for the log.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

/// Why a message failed processing; becomes the `reason` label on
/// `agent_hub_messages_failed_total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum FailReason {
    Parse,
    Rate,
    Expired,
    Undeliverable,
    Inject,
}

impl FailReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Parse => "parse",
            Self::Rate => "rate",
            Self::Expired => "expired",
            Self::Undeliverable => "undeliverable",
            Self::Inject => "inject",
        }
    }
}

const COUNTERS: &[(&str, &str)] = &[
    ("agent_hub_messages_total", "Total messages processed successfully"),
    ("agent_hub_injections_total", "Total message injections sent to sessions"),
    ("agent_hub_injections_failed_total", "Total injection failures after retries"),
    ("agent_hub_injections_retried_total", "Total injection retry attempts"),
    ("agent_hub_sessions_oriented_total", "Total sessions that received orientation"),
    ("agent_hub_agents_auto_created_total", "Total agents auto-created from sessions"),
    ("agent_hub_cache_hits_total", "Total session cache hits"),
    ("agent_hub_cache_misses_total", "Total session cache misses"),
    ("agent_hub_gc_runs_total", "Total garbage collection runs"),
    ("agent_hub_gc_messages_archived_total", "Total expired messages archived by GC"),
    ("agent_hub_gc_agents_cleaned_total", "Total stale agents cleaned by GC"),
    ("agent_hub_gc_sessions_cleaned_total", "Total stale session mappings cleaned by GC"),
    ("agent_hub_gc_threads_cleaned_total", "Total stale threads cleaned by GC"),
];

const GAUGES: &[(&str, &str)] = &[
    ("agent_hub_active_agents", "Current number of registered agents"),
    ("agent_hub_oriented_sessions", "Current number of oriented sessions"),
    ("agent_hub_message_queue_size", "Current delivery queue depth"),
];

const FAILED_TOTAL: &str = "agent_hub_messages_failed_total";
const FAILED_HELP: &str = "Total messages that failed processing, by reason";

struct Inner {
    start_epoch_secs: f64,
    started: Instant,
    counters: Mutex<BTreeMap<&'static str, u64>>,
    failed: Mutex<BTreeMap<&'static str, u64>>,
    gauges: Mutex<BTreeMap<&'static str, f64>>,
}

/// Cloneable handle to the shared metrics registry.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<Inner>,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                start_epoch_secs: chrono::Utc::now().timestamp_millis() as f64 / 1000.0,
                started: Instant::now(),
                counters: Mutex::new(COUNTERS.iter().map(|(n, _)| (*n, 0)).collect()),
                failed: Mutex::new(BTreeMap::new()),
                gauges: Mutex::new(GAUGES.iter().map(|(n, _)| (*n, 0.0)).collect()),
            }),
        }
    }

    pub fn inc(&self, name: &'static str) {
        self.inc_by(name, 1);
    }

    pub fn inc_by(&self, name: &'static str, delta: u64) {
        let mut counters = self.inner.counters.lock();
        if let Some(slot) = counters.get_mut(name) {
            *slot += delta;
        } else {
            debug_assert!(false, "unknown counter {name}");
        }
    }

    pub fn fail(&self, reason: FailReason) {
        *self.inner.failed.lock().entry(reason.as_str()).or_insert(0) += 1;
    }

    pub fn set_gauge(&self, name: &'static str, value: f64) {
        self.inner.gauges.lock().insert(name, value);
    }

    pub fn add_gauge(&self, name: &'static str, delta: f64) {
        *self.inner.gauges.lock().entry(name).or_insert(0.0) += delta;
    }

    pub fn get(&self, name: &str) -> u64 {
        self.inner.counters.lock().get(name).copied().unwrap_or(0)
    }

    pub fn get_failed(&self, reason: FailReason) -> u64 {
        self.inner
            .failed
            .lock()
            .get(reason.as_str())
            .copied()
            .unwrap_or(0)
    }

    pub fn get_gauge(&self, name: &str) -> f64 {
        self.inner.gauges.lock().get(name).copied().unwrap_or(0.0)
    }

    /// Render the Prometheus text exposition format.
    pub fn render(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP agent_hub_start_time_seconds Unix timestamp when daemon started\n");
        out.push_str("# TYPE agent_hub_start_time_seconds gauge\n");
        out.push_str(&format!(
            "agent_hub_start_time_seconds {}\n",
            self.inner.start_epoch_secs
        ));

        let counters = self.inner.counters.lock();
        for (name, help) in COUNTERS {
            let value = counters.get(name).copied().unwrap_or(0);
            out.push_str(&format!("# HELP {name} {help}\n"));
            out.push_str(&format!("# TYPE {name} counter\n"));
            out.push_str(&format!("{name} {value}\n"));
        }
        drop(counters);

        out.push_str(&format!("# HELP {FAILED_TOTAL} {FAILED_HELP}\n"));
        out.push_str(&format!("# TYPE {FAILED_TOTAL} counter\n"));
        let failed = self.inner.failed.lock();
        if failed.is_empty() {
            out.push_str(&format!("{FAILED_TOTAL} 0\n"));
        } else {
            for (reason, value) in failed.iter() {
                out.push_str(&format!("{FAILED_TOTAL}{{reason=\"{reason}\"}} {value}\n"));
            }
        }
        drop(failed);

        let gauges = self.inner.gauges.lock();
        for (name, help) in GAUGES {
            let value = gauges.get(name).copied().unwrap_or(0.0);
            out.push_str(&format!("# HELP {name} {help}\n"));
            out.push_str(&format!("# TYPE {name} gauge\n"));
            out.push_str(&format!("{name} {value}\n"));
        }

        out
    }

    /// One-line human summary for the periodic log.
    pub fn log_summary(&self) -> String {
        let uptime = self.inner.started.elapsed().as_secs();
        let (h, rem) = (uptime / 3600, uptime % 3600);
        let (m, s) = (rem / 60, rem % 60);
        let uptime_str = if h > 0 {
            format!("{h}h{m}m{s}s")
        } else if m > 0 {
            format!("{m}m{s}s")
        } else {
            format!("{s}s")
        };

        let failed: u64 = self.inner.failed.lock().values().sum();
        format!(
            "uptime={} msgs={}/{} inj={}/{} orient={} cache={}/{} gc={}",
            uptime_str,
            self.get("agent_hub_messages_total"),
            failed,
            self.get("agent_hub_injections_total"),
            self.get("agent_hub_injections_failed_total"),
            self.get("agent_hub_sessions_oriented_total"),
            self.get("agent_hub_cache_hits_total"),
            self.get("agent_hub_cache_misses_total"),
            self.get("agent_hub_gc_runs_total"),
        )
    }
}
