//! Injection worker pool.
//!
//! Workers consume delivery tasks from a shared channel and walk each
//! message through the delivery state machine: rate gate, TTL check,
//! recipient resolution, envelope composition, injection with retries,
//! then thread bookkeeping and archiving. Acknowledgement comes before the
//! archive rename, so a crash between the two can only produce a
//! duplicate, never a loss.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;

use crate::metrics::{FailReason, Metrics};
use crate::prompt;
use crate::ratelimit::RateLimiter;
use crate::relay::RelayClient;
use crate::session_cache::SessionCache;
use crate::spool::{self, Disposition};
use crate::store::StateStore;
use crate::threads::ThreadTracker;
use crate::types::{now_ms, DeliveryTask, Message};

/// Everything a worker needs, bundled so the pool shares one set of Arcs.
pub struct DeliveryContext {
    pub relay: Arc<RelayClient>,
    pub cache: Arc<SessionCache>,
    pub store: Arc<StateStore>,
    pub threads: Arc<ThreadTracker>,
    pub limiter: Arc<RateLimiter>,
    pub metrics: Metrics,
    pub archive_dir: PathBuf,
    pub message_ttl_ms: i64,
    pub retries: u32,
    pub backoff_base: Duration,
}

/// Exponential backoff with ±20% jitter: `base * 2^attempt`, jittered.
pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    let exp = base.as_millis() as f64 * 2f64.powi(attempt as i32);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    Duration::from_millis((exp * jitter) as u64)
}

/// Worker loop. The receiver is shared: whichever worker holds the lock
/// takes the next task, releases, and processes while another worker
/// waits. Exits when the channel is closed and drained.
pub async fn run_worker(
    ctx: Arc<DeliveryContext>,
    rx: Arc<AsyncMutex<mpsc::Receiver<DeliveryTask>>>,
) {
    loop {
        let task = { rx.lock().await.recv().await };
        let Some(task) = task else {
            break;
        };
        ctx.metrics.add_gauge("agent_hub_message_queue_size", -1.0);
        process_task(&ctx, task).await;
    }
}

/// Run one delivery task to a terminal state. Task-scope failures are
/// archived and counted, never propagated.
pub async fn process_task(ctx: &DeliveryContext, task: DeliveryTask) {
    let path = task.path;
    if !path.exists() {
        // Raced with GC or a duplicate event; the file already reached
        // a terminal state.
        return;
    }

    let mut msg = match spool::read_message(&path) {
        Ok(msg) => msg,
        Err(error) => {
            tracing::warn!(path = %path.display(), %error, "unparseable message file");
            ctx.metrics.fail(FailReason::Parse);
            if let Err(error) = spool::archive_error(&path, &ctx.archive_dir, &error) {
                tracing::error!(path = %path.display(), %error, "failed archiving bad message");
            }
            return;
        }
    };

    if let Err(reason) = ctx.limiter.check_and_record(&msg.from) {
        tracing::warn!(from = %msg.from, %reason, "message rate limited");
        ctx.metrics.fail(FailReason::Rate);
        archive(ctx, &path, msg, Disposition::RateLimited { reason });
        return;
    }

    if msg.age_ms(now_ms()) > ctx.message_ttl_ms {
        tracing::info!(path = %path.display(), "message expired before delivery");
        ctx.metrics.fail(FailReason::Expired);
        archive(ctx, &path, msg, Disposition::Expired);
        return;
    }

    let thread_id = ctx.threads.ensure_thread_id(&msg);
    msg.thread_id = Some(thread_id.clone());

    let Some(mut session_id) = resolve_recipient(ctx, &msg.to).await else {
        tracing::warn!(to = %msg.to, "recipient unresolvable after retries");
        ctx.metrics.fail(FailReason::Undeliverable);
        archive(ctx, &path, msg, Disposition::Undeliverable);
        return;
    };

    let text = prompt::envelope(&msg, &msg.to, &thread_id);

    let mut attempt: u32 = 0;
    let mut retried_after_not_found = false;
    loop {
        match ctx.relay.inject(&session_id, &text).await {
            Ok(()) => break,
            Err(error) if error.is_not_found() => {
                ctx.cache.evict_session(&session_id);
                if retried_after_not_found {
                    tracing::warn!(to = %msg.to, session = %session_id, "session gone, undeliverable");
                    ctx.metrics.fail(FailReason::Undeliverable);
                    archive(ctx, &path, msg, Disposition::Undeliverable);
                    return;
                }
                retried_after_not_found = true;
                tokio::time::sleep(backoff_delay(ctx.backoff_base, 0)).await;
                match resolve_recipient_once(ctx, &msg.to).await {
                    Some(fresh) => session_id = fresh,
                    None => {
                        ctx.metrics.fail(FailReason::Undeliverable);
                        archive(ctx, &path, msg, Disposition::Undeliverable);
                        return;
                    }
                }
            }
            Err(error) => {
                if attempt >= ctx.retries {
                    tracing::error!(to = %msg.to, %error, "injection failed after retries");
                    ctx.metrics.inc("agent_hub_injections_failed_total");
                    ctx.metrics.fail(FailReason::Inject);
                    archive(ctx, &path, msg, Disposition::InjectFailed);
                    return;
                }
                ctx.metrics.inc("agent_hub_injections_retried_total");
                tokio::time::sleep(backoff_delay(ctx.backoff_base, attempt)).await;
                attempt += 1;
            }
        }
    }

    // Delivered: ack first, then commit via rename.
    ctx.metrics.inc("agent_hub_injections_total");
    ctx.metrics.inc("agent_hub_messages_total");
    if let Err(error) = ctx.threads.record_message(&thread_id, &msg) {
        tracing::warn!(thread = %thread_id, %error, "failed updating thread record");
    }
    if let Err(error) = ctx.threads.maybe_close(&thread_id, &msg) {
        tracing::warn!(thread = %thread_id, %error, "failed closing thread");
    }
    tracing::info!(from = %msg.from, to = %msg.to, thread = %thread_id, "message delivered");
    archive(ctx, &path, msg, Disposition::Delivered);
}

fn archive(ctx: &DeliveryContext, path: &std::path::Path, msg: Message, disposition: Disposition) {
    if let Err(error) = spool::archive(path, &ctx.archive_dir, msg, disposition) {
        tracing::error!(path = %path.display(), %error, "failed archiving message");
    }
}

/// Resolve the recipient's live session id, retrying with backoff up to
/// the configured retry budget.
async fn resolve_recipient(ctx: &DeliveryContext, to: &str) -> Option<String> {
    for attempt in 0..=ctx.retries {
        if let Some(session_id) = resolve_recipient_once(ctx, to).await {
            return Some(session_id);
        }
        if attempt < ctx.retries {
            tokio::time::sleep(backoff_delay(ctx.backoff_base, attempt)).await;
        }
    }
    None
}

/// One resolution pass: agent record (or session map) gives the session
/// id, which must be present in the session cache; a single
/// cache-refreshing list call covers the miss.
async fn resolve_recipient_once(ctx: &DeliveryContext, to: &str) -> Option<String> {
    let session_id = ctx
        .store
        .agent(to)
        .map(|a| a.session_id)
        .filter(|s| !s.is_empty())
        .or_else(|| ctx.store.session_for_agent(to))?;

    match ctx.cache.contains(&session_id) {
        Some(true) => Some(session_id),
        _ => {
            let sessions = ctx.cache.refresh(&ctx.relay).await.ok()?;
            sessions
                .iter()
                .any(|s| s.id == session_id)
                .then_some(session_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt_with_jitter() {
        let base = Duration::from_secs(5);
        for attempt in 0..3 {
            let d = backoff_delay(base, attempt).as_millis() as f64;
            let nominal = 5000.0 * 2f64.powi(attempt as i32);
            assert!(d >= nominal * 0.8 - 1.0, "attempt {attempt}: {d} too small");
            assert!(d <= nominal * 1.2 + 1.0, "attempt {attempt}: {d} too large");
        }
    }

    #[test]
    fn backoff_zero_base_stays_zero() {
        assert_eq!(backoff_delay(Duration::ZERO, 3), Duration::ZERO);
    }
}
