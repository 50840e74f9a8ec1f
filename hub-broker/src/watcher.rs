//! Spool directory watcher.
//!
//! A `notify` watcher on `messages/` forwards complete message files into
//! the delivery channel. The callback runs on notify's own thread and
//! does nothing but filter and forward; parsing happens in the workers.
//! Producers commit files by rename, so both create and rename-to events
//! count as arrivals.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::event::{CreateKind, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::metrics::Metrics;
use crate::spool;
use crate::types::DeliveryTask;

pub struct SpoolWatcher {
    // Dropping the watcher stops event delivery; held for lifetime only.
    _watcher: RecommendedWatcher,
}

impl SpoolWatcher {
    /// Watch `messages_dir` (non-recursive, so `archive/` stays silent)
    /// and enqueue every arriving message file.
    pub fn start(
        messages_dir: &Path,
        tx: mpsc::Sender<DeliveryTask>,
        metrics: Metrics,
    ) -> notify::Result<Self> {
        let dir = messages_dir.to_path_buf();
        let mut watcher = notify::recommended_watcher(move |result: notify::Result<Event>| {
            let event = match result {
                Ok(event) => event,
                Err(error) => {
                    tracing::warn!(%error, "spool watch error");
                    return;
                }
            };
            if !is_arrival(&event.kind) {
                return;
            }
            for path in event.paths {
                if path.parent() == Some(dir.as_path()) && spool::is_message_file(&path) {
                    enqueue(&tx, &metrics, path);
                }
            }
        })?;
        watcher.watch(messages_dir, RecursiveMode::NonRecursive)?;
        Ok(Self { _watcher: watcher })
    }
}

fn is_arrival(kind: &EventKind) -> bool {
    // Rename-to covers producers committing staged files; platforms that
    // report a same-directory rename as one Both event carry the staging
    // path too, which the dot-prefix filter drops.
    matches!(
        kind,
        EventKind::Create(CreateKind::File | CreateKind::Any)
            | EventKind::Modify(ModifyKind::Name(
                RenameMode::To | RenameMode::Both | RenameMode::Any
            ))
    )
}

fn enqueue(tx: &mpsc::Sender<DeliveryTask>, metrics: &Metrics, path: PathBuf) {
    tracing::debug!(path = %path.display(), "message file detected");
    // Queue pressure is visible through the gauge; sends still succeed
    // (blocking briefly) rather than dropping files.
    match tx.blocking_send(DeliveryTask { path }) {
        Ok(()) => metrics.add_gauge("agent_hub_message_queue_size", 1.0),
        Err(_) => tracing::debug!("delivery channel closed, dropping watch event"),
    }
}

/// Enqueue message files already sitting in the spool (startup recovery
/// for files that arrived while the daemon was down).
pub async fn recover_spool(
    messages_dir: &Path,
    tx: &mpsc::Sender<DeliveryTask>,
    metrics: &Metrics,
) -> std::io::Result<usize> {
    let pending = spool::scan(messages_dir)?;
    let count = pending.len();
    for path in pending {
        if tx.send(DeliveryTask { path }).await.is_ok() {
            metrics.add_gauge("agent_hub_message_queue_size", 1.0);
        }
    }
    if count > 0 {
        tracing::info!(count, "recovered in-flight messages from spool");
    }
    Ok(count)
}

/// Convenience wrapper so callers can hold both halves with one Arc.
pub type SharedReceiver = Arc<tokio::sync::Mutex<mpsc::Receiver<DeliveryTask>>>;

pub fn delivery_channel(capacity: usize) -> (mpsc::Sender<DeliveryTask>, SharedReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    (tx, Arc::new(tokio::sync::Mutex::new(rx)))
}
