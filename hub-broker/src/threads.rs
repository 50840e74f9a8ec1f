//! Thread tracking: one JSON file per thread under `threads/`.
//!
//! Threads are created implicitly by the first message that mentions them,
//! touched on every delivery, and closed when a `completion` message
//! carries the literal token `RESOLVED`.

use std::collections::HashMap;
use std::path::PathBuf;

use parking_lot::Mutex;

use crate::paths::write_atomic;
use crate::types::{now_ms, Message, MessageType, ThreadRecord};

pub struct ThreadTracker {
    dir: PathBuf,
    index: Mutex<HashMap<String, ThreadRecord>>,
}

impl ThreadTracker {
    /// Load existing thread records from the threads directory.
    pub fn load(dir: PathBuf) -> std::io::Result<Self> {
        let mut index = HashMap::new();
        if dir.is_dir() {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().is_none_or(|e| e != "json") {
                    continue;
                }
                match std::fs::read_to_string(&path)
                    .map_err(|e| e.to_string())
                    .and_then(|t| {
                        serde_json::from_str::<ThreadRecord>(&t).map_err(|e| e.to_string())
                    }) {
                    Ok(record) => {
                        index.insert(record.thread_id.clone(), record);
                    }
                    Err(error) => {
                        tracing::warn!(path = %path.display(), %error, "skipping unreadable thread file");
                    }
                }
            }
        }
        Ok(Self {
            dir,
            index: Mutex::new(index),
        })
    }

    /// Return the message's thread id, generating one when absent.
    /// Generated ids are derived from the sender/recipient pair with a
    /// short random suffix so concurrent pairs never collide.
    pub fn ensure_thread_id(&self, msg: &Message) -> String {
        if let Some(id) = msg.thread_id.as_deref().filter(|id| !id.is_empty()) {
            return id.to_string();
        }
        let suffix = &uuid::Uuid::new_v4().simple().to_string()[..4];
        format!("t-{}-{}-{}", msg.from, msg.to, suffix)
    }

    /// Record a delivered message against its thread: create the record on
    /// first sight, union participants, bump the activity timestamp.
    /// Idempotent for replays.
    pub fn record_message(&self, thread_id: &str, msg: &Message) -> std::io::Result<()> {
        let now = now_ms();
        let record = {
            let mut index = self.index.lock();
            let record = index
                .entry(thread_id.to_string())
                .or_insert_with(|| ThreadRecord {
                    thread_id: thread_id.to_string(),
                    participants: Default::default(),
                    opened_at: now,
                    last_activity_at: now,
                    closed: false,
                });
            record.participants.insert(msg.from.clone());
            record.participants.insert(msg.to.clone());
            record.last_activity_at = now;
            record.clone()
        };
        self.persist(&record)
    }

    /// Close the thread if this message resolves it. Returns whether the
    /// thread was closed by this call. Closed threads stay on disk until
    /// GC ages them out; later messages still deliver into them.
    pub fn maybe_close(&self, thread_id: &str, msg: &Message) -> std::io::Result<bool> {
        if msg.kind != MessageType::Completion || !contains_resolved_token(&msg.content) {
            return Ok(false);
        }
        let record = {
            let mut index = self.index.lock();
            match index.get_mut(thread_id) {
                Some(record) if !record.closed => {
                    record.closed = true;
                    record.last_activity_at = now_ms();
                    record.clone()
                }
                _ => return Ok(false),
            }
        };
        tracing::info!(thread = thread_id, by = %msg.from, "thread resolved");
        self.persist(&record)?;
        Ok(true)
    }

    pub fn get(&self, thread_id: &str) -> Option<ThreadRecord> {
        self.index.lock().get(thread_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<ThreadRecord> {
        self.index.lock().values().cloned().collect()
    }

    /// Delete a thread record and its file (GC).
    pub fn remove(&self, thread_id: &str) {
        self.index.lock().remove(thread_id);
        let path = self.dir.join(format!("{thread_id}.json"));
        if let Err(error) = std::fs::remove_file(&path) {
            if error.kind() != std::io::ErrorKind::NotFound {
                tracing::warn!(thread = thread_id, %error, "failed removing thread file");
            }
        }
    }

    fn persist(&self, record: &ThreadRecord) -> std::io::Result<()> {
        let path = self.dir.join(format!("{}.json", record.thread_id));
        write_atomic(&path, &serde_json::to_vec_pretty(record)?)
    }
}

/// Token-bounded, case-sensitive check for the literal `RESOLVED`:
/// the match must be delimited by the string edges or non-alphanumeric
/// characters, so `done — RESOLVED` and `RESOLVED: shipped` match while
/// `UNRESOLVED` does not.
pub fn contains_resolved_token(content: &str) -> bool {
    const TOKEN: &str = "RESOLVED";
    let bytes = content.as_bytes();
    let mut search_from = 0;
    while let Some(offset) = content[search_from..].find(TOKEN) {
        let start = search_from + offset;
        let end = start + TOKEN.len();
        let left_ok = start == 0 || !bytes[start - 1].is_ascii_alphanumeric();
        let right_ok = end == bytes.len() || !bytes[end].is_ascii_alphanumeric();
        if left_ok && right_ok {
            return true;
        }
        search_from = start + 1;
    }
    false
}
