//! The spool directory treated as a durable queue.
//!
//! Producers stage message files under dot-prefixed names and rename them
//! into `messages/`; the daemon's only commit primitive is the atomic
//! rename into `messages/archive/`. A processed file is in exactly one of
//! the two directories, never both.

use std::io;
use std::path::{Path, PathBuf};

use crate::paths::write_atomic;
use crate::types::Message;

/// Terminal disposition recorded on the archived file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Injected successfully; archived as-is.
    Delivered,
    RateLimited { reason: String },
    Expired,
    Undeliverable,
    InjectFailed,
}

/// Whether the watcher/scanner should consider this path a spool message.
pub fn is_message_file(path: &Path) -> bool {
    if path.extension().is_none_or(|e| e != "json") {
        return false;
    }
    match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => !name.starts_with('.'),
        None => false,
    }
}

/// List candidate message files currently in the spool (startup recovery).
pub fn scan(messages_dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(messages_dir)? {
        let path = entry?.path();
        if path.is_file() && is_message_file(&path) {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

pub fn read_message(path: &Path) -> Result<Message, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    serde_json::from_str(&text).map_err(|e| e.to_string())
}

/// Annotate the message per its disposition and move the file into the
/// archive atomically. The annotated body is written back to the original
/// path first so the rename itself stays the single commit point.
pub fn archive(
    path: &Path,
    archive_dir: &Path,
    mut msg: Message,
    disposition: Disposition,
) -> io::Result<PathBuf> {
    match &disposition {
        Disposition::Delivered => {}
        Disposition::RateLimited { reason } => {
            msg.rate_limited = true;
            msg.rate_limit_reason = Some(reason.clone());
        }
        Disposition::Expired => msg.expired = true,
        Disposition::Undeliverable => msg.undeliverable = true,
        Disposition::InjectFailed => msg.inject_failed = true,
    }
    write_atomic(path, &serde_json::to_vec_pretty(&msg)?)?;
    rename_into_archive(path, archive_dir)
}

/// Move an unparseable file into the archive and drop a `.error` sidecar
/// beside it explaining why.
pub fn archive_error(path: &Path, archive_dir: &Path, error: &str) -> io::Result<PathBuf> {
    let dest = rename_into_archive(path, archive_dir)?;
    let sidecar = dest.with_extension("json.error");
    write_atomic(&sidecar, error.as_bytes())?;
    Ok(dest)
}

fn rename_into_archive(path: &Path, archive_dir: &Path) -> io::Result<PathBuf> {
    let name = path
        .file_name()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "path has no file name"))?;
    let dest = archive_dir.join(name);
    std::fs::rename(path, &dest)?;
    Ok(dest)
}
