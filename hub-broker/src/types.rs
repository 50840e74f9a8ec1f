use std::collections::BTreeSet;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Milliseconds since the Unix epoch, the timestamp unit used on disk.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Message category. Only `completion` messages can close a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Task,
    Question,
    Context,
    Completion,
    Error,
}

impl MessageType {
    pub fn label(self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Question => "question",
            Self::Context => "context",
            Self::Completion => "completion",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    Low,
    #[default]
    Normal,
    High,
    Urgent,
}

impl MessagePriority {
    pub fn label(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
            Self::Urgent => "urgent",
        }
    }
}

/// A spool message file. Producers write these into `messages/`; the daemon
/// annotates and moves them into `messages/archive/` once processed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    pub content: String,
    #[serde(default)]
    pub priority: MessagePriority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub timestamp: i64,

    // Archival annotations, absent until the daemon disposes of the file.
    #[serde(default, skip_serializing_if = "is_false")]
    pub rate_limited: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit_reason: Option<String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub expired: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub undeliverable: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub inject_failed: bool,
}

fn is_false(v: &bool) -> bool {
    !v
}

impl Message {
    pub fn new(from: &str, to: &str, kind: MessageType, content: &str) -> Self {
        Self {
            from: from.to_string(),
            to: to.to_string(),
            kind,
            content: content.to_string(),
            priority: MessagePriority::Normal,
            thread_id: None,
            timestamp: now_ms(),
            rate_limited: false,
            rate_limit_reason: None,
            expired: false,
            undeliverable: false,
            inject_failed: false,
        }
    }

    /// Age relative to the message's own timestamp field.
    pub fn age_ms(&self, now: i64) -> i64 {
        now - self.timestamp
    }
}

/// One session as reported by the relay's `GET /session`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<SessionTime>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionTime {
    #[serde(default)]
    pub created: i64,
}

impl SessionInfo {
    /// Human name of the session: slug preferred, relay title as fallback.
    pub fn name(&self) -> Option<&str> {
        self.slug
            .as_deref()
            .filter(|s| !s.is_empty())
            .or_else(|| self.title.as_deref().filter(|s| !s.is_empty()))
    }
}

/// Persisted agent identity, one file per agent under `agents/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub agent_id: String,
    #[serde(default)]
    pub session_id: String,
    #[serde(default)]
    pub directory: String,
    pub created_at: i64,
    pub last_seen_at: i64,
}

/// Thread record, one file per thread under `threads/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadRecord {
    pub thread_id: String,
    pub participants: BTreeSet<String>,
    pub opened_at: i64,
    pub last_activity_at: i64,
    #[serde(default)]
    pub closed: bool,
}

/// A message file queued for delivery.
#[derive(Debug, Clone)]
pub struct DeliveryTask {
    pub path: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_round_trips_camel_case() {
        let json = r#"{
            "from": "alice",
            "to": "bob",
            "type": "task",
            "content": "ship it",
            "threadId": "t-42",
            "timestamp": 1000
        }"#;
        let msg: Message = serde_json::from_str(json).unwrap();
        assert_eq!(msg.from, "alice");
        assert_eq!(msg.kind, MessageType::Task);
        assert_eq!(msg.priority, MessagePriority::Normal);
        assert_eq!(msg.thread_id.as_deref(), Some("t-42"));

        let out = serde_json::to_string(&msg).unwrap();
        assert!(out.contains("\"threadId\""));
        assert!(!out.contains("rateLimited"), "clean messages carry no annotations");
    }

    #[test]
    fn message_missing_required_field_fails() {
        let json = r#"{"from": "alice", "type": "task", "content": "x", "timestamp": 1}"#;
        assert!(serde_json::from_str::<Message>(json).is_err());
    }

    #[test]
    fn annotations_serialize_when_set() {
        let mut msg = Message::new("a", "b", MessageType::Task, "x");
        msg.rate_limited = true;
        msg.rate_limit_reason = Some("cooldown".into());
        let out = serde_json::to_string(&msg).unwrap();
        assert!(out.contains("\"rateLimited\":true"));
        assert!(out.contains("\"rateLimitReason\""));
    }

    #[test]
    fn session_name_prefers_slug_over_title() {
        let s: SessionInfo = serde_json::from_str(
            r#"{"id":"ses_1","slug":"cosmic-panda","title":"Fix auth bug"}"#,
        )
        .unwrap();
        assert_eq!(s.name(), Some("cosmic-panda"));

        let s: SessionInfo =
            serde_json::from_str(r#"{"id":"ses_2","title":"Fix auth bug"}"#).unwrap();
        assert_eq!(s.name(), Some("Fix auth bug"));

        let s: SessionInfo = serde_json::from_str(r#"{"id":"ses_3","slug":""}"#).unwrap();
        assert_eq!(s.name(), None);
    }

    #[test]
    fn session_time_is_optional() {
        let s: SessionInfo =
            serde_json::from_str(r#"{"id":"ses_4","time":{"created":1234}}"#).unwrap();
        assert_eq!(s.time.unwrap().created, 1234);
    }
}
