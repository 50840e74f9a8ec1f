//! Prompt text composed by the daemon.
//!
//! Two shapes: the one-time orientation block injected into a newly
//! registered session, and the envelope wrapped around every delivered
//! message. Both are deterministic plain text so agents can parse them
//! reliably and tests can assert on them.

use crate::types::{AgentRecord, Message};

/// How many other agents the orientation lists before truncating.
const ORIENTATION_AGENT_CAP: usize = 8;

/// Orientation block for a freshly registered session.
pub fn orientation(agent: &AgentRecord, other_agents: &[String]) -> String {
    let mut out = String::new();
    out.push_str("AGENT HUB - CONNECTED\n");
    out.push_str(&format!("You are: {}\n", agent.agent_id));
    if !agent.directory.is_empty() {
        out.push_str(&format!("Directory: {}\n", agent.directory));
    }

    if !other_agents.is_empty() {
        let shown: Vec<&str> = other_agents
            .iter()
            .take(ORIENTATION_AGENT_CAP)
            .map(String::as_str)
            .collect();
        let mut line = shown.join(", ");
        if other_agents.len() > ORIENTATION_AGENT_CAP {
            line.push_str(&format!(" (+{} more)", other_agents.len() - ORIENTATION_AGENT_CAP));
        }
        out.push_str(&format!("Other agents: {line}\n"));
    }

    out.push('\n');
    out.push_str("Message types: task, question, context, completion, error.\n");
    out.push_str("Send messages with the agent-hub send_message tool; set from to your\n");
    out.push_str("agent id and to to the recipient. Keep messages to 1-2 sentences.\n");
    out.push_str("No action is required right now.\n");
    out
}

/// Envelope wrapped around a delivered message. States sender, type,
/// priority and thread, carries the full content, and closes with terse
/// reply instructions.
pub fn envelope(msg: &Message, recipient: &str, thread_id: &str) -> String {
    let mut out = String::new();
    out.push_str("AGENT HUB MESSAGE\n");
    out.push_str(&format!("From: {}\n", msg.from));
    out.push_str(&format!(
        "Type: {} (priority: {})\n",
        msg.kind.label(),
        msg.priority.label()
    ));
    out.push_str(&format!("Thread: {thread_id}\n"));
    out.push('\n');
    out.push_str(&msg.content);
    out.push('\n');
    out.push('\n');
    out.push_str(&format!(
        "Reply with agent-hub send_message: from \"{recipient}\", to \"{}\", threadId \"{thread_id}\".\n",
        msg.from
    ));
    out.push_str("To close the thread, send a completion containing RESOLVED.\n");
    out
}

/// Body of the NEW_AGENT notification delivered to the coordinator.
pub fn new_agent_notification(agent_id: &str, directory: &str) -> String {
    format!("NEW_AGENT: {agent_id} at {directory}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{now_ms, MessagePriority, MessageType};

    fn agent(id: &str) -> AgentRecord {
        AgentRecord {
            agent_id: id.to_string(),
            session_id: "ses_1".to_string(),
            directory: "/work/project".to_string(),
            created_at: now_ms(),
            last_seen_at: now_ms(),
        }
    }

    #[test]
    fn orientation_states_identity() {
        let text = orientation(&agent("cosmic-panda"), &[]);
        assert!(text.contains("You are: cosmic-panda"));
        assert!(text.contains("Directory: /work/project"));
        assert!(text.contains("task, question, context, completion, error"));
        assert!(!text.contains("Other agents"));
    }

    #[test]
    fn orientation_caps_agent_list() {
        let others: Vec<String> = (0..11).map(|i| format!("agent-{i}")).collect();
        let text = orientation(&agent("me"), &others);
        assert!(text.contains("agent-0"));
        assert!(text.contains("agent-7"));
        assert!(!text.contains("agent-8,"));
        assert!(text.contains("(+3 more)"));
    }

    #[test]
    fn envelope_is_deterministic() {
        let mut msg = Message::new("alice", "bob", MessageType::Task, "ship it");
        msg.priority = MessagePriority::Urgent;
        msg.timestamp = 1000;

        let a = envelope(&msg, "bob", "t-42");
        let b = envelope(&msg, "bob", "t-42");
        assert_eq!(a, b);

        assert!(a.contains("From: alice"));
        assert!(a.contains("Type: task (priority: urgent)"));
        assert!(a.contains("Thread: t-42"));
        assert!(a.contains("ship it"));
        assert!(a.contains("from \"bob\", to \"alice\", threadId \"t-42\""));
    }

    #[test]
    fn new_agent_notification_format() {
        assert_eq!(
            new_agent_notification("cosmic-panda", "/work/project"),
            "NEW_AGENT: cosmic-panda at /work/project"
        );
    }
}
