//! Startup preflight: the relay host must have the agent-hub MCP
//! configured, otherwise agents have no tools to send messages with and
//! the whole hub is inert. Absence is fatal with a dedicated exit code.

use std::path::{Path, PathBuf};

use serde_json::Value;

pub fn relay_host_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("opencode")
        .join("opencode.json")
}

/// Check that the relay host config declares an `agent-hub` MCP entry
/// (under either the `mcp` or `mcpServers` key).
pub fn check_agent_hub_mcp(config_path: &Path) -> Result<(), String> {
    let text = std::fs::read_to_string(config_path).map_err(|_| {
        format!(
            "relay host config not found at {}",
            config_path.display()
        )
    })?;
    let value: Value = serde_json::from_str(&text)
        .map_err(|e| format!("relay host config is not valid JSON: {e}"))?;

    let present = ["mcp", "mcpServers"]
        .iter()
        .any(|key| value.get(key).and_then(|m| m.get("agent-hub")).is_some());
    if present {
        Ok(())
    } else {
        Err("agent-hub MCP is not configured in the relay host config".to_string())
    }
}

pub const GUIDANCE: &str = "\
The agent-hub MCP server is missing from the relay host configuration.\n\
Add an \"agent-hub\" entry under \"mcp\" in your opencode.json so sessions\n\
get the send_message tool, then restart the daemon.";

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(contents: &str) -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("opencode.json");
        std::fs::write(&path, contents).unwrap();
        (tmp, path)
    }

    #[test]
    fn accepts_mcp_entry() {
        let (_tmp, path) = write_config(r#"{"mcp": {"agent-hub": {"command": "agent-hub-mcp"}}}"#);
        assert!(check_agent_hub_mcp(&path).is_ok());
    }

    #[test]
    fn accepts_mcp_servers_entry() {
        let (_tmp, path) =
            write_config(r#"{"mcpServers": {"agent-hub": {"command": "agent-hub-mcp"}}}"#);
        assert!(check_agent_hub_mcp(&path).is_ok());
    }

    #[test]
    fn rejects_missing_entry() {
        let (_tmp, path) = write_config(r#"{"mcp": {"other-server": {}}}"#);
        assert!(check_agent_hub_mcp(&path).is_err());
    }

    #[test]
    fn rejects_missing_file() {
        let tmp = tempfile::tempdir().unwrap();
        let err = check_agent_hub_mcp(&tmp.path().join("nope.json")).unwrap_err();
        assert!(err.contains("not found"));
    }

    #[test]
    fn rejects_invalid_json() {
        let (_tmp, path) = write_config("{broken");
        let err = check_agent_hub_mcp(&path).unwrap_err();
        assert!(err.contains("not valid JSON"));
    }
}
