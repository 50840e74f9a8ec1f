//! Daemon configuration.
//!
//! Every tunable resolves in the same order: environment variable, then
//! config file value, then built-in default. The config file is JSON at
//! `~/.config/agent-hub-daemon/config.json` (or `$AGENT_HUB_CONFIG`).

use std::path::PathBuf;
use std::time::Duration;

use serde_json::Value;

use crate::paths::HubPaths;

const CONFIG_DIR_NAME: &str = "agent-hub-daemon";

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_messages: usize,
    pub window_seconds: u64,
    pub cooldown_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub enabled: bool,
    pub model: String,
    pub directory: PathBuf,
    /// Explicit instructions file; highest-priority template source.
    pub instructions: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    pub opencode_port: u16,
    pub log_level: String,
    pub hub_dir: PathBuf,
    pub message_ttl_seconds: u64,
    pub agent_stale_seconds: u64,
    pub gc_interval_seconds: u64,
    pub session_poll_seconds: u64,
    pub session_cache_ttl_seconds: u64,
    pub injection_workers: usize,
    pub injection_retries: u32,
    pub injection_timeout_seconds: u64,
    pub metrics_interval_seconds: u64,
    pub rate_limit: RateLimitConfig,
    pub coordinator: CoordinatorConfig,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self::from_sources(&Value::Null, |_| None)
    }
}

impl HubConfig {
    /// Load from the config file and process environment.
    pub fn load() -> Self {
        let file = read_config_file();
        Self::from_sources(&file, |key| std::env::var(key).ok())
    }

    /// Resolve every key against an explicit file value and env lookup.
    /// Split out so tests can drive both sources without touching the
    /// process environment.
    pub fn from_sources(file: &Value, env: impl Fn(&str) -> Option<String>) -> Self {
        let r = Resolver { file, env: &env };
        HubConfig {
            opencode_port: r.get("OPENCODE_PORT", &["opencode_port"], 4096u64) as u16,
            log_level: r.get_str("AGENT_HUB_DAEMON_LOG_LEVEL", &["log_level"], "info"),
            hub_dir: r
                .get_opt_str("AGENT_HUB_DIR", &["hub_dir"])
                .map(PathBuf::from)
                .unwrap_or_else(HubPaths::default_root),
            message_ttl_seconds: r.get("AGENT_HUB_MESSAGE_TTL", &["message_ttl_seconds"], 3600),
            agent_stale_seconds: r.get("AGENT_HUB_AGENT_STALE", &["agent_stale_seconds"], 3600),
            gc_interval_seconds: r.get("AGENT_HUB_GC_INTERVAL", &["gc_interval_seconds"], 60),
            session_poll_seconds: r.get("AGENT_HUB_SESSION_POLL", &["session_poll_seconds"], 5),
            session_cache_ttl_seconds: r.get(
                "AGENT_HUB_SESSION_CACHE_TTL",
                &["session_cache_ttl_seconds"],
                10,
            ),
            injection_workers: r.get("AGENT_HUB_INJECTION_WORKERS", &["injection_workers"], 4)
                as usize,
            injection_retries: r.get("AGENT_HUB_INJECTION_RETRIES", &["injection_retries"], 3)
                as u32,
            injection_timeout_seconds: r.get(
                "AGENT_HUB_INJECTION_TIMEOUT",
                &["injection_timeout_seconds"],
                5,
            ),
            metrics_interval_seconds: r.get(
                "AGENT_HUB_METRICS_INTERVAL",
                &["metrics_interval_seconds"],
                30,
            ),
            rate_limit: RateLimitConfig {
                enabled: r.get_bool("AGENT_HUB_RATE_LIMIT", &["rate_limit", "enabled"], false),
                max_messages: r.get(
                    "AGENT_HUB_RATE_LIMIT_MAX",
                    &["rate_limit", "max_messages"],
                    10,
                ) as usize,
                window_seconds: r.get(
                    "AGENT_HUB_RATE_LIMIT_WINDOW",
                    &["rate_limit", "window_seconds"],
                    300,
                ),
                cooldown_seconds: r.get(
                    "AGENT_HUB_RATE_LIMIT_COOLDOWN",
                    &["rate_limit", "cooldown_seconds"],
                    0,
                ),
            },
            coordinator: CoordinatorConfig {
                enabled: r.get_bool("AGENT_HUB_COORDINATOR", &["coordinator", "enabled"], false),
                model: r.get_str(
                    "AGENT_HUB_COORDINATOR_MODEL",
                    &["coordinator", "model"],
                    "anthropic/claude-haiku-4-5",
                ),
                directory: r
                    .get_opt_str("AGENT_HUB_COORDINATOR_DIR", &["coordinator", "directory"])
                    .map(PathBuf::from)
                    .unwrap_or_else(default_coordinator_dir),
                instructions: r
                    .get_opt_str(
                        "AGENT_HUB_COORDINATOR_INSTRUCTIONS",
                        &["coordinator", "instructions"],
                    )
                    .map(PathBuf::from),
            },
        }
    }

    pub fn relay_base_url(&self) -> String {
        format!("http://localhost:{}", self.opencode_port)
    }

    pub fn injection_timeout(&self) -> Duration {
        Duration::from_secs(self.injection_timeout_seconds)
    }

    /// Bounded grace period for draining in-flight deliveries at shutdown.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.injection_timeout_seconds * u64::from(self.injection_retries))
    }
}

/// User config directory: `~/.config/agent-hub-daemon`.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
}

fn default_coordinator_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(CONFIG_DIR_NAME)
        .join("coordinator")
}

fn read_config_file() -> Value {
    let path = std::env::var("AGENT_HUB_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| config_dir().join("config.json"));
    match std::fs::read_to_string(&path) {
        Ok(text) => match serde_json::from_str(&text) {
            Ok(value) => value,
            Err(error) => {
                tracing::warn!(path = %path.display(), %error, "ignoring unparseable config file");
                Value::Null
            }
        },
        Err(_) => Value::Null,
    }
}

struct Resolver<'a, E: Fn(&str) -> Option<String>> {
    file: &'a Value,
    env: &'a E,
}

impl<E: Fn(&str) -> Option<String>> Resolver<'_, E> {
    fn file_value(&self, path: &[&str]) -> Option<&Value> {
        let mut cur = self.file;
        for key in path {
            cur = cur.get(key)?;
        }
        Some(cur)
    }

    fn get(&self, env_key: &str, path: &[&str], default: u64) -> u64 {
        if let Some(raw) = (self.env)(env_key) {
            match raw.parse() {
                Ok(v) => return v,
                Err(_) => {
                    tracing::warn!(key = env_key, value = %raw, "invalid numeric env var, using default");
                    return default;
                }
            }
        }
        match self.file_value(path) {
            Some(Value::Number(n)) => n.as_u64().unwrap_or(default),
            Some(Value::String(s)) => s.parse().unwrap_or(default),
            _ => default,
        }
    }

    fn get_bool(&self, env_key: &str, path: &[&str], default: bool) -> bool {
        if let Some(raw) = (self.env)(env_key) {
            return parse_bool(&raw);
        }
        match self.file_value(path) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => parse_bool(s),
            _ => default,
        }
    }

    fn get_str(&self, env_key: &str, path: &[&str], default: &str) -> String {
        self.get_opt_str(env_key, path)
            .unwrap_or_else(|| default.to_string())
    }

    fn get_opt_str(&self, env_key: &str, path: &[&str]) -> Option<String> {
        if let Some(raw) = (self.env)(env_key) {
            if !raw.is_empty() {
                return Some(raw);
            }
        }
        match self.file_value(path) {
            Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
            _ => None,
        }
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}
