//! Configuration for launching and supervising an agent process.
//!
//! A host reads a JSON document naming the agent command, either from a
//! file or from the `ACP_STDIO_CONFIG` environment variable. Connection
//! tuning has built-in defaults that can be overridden by the document's
//! `connection` section or by environment variables.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::transport::MAX_LINE_BYTES;

/// Environment variable holding a JSON [`Config`].
pub const CONFIG_ENV: &str = "ACP_STDIO_CONFIG";

const DEFAULT_SHUTDOWN_GRACE_MS: u64 = 5_000;

/// Parsed supervisor settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SupervisorConfig {
    /// How long an agent gets to exit after its stdin is closed before it
    /// is killed.
    pub shutdown_grace: Duration,

    /// Longest inbound line accepted from the agent.
    pub max_line_bytes: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shutdown_grace: Duration::from_millis(DEFAULT_SHUTDOWN_GRACE_MS),
            max_line_bytes: MAX_LINE_BYTES,
        }
    }
}

impl SupervisorConfig {
    /// Create from the serde `connection` section.
    pub fn from_settings(settings: &ConnectionSettings) -> Self {
        Self {
            shutdown_grace: Duration::from_millis(settings.shutdown_grace_ms),
            max_line_bytes: settings.max_line_bytes,
        }
    }

    /// Create from environment variables, falling back to defaults.
    ///
    /// Reads `ACP_SHUTDOWN_GRACE_MS` and `ACP_MAX_LINE_BYTES`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            shutdown_grace: parse_var(&lookup, "ACP_SHUTDOWN_GRACE_MS")
                .map_or(defaults.shutdown_grace, Duration::from_millis),
            max_line_bytes: parse_var(&lookup, "ACP_MAX_LINE_BYTES")
                .unwrap_or(defaults.max_line_bytes),
        }
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparseable environment variable");
            None
        }
    }
}

/// Connection tuning as read from JSON.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionSettings {
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,

    #[serde(default = "default_max_line_bytes")]
    pub max_line_bytes: usize,
}

const fn default_shutdown_grace_ms() -> u64 {
    DEFAULT_SHUTDOWN_GRACE_MS
}

const fn default_max_line_bytes() -> usize {
    MAX_LINE_BYTES
}

/// How to start an agent process.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct AgentCommand {
    /// Executable, resolved through `PATH` if not absolute.
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Extra environment variables, added on top of the inherited ones.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory for the agent. Defaults to the host's.
    #[serde(default)]
    pub cwd: Option<PathBuf>,
}

impl AgentCommand {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
        }
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }
}

/// Top-level host configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Agent to spawn.
    pub agent: AgentCommand,

    /// Connection tuning (optional).
    #[serde(default)]
    pub connection: Option<ConnectionSettings>,
}

impl Config {
    /// Load configuration from a JSON file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config = Self::from_json(&raw)
            .with_context(|| format!("Invalid config file {}", path.display()))?;
        debug!(path = %path.display(), command = %config.agent.command, "Loaded config file");
        Ok(config)
    }

    /// Load configuration from the `ACP_STDIO_CONFIG` environment variable.
    pub fn from_env() -> Result<Self> {
        let raw = std::env::var(CONFIG_ENV).with_context(|| format!("{CONFIG_ENV} not set"))?;
        Self::from_json(&raw).with_context(|| format!("Failed to parse {CONFIG_ENV}"))
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json).context("Failed to parse JSON")?;
        Ok(config)
    }

    /// Supervisor settings: the `connection` section if present, otherwise
    /// environment variables and defaults.
    pub fn supervisor(&self) -> SupervisorConfig {
        self.connection
            .as_ref()
            .map_or_else(SupervisorConfig::from_env, SupervisorConfig::from_settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_config() {
        let config = Config::from_json(r#"{"agent": {"command": "python3"}}"#).unwrap();
        assert_eq!(config.agent, AgentCommand::new("python3"));
        assert!(config.connection.is_none());
    }

    #[test]
    fn parse_full_config() {
        let json = r#"{
            "agent": {
                "command": "/usr/bin/python3",
                "args": ["agent.py", "--verbose"],
                "env": {"MODEL": "small"},
                "cwd": "/srv/agent"
            },
            "connection": {
                "shutdown_grace_ms": 250
            }
        }"#;

        let config = Config::from_json(json).unwrap();
        assert_eq!(
            config.agent,
            AgentCommand::new("/usr/bin/python3")
                .args(["agent.py", "--verbose"])
                .env("MODEL", "small")
                .cwd("/srv/agent")
        );

        // Missing fields in the section fall back to defaults
        let supervisor = config.supervisor();
        assert_eq!(supervisor.shutdown_grace, Duration::from_millis(250));
        assert_eq!(supervisor.max_line_bytes, MAX_LINE_BYTES);
    }

    #[test]
    fn reject_config_without_agent() {
        let err = Config::from_json(r#"{"connection": {}}"#).unwrap_err();
        assert!(format!("{err:#}").contains("agent"));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acp.json");
        std::fs::write(&path, r#"{"agent": {"command": "node", "args": ["agent.js"]}}"#).unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.agent.command, "node");
        assert_eq!(config.agent.args, vec!["agent.js"]);
    }

    #[test]
    fn load_from_missing_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.json");
        let err = Config::from_file(&path).unwrap_err();
        assert!(format!("{err:#}").contains("missing.json"));
    }

    #[test]
    fn supervisor_overrides_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("ACP_SHUTDOWN_GRACE_MS", "1500"),
            ("ACP_MAX_LINE_BYTES", "4096"),
        ]
        .into_iter()
        .collect();
        let config = SupervisorConfig::from_lookup(|k| vars.get(k).map(|v| (*v).to_string()));
        assert_eq!(config.shutdown_grace, Duration::from_millis(1500));
        assert_eq!(config.max_line_bytes, 4096);
    }

    #[test]
    fn supervisor_ignores_garbage_values() {
        let config = SupervisorConfig::from_lookup(|k| {
            (k == "ACP_SHUTDOWN_GRACE_MS").then(|| "soon".to_string())
        });
        assert_eq!(config, SupervisorConfig::default());
    }
}
