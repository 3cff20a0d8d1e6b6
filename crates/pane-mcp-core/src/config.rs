//! Configuration types for pane-mcp.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{Error, ExecutionStrategy, Result};

/// Server configuration loaded from YAML file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ServerConfig {
    /// Server settings
    pub server: ServerSettings,
    /// Connection pool settings
    pub pool: PoolSettings,
    /// Command execution settings
    pub execution: ExecutionSettings,
    /// Terminal host settings
    pub host: HostSettings,
}

impl ServerConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ServerConfig =
            serde_yaml::from_str(yaml).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `PANE_MCP_*` environment overrides, then re-validate.
    pub fn apply_env_overrides<FEnv>(&mut self, env_lookup: FEnv) -> Result<()>
    where
        FEnv: Fn(&str) -> Option<String>,
    {
        if let Some(level) = env_lookup("PANE_MCP_LOG_LEVEL") {
            self.server.log_level = level;
        }
        if let Some(value) = env_lookup("PANE_MCP_IDLE_WINDOW_SECONDS") {
            self.pool.idle_window_seconds = parse_env("PANE_MCP_IDLE_WINDOW_SECONDS", &value)?;
        }
        if let Some(value) = env_lookup("PANE_MCP_DEFAULT_TIMEOUT_SECONDS") {
            self.execution.default_timeout_seconds =
                parse_env("PANE_MCP_DEFAULT_TIMEOUT_SECONDS", &value)?;
        }
        if let Some(value) = env_lookup("PANE_MCP_MAX_OUTPUT_CHARS") {
            self.execution.max_output_chars = parse_env("PANE_MCP_MAX_OUTPUT_CHARS", &value)?;
        }
        if let Some(value) = env_lookup("PANE_MCP_POLL_INTERVAL_MILLIS") {
            self.execution.poll_interval_millis =
                parse_env("PANE_MCP_POLL_INTERVAL_MILLIS", &value)?;
        }
        if let Some(value) = env_lookup("PANE_MCP_HOST") {
            self.host.backend = value.parse()?;
        }
        if let Some(socket) = env_lookup("PANE_MCP_TMUX_SOCKET") {
            self.host.tmux_socket = Some(socket).filter(|s| !s.trim().is_empty());
        }
        self.validate()
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.pool.idle_window_seconds == 0 {
            return Err(Error::Config(
                "pool.idle_window_seconds must be > 0".to_string(),
            ));
        }

        let exec = &self.execution;
        if exec.default_timeout_seconds == 0 {
            return Err(Error::Config(
                "execution.default_timeout_seconds must be > 0".to_string(),
            ));
        }
        if exec.max_output_chars == 0 {
            return Err(Error::Config(
                "execution.max_output_chars must be > 0".to_string(),
            ));
        }
        if exec.poll_interval_millis == 0 || exec.max_polls == 0 {
            return Err(Error::Config(
                "execution.poll_interval_millis and execution.max_polls must be > 0".to_string(),
            ));
        }
        if !exec.ambiguous_strategy.is_atomic() {
            return Err(Error::Config(format!(
                "execution.ambiguous_strategy must be atomic, got {}",
                exec.ambiguous_strategy
            )));
        }

        if self.host.scrollback_lines == 0 {
            return Err(Error::Config(
                "host.scrollback_lines must be > 0".to_string(),
            ));
        }
        if self.host.script_interpreter.trim().is_empty() {
            return Err(Error::Config(
                "host.script_interpreter cannot be empty".to_string(),
            ));
        }

        Ok(())
    }
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse::<T>().map_err(|_| {
        Error::Config(format!(
            "invalid {name} value `{value}`: expected a positive integer"
        ))
    })
}

/// Server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

/// Connection pool settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// How long an unused host connection is kept before eviction
    pub idle_window_seconds: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            idle_window_seconds: 300,
        }
    }
}

/// Command execution settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    /// Timeout used when a request does not give one
    pub default_timeout_seconds: u64,
    /// Output bound used when a request does not give one
    pub max_output_chars: usize,
    /// Delay between screen reads while waiting for a command
    pub poll_interval_millis: u64,
    /// Hard cap on screen reads per command, independent of the deadline
    pub max_polls: u32,
    /// Responses with more output than this are serialized without indentation
    pub compact_threshold_chars: usize,
    /// Send Ctrl+C to the session when a command times out
    pub interrupt_on_timeout: bool,
    /// Strategy for text the classifier cannot place in a stricter bucket
    pub ambiguous_strategy: ExecutionStrategy,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            default_timeout_seconds: 10,
            max_output_chars: 10_000,
            poll_interval_millis: 100,
            max_polls: 10_000,
            compact_threshold_chars: 2000,
            interrupt_on_timeout: false,
            ambiguous_strategy: ExecutionStrategy::BracketedPaste,
        }
    }
}

/// Which terminal host implementation to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostBackend {
    /// A tmux server, through its command-line client
    Tmux,
    /// The in-process scripted shell
    Memory,
}

impl std::fmt::Display for HostBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HostBackend::Tmux => write!(f, "tmux"),
            HostBackend::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for HostBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tmux" => Ok(HostBackend::Tmux),
            "memory" => Ok(HostBackend::Memory),
            other => Err(Error::Config(format!(
                "unknown host backend `{other}` (expected tmux or memory)"
            ))),
        }
    }
}

/// Terminal host settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostSettings {
    /// Host implementation
    pub backend: HostBackend,
    /// tmux socket path (`tmux -S`); the default server when unset
    pub tmux_socket: Option<String>,
    /// Scrollback lines read when capturing output
    pub scrollback_lines: usize,
    /// Where ScriptFile delivery writes its scripts; the system temp dir when unset
    pub script_dir: Option<PathBuf>,
    /// Interpreter named in the script shebang
    pub script_interpreter: String,
}

impl Default for HostSettings {
    fn default() -> Self {
        Self {
            backend: HostBackend::Tmux,
            tmux_socket: None,
            scrollback_lines: 10_000,
            script_dir: None,
            script_interpreter: "/bin/sh".to_string(),
        }
    }
}

impl HostSettings {
    /// Resolved script directory.
    pub fn script_dir(&self) -> PathBuf {
        self.script_dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.server.log_level, "info");
        assert_eq!(config.pool.idle_window_seconds, 300);
        assert_eq!(config.execution.default_timeout_seconds, 10);
        assert_eq!(config.execution.max_output_chars, 10_000);
        assert_eq!(config.execution.compact_threshold_chars, 2000);
        assert!(!config.execution.interrupt_on_timeout);
        assert_eq!(
            config.execution.ambiguous_strategy,
            ExecutionStrategy::BracketedPaste
        );
        assert_eq!(config.host.backend, HostBackend::Tmux);
        assert_eq!(config.host.script_interpreter, "/bin/sh");
    }

    #[test]
    fn test_config_validation() {
        let config = ServerConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_idle_window() {
        let mut config = ServerConfig::default();
        config.pool.idle_window_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_execution_limits() {
        let mut config = ServerConfig::default();
        config.execution.max_output_chars = 0;
        assert!(config.validate().is_err());

        let mut config = ServerConfig::default();
        config.execution.max_polls = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
server:
  log_level: debug

pool:
  idle_window_seconds: 60

execution:
  default_timeout_seconds: 30
  max_output_chars: 500
  interrupt_on_timeout: true
  ambiguous_strategy: script_file

host:
  backend: memory
  tmux_socket: /tmp/pane-mcp.sock
  script_dir: /var/tmp
"#;

        let config = ServerConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.log_level, "debug");
        assert_eq!(config.pool.idle_window_seconds, 60);
        assert_eq!(config.execution.default_timeout_seconds, 30);
        assert_eq!(config.execution.max_output_chars, 500);
        assert!(config.execution.interrupt_on_timeout);
        assert_eq!(
            config.execution.ambiguous_strategy,
            ExecutionStrategy::ScriptFile
        );
        // Unlisted keys keep their defaults
        assert_eq!(config.execution.poll_interval_millis, 100);
        assert_eq!(config.host.backend, HostBackend::Memory);
        assert_eq!(config.host.tmux_socket.as_deref(), Some("/tmp/pane-mcp.sock"));
        assert_eq!(config.host.script_dir(), PathBuf::from("/var/tmp"));
    }

    #[test]
    fn test_parse_yaml_rejects_invalid_values() {
        assert!(ServerConfig::from_yaml("pool:\n  idle_window_seconds: 0\n").is_err());
        assert!(ServerConfig::from_yaml("host:\n  backend: screen\n").is_err());
        assert!(ServerConfig::from_yaml("execution:\n  ambiguous_strategy: typing\n").is_err());
        assert!(ServerConfig::from_yaml("execution:\n  ambiguous_strategy: direct\n").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = ServerConfig::default();
        config
            .apply_env_overrides(lookup(&[
                ("PANE_MCP_LOG_LEVEL", "trace"),
                ("PANE_MCP_IDLE_WINDOW_SECONDS", "45"),
                ("PANE_MCP_DEFAULT_TIMEOUT_SECONDS", "3"),
                ("PANE_MCP_MAX_OUTPUT_CHARS", "128"),
                ("PANE_MCP_POLL_INTERVAL_MILLIS", "20"),
                ("PANE_MCP_HOST", "Memory"),
                ("PANE_MCP_TMUX_SOCKET", "/tmp/other.sock"),
            ]))
            .unwrap();

        assert_eq!(config.server.log_level, "trace");
        assert_eq!(config.pool.idle_window_seconds, 45);
        assert_eq!(config.execution.default_timeout_seconds, 3);
        assert_eq!(config.execution.max_output_chars, 128);
        assert_eq!(config.execution.poll_interval_millis, 20);
        assert_eq!(config.host.backend, HostBackend::Memory);
        assert_eq!(config.host.tmux_socket.as_deref(), Some("/tmp/other.sock"));
    }

    #[test]
    fn test_env_overrides_absent_keep_config() {
        let mut config = ServerConfig::default();
        config.apply_env_overrides(lookup(&[])).unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_env_override_invalid_number() {
        let mut config = ServerConfig::default();
        let err = config
            .apply_env_overrides(lookup(&[("PANE_MCP_MAX_OUTPUT_CHARS", "lots")]))
            .unwrap_err();
        assert!(err.to_string().contains("PANE_MCP_MAX_OUTPUT_CHARS"));

        let mut config = ServerConfig::default();
        assert!(config
            .apply_env_overrides(lookup(&[("PANE_MCP_IDLE_WINDOW_SECONDS", "0")]))
            .is_err());
    }
}
