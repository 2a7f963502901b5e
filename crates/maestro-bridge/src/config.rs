// ABOUTME: Configuration loading and management for the agent bridge
// ABOUTME: TOML file under ~/.config/maestro with defaults matching the legacy qwen bridge

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::BridgeError;

/// Default TCP host for the frontend listener.
pub const DEFAULT_HOST: &str = "127.0.0.1";
/// Default TCP port for the frontend listener.
pub const DEFAULT_PORT: u16 = 7777;

/// Main configuration structure
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// How the frontend reaches the bridge
    pub transport: TransportConfig,
    /// Which agent to run and how to supervise it
    pub agent: AgentConfig,
    /// Poll intervals, grace periods and I/O timeouts
    pub timings: Timings,
}

/// Channel used between the frontend and the bridge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// The bridge's own stdin/stdout
    #[default]
    Stdin,
    /// A `<base>.in` / `<base>.out` FIFO pair
    Pipe,
    /// A single-client TCP listener
    Tcp,
}

impl TransportMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportMode::Stdin => "stdin",
            TransportMode::Pipe => "pipe",
            TransportMode::Tcp => "tcp",
        }
    }
}

impl fmt::Display for TransportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportMode {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stdin" | "stdio" => Ok(TransportMode::Stdin),
            "pipe" => Ok(TransportMode::Pipe),
            "tcp" => Ok(TransportMode::Tcp),
            other => Err(BridgeError::Config(format!("unknown transport mode: {other}"))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub mode: TransportMode,
    /// FIFO base path; the bridge reads `<base>.in` and writes `<base>.out`
    pub pipe_path: Option<PathBuf>,
    pub host: String,
    pub port: u16,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::Stdin,
            pipe_path: None,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
        }
    }
}

impl TransportConfig {
    /// Reject combinations that cannot start (checked before any resource is opened).
    pub fn validate(&self) -> Result<(), BridgeError> {
        match self.mode {
            TransportMode::Pipe if self.pipe_path.is_none() => Err(BridgeError::Config(
                "pipe mode requires a pipe path".to_string(),
            )),
            TransportMode::Tcp if self.host.trim().is_empty() => Err(BridgeError::Config(
                "tcp mode requires a host".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent command; split on whitespace, so "npx qwen-code" is program + first arg
    pub executable: String,
    /// Arguments appended after the ones embedded in `executable`
    pub args: Vec<String>,
    /// Extra environment variables for the agent process
    pub env: BTreeMap<String, String>,
    /// Working directory for the agent (inherits the bridge's when unset)
    pub working_dir: Option<PathBuf>,
    /// Restart the agent when it closes its stdout
    pub auto_restart: bool,
    /// Upper bound on automatic and manual restarts
    pub max_restarts: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            executable: "npx qwen-code".to_string(),
            args: vec!["--server-mode".to_string(), "stdin".to_string()],
            env: BTreeMap::new(),
            working_dir: None,
            auto_restart: true,
            max_restarts: 5,
        }
    }
}

impl AgentConfig {
    /// Agent config running `program` with exactly `args`.
    pub fn command(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            executable: program.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            ..Self::default()
        }
    }

    /// Program and full argument list, or None when `executable` is blank.
    pub fn command_line(&self) -> Option<(String, Vec<String>)> {
        let mut parts = self.executable.split_whitespace();
        let program = parts.next()?.to_string();
        let args = parts
            .map(str::to_string)
            .chain(self.args.iter().cloned())
            .collect();
        Some((program, args))
    }
}

/// Every interval and timeout the bridge uses, in one place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Timings {
    /// Coordination loop wait per cycle, and idle sleep for polling readers
    pub poll_interval_ms: u64,
    /// How long a terminated agent gets before it is killed
    pub stop_grace_secs: u64,
    /// Upper bound on a single write to a frontend
    pub write_timeout_ms: u64,
    /// Upper bound on joining a background task during stop
    pub join_timeout_ms: u64,
}

impl Default for Timings {
    fn default() -> Self {
        Self {
            poll_interval_ms: 10,
            stop_grace_secs: 5,
            write_timeout_ms: 1000,
            join_timeout_ms: 1000,
        }
    }
}

impl Timings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }
}

impl BridgeConfig {
    /// Get the XDG config directory for maestro (~/.config/maestro)
    pub fn config_dir() -> PathBuf {
        // Respect XDG_CONFIG_HOME if set, otherwise use ~/.config
        std::env::var("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|p| p.join(".config"))
                    .unwrap_or_else(|| PathBuf::from("."))
            })
            .join("maestro")
    }

    /// Get the default config file path
    pub fn config_path() -> PathBuf {
        Self::config_dir().join("bridge.toml")
    }

    /// Load config from XDG config directory
    pub fn load() -> Result<Self> {
        let path = Self::config_path();

        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from a specific path
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        let config: BridgeConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), BridgeError> {
        self.transport.validate()?;
        if self.agent.command_line().is_none() {
            return Err(BridgeError::Config("agent executable is empty".to_string()));
        }
        Ok(())
    }

    /// Generate a default config file content
    pub fn default_toml() -> String {
        format!(
            r#"# maestro bridge configuration
# Location: ~/.config/maestro/bridge.toml

[transport]
# stdin | pipe | tcp
mode = "stdin"
# pipe_path = "/tmp/maestro-bridge"  # Reads <base>.in, writes <base>.out (create both with mkfifo)
host = "{DEFAULT_HOST}"
port = {DEFAULT_PORT}

[agent]
executable = "npx qwen-code"
args = ["--server-mode", "stdin"]
auto_restart = true
max_restarts = 5
# working_dir = "/path/to/repo"

[agent.env]
# QWEN_MODEL = "qwen3-coder"

[timings]
poll_interval_ms = 10
stop_grace_secs = 5
write_timeout_ms = 1000
join_timeout_ms = 1000
"#
        )
    }

    /// Initialize config directory and create default config if needed
    pub fn init() -> Result<PathBuf> {
        let config_dir = Self::config_dir();
        let config_path = Self::config_path();

        std::fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config dir: {}", config_dir.display()))?;

        if !config_path.exists() {
            std::fs::write(&config_path, Self::default_toml())
                .with_context(|| format!("Failed to write config: {}", config_path.display()))?;
        }

        Ok(config_path)
    }
}
