//! Configuration
//!
//! Parses `tether.toml`. Every section and key is optional; missing values
//! fall back to the defaults below.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::agent::permissions::validate_permission;
use crate::client::ConsumerSettings;
use crate::orchestrator::OrchestratorSettings;
use crate::protocol::PermissionMode;
use crate::ratelimit::RateLimits;

/// Default config file name, looked up in the working directory
pub const CONFIG_FILE: &str = "tether.toml";

/// HTTP server settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServerConfig {
    /// Listen address
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Seconds between SSE keep-alive comments
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

const fn default_keep_alive_secs() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            keep_alive_secs: default_keep_alive_secs(),
        }
    }
}

/// Rate limiting budgets
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Requests per window for ordinary endpoints
    #[serde(default = "default_general_limit")]
    pub general_limit: usize,
    /// Stream-start requests per window
    #[serde(default = "default_chat_limit")]
    pub chat_limit: usize,
    /// Window length in seconds
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Seconds between sweeps of expired entries
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

const fn default_general_limit() -> usize {
    100
}

const fn default_chat_limit() -> usize {
    10
}

const fn default_window_secs() -> u64 {
    60
}

const fn default_sweep_interval_secs() -> u64 {
    300
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            general_limit: default_general_limit(),
            chat_limit: default_chat_limit(),
            window_secs: default_window_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

/// How agents are launched
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentConfig {
    /// Agent executable, looked up on PATH
    #[serde(default = "default_program")]
    pub program: String,
    /// Fail a turn after this many seconds without valid agent output
    #[serde(default = "default_stall_timeout_secs")]
    pub stall_timeout_secs: u64,
    /// Cap on a turn's running time in seconds, excluding permission waits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turn_secs: Option<u64>,
    /// Permission mode for requests that name none
    #[serde(default)]
    pub default_permission_mode: PermissionMode,
    /// Tools pre-approved for every turn
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Tools refused for every turn
    #[serde(default)]
    pub disallowed_tools: Vec<String>,
    /// Turn cap for requests that name none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_turns: Option<u32>,
    /// Budget cap for requests that name none
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_budget_usd: Option<f64>,
    /// Directory agents run in; the server's own when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,
}

fn default_program() -> String {
    "claude".to_string()
}

const fn default_stall_timeout_secs() -> u64 {
    30
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            program: default_program(),
            stall_timeout_secs: default_stall_timeout_secs(),
            max_turn_secs: None,
            default_permission_mode: PermissionMode::Default,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            max_turns: None,
            max_budget_usd: None,
            working_dir: None,
        }
    }
}

/// Turn history location
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StoreConfig {
    /// Directory holding `turns.jsonl`
    #[serde(default = "default_store_dir")]
    pub dir: PathBuf,
}

fn default_store_dir() -> PathBuf {
    PathBuf::from(".tether")
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: default_store_dir(),
        }
    }
}

/// Stream consumer behavior for `tether chat`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClientConfig {
    /// Reconnection attempts before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// First retry delay in milliseconds
    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,
    /// Largest retry delay in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Seconds without data before a connection counts as dropped
    #[serde(default = "default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

const fn default_max_attempts() -> u32 {
    5
}

const fn default_base_backoff_ms() -> u64 {
    500
}

const fn default_max_backoff_ms() -> u64 {
    8000
}

const fn default_read_timeout_secs() -> u64 {
    45
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            read_timeout_secs: default_read_timeout_secs(),
        }
    }
}

/// Top-level configuration parsed from tether.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct TetherConfig {
    /// HTTP server
    #[serde(default)]
    pub server: ServerConfig,
    /// Rate limiting
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Agent launching
    #[serde(default)]
    pub agent: AgentConfig,
    /// Turn history
    #[serde(default)]
    pub store: StoreConfig,
    /// Stream consumer
    #[serde(default)]
    pub client: ClientConfig,
}

impl TetherConfig {
    /// Parse a tether.toml file from a path
    pub fn from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("in {}", path.display()))
    }

    /// Parse tether.toml content from a string
    pub fn parse(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("Failed to parse tether.toml")?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if given, else `tether.toml` in `dir` if present, else defaults.
    pub fn load(path: Option<&Path>, dir: &Path) -> Result<Self> {
        if let Some(path) = path {
            return Self::from_path(path);
        }
        let candidate = dir.join(CONFIG_FILE);
        if candidate.exists() {
            Self::from_path(candidate)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.bind_addr()?;
        if self.server.keep_alive_secs == 0 {
            bail!("server.keep_alive_secs must be at least 1");
        }

        let limits = &self.rate_limit;
        if limits.general_limit == 0 || limits.chat_limit == 0 {
            bail!("rate_limit limits must be at least 1");
        }
        if limits.window_secs == 0 {
            bail!("rate_limit.window_secs must be at least 1");
        }
        if limits.sweep_interval_secs == 0 {
            bail!("rate_limit.sweep_interval_secs must be at least 1");
        }

        let agent = &self.agent;
        if agent.program.trim().is_empty() {
            bail!("agent.program cannot be empty");
        }
        if agent.stall_timeout_secs == 0 {
            bail!("agent.stall_timeout_secs must be at least 1");
        }
        if agent.max_turn_secs == Some(0) {
            bail!("agent.max_turn_secs must be at least 1");
        }
        if agent.max_turns == Some(0) {
            bail!("agent.max_turns must be at least 1");
        }
        if let Some(budget) = agent.max_budget_usd {
            if !budget.is_finite() || budget <= 0.0 {
                bail!("agent.max_budget_usd must be a positive number");
            }
        }
        for perm in &agent.allowed_tools {
            validate_permission(perm).context("in agent.allowed_tools")?;
        }
        for perm in &agent.disallowed_tools {
            validate_permission(perm).context("in agent.disallowed_tools")?;
        }

        let client = &self.client;
        if client.max_attempts == 0 {
            bail!("client.max_attempts must be at least 1");
        }
        if client.base_backoff_ms > client.max_backoff_ms {
            bail!(
                "client.base_backoff_ms ({}) exceeds client.max_backoff_ms ({})",
                client.base_backoff_ms,
                client.max_backoff_ms
            );
        }
        if client.read_timeout_secs == 0 {
            bail!("client.read_timeout_secs must be at least 1");
        }

        Ok(())
    }

    /// Parsed listen address
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        self.server
            .bind
            .parse()
            .with_context(|| format!("Invalid server.bind address '{}'", self.server.bind))
    }

    /// SSE keep-alive interval
    #[must_use]
    pub const fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.server.keep_alive_secs)
    }

    /// Rate limiter sweep interval
    #[must_use]
    pub const fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.rate_limit.sweep_interval_secs)
    }

    /// Budgets for the rate-limit middleware
    #[must_use]
    pub const fn rate_limits(&self) -> RateLimits {
        RateLimits {
            general: self.rate_limit.general_limit,
            chat: self.rate_limit.chat_limit,
            window: Duration::from_secs(self.rate_limit.window_secs),
        }
    }

    /// Orchestrator defaults derived from `[agent]`
    #[must_use]
    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            program: self.agent.program.clone(),
            stall_timeout: Duration::from_secs(self.agent.stall_timeout_secs),
            max_turn_duration: self.agent.max_turn_secs.map(Duration::from_secs),
            default_permission_mode: self.agent.default_permission_mode,
            allowed_tools: self.agent.allowed_tools.clone(),
            disallowed_tools: self.agent.disallowed_tools.clone(),
            max_turns: self.agent.max_turns,
            max_budget_usd: self.agent.max_budget_usd,
            working_dir: self.agent.working_dir.clone(),
            ..OrchestratorSettings::default()
        }
    }

    /// Consumer settings derived from `[client]`
    #[must_use]
    pub const fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            max_attempts: self.client.max_attempts,
            base_backoff: Duration::from_millis(self.client.base_backoff_ms),
            max_backoff: Duration::from_millis(self.client.max_backoff_ms),
            read_timeout: Duration::from_secs(self.client.read_timeout_secs),
        }
    }
}
