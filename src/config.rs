//! Server configuration module
//!
//! Parses and manages host configuration from YAML files. Every key has a
//! default, so an empty document is a valid local setup.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::core::DEFAULT_TICK;
use crate::network::acl::{AccessList, AclOrder};

/// Smallest frame limit that still fits the handshake.
pub const MIN_FRAME_SIZE: usize = 16;

/// A development account for the in-memory account store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountEntry {
    pub username: String,

    /// bcrypt hash of the password
    pub password_hash: String,

    pub account_id: u32,

    #[serde(default)]
    pub banned: bool,
}

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    // ============================================
    // Listeners
    // ============================================
    #[serde(default = "default_bind_ip")]
    pub bind_ip: String,

    #[serde(default = "default_auth_port")]
    pub auth_port: u16,

    #[serde(default = "default_world_port")]
    pub world_port: u16,

    // ============================================
    // Sessions
    // ============================================
    /// Idle timeout once the handshake is done
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// Deadline to complete the handshake
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Upper bound on a single frame, header included
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,

    #[serde(default = "default_max_sessions")]
    pub max_sessions: usize,

    /// Host loop tick in milliseconds
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,

    // ============================================
    // Access control & throttling
    // ============================================
    #[serde(default = "default_allow")]
    pub allow: Vec<String>,

    #[serde(default)]
    pub deny: Vec<String>,

    #[serde(default)]
    pub acl_order: AclOrder,

    /// Connections allowed per IP within one window
    #[serde(default = "default_connect_limit")]
    pub connect_limit: u32,

    #[serde(default = "default_connect_window_ms")]
    pub connect_window_ms: u64,

    #[serde(default = "default_lockout_secs")]
    pub lockout_secs: u64,

    // ============================================
    // Telemetry
    // ============================================
    /// Packet counter report period (0 = off)
    #[serde(default = "default_stats_interval_secs")]
    pub stats_interval_secs: u64,

    // ============================================
    // Auth gateway
    // ============================================
    #[serde(default)]
    pub accounts: Vec<AccountEntry>,
}

// ============================================
// Default value functions
// These are called by serde when a field is missing
// ============================================

fn default_bind_ip() -> String {
    "0.0.0.0".to_string()
}

fn default_auth_port() -> u16 {
    2000
}

fn default_world_port() -> u16 {
    2001
}

fn default_idle_timeout_secs() -> u64 {
    60
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

fn default_max_frame_size() -> usize {
    4096
}

fn default_max_sessions() -> usize {
    1024
}

fn default_tick_ms() -> u64 {
    DEFAULT_TICK.as_millis() as u64
}

fn default_allow() -> Vec<String> {
    vec!["all".to_string()]
}

fn default_connect_limit() -> u32 {
    20
}

fn default_connect_window_ms() -> u64 {
    1000
}

fn default_lockout_secs() -> u64 {
    600
}

fn default_stats_interval_secs() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: default_bind_ip(),
            auth_port: default_auth_port(),
            world_port: default_world_port(),
            idle_timeout_secs: default_idle_timeout_secs(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            max_frame_size: default_max_frame_size(),
            max_sessions: default_max_sessions(),
            tick_ms: default_tick_ms(),
            allow: default_allow(),
            deny: Vec::new(),
            acl_order: AclOrder::default(),
            connect_limit: default_connect_limit(),
            connect_window_ms: default_connect_window_ms(),
            lockout_secs: default_lockout_secs(),
            stats_interval_secs: default_stats_interval_secs(),
            accounts: Vec::new(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file
    ///
    /// # Example
    /// ```no_run
    /// use realmnet::config::ServerConfig;
    ///
    /// let config = ServerConfig::from_file("conf/server.yaml")
    ///     .expect("Failed to load config");
    /// println!("auth port: {}", config.auth_port);
    /// ```
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: ServerConfig = serde_yaml::from_str(&contents)
            .with_context(|| format!("Failed to parse YAML in {}", path.display()))?;

        config.validate()?;

        Ok(config)
    }

    /// Parse configuration from a YAML string
    ///
    /// Useful for testing
    pub fn from_str(contents: &str) -> Result<Self> {
        let config: ServerConfig = serde_yaml::from_str(contents)
            .context("Failed to parse YAML")?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.bind_ip.is_empty(), "bind_ip cannot be empty");
        anyhow::ensure!(self.idle_timeout_secs > 0, "idle_timeout_secs must be non-zero");
        anyhow::ensure!(self.handshake_timeout_secs > 0, "handshake_timeout_secs must be non-zero");
        anyhow::ensure!(self.tick_ms > 0, "tick_ms must be non-zero");
        anyhow::ensure!(self.connect_window_ms > 0, "connect_window_ms must be non-zero");
        anyhow::ensure!(
            self.max_frame_size >= MIN_FRAME_SIZE,
            "max_frame_size too small: {} (min {})",
            self.max_frame_size,
            MIN_FRAME_SIZE
        );
        anyhow::ensure!(self.max_sessions > 0, "max_sessions must be non-zero");

        self.access_list()?;

        Ok(())
    }

    /// Build the access list from `allow` / `deny` / `acl_order`.
    pub fn access_list(&self) -> Result<AccessList> {
        AccessList::parse(&self.allow, &self.deny, self.acl_order).context("Invalid access list")
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms)
    }

    /// Save configuration to a YAML file
    ///
    /// Useful for generating config templates or saving modified configs
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let yaml = serde_yaml::to_string(&self)
            .context("Failed to serialize config to YAML")?;

        fs::write(path.as_ref(), yaml)
            .with_context(|| format!("Failed to write config to {}", path.as_ref().display()))?;

        Ok(())
    }
}
