//! Configuration schema types

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Complete proxy configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub log_fields: LogFields,
    #[serde(default)]
    pub limits: Limits,
    #[serde(default)]
    pub access_control: AccessControlConfig,
    #[serde(default)]
    pub special_hosts: Vec<SpecialHost>,
}

/// Listener and forwarding settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Relay inactivity timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    /// Relay buffer size in bytes
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3128
}

fn default_timeout() -> u64 {
    20
}

fn default_buffer_size() -> usize {
    4096
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            timeout: default_timeout(),
            buffer_size: default_buffer_size(),
        }
    }
}

/// Access log sink settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_path")]
    pub path: PathBuf,
    /// Diagnostic log level (overridable with RUST_LOG)
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_rotate_size_mb")]
    pub rotate_size_mb: u64,
    #[serde(default = "default_rotate_backups")]
    pub rotate_backups: usize,
}

fn default_log_path() -> PathBuf {
    PathBuf::from("./logs/proxy.log")
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_rotate_size_mb() -> u64 {
    5
}

fn default_rotate_backups() -> usize {
    3
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            path: default_log_path(),
            level: default_log_level(),
            rotate_size_mb: default_rotate_size_mb(),
            rotate_backups: default_rotate_backups(),
        }
    }
}

/// Which fields appear in serialized access records.
/// A disabled field is omitted from the record entirely, not nulled.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct LogFields {
    #[serde(default = "default_true")]
    pub remote_ip: bool,
    #[serde(default = "default_true")]
    pub method: bool,
    #[serde(default = "default_true")]
    pub url: bool,
    #[serde(default = "default_true")]
    pub status_code: bool,
    #[serde(default = "default_true")]
    pub duration_ms: bool,
    #[serde(default)]
    pub headers: bool,
    #[serde(default)]
    pub body: bool,
    #[serde(default)]
    pub response_headers: bool,
    #[serde(default)]
    pub response_body: bool,
}

fn default_true() -> bool {
    true
}

impl Default for LogFields {
    fn default() -> Self {
        Self {
            remote_ip: true,
            method: true,
            url: true,
            status_code: true,
            duration_ms: true,
            headers: false,
            body: false,
            response_headers: false,
            response_body: false,
        }
    }
}

/// Payload limits
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct Limits {
    #[serde(default = "default_max_body_size_kb")]
    pub max_body_size_kb: u64,
}

fn default_max_body_size_kb() -> u64 {
    2048
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_body_size_kb: default_max_body_size_kb(),
        }
    }
}

impl Limits {
    pub fn max_body_bytes(&self) -> u64 {
        self.max_body_size_kb * 1024
    }
}

/// Rule action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Allow,
    Deny,
}

fn default_action() -> Action {
    Action::Deny
}

/// Ordered access-control rules plus the fallback action
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AccessControlConfig {
    #[serde(default = "default_action")]
    pub default_action: Action,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

impl Default for AccessControlConfig {
    fn default() -> Self {
        Self {
            default_action: default_action(),
            rules: Vec::new(),
        }
    }
}

/// A single access rule. Rules are evaluated in declared order; the first
/// rule whose networks contain the client address wins.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RuleConfig {
    pub name: String,
    #[serde(default)]
    pub networks: Vec<String>,
    pub action: Action,
    /// Addresses that flip a matched rule to allow
    #[serde(default)]
    pub whitelist_file: Option<PathBuf>,
    /// Addresses that flip a matched rule to deny
    #[serde(default)]
    pub blacklist_file: Option<PathBuf>,
}

/// Destination host with bespoke connection handling
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SpecialHost {
    pub host: String,
    #[serde(default)]
    pub description: String,
    /// Terminate the session after one exchange regardless of keep-alive
    #[serde(default)]
    pub force_close: bool,
    /// Connect without further policy evaluation
    #[serde(default)]
    pub direct_connection: bool,
}
