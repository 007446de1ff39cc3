//! Error types for proxy operations

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProxyError>;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Configuration validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Failed to load config from {path}: {source}")]
    ConfigLoad {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Failed to load list file {path}: {reason}")]
    ListLoad { path: PathBuf, reason: String },

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Invalid CIDR notation in rule '{rule}': {cidr}")]
    InvalidCidr { rule: String, cidr: String },

    #[error("Rule '{rule}' carries both a whitelist and a blacklist file")]
    ConflictingLists { rule: String },

    #[error("List file for rule '{rule}' is not readable: {path}")]
    UnreadableListFile { rule: String, path: PathBuf },

    #[error("Invalid listen port: {port}")]
    InvalidPort { port: u16 },

    #[error("buffer_size must be greater than zero")]
    InvalidBufferSize,

    #[error("Special host entry has an empty host")]
    EmptySpecialHost,
}
