//! Configuration file loading

use super::schema::Config;
use crate::error::{ProxyError, Result};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub struct ConfigLoader;

impl ConfigLoader {
    /// Get the default config file path.
    ///
    /// Priority order:
    /// 1. $NETGATE_CONFIG
    /// 2. ./config.toml
    pub fn default_config_path() -> PathBuf {
        if let Ok(path) = env::var("NETGATE_CONFIG") {
            return PathBuf::from(path);
        }
        PathBuf::from("config.toml")
    }

    /// Load config from a file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Config> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|e| ProxyError::ConfigLoad {
            path: path.to_path_buf(),
            source: e,
        })?;

        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load config from an explicit path, or the default location,
    /// falling back to built-in defaults when no file exists.
    pub fn load_or_default(path: Option<PathBuf>) -> Result<Config> {
        if let Some(p) = path {
            return Self::load_from_file(p);
        }

        let path = Self::default_config_path();
        if path.exists() {
            Self::load_from_file(&path)
        } else {
            tracing::debug!("Config file not found at {:?}, using defaults", path);
            Ok(Config::default())
        }
    }
}
