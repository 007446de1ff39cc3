//! Fail-fast startup validation

use super::schema::Config;
use crate::error::{Result, ValidationError};
use ipnet::IpNet;
use std::fs;

pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate a loaded configuration before any socket is opened.
    /// A bad CIDR, a rule carrying both list files, or an unreadable list
    /// file is fatal here rather than a per-connection surprise later.
    pub fn validate(config: &Config) -> Result<()> {
        Self::check_server(config)?;
        Self::check_rules(config)?;
        Self::check_special_hosts(config)?;
        Ok(())
    }

    fn check_server(config: &Config) -> Result<()> {
        if config.server.port == 0 {
            return Err(ValidationError::InvalidPort {
                port: config.server.port,
            }
            .into());
        }

        if config.server.buffer_size == 0 {
            return Err(ValidationError::InvalidBufferSize.into());
        }

        Ok(())
    }

    fn check_rules(config: &Config) -> Result<()> {
        for rule in &config.access_control.rules {
            for cidr in &rule.networks {
                if cidr.parse::<IpNet>().is_err() {
                    return Err(ValidationError::InvalidCidr {
                        rule: rule.name.clone(),
                        cidr: cidr.clone(),
                    }
                    .into());
                }
            }

            if rule.whitelist_file.is_some() && rule.blacklist_file.is_some() {
                return Err(ValidationError::ConflictingLists {
                    rule: rule.name.clone(),
                }
                .into());
            }

            for path in [&rule.whitelist_file, &rule.blacklist_file]
                .into_iter()
                .flatten()
            {
                if fs::metadata(path).is_err() {
                    return Err(ValidationError::UnreadableListFile {
                        rule: rule.name.clone(),
                        path: path.clone(),
                    }
                    .into());
                }
            }
        }

        Ok(())
    }

    fn check_special_hosts(config: &Config) -> Result<()> {
        for special in &config.special_hosts {
            if special.host.trim().is_empty() {
                return Err(ValidationError::EmptySpecialHost.into());
            }
        }

        Ok(())
    }
}
