//! Access-control decision engine
//!
//! Rules are evaluated in declared order against the client address; the
//! first rule whose networks contain the address wins. Inside the matched
//! rule, whitelist membership flips the outcome to allow and blacklist
//! membership flips it to deny; a list on rule N never affects rule N+1.
//! Special hosts are matched on the destination and can bypass rule
//! evaluation entirely.

use crate::config::schema::{Action, Config, SpecialHost};
use crate::error::{Result, ValidationError};
use crate::filter::listfile::ListFile;
use ipnet::IpNet;
use std::net::IpAddr;

/// Outcome of rule evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny,
    /// Connect without further policy evaluation
    Direct,
}

impl From<Action> for Verdict {
    fn from(action: Action) -> Self {
        match action {
            Action::Allow => Verdict::Allow,
            Action::Deny => Verdict::Deny,
        }
    }
}

/// The decision for one connection: a verdict plus the forced-close
/// annotation carried by a matched special host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub verdict: Verdict,
    pub force_close: bool,
}

impl Decision {
    pub fn is_denied(&self) -> bool {
        self.verdict == Verdict::Deny
    }
}

struct CompiledRule {
    name: String,
    networks: Vec<IpNet>,
    action: Action,
    whitelist: Option<ListFile>,
    blacklist: Option<ListFile>,
}

impl CompiledRule {
    fn matches(&self, addr: IpAddr) -> bool {
        self.networks.iter().any(|net| net.contains(&addr))
    }
}

/// Immutable rule set shared read-only by all connection tasks.
/// List snapshots inside each rule are individually reloadable.
pub struct RuleEngine {
    rules: Vec<CompiledRule>,
    default_action: Action,
    special_hosts: Vec<SpecialHost>,
}

impl RuleEngine {
    /// Compile the configured rules, parsing CIDRs and loading any
    /// referenced list files. Errors here abort startup.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut rules = Vec::with_capacity(config.access_control.rules.len());

        for rule in &config.access_control.rules {
            if rule.whitelist_file.is_some() && rule.blacklist_file.is_some() {
                return Err(ValidationError::ConflictingLists {
                    rule: rule.name.clone(),
                }
                .into());
            }

            let mut networks = Vec::with_capacity(rule.networks.len());
            for cidr in &rule.networks {
                let net = cidr.parse::<IpNet>().map_err(|_| ValidationError::InvalidCidr {
                    rule: rule.name.clone(),
                    cidr: cidr.clone(),
                })?;
                networks.push(net);
            }

            let whitelist = rule
                .whitelist_file
                .as_ref()
                .map(ListFile::load)
                .transpose()?;
            let blacklist = rule
                .blacklist_file
                .as_ref()
                .map(ListFile::load)
                .transpose()?;

            rules.push(CompiledRule {
                name: rule.name.clone(),
                networks,
                action: rule.action,
                whitelist,
                blacklist,
            });
        }

        Ok(Self {
            rules,
            default_action: config.access_control.default_action,
            special_hosts: config.special_hosts.clone(),
        })
    }

    /// Decide what to do with a connection from `client` to `dest_host`.
    /// Pure with respect to the current rule/list snapshot.
    pub fn decide(&self, client: IpAddr, dest_host: &str) -> Decision {
        let special = self.special_host(dest_host);
        let force_close = special.map(|s| s.force_close).unwrap_or(false);

        // A direct-connection host bypasses rule evaluation regardless of
        // what the client's rule would have said.
        if let Some(special) = special {
            if special.direct_connection {
                tracing::debug!(host = %dest_host, "special host, direct connection");
                return Decision {
                    verdict: Verdict::Direct,
                    force_close,
                };
            }
        }

        for rule in &self.rules {
            if !rule.matches(client) {
                continue;
            }

            // List overrides apply only within the matched rule's scope
            if let Some(whitelist) = &rule.whitelist {
                if whitelist.contains(client) {
                    tracing::debug!(rule = %rule.name, client = %client, "whitelist override");
                    return Decision {
                        verdict: Verdict::Allow,
                        force_close,
                    };
                }
            }

            if let Some(blacklist) = &rule.blacklist {
                if blacklist.contains(client) {
                    tracing::debug!(rule = %rule.name, client = %client, "blacklist override");
                    return Decision {
                        verdict: Verdict::Deny,
                        force_close,
                    };
                }
            }

            return Decision {
                verdict: rule.action.into(),
                force_close,
            };
        }

        Decision {
            verdict: self.default_action.into(),
            force_close,
        }
    }

    /// Reload every rule's list files. A file that fails to load keeps its
    /// previous snapshot; the proxy never loses policy mid-flight because
    /// an operator saved a half-edited file.
    pub fn reload_lists(&self) {
        for rule in &self.rules {
            for list in [&rule.whitelist, &rule.blacklist].into_iter().flatten() {
                match list.reload() {
                    Ok(count) => {
                        tracing::info!(
                            rule = %rule.name,
                            path = %list.path().display(),
                            entries = count,
                            "list reloaded"
                        );
                    }
                    Err(e) => {
                        tracing::warn!(
                            rule = %rule.name,
                            path = %list.path().display(),
                            "list reload failed, keeping previous snapshot: {}",
                            e
                        );
                    }
                }
            }
        }
    }

    fn special_host(&self, dest_host: &str) -> Option<&SpecialHost> {
        self.special_hosts.iter().find(|s| s.host == dest_host)
    }
}
