//! Whitelist/blacklist file loading with atomic reload
//!
//! A list file holds one IPv4/IPv6 address or CIDR per line. Blank lines and
//! `#` comments (full-line or trailing) are ignored. The parsed set lives
//! behind an `ArcSwap` so a reload publishes a complete snapshot wholesale;
//! decisions running against the previous snapshot are never torn.

use crate::error::{ProxyError, Result};
use arc_swap::ArcSwap;
use ipnet::IpNet;
use std::collections::HashSet;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// An immutable set of addresses and CIDR blocks
#[derive(Debug, Default)]
pub struct ListSet {
    addrs: HashSet<IpAddr>,
    nets: Vec<IpNet>,
}

impl ListSet {
    /// Parse list file contents. An unparsable entry rejects the whole
    /// input; the error names the offending line.
    pub fn parse(contents: &str) -> std::result::Result<Self, String> {
        let mut addrs = HashSet::new();
        let mut nets = Vec::new();

        for (lineno, raw) in contents.lines().enumerate() {
            let line = raw.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            if let Ok(addr) = line.parse::<IpAddr>() {
                addrs.insert(addr);
            } else if let Ok(net) = line.parse::<IpNet>() {
                nets.push(net);
            } else {
                return Err(format!("line {}: invalid entry '{}'", lineno + 1, line));
            }
        }

        Ok(Self { addrs, nets })
    }

    /// Exact-address or address-in-CIDR membership
    pub fn contains(&self, addr: IpAddr) -> bool {
        self.addrs.contains(&addr) || self.nets.iter().any(|net| net.contains(&addr))
    }

    pub fn len(&self) -> usize {
        self.addrs.len() + self.nets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty() && self.nets.is_empty()
    }
}

/// A list file bound to its path, holding the current snapshot.
///
/// `contains` reads whichever snapshot is current; `reload` swaps in a new
/// one atomically and leaves the old snapshot in place on failure.
#[derive(Debug)]
pub struct ListFile {
    path: PathBuf,
    entries: ArcSwap<ListSet>,
}

impl ListFile {
    /// Load a list file. Unreadable files and unparsable entries are fatal
    /// here; at startup a typo must not silently change policy.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let set = Self::read(&path)?;

        Ok(Self {
            path,
            entries: ArcSwap::from_pointee(set),
        })
    }

    fn read(path: &Path) -> Result<ListSet> {
        let contents = fs::read_to_string(path).map_err(|e| ProxyError::ListLoad {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        ListSet::parse(&contents).map_err(|reason| ProxyError::ListLoad {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Re-read the file and swap in the new snapshot. On failure the
    /// previous snapshot stays active and the error is returned to the
    /// caller to log.
    pub fn reload(&self) -> Result<usize> {
        let set = Self::read(&self.path)?;
        let count = set.len();
        self.entries.store(Arc::new(set));
        Ok(count)
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        self.entries.load().contains(addr)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}
