//! Forward proxy with network access control
//!
//! Every inbound connection is evaluated against an ordered set of network
//! rules with whitelist/blacklist overrides, then rejected, tunneled, or
//! forwarded with bytes streamed under a timeout and size budget. One
//! field-filtered access record is written per connection.

pub mod accesslog;
pub mod config;
pub mod error;
pub mod filter;
pub mod proxy;

// Re-export commonly used types
pub use accesslog::{AccessLog, AccessRecord};
pub use config::{Config, ConfigLoader, ConfigValidator};
pub use error::{ProxyError, Result, ValidationError};
pub use filter::{Decision, ListFile, RuleEngine, Verdict};
pub use proxy::{ProxyServer, ProxyState};
