//! Connection acceptance, evaluation, and forwarding

pub mod forward;
pub mod handler;
pub mod http;
pub mod server;

pub use forward::{forward, FlowSummary, RelayOptions, RelayOutcome};
pub use handler::ProxyState;
pub use server::{spawn_list_reload, ProxyServer};
