//! # surge-proxy
//!
//! A forward proxy for plain HTTP and CONNECT tunnels. Each client
//! connection is parsed once, checked against the blocked-domain list,
//! dialed to its upstream and then relayed byte for byte until either side
//! closes or the session goes idle.

pub mod config;
pub mod dial;
pub mod error;
pub mod handler;
pub mod relay;
pub mod request;
pub mod rules;
pub mod server;
pub mod stats;

#[cfg(test)]
mod tests;

pub use config::{ProxyConfig, SharedConfig};
pub use error::{ProxyError, Result};
pub use handler::{handle_connection, SessionOutcome};
pub use relay::{relay, RelayEnd, RelayOptions, RelaySummary};
pub use request::{Authority, ClientRequest};
pub use rules::{DomainRules, Route};
pub use server::{ProxyServer, ShutdownHandle};
pub use stats::Stats;
