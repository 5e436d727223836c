//! Error types for surge-proxy

use thiserror::Error;

/// Failure of a single connection or of startup.
///
/// Peer close and idle timeout are not errors; the relay reports them as
/// [`RelayEnd`](crate::relay::RelayEnd) values.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Unparsable request line or port
    #[error("malformed request: {0}")]
    MalformedRequest(String),

    /// No Host header and no CONNECT target
    #[error("request carries no target host")]
    MissingHost,

    /// Dial refused, failed to resolve, or timed out
    #[error("upstream {target} unreachable: {source}")]
    UpstreamUnreachable {
        target: String,
        #[source]
        source: std::io::Error,
    },

    /// Any other read/write failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or unreadable configuration
    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for ProxyError
pub type Result<T> = std::result::Result<T, ProxyError>;

impl From<serde_json::Error> for ProxyError {
    fn from(err: serde_json::Error) -> Self {
        ProxyError::Config(err.to_string())
    }
}
