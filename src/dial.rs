use std::io::{Error as IoError, ErrorKind};
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{ProxyError, Result};
use crate::request::Authority;

/// Opens one outbound connection to `target`. No retries.
///
/// Resolution and connection share the same deadline.
pub async fn dial(target: &Authority, connect_timeout: Duration) -> Result<TcpStream> {
    let connect_future = TcpStream::connect((target.host.as_str(), target.port));

    let stream = match timeout(connect_timeout, connect_future).await {
        Ok(Ok(s)) => s,
        Ok(Err(e)) => {
            debug!("Upstream connect failed {}: {}", target, e);
            return Err(ProxyError::UpstreamUnreachable {
                target: target.to_string(),
                source: e,
            });
        }
        Err(_) => {
            debug!("Upstream timeout {}", target);
            return Err(ProxyError::UpstreamUnreachable {
                target: target.to_string(),
                source: IoError::new(ErrorKind::TimedOut, "connect timed out"),
            });
        }
    };

    let _ = stream.set_nodelay(true);

    Ok(stream)
}
