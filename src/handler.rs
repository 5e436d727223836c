//! Per-connection state machine.
//!
//! `Received -> Parsed -> {Blocked | Dialed} -> Relaying -> Closed`. Every
//! path, including every error, ends with both sockets shut down.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info};

use crate::config::ProxyConfig;
use crate::dial::dial;
use crate::error::Result;
use crate::relay::{relay, write_with_timeout, RelaySummary};
use crate::request::ClientRequest;
use crate::rules::Route;
use crate::stats::Stats;

// ============================================================================
// STATIC RESPONSES
// ============================================================================

pub const RESPONSE_403: &[u8] = b"HTTP/1.1 403 Forbidden\r\n\r\n";
pub const RESPONSE_200_CONNECT: &[u8] = b"HTTP/1.1 200 Connection Established\r\n\r\n";

/// Which terminal path a connection took, when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// The client closed or stayed silent before sending a request.
    ClientGone,
    /// The target matched a blocked domain and got a 403.
    Blocked,
    Relayed(RelaySummary),
}

/// Serves one accepted client connection to completion.
///
/// Parse and dial failures are returned as errors without writing anything
/// to the client; the client only sees its connection close.
pub async fn handle_connection(
    mut client: TcpStream,
    client_addr: SocketAddr,
    config: Arc<ProxyConfig>,
    stats: Arc<Stats>,
) -> Result<SessionOutcome> {
    let _ = client.set_nodelay(true);

    let result = serve(&mut client, client_addr, &config, &stats).await;

    // Closed
    let _ = client.shutdown().await;

    result
}

async fn serve(
    client: &mut TcpStream,
    client_addr: SocketAddr,
    config: &ProxyConfig,
    stats: &Stats,
) -> Result<SessionOutcome> {
    let io_timeout = config.io_timeout();

    // Received
    let mut buf = vec![0u8; config.buffer_size];
    let n = match timeout(io_timeout, client.read(&mut buf)).await {
        Ok(Ok(0)) => return Ok(SessionOutcome::ClientGone),
        Ok(Ok(n)) => n,
        Ok(Err(e)) => {
            debug!("Read error from {}: {}", client_addr, e);
            return Err(e.into());
        }
        Err(_) => {
            debug!("Read timeout from {}", client_addr);
            return Ok(SessionOutcome::ClientGone);
        }
    };
    let initial = &buf[..n];

    // Parsed
    let request = ClientRequest::parse(initial).inspect_err(|e| {
        debug!("Unparsable request from {}: {}", client_addr, e);
    })?;
    let target = request.target();

    match config.domains.route(&target.host) {
        Route::Blocked => {
            stats.blocked.fetch_add(1, Ordering::Relaxed);
            info!("Blocked {} {} from {}", request.method(), target, client_addr);
            write_with_timeout(client, RESPONSE_403, io_timeout).await?;
            return Ok(SessionOutcome::Blocked);
        }
        Route::Direct => {
            stats.direct.fetch_add(1, Ordering::Relaxed);
            debug!("Direct domain matched for {}", target.host);
        }
        Route::Proxy => {}
    }

    // Dialed
    let mut upstream = dial(target, io_timeout).await?;

    match &request {
        ClientRequest::Connect { target } => {
            info!("CONNECT: {}", target);
            write_with_timeout(client, RESPONSE_200_CONNECT, io_timeout).await?;
        }
        ClientRequest::Forward { method, target } => {
            info!("HTTP: {} {}", method, target);
            write_with_timeout(&mut upstream, initial, io_timeout).await?;
        }
    }

    // Relaying
    let relayed = relay(client, &mut upstream, &config.relay_options()).await;
    let _ = upstream.shutdown().await;
    let summary = relayed?;

    stats
        .bytes_out
        .fetch_add(summary.client_to_upstream, Ordering::Relaxed);
    stats
        .bytes_in
        .fetch_add(summary.upstream_to_client, Ordering::Relaxed);

    debug!(
        "Session {} -> {} ended: {:?} (out={} in={})",
        client_addr, target, summary.end, summary.client_to_upstream, summary.upstream_to_client
    );

    Ok(SessionOutcome::Relayed(summary))
}
