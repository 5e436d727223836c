//! Bidirectional byte pump between a client and its upstream.
//!
//! The two streams are treated as one session: end-of-stream on either side
//! ends the relay in both directions, and the idle counter is shared rather
//! than kept per direction. Steady traffic one way keeps the whole session
//! alive even if the other way is silent.

use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{sleep, timeout};

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct RelayOptions {
    pub buffer_size: usize,
    /// Empty poll cycles tolerated before giving up.
    pub idle_ticks: u32,
    pub tick_interval: Duration,
    /// Bound on each write to the opposite side.
    pub write_timeout: Duration,
}

/// Why a relay stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayEnd {
    ClientClosed,
    UpstreamClosed,
    IdleTimeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelaySummary {
    pub end: RelayEnd,
    pub client_to_upstream: u64,
    pub upstream_to_client: u64,
}

enum Ready {
    Client(io::Result<usize>),
    Upstream(io::Result<usize>),
    Tick,
}

/// Copies bytes between `client` and `upstream` until one closes, an I/O
/// error occurs, or no byte moves for `idle_ticks` consecutive cycles.
///
/// Neither stream is closed here; that is left to the caller.
pub async fn relay<C, U>(
    client: &mut C,
    upstream: &mut U,
    opts: &RelayOptions,
) -> Result<RelaySummary>
where
    C: AsyncRead + AsyncWrite + Unpin,
    U: AsyncRead + AsyncWrite + Unpin,
{
    let mut client_buf = vec![0u8; opts.buffer_size];
    let mut upstream_buf = vec![0u8; opts.buffer_size];

    let mut client_to_upstream = 0u64;
    let mut upstream_to_client = 0u64;
    let mut idle = 0u32;

    let summary = |end, c2u, u2c| RelaySummary {
        end,
        client_to_upstream: c2u,
        upstream_to_client: u2c,
    };

    loop {
        idle += 1;
        if idle > opts.idle_ticks {
            return Ok(summary(RelayEnd::IdleTimeout, client_to_upstream, upstream_to_client));
        }

        // read() is cancel safe: a branch that loses the race has consumed nothing.
        let ready = tokio::select! {
            r = client.read(&mut client_buf) => Ready::Client(r),
            r = upstream.read(&mut upstream_buf) => Ready::Upstream(r),
            _ = sleep(opts.tick_interval) => Ready::Tick,
        };

        match ready {
            Ready::Tick => {}
            Ready::Client(r) => {
                let n = r?;
                if n == 0 {
                    return Ok(summary(
                        RelayEnd::ClientClosed,
                        client_to_upstream,
                        upstream_to_client,
                    ));
                }
                write_with_timeout(upstream, &client_buf[..n], opts.write_timeout).await?;
                client_to_upstream += n as u64;
                idle = 0;
            }
            Ready::Upstream(r) => {
                let n = r?;
                if n == 0 {
                    return Ok(summary(
                        RelayEnd::UpstreamClosed,
                        client_to_upstream,
                        upstream_to_client,
                    ));
                }
                write_with_timeout(client, &upstream_buf[..n], opts.write_timeout).await?;
                upstream_to_client += n as u64;
                idle = 0;
            }
        }
    }
}

pub(crate) async fn write_with_timeout<W>(
    writer: &mut W,
    data: &[u8],
    limit: Duration,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let write = async {
        writer.write_all(data).await?;
        writer.flush().await
    };

    match timeout(limit, write).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "relay write timed out")),
    }
}
