use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{lookup_host, TcpListener};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::SharedConfig;
use crate::error::{ProxyError, Result};
use crate::handler::handle_connection;
use crate::stats::Stats;

const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Accepts client connections and runs each one on its own task.
pub struct ProxyServer {
    listener: TcpListener,
    config: SharedConfig,
    stats: Arc<Stats>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ProxyServer {
    /// Binds the listen socket described by the current configuration.
    pub async fn bind(config: SharedConfig, stats: Arc<Stats>) -> Result<Self> {
        let snapshot = config.snapshot();
        let listen_addr = snapshot.listen_addr();

        let addr = lookup_host(listen_addr.as_str()).await?.next().ok_or_else(|| {
            ProxyError::Config(format!("listen address {} did not resolve", listen_addr))
        })?;

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(i32::try_from(snapshot.backlog).unwrap_or(i32::MAX))?;

        let listener = TcpListener::from_std(socket.into())?;

        info!("Proxy listening on http://{}", listener.local_addr()?);

        Ok(Self {
            listener,
            config,
            stats,
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            shutdown: self.shutdown.clone(),
            tasks: self.tasks.clone(),
        }
    }

    /// Runs the accept loop until shutdown is requested, then closes the
    /// listen socket. Per-connection failures never reach it.
    pub async fn serve(self) {
        loop {
            let accepted = tokio::select! {
                accepted = self.listener.accept() => accepted,
                _ = self.shutdown.cancelled() => {
                    debug!("Accept loop stopped");
                    break;
                }
            };

            let (client_stream, client_addr) = match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    continue;
                }
            };

            let config = self.config.snapshot();
            let stats = self.stats.clone();

            stats.total.fetch_add(1, Ordering::Relaxed);
            stats.active.fetch_add(1, Ordering::Relaxed);

            self.tasks.spawn(async move {
                match handle_connection(client_stream, client_addr, config, stats.clone()).await {
                    Ok(outcome) => {
                        debug!("Connection from {} finished: {:?}", client_addr, outcome)
                    }
                    Err(e) => {
                        debug!("Connection error from {}: {}", client_addr, e);
                        stats.failed.fetch_add(1, Ordering::Relaxed);
                    }
                }

                stats.active.fetch_sub(1, Ordering::Relaxed);
            });
        }
    }
}

/// Stops a running [`ProxyServer`] from outside its accept loop.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ShutdownHandle {
    /// Stops accepting and waits up to `deadline` for open sessions to end
    /// on their own. Returns `false` if some were still running.
    ///
    /// Sessions are not cancelled here; whatever is left is torn down when
    /// the runtime exits.
    pub async fn shutdown(&self, deadline: Duration) -> bool {
        self.shutdown.cancel();
        self.tasks.close();
        info!("Shutting down ({} open sessions)", self.tasks.len());

        match timeout(deadline, self.tasks.wait()).await {
            Ok(()) => {
                info!("All sessions closed");
                true
            }
            Err(_) => {
                warn!(
                    "{} sessions still open after {:?}, forcing exit",
                    self.tasks.len(),
                    deadline
                );
                false
            }
        }
    }
}
