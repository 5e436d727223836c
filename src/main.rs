#![warn(clippy::all)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use surge_proxy::config::DEFAULT_CONFIG_PATH;
use surge_proxy::{ProxyConfig, ProxyServer, SharedConfig, Stats};

// ============================================================================
// CLI ARGUMENTS
// ============================================================================

#[derive(Parser, Debug, Clone)]
#[command(author, version, about)]
struct Args {
    /// JSON configuration file; defaults apply when it does not exist
    #[arg(long, short = 'c', default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Overrides `host` from the configuration file
    #[arg(long)]
    host: Option<String>,

    /// Overrides `port` from the configuration file
    #[arg(long)]
    port: Option<u16>,

    /// Extra blocked-domain patterns, one per line (repeatable)
    #[arg(long)]
    blocklist: Vec<PathBuf>,

    #[arg(long)]
    stats_interval: Option<u64>,

    #[arg(long, short = 'q')]
    quiet: bool,

    #[arg(long, short = 'v')]
    verbose: bool,

    #[arg(long, default_value = "info")]
    log_level: String,
}

// ============================================================================
// MAIN
// ============================================================================

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_level = if args.quiet {
        "error"
    } else if args.verbose {
        "debug"
    } else {
        &args.log_level
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_target(false)
        .compact()
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get() * 2)
        .enable_all()
        .build()?;

    runtime.block_on(run(args))
}

/// Builds the effective configuration: file, then CLI overrides, then blocklists.
fn load_config(args: &Args) -> anyhow::Result<ProxyConfig> {
    let mut config = ProxyConfig::load(&args.config)
        .with_context(|| format!("Failed to load config {:?}", args.config))?;

    if let Some(ref host) = args.host {
        config.host = host.clone();
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(interval) = args.stats_interval {
        config.stats_interval = interval;
    }

    for path in &args.blocklist {
        config
            .domains
            .load_blocklist(path)
            .with_context(|| format!("Failed to load blocklist {:?}", path))?;
    }

    Ok(config)
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args)?;

    info!(
        "{} blocked domains, {} direct domains, {} routing rules",
        config.domains.blocked_domains.len(),
        config.domains.direct_domains.len(),
        config.rules.len()
    );

    let stats_interval = config.stats_interval;
    let shutdown_deadline = config.shutdown_deadline();
    let listen_addr = config.listen_addr();
    let shared = SharedConfig::new(config);
    let stats = Arc::new(Stats::new());

    if stats_interval > 0 {
        let stats_clone = stats.clone();
        tokio::spawn(async move {
            let mut timer = tokio::time::interval(Duration::from_secs(stats_interval));
            loop {
                timer.tick().await;
                stats_clone.print();
            }
        });
    }

    #[cfg(unix)]
    spawn_reload_on_hangup(args.clone(), shared.clone())?;

    let server = ProxyServer::bind(shared, stats)
        .await
        .with_context(|| format!("Failed to bind {}", listen_addr))?;

    let handle = server.shutdown_handle();

    tokio::select! {
        _ = server.serve() => {}
        signal = shutdown_signal() => {
            signal?;
            info!("Shutdown signal received");
        }
    }

    handle.shutdown(shutdown_deadline).await;
    Ok(())
}

// ============================================================================
// SIGNALS
// ============================================================================

/// Resolves on Ctrl-C or SIGTERM.
#[cfg(unix)]
async fn shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r,
        _ = terminate.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}

// ============================================================================
// RELOAD
// ============================================================================

/// Swaps in a freshly loaded configuration on SIGHUP. Open sessions keep
/// the snapshot they started with; the listen address is not rebound.
#[cfg(unix)]
fn spawn_reload_on_hangup(args: Args, shared: SharedConfig) -> anyhow::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup())?;

    tokio::spawn(async move {
        while hangup.recv().await.is_some() {
            match load_config(&args) {
                Ok(config) => {
                    shared.replace(config);
                    info!("Configuration reloaded from {:?}", args.config);
                }
                Err(e) => error!("Reload failed, keeping previous configuration: {:#}", e),
            }
        }
    });

    Ok(())
}
