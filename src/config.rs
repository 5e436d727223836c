//! Proxy configuration
//!
//! Loaded from a JSON document. Every key is optional; missing keys take
//! the defaults below.

use parking_lot::RwLock;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{ProxyError, Result};
use crate::relay::RelayOptions;
use crate::rules::DomainRules;

pub const DEFAULT_CONFIG_PATH: &str = "config.json";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    /// Bytes per socket read, both for the initial request and during relay.
    pub buffer_size: usize,
    /// Connect and I/O timeout in seconds.
    pub timeout: u64,
    #[serde(flatten)]
    pub domains: DomainRules,
    /// Routing rules are carried but not interpreted.
    pub rules: Vec<serde_json::Value>,
    /// Consecutive empty poll cycles before a relay is torn down.
    pub idle_ticks: u32,
    pub tick_interval_ms: u64,
    pub backlog: u32,
    /// Seconds between stats lines; 0 disables them.
    pub stats_interval: u64,
    /// Seconds open sessions get to finish after a shutdown signal.
    pub shutdown_timeout: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8888,
            buffer_size: 8192,
            timeout: 30,
            domains: DomainRules::default(),
            rules: Vec::new(),
            idle_ticks: 60,
            tick_interval_ms: 1000,
            backlog: 1024,
            stats_interval: 60,
            shutdown_timeout: 10,
        }
    }
}

impl ProxyConfig {
    /// Loads the configuration file, falling back to defaults when it does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            warn!("Config file {} not found, using defaults", path.display());
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(path).map_err(|e| {
            ProxyError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_json(&contents)?;
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(ProxyError::Config("buffer_size must be positive".into()));
        }
        if self.timeout == 0 {
            return Err(ProxyError::Config("timeout must be positive".into()));
        }
        if self.idle_ticks == 0 {
            return Err(ProxyError::Config("idle_ticks must be positive".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(ProxyError::Config("tick_interval_ms must be positive".into()));
        }
        if self.backlog == 0 {
            return Err(ProxyError::Config("backlog must be positive".into()));
        }
        Ok(())
    }

    pub fn io_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn relay_options(&self) -> RelayOptions {
        RelayOptions {
            buffer_size: self.buffer_size,
            idle_ticks: self.idle_ticks,
            tick_interval: Duration::from_millis(self.tick_interval_ms),
            write_timeout: self.io_timeout(),
        }
    }

    pub fn shutdown_deadline(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout)
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Configuration handle shared by the acceptor and the reload path.
///
/// Handlers never hold the lock: each one takes an `Arc` snapshot at
/// accept time, so a replacement only affects connections accepted later.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Arc<ProxyConfig>>>,
}

impl SharedConfig {
    pub fn new(config: ProxyConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn snapshot(&self) -> Arc<ProxyConfig> {
        self.inner.read().clone()
    }

    pub fn replace(&self, config: ProxyConfig) {
        *self.inner.write() = Arc::new(config);
    }
}
