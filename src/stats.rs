use std::sync::atomic::{AtomicU64, Ordering};

use tracing::info;

/// Process-wide counters, updated lock-free by every connection task.
#[derive(Debug, Default)]
pub struct Stats {
    pub total: AtomicU64,
    pub active: AtomicU64,
    pub blocked: AtomicU64,
    pub direct: AtomicU64,
    pub failed: AtomicU64,
    /// Upstream to client.
    pub bytes_in: AtomicU64,
    /// Client to upstream.
    pub bytes_out: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub total: u64,
    pub active: u64,
    pub blocked: u64,
    pub direct: u64,
    pub failed: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            total: self.total.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            direct: self.direct.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            bytes_in: self.bytes_in.load(Ordering::Relaxed),
            bytes_out: self.bytes_out.load(Ordering::Relaxed),
        }
    }

    pub fn print(&self) {
        let s = self.snapshot();
        info!(
            "total={} active={} blocked={} direct={} failed={} in={}MB out={}MB",
            s.total,
            s.active,
            s.blocked,
            s.direct,
            s.failed,
            s.bytes_in / 1_000_000,
            s.bytes_out / 1_000_000,
        );
    }
}
