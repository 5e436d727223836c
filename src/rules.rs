use serde::Deserialize;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use crate::error::{ProxyError, Result};

const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;
const MAX_PATTERNS: usize = 1_000_000;
const BUFFER_SIZE: usize = 64 * 1024;

/// What the rule set says about a target host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Refuse with a 403, never dial.
    Blocked,
    /// Matched a direct-domain pattern. Dialed the same way as `Proxy`.
    Direct,
    Proxy,
}

/// Blocked and direct domain patterns.
///
/// Matching is plain, case-sensitive substring containment: `ads` blocks
/// `ads.example.com` and also `downloads.example.com`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DomainRules {
    #[serde(default)]
    pub blocked_domains: Vec<String>,
    #[serde(default)]
    pub direct_domains: Vec<String>,
}

impl DomainRules {
    pub fn new(blocked_domains: Vec<String>, direct_domains: Vec<String>) -> Self {
        Self {
            blocked_domains,
            direct_domains,
        }
    }

    pub fn is_blocked(&self, host: &str) -> bool {
        contains_any(host, &self.blocked_domains)
    }

    pub fn should_proxy(&self, host: &str) -> bool {
        !contains_any(host, &self.direct_domains)
    }

    pub fn route(&self, host: &str) -> Route {
        if self.is_blocked(host) {
            Route::Blocked
        } else if !self.should_proxy(host) {
            Route::Direct
        } else {
            Route::Proxy
        }
    }

    /// Appends every pattern in a blocklist file and returns how many were added.
    pub fn load_blocklist(&mut self, path: impl AsRef<Path>) -> Result<usize> {
        let patterns = load_patterns(path.as_ref())?;
        let count = patterns.len();
        self.blocked_domains.extend(patterns);
        Ok(count)
    }
}

// An empty pattern is a substring of everything; it never matches here.
fn contains_any(host: &str, patterns: &[String]) -> bool {
    if host.is_empty() {
        return false;
    }
    patterns
        .iter()
        .any(|p| !p.is_empty() && host.contains(p.as_str()))
}

fn load_patterns(path: &Path) -> Result<Vec<String>> {
    let metadata = std::fs::metadata(path).map_err(|e| {
        ProxyError::Config(format!("failed to stat blocklist {}: {}", path.display(), e))
    })?;

    if metadata.len() > MAX_FILE_SIZE {
        return Err(ProxyError::Config(format!(
            "blocklist {} too large",
            path.display()
        )));
    }

    let file = File::open(path).map_err(|e| {
        ProxyError::Config(format!("failed to open blocklist {}: {}", path.display(), e))
    })?;
    let reader = BufReader::with_capacity(BUFFER_SIZE, file);

    let mut patterns = Vec::new();
    let mut raw_count = 0;

    for line in reader.lines() {
        let line = line.map_err(|e| {
            ProxyError::Config(format!("failed to read blocklist {}: {}", path.display(), e))
        })?;
        raw_count += 1;

        if let Some(pattern) = parse_pattern_line(&line) {
            patterns.push(pattern.to_string());
        }

        if patterns.len() > MAX_PATTERNS {
            return Err(ProxyError::Config(format!(
                "too many patterns in {}",
                path.display()
            )));
        }
    }

    tracing::info!(
        "Loaded blocklist {}: {} patterns from {} lines",
        path.display(),
        patterns.len(),
        raw_count
    );

    Ok(patterns)
}

fn parse_pattern_line(line: &str) -> Option<&str> {
    let line = line.trim();

    if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
        return None;
    }

    line.split_whitespace().next()
}
