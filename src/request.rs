use std::fmt;

use crate::error::{ProxyError, Result};

pub const DEFAULT_HTTP_PORT: u16 = 80;
pub const DEFAULT_CONNECT_PORT: u16 = 443;

/// Target host and port of a client request.
///
/// The host is kept as written; name resolution happens at dial time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authority {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl Authority {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parses `host[:port]`, using `default_port` when no port is given.
    pub fn parse(s: &str, default_port: u16) -> Result<Self> {
        let s = s.trim();

        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, after) = rest.split_once(']').ok_or_else(|| {
                ProxyError::MalformedRequest(format!("unterminated IPv6 literal in {:?}", s))
            })?;
            let port = match after {
                "" => default_port,
                _ => match after.strip_prefix(':') {
                    Some(p) => parse_port(p)?,
                    None => {
                        return Err(ProxyError::MalformedRequest(format!(
                            "unexpected text after IPv6 literal in {:?}",
                            s
                        )))
                    }
                },
            };
            (host, port)
        } else {
            match s.rsplit_once(':') {
                Some((host, port)) => (host, parse_port(port)?),
                None => (s, default_port),
            }
        };

        if host.is_empty() {
            return Err(ProxyError::MissingHost);
        }

        Ok(Self::new(host, port))
    }
}

fn parse_port(s: &str) -> Result<u16> {
    s.parse::<u16>()
        .map_err(|_| ProxyError::MalformedRequest(format!("invalid port {:?}", s)))
}

/// A client's opening request, classified once by method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientRequest {
    /// `CONNECT host[:port]`: the envelope is consumed, later bytes are tunneled.
    Connect { target: Authority },
    /// Any other method: the raw request is replayed to `target` unchanged.
    Forward { method: String, target: Authority },
}

impl ClientRequest {
    /// Parses the request line and, for non-CONNECT methods, the `Host:` header.
    pub fn parse(buf: &[u8]) -> Result<Self> {
        let text = String::from_utf8_lossy(buf);
        let mut lines = text.lines();

        let first = lines
            .next()
            .ok_or_else(|| ProxyError::MalformedRequest("empty request".into()))?;
        let mut parts = first.split_whitespace();
        let method = parts
            .next()
            .ok_or_else(|| ProxyError::MalformedRequest("empty request line".into()))?;

        if method == "CONNECT" {
            let target = parts.next().ok_or_else(|| {
                ProxyError::MalformedRequest("CONNECT request line has no target".into())
            })?;
            return Ok(Self::Connect {
                target: Authority::parse(target, DEFAULT_CONNECT_PORT)?,
            });
        }

        for line in lines {
            // end of the header block
            if line.is_empty() {
                break;
            }
            if let Some(value) = line.strip_prefix("Host:") {
                return Ok(Self::Forward {
                    method: method.to_string(),
                    target: Authority::parse(value, DEFAULT_HTTP_PORT)?,
                });
            }
        }

        Err(ProxyError::MissingHost)
    }

    pub fn method(&self) -> &str {
        match self {
            Self::Connect { .. } => "CONNECT",
            Self::Forward { method, .. } => method,
        }
    }

    pub fn target(&self) -> &Authority {
        match self {
            Self::Connect { target } | Self::Forward { target, .. } => target,
        }
    }

    pub fn is_connect(&self) -> bool {
        matches!(self, Self::Connect { .. })
    }
}
