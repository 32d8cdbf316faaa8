use std::{borrow::Cow, fmt, str::FromStr};

use crate::transport::TransportError;

pub const DEFAULT_GATE: &str = "/gate.php";
const SCHEME: &str = "http://";
const DEFAULT_HTTP_PORT: u16 = 80;

/// Where a client finds the gate: `http://host[:port]/path`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
    path: String,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16, path: impl Into<String>) -> Self {
        let path = path.into();
        let path = if path.starts_with('/') {
            path
        } else {
            format!("/{path}")
        };
        let host = host.into();
        let host = match host.strip_prefix('[').and_then(|h| h.strip_suffix(']')) {
            Some(bare) => bare.to_string(),
            None => host,
        };
        Self { host, port, path }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// `host:port`, always with the port, for dialing. IPv6 hosts are
    /// bracketed.
    pub fn authority(&self) -> String {
        format!("{}:{}", self.bracketed_host(), self.port)
    }

    fn bracketed_host(&self) -> Cow<'_, str> {
        if self.host.contains(':') {
            Cow::Owned(format!("[{}]", self.host))
        } else {
            Cow::Borrowed(&self.host)
        }
    }

    pub fn url(&self) -> String {
        self.to_string()
    }

    pub fn parse(url: &str) -> Result<Self, TransportError> {
        let invalid = |reason: &str| TransportError::InvalidEndpoint {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let rest = url
            .strip_prefix(SCHEME)
            .ok_or_else(|| invalid("only http:// endpoints are supported"))?;
        let (authority, path) = match rest.find('/') {
            Some(index) => rest.split_at(index),
            None => (rest, "/"),
        };

        let (host, port) = match authority.strip_prefix('[') {
            Some(bracketed) => {
                let (host, rest) = bracketed
                    .split_once(']')
                    .ok_or_else(|| invalid("unterminated IPv6 host"))?;
                match rest {
                    "" => (host, DEFAULT_HTTP_PORT),
                    _ => {
                        let port = rest
                            .strip_prefix(':')
                            .ok_or_else(|| invalid("unexpected text after IPv6 host"))?;
                        (host, port.parse().map_err(|_| invalid("port is not a number"))?)
                    }
                }
            }
            None => match authority.rsplit_once(':') {
                Some((host, port)) => {
                    let port = port.parse().map_err(|_| invalid("port is not a number"))?;
                    (host, port)
                }
                None => (authority, DEFAULT_HTTP_PORT),
            },
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        Ok(Self::new(host, port, path))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.port == DEFAULT_HTTP_PORT {
            write!(f, "{SCHEME}{}{}", self.bracketed_host(), self.path)
        } else {
            write!(f, "{SCHEME}{}{}", self.authority(), self.path)
        }
    }
}

impl FromStr for Endpoint {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
