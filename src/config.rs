//! Client configuration.
//!
//! An [`Endpoint`] accepts the forms servers are usually written in:
//!
//! - `db.example.com` or `10.0.0.7`: default port [`DEFAULT_PORT`].
//! - `db.example.com:4000`, `10.0.0.7:4000`.
//! - `[::1]:4000`, or a bare IPv6 literal such as `::1`.
use std::{
    fmt,
    net::{IpAddr, SocketAddr, ToSocketAddrs},
    str::FromStr,
};

use thiserror::Error;

use crate::protocol::channel::DEFAULT_MAX_MESSAGE_SIZE;

pub const DEFAULT_PORT: u16 = 3883;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid endpoint '{0}'")]
    InvalidEndpoint(String),

    #[error("failed to resolve '{endpoint}': {source}")]
    Resolve {
        endpoint: String,
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Every address the host resolves to, in resolver order.
    pub fn resolve(&self) -> Result<Vec<SocketAddr>, ConfigError> {
        let resolve_err = |source| ConfigError::Resolve {
            endpoint: self.to_string(),
            source,
        };
        let addrs: Vec<_> = (self.host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(resolve_err)?
            .collect();
        if addrs.is_empty() {
            return Err(resolve_err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                "no addresses",
            )));
        }
        Ok(addrs)
    }
}

impl From<SocketAddr> for Endpoint {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr.ip().to_string(), addr.port())
    }
}

impl FromStr for Endpoint {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::InvalidEndpoint(s.to_string());
        let s = s.trim();

        if let Some(rest) = s.strip_prefix('[') {
            let (host, rest) = rest.split_once(']').ok_or_else(invalid)?;
            let port = match rest {
                "" => DEFAULT_PORT,
                _ => rest
                    .strip_prefix(':')
                    .and_then(|p| p.parse().ok())
                    .ok_or_else(invalid)?,
            };
            host.parse::<IpAddr>().map_err(|_| invalid())?;
            return Ok(Self::new(host, port));
        }
        if s.parse::<IpAddr>().is_ok() {
            return Ok(Self::new(s, DEFAULT_PORT));
        }

        let (host, port) = match s.rsplit_once(':') {
            Some((host, port)) => (host, port.parse().map_err(|_| invalid())?),
            None => (s, DEFAULT_PORT),
        };
        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(invalid());
        }
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub endpoint: Endpoint,
    /// Largest frame accepted from the server.
    pub max_message_size: usize,
}

impl ClientConfig {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }

    pub fn with_max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }
}
