//! Backend endpoints.
//!
//! An endpoint is an immutable host:port destination with an optional dial
//! timeout. It is shared by reference across concurrent dial attempts.

use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{lookup_host, TcpStream};
use tokio::time::timeout;
use tracing::debug;

use crate::error::{ConfigError, ProxyError};

/// Default connect timeout for backend connections.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// An addressable backend destination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
    dial_timeout: Option<Duration>,
}

impl Endpoint {
    /// Create a new endpoint.
    ///
    /// Fails if the host is empty or the port is zero.
    pub fn new(host: impl Into<String>, port: u16) -> Result<Self, ConfigError> {
        let host = host.into();
        let trimmed = host.trim();

        if trimmed.is_empty() {
            return Err(ConfigError::InvalidEndpoint {
                host,
                port,
                detail: "host must not be empty".to_string(),
            });
        }

        if port == 0 {
            return Err(ConfigError::InvalidEndpoint {
                host,
                port,
                detail: "port must be between 1 and 65535".to_string(),
            });
        }

        Ok(Self {
            host: trimmed.to_string(),
            port,
            dial_timeout: None,
        })
    }

    /// Set a dial timeout that overrides the server default.
    pub fn with_dial_timeout(mut self, dial_timeout: Duration) -> Self {
        self.dial_timeout = Some(dial_timeout);
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn dial_timeout(&self) -> Option<Duration> {
        self.dial_timeout
    }

    /// Resolve the endpoint to a connectable address.
    ///
    /// `localhost` maps to the IPv4 loopback and `public` to the unspecified
    /// address without a DNS round trip.
    pub async fn resolve(&self) -> Result<SocketAddr, ProxyError> {
        if let Some(ip) = alias_ip(&self.host) {
            return Ok(SocketAddr::new(ip, self.port));
        }

        if let Ok(ip) = self.host.parse::<IpAddr>() {
            return Ok(SocketAddr::new(ip, self.port));
        }

        let mut addrs = lookup_host((self.host.as_str(), self.port))
            .await
            .map_err(|e| self.unreachable(e))?;

        addrs.next().ok_or_else(|| {
            self.unreachable(io::Error::new(
                io::ErrorKind::NotFound,
                "host resolved to no addresses",
            ))
        })
    }

    /// Resolve and connect, bounded by the endpoint's dial timeout or
    /// `default_timeout` when none is set.
    pub async fn connect(&self, default_timeout: Duration) -> Result<TcpStream, ProxyError> {
        let dial_timeout = self.dial_timeout.unwrap_or(default_timeout);

        let attempt = async {
            let addr = self.resolve().await?;
            TcpStream::connect(addr)
                .await
                .map_err(|e| self.unreachable(e))
        };

        match timeout(dial_timeout, attempt).await {
            Ok(Ok(stream)) => {
                let _ = stream.set_nodelay(true);
                debug!(endpoint = %self, "Connected to endpoint");
                Ok(stream)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(self.unreachable(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("dial timed out after {:?}", dial_timeout),
            ))),
        }
    }

    fn unreachable(&self, source: io::Error) -> ProxyError {
        ProxyError::EndpointUnreachable {
            endpoint: self.to_string(),
            source,
        }
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

fn alias_ip(host: &str) -> Option<IpAddr> {
    if host.eq_ignore_ascii_case("localhost") {
        Some(IpAddr::V4(Ipv4Addr::LOCALHOST))
    } else if host.eq_ignore_ascii_case("public") {
        Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
    } else {
        None
    }
}
