//! Portmux configuration.
//!
//! Startup settings come from the environment. Routes and detectors come from
//! a JSON file named by `PORTMUX_ROUTES_FILE`, read once before the listener
//! is bound. Any invalid entry aborts startup.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::proxy::{
    DetectorConfig, Endpoint, ProtocolDetector, Route, RouteTable, ServerConfig,
    SignatureMatcher, SignatureRule,
};

/// Portmux configuration (env-driven).
#[derive(Debug, Clone)]
pub struct Config {
    /// Listen socket address.
    pub listen_addr: SocketAddr,

    /// JSON route/detector file.
    pub routes_file: PathBuf,

    /// Maximum concurrent sessions.
    pub max_connections: usize,

    /// Detection byte budget.
    pub detect_max_bytes: usize,

    /// Detection deadline.
    pub detect_timeout: Duration,

    /// Dial timeout for routes without their own.
    pub dial_timeout: Duration,

    /// Joint idle timeout for piping. `None` disables it.
    pub idle_timeout: Option<Duration>,

    /// Silence allowed on the surviving direction after one side's EOF.
    pub half_close_linger: Duration,

    /// How long shutdown waits for live sessions.
    pub shutdown_grace: Duration,

    /// Interval of the periodic stats log. `None` disables it.
    pub stats_interval: Option<Duration>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let listen_addr: SocketAddr = lookup("PORTMUX_LISTEN_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8000".to_string())
            .parse()
            .context("PORTMUX_LISTEN_ADDR must be a socket address (example: 0.0.0.0:8000).")?;

        let routes_file = lookup("PORTMUX_ROUTES_FILE")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from)
            .context("Missing route file. Set PORTMUX_ROUTES_FILE.")?;

        let max_connections: usize = parse_var(&lookup, "PORTMUX_MAX_CONNECTIONS")?
            .unwrap_or(10_000)
            .max(1);

        let detect_max_bytes: usize = parse_var(&lookup, "PORTMUX_DETECT_MAX_BYTES")?
            .unwrap_or(8192)
            .max(1);

        let detect_timeout_ms: u64 = parse_var(&lookup, "PORTMUX_DETECT_TIMEOUT_MS")?
            .unwrap_or(1000)
            .max(1);

        let dial_timeout_ms: u64 = parse_var(&lookup, "PORTMUX_DIAL_TIMEOUT_MS")?
            .unwrap_or(2000)
            .max(1);

        let idle_timeout_ms: u64 =
            parse_var(&lookup, "PORTMUX_IDLE_TIMEOUT_MS")?.unwrap_or(300_000);

        let half_close_linger_ms: u64 =
            parse_var(&lookup, "PORTMUX_HALF_CLOSE_LINGER_MS")?.unwrap_or(500);

        let shutdown_grace_ms: u64 =
            parse_var(&lookup, "PORTMUX_SHUTDOWN_GRACE_MS")?.unwrap_or(10_000);

        let stats_interval_ms: u64 =
            parse_var(&lookup, "PORTMUX_STATS_INTERVAL_MS")?.unwrap_or(60_000);

        let log_level = lookup("PORTMUX_LOG_LEVEL").unwrap_or_else(|| "info".to_string());

        Ok(Self {
            listen_addr,
            routes_file,
            max_connections,
            detect_max_bytes,
            detect_timeout: Duration::from_millis(detect_timeout_ms),
            dial_timeout: Duration::from_millis(dial_timeout_ms),
            idle_timeout: non_zero_millis(idle_timeout_ms),
            half_close_linger: Duration::from_millis(half_close_linger_ms),
            shutdown_grace: Duration::from_millis(shutdown_grace_ms),
            stats_interval: non_zero_millis(stats_interval_ms),
            log_level,
        })
    }

    /// Listener settings derived from this configuration.
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.listen_addr,
            max_connections: self.max_connections,
            idle_timeout: self.idle_timeout,
            half_close_linger: self.half_close_linger,
            dial_timeout: self.dial_timeout,
            shutdown_grace: self.shutdown_grace,
        }
    }

    /// Detection bounds derived from this configuration.
    pub fn detector_config(&self) -> DetectorConfig {
        DetectorConfig {
            timeout: self.detect_timeout,
            max_bytes: self.detect_max_bytes,
        }
    }
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    lookup(name)
        .map(|v| v.trim().parse::<T>())
        .transpose()
        .with_context(|| format!("{name} must be a non-negative integer."))
}

fn non_zero_millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

/// Route file contents.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    #[serde(default)]
    pub routes: Vec<RouteSpec>,

    /// Ordered signature matchers. Derived from the routes when absent.
    #[serde(default)]
    pub detectors: Option<Vec<DetectorSpec>>,

    /// Protocol to route `Unknown` connections to.
    #[serde(default)]
    pub fallback_protocol: Option<String>,
}

/// One route entry. Every field is optional so that missing values surface
/// as `InvalidRoute` rather than as a parse error.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteSpec {
    pub protocol_name: Option<String>,
    pub destination_host: Option<String>,
    pub destination_port: Option<u16>,
    pub dial_timeout_ms: Option<u64>,
}

/// One signature matcher entry.
#[derive(Debug, Clone, Deserialize)]
pub struct DetectorSpec {
    pub protocol: String,
    #[serde(flatten)]
    pub rule: RuleSpec,
}

/// Signature rule, tagged by `rule`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "rule", rename_all = "lowercase")]
pub enum RuleSpec {
    Prefix { hex: String },
    Token { token: String },
    Http,
    Websocket,
    Tls,
    Mqtt,
}

impl RuleSpec {
    fn to_rule(&self, protocol: &str) -> Result<SignatureRule, ConfigError> {
        Ok(match self {
            RuleSpec::Prefix { hex: encoded } => {
                let magic = hex::decode(encoded.trim()).map_err(|e| ConfigError::InvalidDetector {
                    protocol: protocol.to_string(),
                    detail: format!("invalid hex prefix '{encoded}': {e}"),
                })?;
                SignatureRule::Prefix(magic)
            }
            RuleSpec::Token { token } => SignatureRule::Token(token.clone()),
            RuleSpec::Http => SignatureRule::Http,
            RuleSpec::Websocket => SignatureRule::WebSocket,
            RuleSpec::Tls => SignatureRule::Tls,
            RuleSpec::Mqtt => SignatureRule::Mqtt,
        })
    }
}

impl RoutingConfig {
    /// Read and parse a route file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Build the route table, rejecting the first invalid entry.
    pub fn route_table(&self) -> Result<RouteTable, ConfigError> {
        let mut table = RouteTable::new();
        for spec in &self.routes {
            table.add(spec.to_route()?);
        }
        Ok(table)
    }

    /// Build the detector, with matchers in file order.
    pub fn detector(&self, config: DetectorConfig) -> Result<ProtocolDetector, ConfigError> {
        let mut detector = ProtocolDetector::new(config);

        match &self.detectors {
            Some(specs) => {
                for spec in specs {
                    let rule = spec.rule.to_rule(&spec.protocol)?;
                    detector.register(SignatureMatcher::new(spec.protocol.as_str(), rule)?);
                }
            }
            None => {
                for matcher in self.builtin_matchers() {
                    detector.register(matcher);
                }
            }
        }

        if let Some(fallback) = self
            .fallback_protocol
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
        {
            if !self.routes.iter().any(|r| {
                r.protocol_name
                    .as_deref()
                    .is_some_and(|p| p.trim().eq_ignore_ascii_case(fallback))
            }) {
                warn!(fallback = %fallback, "Fallback protocol has no route");
            }
            detector = detector.with_fallback(fallback);
        }

        Ok(detector)
    }

    /// Built-in matchers for the routed protocols that have one, with
    /// `websocket` ahead of `http`.
    fn builtin_matchers(&self) -> Vec<SignatureMatcher> {
        let mut matchers: Vec<SignatureMatcher> = Vec::new();
        for name in self.routes.iter().filter_map(|r| r.protocol_name.as_deref()) {
            let Some(matcher) = SignatureMatcher::builtin(name) else {
                continue;
            };
            if matchers.iter().any(|m| m.protocol() == matcher.protocol()) {
                continue;
            }
            matchers.push(matcher);
        }

        let position = |name: &str| matchers.iter().position(|m| m.protocol() == name);
        if let (Some(http), Some(ws)) = (position("http"), position("websocket")) {
            if ws > http {
                let websocket = matchers.remove(ws);
                matchers.insert(http, websocket);
            }
        }

        debug!(
            matchers = ?matchers.iter().map(|m| m.protocol()).collect::<Vec<_>>(),
            "Derived detectors from routes"
        );
        matchers
    }
}

impl RouteSpec {
    fn to_route(&self) -> Result<Route, ConfigError> {
        let endpoint = match (&self.destination_host, self.destination_port) {
            (Some(host), Some(port)) => {
                let endpoint = Endpoint::new(host.as_str(), port)?;
                Some(match self.dial_timeout_ms {
                    Some(ms) if ms > 0 => endpoint.with_dial_timeout(Duration::from_millis(ms)),
                    _ => endpoint,
                })
            }
            _ => None,
        };
        Route::from_parts(self.protocol_name.as_deref(), endpoint)
    }
}
