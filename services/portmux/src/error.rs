//! Error types for portmux.
//!
//! Configuration errors are fatal at startup. Per-connection errors are
//! terminal for the affected session only: they are recorded as its
//! [`CloseReason`] and surface through stats and logs.

use std::fmt;
use std::io;
use std::path::PathBuf;

use serde::Serialize;
use thiserror::Error;

/// Startup configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Route is missing its protocol identifier or destination.
    #[error("invalid route: {0}")]
    InvalidRoute(String),

    /// Endpoint host or port is out of range.
    #[error("invalid endpoint {host}:{port}: {detail}")]
    InvalidEndpoint {
        host: String,
        port: u16,
        detail: String,
    },

    /// Signature matcher could not be built.
    #[error("invalid detector for protocol '{protocol}': {detail}")]
    InvalidDetector { protocol: String, detail: String },

    /// Could not read the routing file.
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Could not parse the routing file.
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Per-connection errors. None of them are retried by the proxy.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Admission refused at the concurrency limit.
    #[error("capacity exceeded")]
    CapacityExceeded,

    /// No signature matched before the detection deadline.
    #[error("protocol detection timed out")]
    DetectionTimeout,

    /// No signature matched within the byte budget.
    #[error("unknown protocol")]
    UnknownProtocol,

    /// A protocol was identified but nothing routes it.
    #[error("no route for protocol '{protocol}'")]
    NoRouteForProtocol { protocol: String },

    /// Dialing the destination failed or timed out.
    #[error("endpoint {endpoint} unreachable: {source}")]
    EndpointUnreachable {
        endpoint: String,
        #[source]
        source: io::Error,
    },

    /// I/O failure after the pipe was established.
    #[error("pipe I/O error: {0}")]
    PipeIo(#[source] io::Error),
}

impl ProxyError {
    /// The close reason a session records for this error.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            ProxyError::CapacityExceeded => CloseReason::CapacityExceeded,
            ProxyError::DetectionTimeout => CloseReason::DetectionTimeout,
            ProxyError::UnknownProtocol => CloseReason::UnknownProtocol,
            ProxyError::NoRouteForProtocol { .. } => CloseReason::NoRouteForProtocol,
            ProxyError::EndpointUnreachable { .. } => CloseReason::EndpointUnreachable,
            ProxyError::PipeIo(_) => CloseReason::PipeIoError,
        }
    }
}

/// Terminal outcome of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// Both sides finished cleanly.
    Completed,
    CapacityExceeded,
    DetectionTimeout,
    UnknownProtocol,
    NoRouteForProtocol,
    EndpointUnreachable,
    PipeIoError,
    /// No bytes moved in either direction for the idle timeout.
    IdleTimeout,
    /// Force-closed after the shutdown grace period.
    Shutdown,
}

impl CloseReason {
    /// Every variant, in counter order.
    pub const ALL: [CloseReason; 9] = [
        CloseReason::Completed,
        CloseReason::CapacityExceeded,
        CloseReason::DetectionTimeout,
        CloseReason::UnknownProtocol,
        CloseReason::NoRouteForProtocol,
        CloseReason::EndpointUnreachable,
        CloseReason::PipeIoError,
        CloseReason::IdleTimeout,
        CloseReason::Shutdown,
    ];

    /// Stable reason code for logs and stats.
    pub fn reason_code(&self) -> &'static str {
        match self {
            CloseReason::Completed => "completed",
            CloseReason::CapacityExceeded => "capacity_exceeded",
            CloseReason::DetectionTimeout => "detection_timeout",
            CloseReason::UnknownProtocol => "unknown_protocol",
            CloseReason::NoRouteForProtocol => "no_route_for_protocol",
            CloseReason::EndpointUnreachable => "endpoint_unreachable",
            CloseReason::PipeIoError => "pipe_io_error",
            CloseReason::IdleTimeout => "idle_timeout",
            CloseReason::Shutdown => "shutdown",
        }
    }

    /// Index into per-reason counter arrays.
    pub(crate) fn index(&self) -> usize {
        *self as usize
    }

    /// Whether this reason counts as a failure.
    pub fn is_error(&self) -> bool {
        !matches!(self, CloseReason::Completed)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason_code())
    }
}
