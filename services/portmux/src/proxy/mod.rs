//! Protocol-aware L4 proxy.
//!
//! This module provides:
//! - TCP listener and admission control
//! - Protocol detection from the first client bytes
//! - Protocol-to-endpoint routing
//! - Per-connection session lifecycle
//! - Bidirectional piping with a joint idle timeout
//!
//! ## Architecture
//!
//! ```text
//! Client -> ProxyServer -> ProtocolDetector -> RouteTable -> Endpoint
//!                                 |                              |
//!                         buffered bytes ----- replay ---------->|
//!                                                                |
//!           Client <============ ConnectionPipe ===============> Backend
//! ```
//!
//! ## Usage
//!
//! ```ignore
//! use portmux::proxy::{ProxyServer, ServerConfig, RouteTable, ProtocolDetector};
//!
//! let routes = Arc::new(RouteTable::new());
//! let detector = Arc::new(ProtocolDetector::default());
//!
//! let config = ServerConfig::new("0.0.0.0:8000".parse()?);
//! let server = Arc::new(ProxyServer::bind(config, routes, detector).await?);
//! let handle = Arc::clone(&server).start()?;
//! ```

mod detector;
mod endpoint;
mod pipe;
mod router;
mod server;
mod session;

pub use detector::{
    Classification, Detection, DetectorConfig, MatchOutcome, ProtocolDetector, SignatureMatcher,
    SignatureRule, DEFAULT_DETECT_TIMEOUT, DEFAULT_MAX_DETECT_BYTES,
};
pub use endpoint::{Endpoint, DEFAULT_DIAL_TIMEOUT};
pub use pipe::{
    ConnectionPipe, PipeOutcome, PipeReport, DEFAULT_HALF_CLOSE_LINGER, PIPE_BUFFER_SIZE,
};
pub use router::{Route, RouteTable, SharedRouteTable};
pub use server::{
    ProxyServer, ProxyStats, ServerConfig, ShutdownPhase, StatsSnapshot, DEFAULT_IDLE_TIMEOUT,
    DEFAULT_MAX_CONNECTIONS, DEFAULT_SHUTDOWN_GRACE,
};
pub use session::{ConnectionSession, SessionState, SessionSummary};
