pub mod config;
pub mod error;
pub mod proxy;

pub use config::{Config, RoutingConfig};
pub use error::{CloseReason, ConfigError, ProxyError};
pub use proxy::{
    ConnectionPipe, Detection, DetectorConfig, Endpoint, ProtocolDetector, ProxyServer,
    ProxyStats, Route, RouteTable, ServerConfig, SharedRouteTable, ShutdownPhase,
    SignatureMatcher, SignatureRule, StatsSnapshot,
};
