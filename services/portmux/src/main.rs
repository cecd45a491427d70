//! portmux
//!
//! Protocol-aware L4 reverse proxy.
//!
//! This service:
//! - Loads routes and signature matchers from a JSON file at startup
//! - Accepts TCP connections on a single listener
//! - Detects each connection's protocol from its first bytes
//! - Pipes the connection to the route's backend, replaying detected bytes
//! - Drains live sessions on Ctrl-C

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use portmux::{Config, ProxyServer, RoutingConfig};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Initialize tracing (prefer RUST_LOG, fallback to PORTMUX_LOG_LEVEL)
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting portmux");

    let routing = RoutingConfig::load(&config.routes_file)?;
    let routes = Arc::new(
        routing
            .route_table()
            .context("Route file contains an invalid route.")?,
    );
    let detector = Arc::new(
        routing
            .detector(config.detector_config())
            .context("Route file contains an invalid detector.")?,
    );

    info!(
        listen_addr = %config.listen_addr,
        routes_file = %config.routes_file.display(),
        route_count = routes.len(),
        matcher_count = detector.matchers().len(),
        fallback_protocol = ?detector.fallback_protocol(),
        max_connections = config.max_connections,
        "Configuration loaded"
    );
    for route in routes.routes() {
        info!(
            protocol = %route.protocol(),
            destination = %route.destination(),
            "Route loaded"
        );
    }

    let server = match ProxyServer::bind(config.server_config(), routes, detector).await {
        Ok(server) => Arc::new(server),
        Err(e) => {
            error!(bind_addr = %config.listen_addr, error = %e, "Failed to bind listener");
            return Err(e.into());
        }
    };
    let mut accept_loop = Arc::clone(&server).start()?;

    if let Some(interval) = config.stats_interval {
        let stats_server = Arc::clone(&server);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !stats_server.is_running() {
                    break;
                }
                let snapshot = stats_server.stats().snapshot();
                match serde_json::to_string(&snapshot) {
                    Ok(stats) => info!(stats = %stats, "Proxy stats"),
                    Err(e) => error!(error = %e, "Failed to serialize stats"),
                }
            }
        });
    }

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal.context("Failed to listen for Ctrl-C")?;
            info!("Received Ctrl-C, shutting down");
            server.shutdown().await;
            accept_loop.await.context("Accept loop panicked")?;
        }
        joined = &mut accept_loop => {
            joined.context("Accept loop panicked")?;
        }
    }

    let snapshot = server.stats().snapshot();
    info!(
        connections_accepted = snapshot.connections_accepted,
        connections_rejected = snapshot.connections_rejected,
        connections_closed = snapshot.connections_closed,
        "portmux stopped"
    );

    Ok(())
}
