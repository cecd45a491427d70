//! TCP listener and connection handling.
//!
//! The server accepts connections on one socket and hands each one to its
//! own task, which drives a [`ConnectionSession`] through detection,
//! routing, dialing and piping.
//!
//! Admission is fail-fast: a connection accepted at the concurrency limit is
//! closed at once with `CapacityExceeded` and never reaches detection.
//!
//! Shutdown stops accepting first, waits up to the grace period for live
//! sessions to finish on their own, then force-closes the rest.

use std::collections::{BTreeMap, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn, Instrument};

use super::detector::ProtocolDetector;
use super::endpoint::DEFAULT_DIAL_TIMEOUT;
use super::pipe::{ConnectionPipe, DEFAULT_HALF_CLOSE_LINGER};
use super::router::SharedRouteTable;
use super::session::{ConnectionSession, SessionContext};
use crate::error::{CloseReason, ProxyError};

/// Default maximum concurrent connections.
pub const DEFAULT_MAX_CONNECTIONS: usize = 10000;

/// Default idle timeout for established pipes.
pub const DEFAULT_IDLE_TIMEOUT: Option<Duration> = Some(Duration::from_secs(300));

/// Default grace period for in-flight sessions on shutdown.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Pause after a failed accept before trying again.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Server lifecycle phase, broadcast to every session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ShutdownPhase {
    Running,
    /// No longer accepting; live sessions may finish.
    Draining,
    /// Grace period over; sessions must close now.
    ForceClose,
    Stopped,
}

/// Configuration for a proxy server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum concurrent sessions.
    pub max_connections: usize,
    /// Idle timeout for piping. `None` disables it.
    pub idle_timeout: Option<Duration>,
    /// Silence allowed on the surviving direction after one side's EOF.
    pub half_close_linger: Duration,
    /// Dial timeout for endpoints without their own.
    pub dial_timeout: Duration,
    /// How long shutdown waits for live sessions.
    pub shutdown_grace: Duration,
}

impl ServerConfig {
    /// Create a new server configuration with defaults.
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            half_close_linger: DEFAULT_HALF_CLOSE_LINGER,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

/// Statistics for a proxy server.
#[derive(Debug, Default)]
pub struct ProxyStats {
    /// Total connections admitted.
    pub connections_accepted: AtomicU64,
    /// Sessions currently live.
    pub connections_active: AtomicU64,
    /// Connections refused at the concurrency limit.
    pub connections_rejected: AtomicU64,
    /// Sessions closed, for any reason.
    pub connections_closed: AtomicU64,
    /// Bytes forwarded to backends, detection replay included.
    pub bytes_to_backend: AtomicU64,
    /// Bytes forwarded from backends.
    pub bytes_from_backend: AtomicU64,
    close_reasons: [AtomicU64; CloseReason::ALL.len()],
    protocols: Mutex<HashMap<String, u64>>,
}

impl ProxyStats {
    pub(crate) fn record_close(&self, reason: CloseReason) {
        self.close_reasons[reason.index()].fetch_add(1, Ordering::Relaxed);
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_protocol(&self, protocol: &str) {
        let mut protocols = self.protocols.lock().unwrap_or_else(|e| e.into_inner());
        *protocols.entry(protocol.to_ascii_lowercase()).or_default() += 1;
    }

    pub(crate) fn add_bytes_to_backend(&self, bytes: u64) {
        self.bytes_to_backend.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_bytes_from_backend(&self, bytes: u64) {
        self.bytes_from_backend.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Sessions closed with `reason`.
    pub fn close_count(&self, reason: CloseReason) -> u64 {
        self.close_reasons[reason.index()].load(Ordering::Relaxed)
    }

    /// Connections detected as `protocol` (case-insensitive).
    pub fn protocol_count(&self, protocol: &str) -> u64 {
        let protocols = self.protocols.lock().unwrap_or_else(|e| e.into_inner());
        protocols
            .get(&protocol.to_ascii_lowercase())
            .copied()
            .unwrap_or(0)
    }

    /// Point-in-time copy for an external collector.
    pub fn snapshot(&self) -> StatsSnapshot {
        let protocols = self
            .protocols
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();

        let close_reasons = CloseReason::ALL
            .iter()
            .map(|reason| (reason.reason_code(), self.close_count(*reason)))
            .filter(|(_, count)| *count > 0)
            .collect();

        StatsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            bytes_to_backend: self.bytes_to_backend.load(Ordering::Relaxed),
            bytes_from_backend: self.bytes_from_backend.load(Ordering::Relaxed),
            protocols,
            close_reasons,
        }
    }
}

/// Serializable copy of [`ProxyStats`].
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub connections_accepted: u64,
    pub connections_active: u64,
    pub connections_rejected: u64,
    pub connections_closed: u64,
    pub bytes_to_backend: u64,
    pub bytes_from_backend: u64,
    pub protocols: BTreeMap<String, u64>,
    pub close_reasons: BTreeMap<&'static str, u64>,
}

/// Holds a concurrency slot and the live-session count for one task.
struct ActiveSlot {
    stats: Arc<ProxyStats>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for ActiveSlot {
    fn drop(&mut self) {
        self.stats.connections_active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Protocol-aware TCP reverse proxy.
pub struct ProxyServer {
    /// Server configuration.
    config: ServerConfig,
    /// Bound listener, taken by `start`.
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    /// State shared by all sessions.
    context: Arc<SessionContext>,
    /// Connection semaphore for limiting concurrent sessions.
    conn_semaphore: Arc<Semaphore>,
    phase: watch::Sender<ShutdownPhase>,
    running: AtomicBool,
    next_session_id: AtomicU64,
}

impl ProxyServer {
    /// Bind the listening socket.
    pub async fn bind(
        config: ServerConfig,
        routes: SharedRouteTable,
        detector: Arc<ProtocolDetector>,
    ) -> io::Result<Self> {
        let listener = TcpListener::bind(config.bind_addr).await?;
        let local_addr = listener.local_addr()?;
        let max_connections = config.max_connections.max(1);

        info!(
            bind_addr = %local_addr,
            max_connections,
            route_count = routes.len(),
            matcher_count = detector.matchers().len(),
            "Listener bound"
        );

        let context = SessionContext {
            routes,
            detector,
            pipe: ConnectionPipe::new(config.idle_timeout)
                .with_half_close_linger(config.half_close_linger),
            dial_timeout: config.dial_timeout,
            stats: Arc::new(ProxyStats::default()),
        };
        let (phase, _) = watch::channel(ShutdownPhase::Running);

        Ok(Self {
            conn_semaphore: Arc::new(Semaphore::new(max_connections)),
            listener: Mutex::new(Some(listener)),
            local_addr,
            context: Arc::new(context),
            config,
            phase,
            running: AtomicBool::new(false),
            next_session_id: AtomicU64::new(1),
        })
    }

    /// Get the local address this server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Get server statistics.
    pub fn stats(&self) -> &ProxyStats {
        &self.context.stats
    }

    /// Sessions currently live.
    pub fn live_sessions(&self) -> u64 {
        self.context
            .stats
            .connections_active
            .load(Ordering::Relaxed)
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> ShutdownPhase {
        *self.phase.borrow()
    }

    /// Spawn the accept loop.
    ///
    /// The returned handle resolves once the server has fully stopped.
    pub fn start(self: Arc<Self>) -> io::Result<JoinHandle<()>> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "proxy server is already running",
            ));
        }

        let listener = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(listener) = listener else {
            self.running.store(false, Ordering::Release);
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "proxy server has already been stopped",
            ));
        };

        Ok(tokio::spawn(self.run(listener)))
    }

    /// Stop accepting, drain live sessions within the grace period, then
    /// force-close whatever is left. Resolves once the server has stopped.
    pub async fn shutdown(&self) {
        if !self.is_running() {
            self.phase.send_replace(ShutdownPhase::Stopped);
            return;
        }

        self.phase.send_if_modified(|phase| {
            if *phase == ShutdownPhase::Running {
                *phase = ShutdownPhase::Draining;
                true
            } else {
                false
            }
        });

        let mut phase = self.phase.subscribe();
        let _ = phase
            .wait_for(|p| *p == ShutdownPhase::Stopped)
            .await;
    }

    async fn run(self: Arc<Self>, listener: TcpListener) {
        let mut phase = self.phase.subscribe();
        let mut sessions = JoinSet::new();
        info!(bind_addr = %self.local_addr, "Proxy server started");

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer_addr)) => self.admit(&mut sessions, stream, peer_addr),
                    Err(e) => {
                        error!(error = %e, "Accept error");
                        tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
                    }
                },
                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    log_join(joined);
                }
                _ = stop_requested(&mut phase) => break,
            }
        }

        drop(listener);
        info!(
            live_sessions = sessions.len(),
            grace_ms = self.config.shutdown_grace.as_millis() as u64,
            "Stopped accepting, draining sessions"
        );

        self.drain(&mut sessions).await;

        self.running.store(false, Ordering::Release);
        self.phase.send_replace(ShutdownPhase::Stopped);
        info!("Proxy server stopped");
    }

    fn admit(
        &self,
        sessions: &mut JoinSet<()>,
        stream: TcpStream,
        peer_addr: SocketAddr,
    ) {
        let session = ConnectionSession::new(
            self.next_session_id.fetch_add(1, Ordering::Relaxed),
            stream,
            peer_addr,
        );
        let stats = &self.context.stats;

        // Try to acquire a permit
        let permit = match self.conn_semaphore.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    peer_addr = %peer_addr,
                    max_connections = self.config.max_connections,
                    "Connection rejected: max connections reached"
                );
                session.reject(ProxyError::CapacityExceeded, stats);
                return;
            }
        };

        stats.connections_accepted.fetch_add(1, Ordering::Relaxed);
        stats.connections_active.fetch_add(1, Ordering::Relaxed);
        let slot = ActiveSlot {
            stats: Arc::clone(stats),
            _permit: permit,
        };

        let span = tracing::info_span!("connection", session_id = session.id(), peer = %peer_addr);
        let context = Arc::clone(&self.context);
        let phase = self.phase.subscribe();
        sessions.spawn(
            async move {
                let _slot = slot;
                session.run(&context, phase).await;
            }
            .instrument(span),
        );
    }

    async fn drain(&self, sessions: &mut JoinSet<()>) {
        let deadline = Instant::now() + self.config.shutdown_grace;

        while !sessions.is_empty() {
            match timeout_at(deadline, sessions.join_next()).await {
                Ok(Some(joined)) => log_join(joined),
                Ok(None) => break,
                Err(_) => {
                    warn!(
                        remaining = sessions.len(),
                        "Grace period elapsed, force-closing sessions"
                    );
                    self.phase.send_replace(ShutdownPhase::ForceClose);
                    while let Some(joined) = sessions.join_next().await {
                        log_join(joined);
                    }
                }
            }
        }
    }
}

async fn stop_requested(phase: &mut watch::Receiver<ShutdownPhase>) {
    let _ = phase
        .wait_for(|p| *p != ShutdownPhase::Running)
        .await
        .map(|_| ());
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Session task failed");
    } else {
        debug!("Session task finished");
    }
}
