//! Per-connection session lifecycle.
//!
//! A session owns its client socket, the bytes buffered during detection,
//! and, once dialed, the destination socket. It moves forward through
//! [`SessionState`] and never revisits a state. Any failure closes it with a
//! [`CloseReason`]; the client is responsible for reconnecting.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{debug, trace, warn};

use super::detector::{Detection, ProtocolDetector};
use super::pipe::{ConnectionPipe, PipeOutcome};
use super::router::{Route, SharedRouteTable};
use super::server::{ProxyStats, ShutdownPhase};
use crate::error::{CloseReason, ProxyError};

/// Lifecycle states, in the only order they can be entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SessionState {
    Accepted,
    Detecting,
    Routed,
    Connecting,
    Piping,
    Closed,
}

/// Read-only state shared by every session of a server.
#[derive(Debug)]
pub(crate) struct SessionContext {
    pub routes: SharedRouteTable,
    pub detector: Arc<ProtocolDetector>,
    pub pipe: ConnectionPipe,
    pub dial_timeout: Duration,
    pub stats: Arc<ProxyStats>,
}

/// What a closed session leaves behind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: u64,
    pub peer_addr: SocketAddr,
    pub protocol: Option<String>,
    pub destination: Option<String>,
    /// Last state entered before `Closed`.
    pub last_state: SessionState,
    pub close_reason: CloseReason,
    pub bytes_to_destination: u64,
    pub bytes_to_client: u64,
}

/// Ephemeral per-connection record, owned by one task.
#[derive(Debug)]
pub struct ConnectionSession {
    id: u64,
    peer_addr: SocketAddr,
    client: TcpStream,
    buffered: Vec<u8>,
    protocol: Option<String>,
    route: Option<Route>,
    destination: Option<TcpStream>,
    state: SessionState,
    last_state: SessionState,
    bytes_to_destination: u64,
    bytes_to_client: u64,
}

impl ConnectionSession {
    /// Create a session for a freshly accepted connection.
    pub fn new(id: u64, client: TcpStream, peer_addr: SocketAddr) -> Self {
        Self {
            id,
            peer_addr,
            client,
            buffered: Vec::new(),
            protocol: None,
            route: None,
            destination: None,
            state: SessionState::Accepted,
            last_state: SessionState::Accepted,
            bytes_to_destination: 0,
            bytes_to_client: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Close without reading a byte.
    pub(crate) fn reject(self, error: ProxyError, stats: &ProxyStats) -> SessionSummary {
        self.close(error.close_reason(), stats)
    }

    /// Drive the session to completion and release its sockets.
    pub(crate) async fn run(
        mut self,
        ctx: &SessionContext,
        phase: watch::Receiver<ShutdownPhase>,
    ) -> SessionSummary {
        let reason = match self.drive(ctx, &phase).await {
            Ok(reason) => reason,
            Err(e) => {
                match &e {
                    ProxyError::EndpointUnreachable { .. } => {
                        warn!(error = %e, "Destination unreachable")
                    }
                    _ => debug!(error = %e, "Session failed"),
                }
                e.close_reason()
            }
        };
        self.close(reason, &ctx.stats)
    }

    async fn drive(
        &mut self,
        ctx: &SessionContext,
        phase: &watch::Receiver<ShutdownPhase>,
    ) -> Result<CloseReason, ProxyError> {
        self.transition(SessionState::Detecting);

        let detection = tokio::select! {
            detection = ctx.detector.detect(&mut self.client, &mut self.buffered) => detection,
            _ = force_closed(phase.clone()) => return Ok(CloseReason::Shutdown),
        };

        let protocol = match detection {
            Detection::Matched(protocol) => protocol,
            Detection::TimedOut => return Err(ProxyError::DetectionTimeout),
            Detection::Aborted => return Err(ProxyError::UnknownProtocol),
            Detection::Unknown => match ctx.detector.fallback_protocol() {
                Some(fallback) => {
                    debug!(fallback = %fallback, "No signature matched, using fallback protocol");
                    fallback.to_string()
                }
                None => return Err(ProxyError::UnknownProtocol),
            },
        };

        debug!(
            protocol = %protocol,
            buffered = self.buffered.len(),
            "Protocol detected"
        );
        ctx.stats.record_protocol(&protocol);
        self.protocol = Some(protocol.clone());

        let route = ctx
            .routes
            .find_route(&protocol)
            .cloned()
            .ok_or(ProxyError::NoRouteForProtocol { protocol })?;
        let endpoint = route.destination().clone();
        self.route = Some(route);
        self.transition(SessionState::Routed);

        self.transition(SessionState::Connecting);
        let destination = tokio::select! {
            connected = endpoint.connect(ctx.dial_timeout) => connected?,
            _ = force_closed(phase.clone()) => return Ok(CloseReason::Shutdown),
        };

        self.transition(SessionState::Piping);
        let destination = self.destination.insert(destination);

        if !self.buffered.is_empty() {
            let replay = destination.write_all(&self.buffered);
            tokio::select! {
                written = replay => written.map_err(ProxyError::PipeIo)?,
                _ = force_closed(phase.clone()) => return Ok(CloseReason::Shutdown),
            }
            let replayed = self.buffered.len() as u64;
            self.bytes_to_destination += replayed;
            ctx.stats.add_bytes_to_backend(replayed);
        }

        let report = ctx
            .pipe
            .run(&mut self.client, destination, force_closed(phase.clone()))
            .await;

        self.bytes_to_destination += report.bytes_to_destination;
        self.bytes_to_client += report.bytes_to_client;
        ctx.stats.add_bytes_to_backend(report.bytes_to_destination);
        ctx.stats.add_bytes_from_backend(report.bytes_to_client);

        match report.result {
            Ok(PipeOutcome::Completed) => Ok(CloseReason::Completed),
            Ok(PipeOutcome::IdleTimeout) => Ok(CloseReason::IdleTimeout),
            Ok(PipeOutcome::Cancelled) => Ok(CloseReason::Shutdown),
            Err(e) => Err(ProxyError::PipeIo(e)),
        }
    }

    fn transition(&mut self, next: SessionState) {
        debug_assert!(next > self.state, "{:?} -> {:?}", self.state, next);
        trace!(from = ?self.state, to = ?next, "Session transition");
        self.state = next;
    }

    /// Enter `Closed` and drop both sockets.
    fn close(mut self, reason: CloseReason, stats: &ProxyStats) -> SessionSummary {
        self.last_state = self.state;
        self.transition(SessionState::Closed);
        stats.record_close(reason);

        let summary = SessionSummary {
            id: self.id,
            peer_addr: self.peer_addr,
            protocol: self.protocol.take(),
            destination: self.route.as_ref().map(|r| r.destination().to_string()),
            last_state: self.last_state,
            close_reason: reason,
            bytes_to_destination: self.bytes_to_destination,
            bytes_to_client: self.bytes_to_client,
        };

        debug!(
            close_reason = %reason,
            last_state = ?summary.last_state,
            protocol = ?summary.protocol,
            bytes_to_destination = summary.bytes_to_destination,
            bytes_to_client = summary.bytes_to_client,
            "Session closed"
        );

        summary
    }
}

/// Resolves once the server enters its force-close phase.
async fn force_closed(mut phase: watch::Receiver<ShutdownPhase>) {
    if phase
        .wait_for(|p| *p >= ShutdownPhase::ForceClose)
        .await
        .is_err()
    {
        std::future::pending::<()>().await;
    }
}
