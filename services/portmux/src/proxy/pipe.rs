//! Bidirectional byte forwarding between two connected streams.
//!
//! The idle timeout is joint: it fires only when no bytes have moved in
//! either direction for the configured duration. A clean EOF on one side is
//! propagated as a write shutdown to the other side. The opposite direction
//! may keep flowing, but only while it stays active within the half-close
//! linger; after that the pipe ends and both streams are released. An I/O
//! error in either direction stops both at once. Nothing is retried.

use std::future::Future;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

/// Copy buffer size per direction.
pub const PIPE_BUFFER_SIZE: usize = 8192;

/// Default time the surviving direction may stay silent after the other
/// side reached EOF.
pub const DEFAULT_HALF_CLOSE_LINGER: Duration = Duration::from_millis(500);

/// How a pipe ended without an I/O error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeOutcome {
    /// Both directions reached EOF, or one did and the other went quiet
    /// for the half-close linger.
    Completed,
    /// No bytes in either direction for the idle timeout.
    IdleTimeout,
    /// The cancel future resolved first.
    Cancelled,
}

/// Bytes moved and how the pipe ended.
#[derive(Debug)]
pub struct PipeReport {
    pub bytes_to_destination: u64,
    pub bytes_to_client: u64,
    pub result: io::Result<PipeOutcome>,
}

/// Last-activity clock shared by both directions.
struct Activity {
    started: Instant,
    last_ms: AtomicU64,
    half_closed: AtomicBool,
    half_close: Notify,
}

impl Activity {
    fn new() -> Self {
        Self {
            started: Instant::now(),
            last_ms: AtomicU64::new(0),
            half_closed: AtomicBool::new(false),
            half_close: Notify::new(),
        }
    }

    fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_ms.fetch_max(elapsed, Ordering::Relaxed);
    }

    fn last(&self) -> Instant {
        self.started + Duration::from_millis(self.last_ms.load(Ordering::Relaxed))
    }

    fn mark_half_closed(&self) {
        self.touch();
        self.half_closed.store(true, Ordering::Release);
        self.half_close.notify_one();
    }

    fn is_half_closed(&self) -> bool {
        self.half_closed.load(Ordering::Acquire)
    }
}

/// Forwards bytes between a client and a destination.
#[derive(Debug, Clone, Copy)]
pub struct ConnectionPipe {
    idle_timeout: Option<Duration>,
    half_close_linger: Duration,
}

impl ConnectionPipe {
    /// Create a pipe. `None` disables the idle timeout.
    pub fn new(idle_timeout: Option<Duration>) -> Self {
        Self {
            idle_timeout,
            half_close_linger: DEFAULT_HALF_CLOSE_LINGER,
        }
    }

    /// Set how long the surviving direction may stay silent once the other
    /// side has reached EOF.
    pub fn with_half_close_linger(mut self, linger: Duration) -> Self {
        self.half_close_linger = linger;
        self
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout
    }

    pub fn half_close_linger(&self) -> Duration {
        self.half_close_linger
    }

    /// Silence allowed before the watchdog ends the pipe.
    fn silence_limit(&self, half_closed: bool) -> Option<Duration> {
        if !half_closed {
            return self.idle_timeout;
        }
        Some(match self.idle_timeout {
            Some(idle) => idle.min(self.half_close_linger),
            None => self.half_close_linger,
        })
    }

    /// Run until both directions finish, one finishes and the other goes
    /// quiet, an error occurs, the pipe idles out, or `cancel` resolves.
    ///
    /// The caller closes both streams by dropping them afterwards.
    pub async fn run<C, D, F>(&self, client: &mut C, destination: &mut D, cancel: F) -> PipeReport
    where
        C: AsyncRead + AsyncWrite + Unpin,
        D: AsyncRead + AsyncWrite + Unpin,
        F: Future<Output = ()>,
    {
        let (mut client_read, mut client_write) = tokio::io::split(client);
        let (mut dest_read, mut dest_write) = tokio::io::split(destination);

        let activity = Activity::new();
        let to_destination = AtomicU64::new(0);
        let to_client = AtomicU64::new(0);

        let transfer = async {
            tokio::try_join!(
                copy_direction(
                    &mut client_read,
                    &mut dest_write,
                    &to_destination,
                    &activity,
                    "client->destination",
                ),
                copy_direction(
                    &mut dest_read,
                    &mut client_write,
                    &to_client,
                    &activity,
                    "destination->client",
                ),
            )
        };

        let watchdog = async {
            loop {
                let half_closed = activity.is_half_closed();
                let Some(limit) = self.silence_limit(half_closed) else {
                    activity.half_close.notified().await;
                    continue;
                };

                let deadline = activity.last() + limit;
                if Instant::now() >= deadline {
                    return if half_closed {
                        debug!(
                            linger_ms = limit.as_millis() as u64,
                            "Half-closed pipe went quiet, closing both sides"
                        );
                        PipeOutcome::Completed
                    } else {
                        PipeOutcome::IdleTimeout
                    };
                }

                tokio::select! {
                    _ = sleep_until(deadline) => {}
                    _ = activity.half_close.notified(), if !half_closed => {}
                }
            }
        };

        let result = tokio::select! {
            transferred = transfer => transferred.map(|_| PipeOutcome::Completed),
            outcome = watchdog => Ok(outcome),
            _ = cancel => Ok(PipeOutcome::Cancelled),
        };

        PipeReport {
            bytes_to_destination: to_destination.load(Ordering::Relaxed),
            bytes_to_client: to_client.load(Ordering::Relaxed),
            result,
        }
    }
}

async fn copy_direction<R, W>(
    reader: &mut R,
    writer: &mut W,
    counter: &AtomicU64,
    activity: &Activity,
    direction: &'static str,
) -> io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; PIPE_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        activity.touch();
        writer.write_all(&buf[..n]).await?;
        counter.fetch_add(n as u64, Ordering::Relaxed);
        activity.touch();
    }

    trace!(direction, "EOF, shutting down write half");
    writer.shutdown().await?;
    activity.mark_half_closed();
    Ok(())
}
