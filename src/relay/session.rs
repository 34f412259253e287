//! Relay Session
//!
//! One client connection paired with one outbound target connection. The
//! session reads client bytes while the target connect is in flight, queues
//! them, flushes the queue once the target is up, and only then starts
//! forwarding directly. Everything happens on a single task, so no client read
//! can overtake the flush.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use serde::Serialize;
use tokio::net::TcpStream;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::connector;
use super::pending::PendingQueue;
use super::pump::{pump, PumpError};
use super::transport::{Side, Transport};
use crate::config::{Route, ServerConfig};
use crate::metrics::{Direction, RelayStats};
use crate::Result;

/// Session lifecycle.
///
/// `Connecting -> {Forwarding, Failed} -> Closed`, plus `Connecting -> Closed`
/// when the client leaves before the target connect resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Connecting,
    Forwarding,
    Failed,
    Closed,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CloseReason {
    /// Client sent EOF
    ClientClosed,
    /// Target sent EOF
    TargetClosed,
    /// Resolving or connecting to the target failed or timed out
    ConnectFailed,
    /// Client sent more than `max_pending_bytes` before the target connected
    PendingOverflow,
    /// Read or write error on the client socket
    ClientError,
    /// Read or write error on the target socket
    TargetError,
}

/// Per-session tunables, shared by every session of a relay
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub connect_timeout: Duration,
    pub buffer_size: usize,
    pub max_pending_bytes: usize,
}

impl SessionSettings {
    pub fn from_server_config(server: &ServerConfig) -> Self {
        Self {
            connect_timeout: server.connect_timeout,
            buffer_size: server.buffer_size,
            max_pending_bytes: server.max_pending_bytes,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_server_config(&ServerConfig::default())
    }
}

/// Summary of a finished session
#[derive(Debug, Clone, Serialize)]
pub struct SessionOutcome {
    pub session_id: String,
    pub listen_port: u16,
    pub client_addr: SocketAddr,
    pub state: SessionState,
    pub reason: CloseReason,
    /// Whether the target connect succeeded at any point
    pub forwarded: bool,
    pub bytes_up: u64,
    pub bytes_down: u64,
    pub duration_ms: u64,
}

/// A client connection and everything needed to relay it
#[derive(Debug)]
pub struct Session {
    id: String,
    route: Arc<Route>,
    client: Transport,
    target: Option<Transport>,
    pending: PendingQueue,
    state: SessionState,
    settings: SessionSettings,
    stats: Arc<RelayStats>,
    started: Instant,
    bytes_up: u64,
    bytes_down: u64,
}

impl Session {
    /// Wrap a freshly accepted client socket. TCP_NODELAY is enabled here,
    /// before anything is written to the client.
    ///
    /// The session counts as active from here until it is dropped, whether or
    /// not its task has started running.
    pub fn new(
        client: TcpStream,
        route: Arc<Route>,
        settings: SessionSettings,
        stats: Arc<RelayStats>,
    ) -> Result<Self> {
        let client = Transport::new(client, Side::Client)?;
        stats.session_opened();

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            route,
            client,
            target: None,
            pending: PendingQueue::new(settings.max_pending_bytes),
            state: SessionState::Connecting,
            settings,
            stats,
            started: Instant::now(),
            bytes_up: 0,
            bytes_down: 0,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn client_addr(&self) -> SocketAddr {
        self.client.peer_addr()
    }

    /// Connect to the route's target and relay until either side closes
    pub async fn run(self) -> SessionOutcome {
        let target = self.route.target.clone();
        let connect_timeout = self.settings.connect_timeout;

        self.run_with(async move { connector::connect(&target, connect_timeout).await })
            .await
    }

    /// Relay using `connect` as the single outbound connect attempt.
    ///
    /// The future is polled alongside client reads; whatever the client sends
    /// before it resolves is queued and written to the target first.
    #[instrument(
        name = "session",
        skip_all,
        fields(
            session_id = %self.id,
            listen_port = self.route.listen_port,
            client = %self.client.peer_addr(),
        )
    )]
    pub async fn run_with<F>(mut self, connect: F) -> SessionOutcome
    where
        F: Future<Output = Result<TcpStream>>,
    {
        debug!(target_addr = %self.route.target, "Session started");

        let reason = self.drive(connect).await;
        self.teardown().await;

        let outcome = SessionOutcome {
            session_id: self.id.clone(),
            listen_port: self.route.listen_port,
            client_addr: self.client.peer_addr(),
            state: self.state,
            reason,
            forwarded: self.target.is_some(),
            bytes_up: self.bytes_up,
            bytes_down: self.bytes_down,
            duration_ms: self.started.elapsed().as_millis() as u64,
        };

        info!(
            reason = ?outcome.reason,
            bytes_up = outcome.bytes_up,
            bytes_down = outcome.bytes_down,
            duration_ms = outcome.duration_ms,
            "Session closed"
        );

        outcome
    }

    async fn drive<F>(&mut self, connect: F) -> CloseReason
    where
        F: Future<Output = Result<TcpStream>>,
    {
        let stream = match self.await_target(connect).await {
            Ok(stream) => stream,
            Err(reason) => return reason,
        };

        let target = match Transport::new(stream, Side::Target) {
            Ok(target) => target,
            Err(e) => return self.connect_failed(&e),
        };

        debug!(
            target_peer = %target.peer_addr(),
            queued_bytes = self.pending.len_bytes(),
            "Target connected"
        );
        self.target = Some(target);

        if let Err(reason) = self.flush_pending().await {
            return reason;
        }
        self.state = SessionState::Forwarding;

        self.forward().await
    }

    /// Queue client bytes until the connect resolves
    async fn await_target<F>(&mut self, connect: F) -> std::result::Result<TcpStream, CloseReason>
    where
        F: Future<Output = Result<TcpStream>>,
    {
        tokio::pin!(connect);
        let mut buf = BytesMut::with_capacity(self.settings.buffer_size);

        loop {
            tokio::select! {
                // A ready connect wins over ready client bytes; those stay in
                // the socket and are read after the flush.
                biased;

                result = &mut connect => {
                    return match result {
                        Ok(stream) => Ok(stream),
                        Err(e) => Err(self.connect_failed(&e)),
                    };
                }

                read = self.client.read_buf(&mut buf) => match read {
                    Ok(0) => {
                        debug!(
                            discarded_bytes = self.pending.len_bytes(),
                            "Client closed before target connected"
                        );
                        self.pending.clear();
                        self.state = SessionState::Closed;
                        return Err(CloseReason::ClientClosed);
                    }
                    Ok(_) => {
                        let chunk = buf.split().freeze();
                        if let Err(full) = self.pending.push(chunk) {
                            warn!(error = %full, "Client sent too much before target connected");
                            self.pending.clear();
                            self.state = SessionState::Closed;
                            return Err(CloseReason::PendingOverflow);
                        }
                        buf.reserve(self.settings.buffer_size);
                    }
                    Err(e) => {
                        debug!(error = %e, "Client error before target connected");
                        self.pending.clear();
                        self.state = SessionState::Closed;
                        return Err(CloseReason::ClientError);
                    }
                }
            }
        }
    }

    fn connect_failed(&mut self, error: &anyhow::Error) -> CloseReason {
        self.state = SessionState::Failed;
        self.pending.clear();
        self.stats.connect_failed();
        warn!(target_addr = %self.route.target, error = %format!("{:#}", error), "Target connect failed");
        CloseReason::ConnectFailed
    }

    /// Write every queued chunk to the target, oldest first
    async fn flush_pending(&mut self) -> std::result::Result<(), CloseReason> {
        let Some(target) = self.target.as_mut() else {
            return Ok(());
        };

        for chunk in self.pending.drain() {
            if let Err(e) = target.write_all(&chunk).await {
                debug!(error = %e, "Flushing queued bytes to target failed");
                return Err(CloseReason::TargetError);
            }
            self.stats.add_bytes(Direction::ClientToTarget, chunk.len() as u64);
            self.bytes_up += chunk.len() as u64;
        }

        Ok(())
    }

    /// Pass bytes through in both directions until one side stops
    async fn forward(&mut self) -> CloseReason {
        let Some(target) = self.target.as_mut() else {
            return CloseReason::TargetClosed;
        };

        let buffer_size = self.settings.buffer_size;
        let stats = &*self.stats;
        let (mut client_read, mut client_write) = self.client.split();
        let (mut target_read, mut target_write) = target.split();

        let upstream = pump(
            &mut client_read,
            &mut target_write,
            buffer_size,
            Direction::ClientToTarget,
            stats,
            &mut self.bytes_up,
        );
        let downstream = pump(
            &mut target_read,
            &mut client_write,
            buffer_size,
            Direction::TargetToClient,
            stats,
            &mut self.bytes_down,
        );

        // Whichever direction stops first ends the session; the other pump is
        // dropped here and never reports.
        tokio::select! {
            result = upstream => match result {
                Ok(()) => {
                    debug!("Client disconnected");
                    CloseReason::ClientClosed
                }
                Err(e) => pump_failure(Direction::ClientToTarget, &e),
            },
            result = downstream => match result {
                Ok(()) => {
                    debug!("Target disconnected");
                    CloseReason::TargetClosed
                }
                Err(e) => pump_failure(Direction::TargetToClient, &e),
            },
        }
    }

    /// Close both transports; already closed ones are skipped
    async fn teardown(&mut self) {
        if let Some(target) = self.target.as_mut() {
            target.close().await;
        }
        self.client.close().await;
        self.pending.clear();
        self.state = SessionState::Closed;
    }
}

/// Close reason for a forwarding error, named after the socket that failed
fn pump_failure(direction: Direction, error: &PumpError) -> CloseReason {
    let side = error.failed_side(direction);
    debug!(direction = direction.as_str(), failed = %side, error = %error, "Forwarding stopped");
    match side {
        Side::Client => CloseReason::ClientError,
        Side::Target => CloseReason::TargetError,
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.stats.session_closed();
    }
}
