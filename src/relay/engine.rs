//! Relay Engine

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::session::{Session, SessionOutcome, SessionSettings};
use crate::config::{Config, Route};
use crate::metrics::RelayStats;
use crate::Result;

/// Spawns one session task per accepted client and tracks how many are live
#[derive(Debug)]
pub struct RelayEngine {
    settings: SessionSettings,
    stats: Arc<RelayStats>,
}

impl RelayEngine {
    /// Create a new relay engine
    pub fn new(settings: SessionSettings, stats: Arc<RelayStats>) -> Self {
        Self { settings, stats }
    }

    /// Create a new relay engine from configuration
    pub fn from_config(config: &Config, stats: Arc<RelayStats>) -> Self {
        Self::new(SessionSettings::from_server_config(&config.server), stats)
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    /// Build a session for an accepted client without starting it
    pub fn create_session(&self, client: TcpStream, route: Arc<Route>) -> Result<Session> {
        Session::new(client, route, self.settings, Arc::clone(&self.stats))
    }

    /// Start relaying an accepted client on its own task.
    ///
    /// A client socket that cannot be set up is dropped and logged; it never
    /// affects other sessions or the listener.
    pub fn spawn_session(
        &self,
        client: TcpStream,
        client_addr: SocketAddr,
        route: Arc<Route>,
    ) -> Option<JoinHandle<SessionOutcome>> {
        match self.create_session(client, route) {
            Ok(session) => {
                debug!(
                    session_id = %session.id(),
                    client = %client_addr,
                    "Spawning relay session"
                );
                Some(tokio::spawn(session.run()))
            }
            Err(e) => {
                warn!(client = %client_addr, error = %format!("{:#}", e), "Dropping client connection");
                None
            }
        }
    }

    /// Get active session count
    pub fn active_session_count(&self) -> usize {
        self.stats.active_sessions().max(0) as usize
    }

    /// Wait for live sessions to finish, giving up after `timeout`
    pub async fn wait_for_sessions_to_close(&self, timeout: Duration) -> bool {
        let start_time = Instant::now();
        let mut last_count = self.active_session_count();

        if last_count > 0 {
            info!(
                "Waiting for {} active sessions to close (timeout: {:?})",
                last_count, timeout
            );
        }

        while last_count > 0 && start_time.elapsed() < timeout {
            tokio::time::sleep(Duration::from_millis(100)).await;

            let current_count = self.active_session_count();
            if current_count != last_count {
                debug!("Active sessions: {} -> {}", last_count, current_count);
                last_count = current_count;
            }
        }

        if last_count == 0 {
            info!("All sessions closed in {:?}", start_time.elapsed());
            true
        } else {
            warn!(
                "Shutdown timeout reached after {:?} with {} sessions still active",
                start_time.elapsed(),
                last_count
            );
            false
        }
    }
}
