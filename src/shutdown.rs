//! Graceful Shutdown Handling
//!
//! Waits for SIGTERM/SIGINT, tells the relay to stop accepting, and gives
//! open sessions a bounded amount of time to finish.

use std::time::Duration;

use tokio::signal;
use tracing::info;

use crate::listener::RelayServer;
use crate::Result;

/// Waits for a termination signal and drains the relay
pub struct ShutdownCoordinator {
    /// How long open sessions get before the process exits anyway
    timeout: Duration,
}

impl ShutdownCoordinator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait for SIGTERM, SIGINT or Ctrl+C
    pub async fn listen_for_signals(&self) -> Result<()> {
        info!("Starting shutdown signal listener");

        #[cfg(unix)]
        {
            let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
            let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())?;

            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating graceful shutdown");
                }
            }
        }

        #[cfg(windows)]
        {
            signal::ctrl_c().await?;
            info!("Received Ctrl+C, initiating graceful shutdown");
        }

        Ok(())
    }

    /// Stop the relay's listeners and wait for its sessions
    pub async fn shutdown_relay(&self, server: &RelayServer) -> bool {
        info!("Initiating graceful shutdown of relay (timeout: {:?})", self.timeout);
        server.initiate_shutdown();
        server
            .engine()
            .wait_for_sessions_to_close(self.timeout)
            .await
    }
}
