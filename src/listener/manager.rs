//! Relay Server
//!
//! Owns the immutable target mapping, binds one listener per route and
//! coordinates shutdown of all of them.

use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info};

use super::Listener;
use crate::config::{Config, TargetMapping};
use crate::metrics::RelayStats;
use crate::relay::RelayEngine;
use crate::Result;

/// Result of binding every configured route
#[derive(Debug)]
pub struct BindReport {
    pub listeners: Vec<Listener>,
    pub failures: Vec<(u16, anyhow::Error)>,
}

/// Runs one listener per configured route
pub struct RelayServer {
    config: Arc<Config>,
    mapping: Arc<TargetMapping>,
    engine: Arc<RelayEngine>,
    /// Flips to `true` once; listeners that start later still see it
    shutdown_tx: watch::Sender<bool>,
}

impl RelayServer {
    /// Validate the configuration and freeze the target mapping.
    ///
    /// Configuration errors, duplicate listen ports included, surface here,
    /// before any port is bound.
    pub fn new(config: Arc<Config>, stats: Arc<RelayStats>) -> Result<Self> {
        config.validate()?;
        let mapping = Arc::new(config.target_mapping()?);
        let engine = Arc::new(RelayEngine::from_config(&config, stats));
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            config,
            mapping,
            engine,
            shutdown_tx,
        })
    }

    pub fn mapping(&self) -> &Arc<TargetMapping> {
        &self.mapping
    }

    pub fn engine(&self) -> &Arc<RelayEngine> {
        &self.engine
    }

    /// Bind every route. A port that fails to bind is reported and skipped;
    /// the others are still returned.
    pub fn bind_all(&self) -> BindReport {
        let bind_ip = self.config.server.bind_ip;
        let backlog = self.config.server.backlog;

        let mut listeners = Vec::with_capacity(self.mapping.len());
        let mut failures = Vec::new();

        for route in self.mapping.routes() {
            let port = route.listen_port;
            match Listener::bind(bind_ip, route, backlog) {
                Ok(listener) => listeners.push(listener),
                Err(e) => {
                    error!(listen_port = port, error = %format!("{:#}", e), "Listener failed to start");
                    failures.push((port, e));
                }
            }
        }

        BindReport {
            listeners,
            failures,
        }
    }

    /// Bind all routes and accept until shutdown.
    ///
    /// Fails only when no listener could be bound at all.
    pub async fn run(&self) -> Result<()> {
        let report = self.bind_all();
        if report.listeners.is_empty() {
            return Err(anyhow!(
                "no listener could be started ({} bind failure(s))",
                report.failures.len()
            ));
        }

        self.serve(report.listeners).await
    }

    /// Serve already bound listeners until shutdown
    pub async fn serve(&self, listeners: Vec<Listener>) -> Result<()> {
        info!("Relaying {} port(s)", listeners.len());

        let mut tasks = JoinSet::new();
        for listener in listeners {
            let engine = Arc::clone(&self.engine);
            let shutdown_rx = self.shutdown_tx.subscribe();
            tasks.spawn(listener.serve(engine, shutdown_rx));
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(error = %format!("{:#}", e), "Listener stopped with error"),
                Err(e) if e.is_cancelled() => {}
                Err(e) => error!(error = %e, "Listener task failed"),
            }
        }

        info!("All listeners stopped");
        Ok(())
    }

    /// Stop accepting on every listener, including ones not yet serving
    pub fn initiate_shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        info!("Listener shutdown requested");
    }
}
