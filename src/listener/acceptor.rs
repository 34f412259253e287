//! Per-port listener

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tracing::{debug, error, info, instrument};

use crate::config::Route;
use crate::relay::RelayEngine;
use crate::Result;

/// A bound listen socket for one route
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    route: Arc<Route>,
    local_addr: SocketAddr,
}

impl Listener {
    /// Bind `(bind_ip, route.listen_port)` with the given accept backlog.
    ///
    /// No retry: a port that is in use or not permitted fails right away.
    pub fn bind(bind_ip: IpAddr, route: Route, backlog: u32) -> Result<Self> {
        let addr = SocketAddr::new(bind_ip, route.listen_port);

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .with_context(|| format!("Failed to create socket for {}", addr))?;

        socket
            .set_reuseaddr(true)
            .with_context(|| format!("Failed to set SO_REUSEADDR on {}", addr))?;
        socket
            .bind(addr)
            .with_context(|| format!("Failed to bind {}", addr))?;
        let inner = socket
            .listen(backlog)
            .with_context(|| format!("Failed to listen on {}", addr))?;
        let local_addr = inner
            .local_addr()
            .with_context(|| format!("Failed to read local address for {}", addr))?;

        info!(
            local_addr = %local_addr,
            target_addr = %route.target,
            backlog,
            "Listening"
        );

        Ok(Self {
            inner,
            route: Arc::new(route),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    /// Accept clients and hand each to a new session until shutdown
    #[instrument(skip_all, fields(listen_port = self.route.listen_port))]
    pub async fn serve(
        self,
        engine: Arc<RelayEngine>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> Result<()> {
        if *shutdown_rx.borrow() {
            info!("Shutdown already requested, not accepting");
            return Ok(());
        }

        debug!("Starting connection acceptance loop");

        loop {
            tokio::select! {
                accept_result = self.inner.accept() => {
                    match accept_result {
                        Ok((stream, addr)) => {
                            debug!(client = %addr, "Accepted connection");
                            engine.spawn_session(stream, addr, Arc::clone(&self.route));
                        }
                        Err(e) => {
                            // Usually fd exhaustion; back off instead of spinning
                            error!(error = %e, "Error accepting connection");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        info!("Received shutdown signal, stopping connection acceptance");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Target, TargetAddr};
    use std::net::Ipv4Addr;

    fn route(listen_port: u16) -> Route {
        Route {
            listen_port,
            target: Target::new(TargetAddr::Domain("example.net".to_string()), 9001),
        }
    }

    #[tokio::test]
    async fn test_bind_ephemeral_port() {
        let listener = Listener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), route(0), 2).unwrap();
        assert_ne!(listener.local_addr().port(), 0);
        assert_eq!(listener.route().target.port, 9001);
    }

    #[tokio::test]
    async fn test_serve_returns_when_shutdown_already_requested() {
        let listener = Listener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), route(0), 2).unwrap();
        let engine = Arc::new(RelayEngine::new(
            crate::relay::SessionSettings::default(),
            Arc::new(crate::metrics::RelayStats::new().unwrap()),
        ));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        shutdown_tx.send_replace(true);

        tokio::time::timeout(Duration::from_secs(1), listener.serve(engine, shutdown_rx))
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_bind_port_in_use_fails() {
        let first = Listener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), route(0), 2).unwrap();
        let port = first.local_addr().port();

        let err = Listener::bind(IpAddr::V4(Ipv4Addr::LOCALHOST), route(port), 2).unwrap_err();
        assert!(err.to_string().contains("Failed to"), "{}", err);
    }
}
