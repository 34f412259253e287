//! portrelay
//!
//! Port-mapping TCP relay. Each configured local port is wired to one
//! target `host:port`; every client that connects gets its own outbound
//! connection, and bytes the client sends before that connection is up are
//! queued and delivered first, in order.

pub mod config;
pub mod listener;
pub mod metrics;
pub mod relay;
pub mod shutdown;

pub use config::Config;
pub use listener::RelayServer;
pub use metrics::RelayStats;
pub use shutdown::ShutdownCoordinator;

/// Common error type for the relay
pub type Result<T> = anyhow::Result<T>;
