//! Configuration Types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use super::target::{Target, TargetAddr};
use crate::Result;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub monitoring: MonitoringConfig,
}

/// Listener and session settings shared by every route
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_ip: IpAddr,
    pub backlog: u32,
    /// Upper bound on resolving and connecting to a target
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    pub buffer_size: usize,
    /// Client bytes a session may hold while its target connect is in flight
    pub max_pending_bytes: usize,
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// A single `listen_port -> target_host:target_port` entry
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct RouteConfig {
    pub listen_port: u16,
    pub target_host: String,
    pub target_port: u16,
}

impl RouteConfig {
    /// Parse the host and build the relay target
    pub fn target(&self) -> Result<Target> {
        let host = self.target_host.parse::<TargetAddr>()?;
        Ok(Target::new(host, self.target_port))
    }
}

impl fmt::Display for RouteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.listen_port, self.target_host, self.target_port)
    }
}

/// Monitoring configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub stats_api: StatsApiConfig,
}

/// Read-only HTTP stats endpoint
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StatsApiConfig {
    pub enabled: bool,
    pub bind_addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            routes: vec![],
            monitoring: MonitoringConfig::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            backlog: 2,
            connect_timeout: Duration::from_secs(10),
            buffer_size: 16 * 1024,
            max_pending_bytes: 1024 * 1024,
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            stats_api: StatsApiConfig::default(),
        }
    }
}

impl Default for StatsApiConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, 9900)),
        }
    }
}
