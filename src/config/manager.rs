//! Configuration Manager

use super::{parse_route_spec, Config, TargetMapping};
use crate::Result;
use anyhow::{bail, Context};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// Manages configuration loading and validation
pub struct ConfigManager;

/// Values supplied on the command line; `None` leaves the loaded value alone
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub routes: Vec<String>,
    pub bind_ip: Option<String>,
    pub backlog: Option<u32>,
    pub connect_timeout_secs: Option<u64>,
    pub max_pending_bytes: Option<usize>,
    pub stats_addr: Option<String>,
    pub log_level: Option<String>,
}

impl ConfigManager {
    /// Load configuration from file
    pub fn load_from_file(path: &Path) -> Result<Config> {
        if path.exists() {
            tracing::info!("Loading configuration from: {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;

            let config: Config = toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

            config
                .validate_settings()
                .with_context(|| "Configuration validation failed")?;

            tracing::info!("Configuration loaded and validated successfully");
            Ok(config)
        } else {
            tracing::warn!("Configuration file not found at {}, using defaults", path.display());
            let config = Config::default();
            config.validate_settings()?;
            Ok(config)
        }
    }

    /// Load configuration from `RELAY_*` environment variables
    pub fn load_from_env() -> Result<Config> {
        Self::load_from_vars(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn load_from_vars<F>(var: F) -> Result<Config>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Config::default();

        if let Some(bind_ip) = var("RELAY_BIND_IP") {
            config.server.bind_ip = bind_ip
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid RELAY_BIND_IP: {}", bind_ip))?;
        }

        if let Some(backlog) = var("RELAY_BACKLOG") {
            config.server.backlog = backlog
                .parse::<u32>()
                .with_context(|| format!("Invalid RELAY_BACKLOG: {}", backlog))?;
        }

        if let Some(timeout) = var("RELAY_CONNECT_TIMEOUT") {
            config.server.connect_timeout = humantime::parse_duration(&timeout)
                .with_context(|| format!("Invalid RELAY_CONNECT_TIMEOUT: {}", timeout))?;
        }

        if let Some(max_pending) = var("RELAY_MAX_PENDING_BYTES") {
            config.server.max_pending_bytes = max_pending
                .parse::<usize>()
                .with_context(|| format!("Invalid RELAY_MAX_PENDING_BYTES: {}", max_pending))?;
        }

        if let Some(buffer_size) = var("RELAY_BUFFER_SIZE") {
            config.server.buffer_size = buffer_size
                .parse::<usize>()
                .with_context(|| format!("Invalid RELAY_BUFFER_SIZE: {}", buffer_size))?;
        }

        if let Some(log_level) = var("RELAY_LOG_LEVEL") {
            config.monitoring.log_level = log_level;
        }

        if let Some(specs) = var("RELAY_TCP") {
            for spec in specs.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                let route = parse_route_spec(spec)
                    .with_context(|| format!("Invalid RELAY_TCP entry: {}", spec))?;
                config.routes.push(route);
            }
        }

        config.validate_settings()?;
        Ok(config)
    }
}

impl Config {
    /// Validate the complete configuration, routes included
    pub fn validate(&self) -> Result<()> {
        self.validate_settings()?;

        self.validate_routes()
            .with_context(|| "Route configuration validation failed")?;

        Ok(())
    }

    /// Validate everything except the route table, which may still be filled
    /// in from the command line
    pub fn validate_settings(&self) -> Result<()> {
        self.validate_server_config()
            .with_context(|| "Server configuration validation failed")?;

        self.validate_monitoring_config()
            .with_context(|| "Monitoring configuration validation failed")?;

        Ok(())
    }

    fn validate_server_config(&self) -> Result<()> {
        if self.server.backlog == 0 {
            bail!("backlog must be greater than 0");
        }

        if self.server.connect_timeout.is_zero() {
            bail!("connect_timeout must be greater than 0");
        }

        if self.server.connect_timeout > Duration::from_secs(3600) {
            bail!("connect_timeout cannot exceed 1 hour");
        }

        if self.server.buffer_size < 1024 {
            bail!("buffer_size must be at least 1024 bytes");
        }

        if self.server.buffer_size > 1048576 {
            bail!("buffer_size cannot exceed 1MB");
        }

        if self.server.max_pending_bytes < self.server.buffer_size {
            bail!(
                "max_pending_bytes ({}) must be at least buffer_size ({})",
                self.server.max_pending_bytes,
                self.server.buffer_size
            );
        }

        Ok(())
    }

    fn validate_routes(&self) -> Result<()> {
        if self.routes.is_empty() {
            bail!("at least one route must be configured (e.g. --tcp 9000:example.net:9001)");
        }

        for (i, route) in self.routes.iter().enumerate() {
            if route.listen_port == 0 {
                bail!("Route {} has invalid listen port 0", i);
            }

            if route.target_port == 0 {
                bail!("Route {} has invalid target port 0", i);
            }
        }

        // Duplicate listen ports and bad hosts surface here
        self.target_mapping()?;

        Ok(())
    }

    fn validate_monitoring_config(&self) -> Result<()> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.monitoring.log_level.as_str()) {
            bail!("monitoring.log_level must be one of: {}", valid_log_levels.join(", "));
        }

        Ok(())
    }

    /// Build the immutable port -> target mapping
    pub fn target_mapping(&self) -> Result<TargetMapping> {
        TargetMapping::from_routes(&self.routes)
    }

    /// Merge with CLI arguments.
    ///
    /// Routes given on the command line replace any routes from the file or
    /// environment.
    pub fn merge_with_cli_args(&mut self, cli: &CliOverrides) -> Result<()> {
        if !cli.routes.is_empty() {
            self.routes = cli
                .routes
                .iter()
                .map(|spec| parse_route_spec(spec))
                .collect::<Result<Vec<_>>>()?;
            tracing::info!("CLI override: {} route(s) from --tcp", self.routes.len());
        }

        if let Some(bind_str) = &cli.bind_ip {
            let ip = bind_str
                .parse::<IpAddr>()
                .with_context(|| format!("Invalid bind IP provided: {}", bind_str))?;
            self.server.bind_ip = ip;
            tracing::info!("CLI override: bind IP set to {}", ip);
        }

        if let Some(backlog) = cli.backlog {
            self.server.backlog = backlog;
            tracing::info!("CLI override: backlog set to {}", backlog);
        }

        if let Some(timeout_secs) = cli.connect_timeout_secs {
            self.server.connect_timeout = Duration::from_secs(timeout_secs);
            tracing::info!("CLI override: connect timeout set to {}s", timeout_secs);
        }

        if let Some(max_pending) = cli.max_pending_bytes {
            self.server.max_pending_bytes = max_pending;
            tracing::info!("CLI override: max pending bytes set to {}", max_pending);
        }

        if let Some(addr) = &cli.stats_addr {
            let addr = addr
                .parse::<SocketAddr>()
                .with_context(|| format!("Invalid stats address provided: {}", addr))?;
            self.monitoring.stats_api.enabled = true;
            self.monitoring.stats_api.bind_addr = addr;
            tracing::info!("CLI override: stats API enabled on {}", addr);
        }

        if let Some(level) = &cli.log_level {
            self.monitoring.log_level = level.clone();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RouteConfig;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_need_routes() {
        let config = Config::default();
        assert!(config.validate_settings().is_ok());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_vars() {
        let config = ConfigManager::load_from_vars(vars(&[
            ("RELAY_BIND_IP", "127.0.0.1"),
            ("RELAY_BACKLOG", "64"),
            ("RELAY_CONNECT_TIMEOUT", "3s"),
            ("RELAY_TCP", "9000:example.net:9001, 22:example.org"),
        ]))
        .unwrap();

        assert_eq!(config.server.bind_ip, "127.0.0.1".parse::<IpAddr>().unwrap());
        assert_eq!(config.server.backlog, 64);
        assert_eq!(config.server.connect_timeout, Duration::from_secs(3));
        assert_eq!(config.routes.len(), 2);
        assert_eq!(config.routes[1].target_port, 22);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_vars_defaults_bind_ip() {
        let config = ConfigManager::load_from_vars(vars(&[])).unwrap();
        assert_eq!(config.server.bind_ip.to_string(), "0.0.0.0");
        assert_eq!(config.server.backlog, 2);
    }

    #[test]
    fn test_load_from_vars_rejects_bad_values() {
        assert!(ConfigManager::load_from_vars(vars(&[("RELAY_BIND_IP", "nope")])).is_err());
        assert!(ConfigManager::load_from_vars(vars(&[("RELAY_BACKLOG", "0")])).is_err());
        assert!(ConfigManager::load_from_vars(vars(&[("RELAY_TCP", "9000")])).is_err());
    }

    #[test]
    fn test_duplicate_listen_port_is_fatal() {
        let mut config = Config::default();
        config.routes = vec![
            RouteConfig {
                listen_port: 9000,
                target_host: "example.net".to_string(),
                target_port: 9001,
            },
            RouteConfig {
                listen_port: 9000,
                target_host: "example.com".to_string(),
                target_port: 443,
            },
        ];

        let err = format!("{:#}", config.validate().unwrap_err());
        assert!(err.contains("duplicate listen port 9000"), "{}", err);
    }

    #[test]
    fn test_server_limits() {
        let mut config = Config::default();
        config.server.buffer_size = 512;
        assert!(config.validate_settings().is_err());

        let mut config = Config::default();
        config.server.max_pending_bytes = 1024;
        assert!(config.validate_settings().is_err());

        let mut config = Config::default();
        config.server.connect_timeout = Duration::ZERO;
        assert!(config.validate_settings().is_err());

        let mut config = Config::default();
        config.monitoring.log_level = "loud".to_string();
        assert!(config.validate_settings().is_err());
    }

    #[test]
    fn test_cli_routes_replace_configured_routes() {
        let mut config =
            ConfigManager::load_from_vars(vars(&[("RELAY_TCP", "80:example.org")])).unwrap();

        let cli = CliOverrides {
            routes: vec!["8443:example.com:443".to_string()],
            bind_ip: Some("::1".to_string()),
            backlog: Some(128),
            stats_addr: Some("127.0.0.1:9911".to_string()),
            ..Default::default()
        };
        config.merge_with_cli_args(&cli).unwrap();

        assert_eq!(config.routes.len(), 1);
        assert_eq!(config.routes[0].listen_port, 8443);
        assert_eq!(config.server.bind_ip.to_string(), "::1");
        assert_eq!(config.server.backlog, 128);
        assert!(config.monitoring.stats_api.enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_rejects_bad_bind_ip() {
        let mut config = Config::default();
        let cli = CliOverrides {
            bind_ip: Some("localhost:80".to_string()),
            ..Default::default()
        };
        assert!(config.merge_with_cli_args(&cli).is_err());
    }
}
