//! portrelay - port-mapping TCP relay
//!
//! Listens on the configured local ports and pipes every client to the
//! target configured for that port. Bytes sent before the target connection
//! is up are queued and delivered first; TCP_NODELAY on every socket.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use tracing::{error, info, warn};
use tracing_subscriber::{
    layer::SubscriberExt, reload, util::SubscriberInitExt, EnvFilter, Registry,
};

use portrelay::config::{CliOverrides, ConfigManager};
use portrelay::metrics::{RelayStats, StatsReporter, StatsServer};
use portrelay::{RelayServer, ShutdownCoordinator};

/// CLI arguments for portrelay
#[derive(Parser, Debug)]
#[command(name = "portrelay")]
#[command(about = "Port-mapping TCP relay")]
#[command(version)]
#[command(long_about = "
Listens on defined ports and pipes clients to defined target sockets.

Example: portrelay --tcp 22:example.net --tcp 8443:example.com:443 --tcp 80:example.org

Configuration priority (highest to lowest):
1. Command-line arguments
2. Configuration file
3. Environment variables
4. Built-in defaults

Environment variables:
  RELAY_BIND_IP            - IP to bind every listener to (default 0.0.0.0)
  RELAY_BACKLOG            - Accept backlog per listener
  RELAY_CONNECT_TIMEOUT    - Target connect timeout (e.g. 10s)
  RELAY_MAX_PENDING_BYTES  - Bytes a client may send before its target connects
  RELAY_BUFFER_SIZE        - Forwarding buffer size in bytes
  RELAY_LOG_LEVEL          - Log level (trace, debug, info, warn, error)
  RELAY_TCP                - Comma separated route specs

Send SIGUSR1 to print the byte counters.
")]
pub struct CliArgs {
    /// Configuration file path
    #[arg(short, long, default_value = "portrelay.toml", help = "Path to configuration file")]
    pub config: PathBuf,

    /// Route spec, repeatable
    #[arg(
        long = "tcp",
        value_name = "HERE_PORT:DEST_HOST[:DEST_PORT]",
        num_args = 1..,
        help = "Listen on HERE_PORT and connect through to DEST_HOST:DEST_PORT (DEST_PORT defaults to HERE_PORT)"
    )]
    pub tcp: Vec<String>,

    /// IP to bind listeners to (overrides config file)
    #[arg(short, long, help = "IP to bind listeners to (e.g. 0.0.0.0)")]
    pub bind: Option<String>,

    /// Accept backlog per listener
    #[arg(long, help = "Accept backlog per listener")]
    pub backlog: Option<u32>,

    /// Target connect timeout in seconds
    #[arg(long, help = "Target connect timeout in seconds")]
    pub connect_timeout: Option<u64>,

    /// Bytes a client may send before its target connects
    #[arg(long, help = "Bytes a client may send before its target connects")]
    pub max_pending_bytes: Option<usize>,

    /// Serve /health, /stats and /metrics on this address
    #[arg(long, help = "Serve /health, /stats and /metrics on this address")]
    pub stats_addr: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, help = "Log level")]
    pub log_level: Option<String>,

    /// Enable verbose logging (sets log level to debug)
    #[arg(short, long, help = "Enable verbose logging")]
    pub verbose: bool,

    /// Validate configuration and exit
    #[arg(long, help = "Validate configuration and exit")]
    pub validate_config: bool,
}

impl CliArgs {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            routes: self.tcp.clone(),
            bind_ip: self.bind.clone(),
            backlog: self.backlog,
            connect_timeout_secs: self.connect_timeout,
            max_pending_bytes: self.max_pending_bytes,
            stats_addr: self.stats_addr.clone(),
            log_level: self.log_level.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    // Config loading logs too; the configured level is applied once known
    let filter_handle = init_tracing(&args)?;

    // Load configuration with priority: CLI args > config file > environment > defaults
    let mut config = if args.config.exists() {
        ConfigManager::load_from_file(&args.config)?
    } else {
        ConfigManager::load_from_env()?
    };

    // Apply CLI argument overrides (highest priority)
    config.merge_with_cli_args(&args.overrides())?;

    info!("Starting portrelay v{}", env!("CARGO_PKG_VERSION"));

    // Final validation after all overrides
    config
        .validate()
        .context("Final configuration validation failed")?;

    if let Some(handle) = filter_handle {
        handle
            .reload(EnvFilter::new(&config.monitoring.log_level))
            .context("Failed to apply configured log level")?;
    }

    if args.validate_config {
        info!("Configuration is valid");
        info!("  Bind IP: {}", config.server.bind_ip);
        info!("  Backlog: {}", config.server.backlog);
        info!("  Connect timeout: {:?}", config.server.connect_timeout);
        info!("  Max pending bytes: {}", config.server.max_pending_bytes);
        for route in config.target_mapping()?.routes() {
            info!("  Route: {}", route);
        }
        return Ok(());
    }

    let stats = Arc::new(RelayStats::new()?);
    let shutdown_coordinator = ShutdownCoordinator::new(config.server.shutdown_timeout);

    // SIGUSR1 prints the counters
    let reporter = StatsReporter::new(Arc::clone(&stats));
    let reporter_handle = tokio::spawn(async move {
        if let Err(e) = reporter.listen_for_signal().await {
            error!("Stats signal handler error: {}", e);
        }
    });

    let stats_handle = if config.monitoring.stats_api.enabled {
        let server = StatsServer::new(config.monitoring.stats_api.bind_addr, Arc::clone(&stats));
        Some(tokio::spawn(async move {
            if let Err(e) = server.start().await {
                error!("Stats server error: {:#}", e);
            }
        }))
    } else {
        None
    };

    let config = Arc::new(config);
    let relay = Arc::new(RelayServer::new(Arc::clone(&config), Arc::clone(&stats))?);

    for route in relay.mapping().routes() {
        info!("Route {}", route);
    }

    let mut server_handle = {
        let relay = Arc::clone(&relay);
        tokio::spawn(async move { relay.run().await })
    };

    info!("portrelay started, send SIGTERM/SIGINT to shut down, SIGUSR1 for stats");

    let exit = tokio::select! {
        result = &mut server_handle => {
            // Only returns on its own when nothing could be bound
            match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e),
                Err(e) => Err(anyhow::anyhow!("Relay task failed: {}", e)),
            }
        }
        signal_result = shutdown_coordinator.listen_for_signals() => {
            if let Err(e) = signal_result {
                error!("Error setting up signal handlers: {}", e);
            }

            if !shutdown_coordinator.shutdown_relay(&relay).await {
                warn!("Exiting with sessions still open");
            }

            if let Err(e) = server_handle.await {
                if !e.is_cancelled() {
                    error!("Relay task failed: {}", e);
                }
            }
            Ok(())
        }
    };

    reporter_handle.abort();
    if let Some(handle) = stats_handle {
        handle.abort();
        info!("Stats server shutdown");
    }

    info!("Relay shutdown complete");
    exit
}

/// Handle for swapping the log filter after configuration is loaded
type FilterHandle = reload::Handle<EnvFilter, Registry>;

/// Initialize tracing/logging.
///
/// RUST_LOG wins, then `--verbose`/`--log-level`. Otherwise logging starts at
/// `info` and the returned handle applies the configured level later.
fn init_tracing(args: &CliArgs) -> Result<Option<FilterHandle>> {
    let env_filter = EnvFilter::try_from_default_env().ok();
    let (log_level, adjustable) = initial_log_level(args);
    let adjustable = adjustable && env_filter.is_none();

    let env_filter = env_filter.unwrap_or_else(|| EnvFilter::new(log_level));
    let (filter_layer, handle) = reload::Layer::new(env_filter);

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_thread_ids(true)
                .with_level(true)
                .with_ansi(true),
        )
        .try_init()
        .context("Failed to install tracing subscriber")?;

    Ok(adjustable.then_some(handle))
}

/// Starting log level, and whether the loaded configuration may change it
fn initial_log_level(args: &CliArgs) -> (&str, bool) {
    if args.verbose {
        ("debug", false)
    } else if let Some(level) = args.log_level.as_deref() {
        (level, false)
    } else {
        ("info", true)
    }
}
