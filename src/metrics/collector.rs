//! Relay Statistics Collector

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::Result;

/// Direction a chunk of bytes travelled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToTarget,
    TargetToClient,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::ClientToTarget => "client->target",
            Direction::TargetToClient => "target->client",
        }
    }
}

/// Point-in-time copy of the relay counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub bytes_client_to_target: u64,
    pub bytes_target_to_client: u64,
    pub sessions_total: u64,
    pub sessions_active: i64,
    pub connect_failures: u64,
}

impl StatsSnapshot {
    pub fn total_bytes(&self) -> u64 {
        self.bytes_client_to_target + self.bytes_target_to_client
    }
}

/// Process-wide relay counters.
///
/// Every counter is atomic. Sessions only ever increment; readers call
/// [`RelayStats::snapshot`] or [`RelayStats::export_prometheus`] at any time
/// without coordinating with the sessions.
pub struct RelayStats {
    registry: Registry,
    bytes_client_to_target: IntCounter,
    bytes_target_to_client: IntCounter,
    sessions_total: IntCounter,
    sessions_active: IntGauge,
    connect_failures: IntCounter,
}

impl std::fmt::Debug for RelayStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayStats")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl RelayStats {
    /// Create and register the relay counters
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let bytes_client_to_target = IntCounter::new(
            "relay_bytes_client_to_target_total",
            "Bytes forwarded from clients to targets",
        )?;
        let bytes_target_to_client = IntCounter::new(
            "relay_bytes_target_to_client_total",
            "Bytes forwarded from targets to clients",
        )?;
        let sessions_total =
            IntCounter::new("relay_sessions_total", "Client connections accepted")?;
        let sessions_active =
            IntGauge::new("relay_sessions_active", "Sessions currently open")?;
        let connect_failures = IntCounter::new(
            "relay_connect_failures_total",
            "Outbound target connects that failed or timed out",
        )?;

        registry.register(Box::new(bytes_client_to_target.clone()))?;
        registry.register(Box::new(bytes_target_to_client.clone()))?;
        registry.register(Box::new(sessions_total.clone()))?;
        registry.register(Box::new(sessions_active.clone()))?;
        registry.register(Box::new(connect_failures.clone()))?;

        Ok(Self {
            registry,
            bytes_client_to_target,
            bytes_target_to_client,
            sessions_total,
            sessions_active,
            connect_failures,
        })
    }

    /// Count bytes written to the far side
    pub fn add_bytes(&self, direction: Direction, bytes: u64) {
        match direction {
            Direction::ClientToTarget => self.bytes_client_to_target.inc_by(bytes),
            Direction::TargetToClient => self.bytes_target_to_client.inc_by(bytes),
        }
    }

    pub fn session_opened(&self) {
        self.sessions_total.inc();
        self.sessions_active.inc();
    }

    pub fn session_closed(&self) {
        self.sessions_active.dec();
    }

    pub fn connect_failed(&self) {
        self.connect_failures.inc();
    }

    pub fn active_sessions(&self) -> i64 {
        self.sessions_active.get()
    }

    /// Read all counters without mutating them
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_client_to_target: self.bytes_client_to_target.get(),
            bytes_target_to_client: self.bytes_target_to_client.get(),
            sessions_total: self.sessions_total.get(),
            sessions_active: self.sessions_active.get(),
            connect_failures: self.connect_failures.get(),
        }
    }

    /// Render the counters in Prometheus text format
    pub fn export_prometheus(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        debug!(families = metric_families.len(), "Exported Prometheus metrics");
        Ok(String::from_utf8(buffer)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_start_at_zero() {
        let stats = RelayStats::new().unwrap();
        assert_eq!(stats.snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn test_counters_by_direction() {
        let stats = RelayStats::new().unwrap();
        stats.add_bytes(Direction::ClientToTarget, 4);
        stats.add_bytes(Direction::ClientToTarget, 6);
        stats.add_bytes(Direction::TargetToClient, 32);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.bytes_client_to_target, 10);
        assert_eq!(snapshot.bytes_target_to_client, 32);
        assert_eq!(snapshot.total_bytes(), 42);
    }

    #[test]
    fn test_session_gauge() {
        let stats = RelayStats::new().unwrap();
        stats.session_opened();
        stats.session_opened();
        stats.session_closed();
        stats.connect_failed();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.sessions_total, 2);
        assert_eq!(snapshot.sessions_active, 1);
        assert_eq!(snapshot.connect_failures, 1);
        assert_eq!(stats.active_sessions(), 1);
    }

    #[test]
    fn test_snapshot_does_not_reset() {
        let stats = RelayStats::new().unwrap();
        stats.add_bytes(Direction::TargetToClient, 5);
        assert_eq!(stats.snapshot(), stats.snapshot());
    }

    #[test]
    fn test_prometheus_export() {
        let stats = RelayStats::new().unwrap();
        stats.add_bytes(Direction::ClientToTarget, 7);

        let text = stats.export_prometheus().unwrap();
        assert!(text.contains("relay_bytes_client_to_target_total 7"));
        assert!(text.contains("relay_sessions_active 0"));
    }
}
