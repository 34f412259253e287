//! Stats Reporter
//!
//! Prints the relay counters on demand (SIGUSR1 on unix).

use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{RelayStats, StatsSnapshot};
use crate::Result;

/// Snapshot plus when it was taken
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsReport {
    pub generated_at: u64, // Unix timestamp
    pub uptime_secs: u64,
    #[serde(flatten)]
    pub counters: StatsSnapshot,
}

/// Samples [`RelayStats`] without touching the sessions that update it
#[derive(Debug, Clone)]
pub struct StatsReporter {
    stats: Arc<RelayStats>,
    started: Instant,
}

impl StatsReporter {
    pub fn new(stats: Arc<RelayStats>) -> Self {
        Self {
            stats,
            started: Instant::now(),
        }
    }

    pub fn report(&self) -> StatsReport {
        let generated_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        StatsReport {
            generated_at,
            uptime_secs: self.started.elapsed().as_secs(),
            counters: self.stats.snapshot(),
        }
    }

    pub fn report_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.report())?)
    }

    /// Log the current counters
    pub fn log_snapshot(&self) {
        let report = self.report();
        info!(
            uptime_secs = report.uptime_secs,
            bytes_client_to_target = report.counters.bytes_client_to_target,
            bytes_target_to_client = report.counters.bytes_target_to_client,
            sessions_total = report.counters.sessions_total,
            sessions_active = report.counters.sessions_active,
            connect_failures = report.counters.connect_failures,
            "Relay stats"
        );
    }

    /// Log the counters every time SIGUSR1 arrives. Runs until the task is
    /// dropped.
    #[cfg(unix)]
    pub async fn listen_for_signal(self) -> Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigusr1 = signal(SignalKind::user_defined1())?;
        debug!("Stats reporter listening for SIGUSR1");

        while sigusr1.recv().await.is_some() {
            self.log_snapshot();
        }

        Ok(())
    }

    #[cfg(not(unix))]
    pub async fn listen_for_signal(self) -> Result<()> {
        debug!("SIGUSR1 stats reporting is only available on unix");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::Direction;

    #[test]
    fn test_report_reflects_counters() {
        let stats = Arc::new(RelayStats::new().unwrap());
        stats.add_bytes(Direction::ClientToTarget, 4);
        stats.add_bytes(Direction::TargetToClient, 9);

        let reporter = StatsReporter::new(stats.clone());
        let report = reporter.report();
        assert_eq!(report.counters.bytes_client_to_target, 4);
        assert_eq!(report.counters.bytes_target_to_client, 9);

        // Reporting must not disturb the counters
        assert_eq!(stats.snapshot(), report.counters);
    }

    #[test]
    fn test_report_json_is_flat() {
        let stats = Arc::new(RelayStats::new().unwrap());
        stats.session_opened();

        let json = StatsReporter::new(stats).report_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["sessions_total"], 1);
        assert_eq!(value["sessions_active"], 1);
        assert!(value["generated_at"].as_u64().unwrap() > 0);
    }
}
