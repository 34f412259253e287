//! Metrics Module
//!
//! Relay byte/session counters and the ways to read them.

pub mod collector;
pub mod reporter;
pub mod server;

pub use collector::{Direction, RelayStats, StatsSnapshot};
pub use reporter::{StatsReport, StatsReporter};
pub use server::StatsServer;
