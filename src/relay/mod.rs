//! Data Relay Module
//!
//! Connects each accepted client to its target and relays bytes both ways.

pub mod connector;
pub mod engine;
pub mod pending;
pub mod pump;
pub mod session;
pub mod transport;

pub use engine::RelayEngine;
pub use pending::{PendingQueue, QueueFull};
pub use pump::PumpError;
pub use session::{CloseReason, Session, SessionOutcome, SessionSettings, SessionState};
pub use transport::{Side, Transport};
