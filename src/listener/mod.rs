//! Listener Module
//!
//! Binds the configured ports and turns every accepted client into a session.

pub mod acceptor;
pub mod manager;

pub use acceptor::Listener;
pub use manager::{BindReport, RelayServer};
