//! Configuration Module
//!
//! Handles configuration loading, validation, and the immutable target mapping.

pub mod manager;
pub mod target;
pub mod types;

pub use manager::{CliOverrides, ConfigManager};
pub use target::{parse_route_spec, Route, Target, TargetAddr, TargetMapping};
pub use types::*;
