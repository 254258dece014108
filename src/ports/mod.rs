//! Port traits the domain depends on.

pub mod config_port;
pub mod event_port;
pub mod notifier_port;
pub mod rule_port;
pub mod series_port;
