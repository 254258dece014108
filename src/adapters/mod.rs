//! Concrete adapter implementations for ports.

#[cfg(feature = "sqlite")]
pub mod sqlite_adapter;
pub mod csv_adapter;
pub mod file_config_adapter;
pub mod log_notifier;
pub mod memory_event_store;
pub mod rule_file_adapter;
#[cfg(feature = "webhook")]
pub mod webhook_notifier;
