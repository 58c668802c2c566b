//! Telemetry: structured logging setup.
//!
//! Metric names recorded through the `metrics` facade by this crate:
//!
//! - `modulith_errors_total{code, category, retryable}`
//! - `modulith_events_dispatched_total{event}`
//! - `modulith_listener_failures_total{event}`
//! - `modulith_events_stored_total{backend}`
//!
//! Installing a recorder/exporter is left to the host process.

pub mod logging;

pub use logging::{init_logging, LogFormat, LoggingConfig};
