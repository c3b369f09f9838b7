//! # Utility Modules
//!
//! Supporting utilities shared by the dispatcher and the transports.
//!
//! ## Components
//! - **Logging**: Structured logging configuration
//! - **Metrics**: Thread-safe traffic counters

pub mod logging;
pub mod metrics;

pub use metrics::{Metrics, MetricsSnapshot};
