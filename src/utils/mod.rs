//! # Utility Modules
//!
//! Supporting utilities for logging, traffic metrics and timing.
//!
//! ## Components
//! - **Logging**: structured logging configuration
//! - **Metrics**: shared traffic counters and the trailing-window sampler
//! - **Timeout**: async timeout wrapper and interval constants

pub mod logging;
pub mod metrics;
pub mod timeout;

pub use metrics::{NetworkMetricsSampler, TrafficCounters};
