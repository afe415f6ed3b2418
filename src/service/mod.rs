//! # Service Layer
//!
//! Coordination of several server connections for application code.
//!
//! ## Components
//! - **Coordinator**: owns channels, routes events, drains queues, reconnects
//! - **Queue**: per-server outbound priority queue with bounded capacity
//! - **Health**: per-connection scoring from traffic, pings and certificate expiry

pub mod coordinator;
pub mod health;
pub mod queue;

pub use coordinator::{Coordinator, Delivery, EngineEvent};
pub use health::{HealthMetrics, HealthMonitor, HealthStatus};
pub use queue::{Priority, PriorityQueue, QueuedMessage};
