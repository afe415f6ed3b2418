//! # takstream
//!
//! Client-side network engine for Cursor-on-Target (CoT) servers.
//!
//! Holds several simultaneous connections (TCP, UDP or mutually
//! authenticated TLS), frames the streaming XML event protocol, routes
//! outbound events through per-server priority queues, scores connection
//! health and enrolls for client certificates.
//!
//! ## Layout
//! - [`core`](crate::core): message framer and CoT event model
//! - [`transport`]: server descriptors, TLS policy and the transport channel
//! - [`identity`]: client identities, identity stores and enrollment
//! - [`service`]: the multi-server [`Coordinator`], queues and health
//! - [`utils`]: logging, traffic metrics and timeouts
//!
//! ## Example
//! ```no_run
//! use std::sync::Arc;
//! use futures::StreamExt;
//! use takstream::{Coordinator, EngineConfig, EngineEvent, MemoryIdentityStore, Priority, ServerDescriptor};
//!
//! # async fn run() -> takstream::Result<()> {
//! let coordinator = Coordinator::new(EngineConfig::default(), Arc::new(MemoryIdentityStore::new()));
//! let mut events = coordinator.take_events().expect("first call");
//!
//! coordinator
//!     .add_connection(ServerDescriptor::tcp("local", "127.0.0.1", 8087))
//!     .await?;
//! coordinator.send_message("<event uid=\"x\" type=\"a-f-G\"/>", "local", Priority::High)?;
//!
//! while let Some(event) = events.next().await {
//!     if let EngineEvent::MessageReceived { server_id, payload } = event {
//!         println!("{server_id}: {payload}");
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod identity;
pub mod service;
pub mod transport;
pub mod utils;

/// Crate version, reported to enrollment endpoints.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use config::EngineConfig;
pub use crate::core::cot::CotEvent;
pub use crate::core::framer::{CotCodec, Framer};
pub use error::{ProtocolError, Result};
pub use identity::{FileIdentityStore, Identity, IdentityRef, IdentityStore, MemoryIdentityStore};
pub use service::{Coordinator, Delivery, EngineEvent, HealthMetrics, HealthStatus, Priority};
pub use transport::{ConnectionState, ServerDescriptor, ServerTrust, TransportKind};
