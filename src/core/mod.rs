//! # Core Protocol Components
//!
//! Message framing and the CoT event model.
//!
//! ## Components
//! - **Framer**: splits a byte stream into complete `<event>` documents, also
//!   available as a tokio codec
//! - **CoT**: typed view of an event envelope, ping/pong helpers
//!
//! ## Wire Format
//! ```text
//! [<?xml ...?>] <event version=".." uid=".." type=".." time=".." start=".." stale=".." how="..">
//!   <point lat=".." lon=".." hae=".." ce=".." le=".."/>
//!   <detail>...</detail>
//! </event>
//! ```
//! Events are written back to back with no length prefix.
//!
//! ## Security
//! - Unconsumed input is capped (1 MiB by default) and cleared past the cap
//! - Bytes outside an event envelope are discarded, never fatal

pub mod cot;
pub mod framer;
