//! # Transport Layer
//!
//! Connections to CoT servers over plaintext TCP, UDP or mutually
//! authenticated TLS.
//!
//! ## Components
//! - **Descriptor**: what to connect to and how, plus connection state
//! - **Channel**: one live connection with its reader and writer tasks
//! - **TLS**: protocol profile, trust modes and client identity presentation

pub mod channel;
pub mod descriptor;
pub mod tls;

pub use channel::{ChannelEvent, ChannelOptions, TransportChannel};
pub use descriptor::{
    ConnectionState, EnrollmentCredentials, ServerDescriptor, ServerTrust, TlsOptions,
    TransportKind,
};
