//! Server descriptors and connection state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::identity::IdentityRef;

/// Transport used to reach a server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Tcp,
    Udp,
    Tls,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            TransportKind::Tcp => "tcp",
            TransportKind::Udp => "udp",
            TransportKind::Tls => "tls",
        })
    }
}

/// How the server certificate is validated
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ServerTrust {
    /// DANGEROUS: accept any server certificate, including self-signed and
    /// private-CA ones. Intended for tactical deployments running their own
    /// certificate authority. Never selected implicitly.
    AcceptAny,
    /// Accept only a server leaf whose SHA-256 fingerprint (hex) matches.
    Pinned { sha256: String },
    /// Validate against the platform roots plus the identity's chain.
    Verified,
}

impl Default for ServerTrust {
    fn default() -> Self {
        ServerTrust::Verified
    }
}

/// TLS flags of a descriptor
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TlsOptions {
    /// Lower the protocol floor to the oldest version in the profile
    #[serde(default)]
    pub allow_legacy: bool,

    #[serde(default)]
    pub trust: ServerTrust,

    /// SNI name when it differs from `host`
    #[serde(default)]
    pub server_name: Option<String>,
}

/// Credentials used to enroll against the server
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrollmentCredentials {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub token: Option<String>,
    pub port: u16,
}

impl fmt::Debug for EnrollmentCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnrollmentCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("port", &self.port)
            .finish()
    }
}

/// Everything needed to connect to one server.
///
/// Owned by the application. The coordinator keeps a clone per active
/// connection; edits take effect only after the connection is re-added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerDescriptor {
    pub id: String,
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    #[serde(default)]
    pub tls: TlsOptions,
    #[serde(default)]
    pub identity: Option<IdentityRef>,
    #[serde(default)]
    pub enrollment: Option<EnrollmentCredentials>,
    #[serde(default = "enabled_default")]
    pub enabled: bool,
}

fn enabled_default() -> bool {
    true
}

impl ServerDescriptor {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16, transport: TransportKind) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
            transport,
            tls: TlsOptions::default(),
            identity: None,
            enrollment: None,
            enabled: true,
        }
    }

    pub fn tcp(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self::new(id, host, port, TransportKind::Tcp)
    }

    pub fn udp(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self::new(id, host, port, TransportKind::Udp)
    }

    pub fn tls(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self::new(id, host, port, TransportKind::Tls)
    }

    pub fn with_identity(mut self, identity: IdentityRef) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn with_trust(mut self, trust: ServerTrust) -> Self {
        self.tls.trust = trust;
        self
    }

    pub fn with_legacy_tls(mut self, allow: bool) -> Self {
        self.tls.allow_legacy = allow;
        self
    }

    pub fn with_enrollment(mut self, credentials: EnrollmentCredentials) -> Self {
        self.enrollment = Some(credentials);
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// `host:port` suitable for socket resolution.
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn is_tls(&self) -> bool {
        self.transport == TransportKind::Tls
    }

    /// Whether a client certificate is part of this connection's health.
    pub fn requires_identity(&self) -> bool {
        self.is_tls() && self.identity.is_some()
    }
}

/// Lifecycle of one connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl Default for ConnectionState {
    fn default() -> Self {
        ConnectionState::Disconnected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => f.write_str("disconnected"),
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Reconnecting => f.write_str("reconnecting"),
            ConnectionState::Failed(reason) => write!(f, "failed: {reason}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_defaults_to_verified_trust() {
        let descriptor = ServerDescriptor::tls("a", "tak.example", 8089);
        assert_eq!(descriptor.tls.trust, ServerTrust::Verified);
        assert!(descriptor.enabled);
        assert!(!descriptor.requires_identity());
    }

    #[test]
    fn ipv6_address_is_bracketed() {
        let descriptor = ServerDescriptor::tcp("a", "::1", 8087);
        assert_eq!(descriptor.address(), "[::1]:8087");
    }

    #[test]
    fn descriptor_serializes_to_json() {
        let descriptor = ServerDescriptor::tls("a", "tak.example", 8089)
            .with_identity(IdentityRef::new("enrolled-tak.example"))
            .with_trust(ServerTrust::Pinned { sha256: "ab".repeat(32) });
        let json = serde_json::to_string(&descriptor).unwrap();
        let back: ServerDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, descriptor);
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = EnrollmentCredentials {
            username: "alice".into(),
            password: "s3cret".into(),
            token: Some("tok".into()),
            port: 8446,
        };
        let shown = format!("{creds:?}");
        assert!(!shown.contains("s3cret"));
        assert!(!shown.contains("tok\""));
    }
}
