//! # TLS Transport Policy
//!
//! Builds the rustls client configuration for a descriptor and performs the
//! handshake on an established TCP stream.
//!
//! ## Responsibilities
//! - Protocol floor/ceiling and cipher preference ([`TlsProfile`])
//! - Server trust: accept-any, SHA-256 pinning, or platform verification
//! - Presenting the client identity when the server asks for one
//! - Telling "the server wanted a client certificate we do not have" apart
//!   from every other handshake failure
//!
//! ## Backend limits
//! rustls implements TLS 1.2 and 1.3 with AEAD suites only. A legacy profile
//! still records TLS 1.0 as its requested floor and lists the CBC suites in
//! its preference, but the effective floor is TLS 1.2 and the CBC entries are
//! filtered out with a warning.

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use rustls::client::{ResolvesClientCert, ServerCertVerified, ServerCertVerifier, WebPkiVerifier};
use rustls::sign::CertifiedKey;
use rustls::{
    AlertDescription, Certificate, ClientConfig, RootCertStore, ServerName, SignatureScheme,
    SupportedCipherSuite, SupportedProtocolVersion,
};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, info, instrument, warn};

use super::descriptor::{ServerDescriptor, ServerTrust, TlsOptions};
use crate::error::{ProtocolError, Result};
use crate::identity::Identity;

/// How long to wait for the server's verdict after it requested a client
/// certificate we could not provide
const CERT_VERDICT_WINDOW: Duration = Duration::from_millis(250);

/// TLS protocol versions, oldest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum TlsVersion {
    Tls10,
    Tls11,
    Tls12,
    Tls13,
}

impl TlsVersion {
    pub const OLDEST: TlsVersion = TlsVersion::Tls10;
    pub const BASELINE: TlsVersion = TlsVersion::Tls12;
    pub const NEWEST: TlsVersion = TlsVersion::Tls13;

    fn to_rustls(self) -> Option<&'static SupportedProtocolVersion> {
        match self {
            TlsVersion::Tls12 => Some(&rustls::version::TLS12),
            TlsVersion::Tls13 => Some(&rustls::version::TLS13),
            TlsVersion::Tls10 | TlsVersion::Tls11 => None,
        }
    }
}

/// Cipher suites in preference order, modern first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CipherSuite {
    Tls13Aes256GcmSha384,
    Tls13Aes128GcmSha256,
    Tls13Chacha20Poly1305Sha256,
    EcdheEcdsaAes256GcmSha384,
    EcdheRsaAes256GcmSha384,
    EcdheEcdsaAes128GcmSha256,
    EcdheRsaAes128GcmSha256,
    EcdheEcdsaChacha20Poly1305,
    EcdheRsaChacha20Poly1305,
    EcdheRsaAes256CbcSha,
    EcdheRsaAes128CbcSha,
    RsaAes256CbcSha,
    RsaAes128CbcSha,
}

impl CipherSuite {
    pub const PREFERENCE: [CipherSuite; 13] = [
        CipherSuite::Tls13Aes256GcmSha384,
        CipherSuite::Tls13Aes128GcmSha256,
        CipherSuite::Tls13Chacha20Poly1305Sha256,
        CipherSuite::EcdheEcdsaAes256GcmSha384,
        CipherSuite::EcdheRsaAes256GcmSha384,
        CipherSuite::EcdheEcdsaAes128GcmSha256,
        CipherSuite::EcdheRsaAes128GcmSha256,
        CipherSuite::EcdheEcdsaChacha20Poly1305,
        CipherSuite::EcdheRsaChacha20Poly1305,
        CipherSuite::EcdheRsaAes256CbcSha,
        CipherSuite::EcdheRsaAes128CbcSha,
        CipherSuite::RsaAes256CbcSha,
        CipherSuite::RsaAes128CbcSha,
    ];

    pub fn iana_name(self) -> &'static str {
        match self {
            CipherSuite::Tls13Aes256GcmSha384 => "TLS_AES_256_GCM_SHA384",
            CipherSuite::Tls13Aes128GcmSha256 => "TLS_AES_128_GCM_SHA256",
            CipherSuite::Tls13Chacha20Poly1305Sha256 => "TLS_CHACHA20_POLY1305_SHA256",
            CipherSuite::EcdheEcdsaAes256GcmSha384 => "TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384",
            CipherSuite::EcdheRsaAes256GcmSha384 => "TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384",
            CipherSuite::EcdheEcdsaAes128GcmSha256 => "TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256",
            CipherSuite::EcdheRsaAes128GcmSha256 => "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256",
            CipherSuite::EcdheEcdsaChacha20Poly1305 => "TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256",
            CipherSuite::EcdheRsaChacha20Poly1305 => "TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256",
            CipherSuite::EcdheRsaAes256CbcSha => "TLS_ECDHE_RSA_WITH_AES_256_CBC_SHA",
            CipherSuite::EcdheRsaAes128CbcSha => "TLS_ECDHE_RSA_WITH_AES_128_CBC_SHA",
            CipherSuite::RsaAes256CbcSha => "TLS_RSA_WITH_AES_256_CBC_SHA",
            CipherSuite::RsaAes128CbcSha => "TLS_RSA_WITH_AES_128_CBC_SHA",
        }
    }

    pub fn is_legacy(self) -> bool {
        matches!(
            self,
            CipherSuite::EcdheRsaAes256CbcSha
                | CipherSuite::EcdheRsaAes128CbcSha
                | CipherSuite::RsaAes256CbcSha
                | CipherSuite::RsaAes128CbcSha
        )
    }

    fn to_rustls(self) -> Option<SupportedCipherSuite> {
        use rustls::cipher_suite as cs;
        Some(match self {
            CipherSuite::Tls13Aes256GcmSha384 => cs::TLS13_AES_256_GCM_SHA384,
            CipherSuite::Tls13Aes128GcmSha256 => cs::TLS13_AES_128_GCM_SHA256,
            CipherSuite::Tls13Chacha20Poly1305Sha256 => cs::TLS13_CHACHA20_POLY1305_SHA256,
            CipherSuite::EcdheEcdsaAes256GcmSha384 => cs::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            CipherSuite::EcdheRsaAes256GcmSha384 => cs::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            CipherSuite::EcdheEcdsaAes128GcmSha256 => cs::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            CipherSuite::EcdheRsaAes128GcmSha256 => cs::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            CipherSuite::EcdheEcdsaChacha20Poly1305 => {
                cs::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256
            }
            CipherSuite::EcdheRsaChacha20Poly1305 => cs::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
            _ => return None,
        })
    }
}

/// Negotiation limits for one connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsProfile {
    /// Floor the descriptor asked for
    pub requested_floor: TlsVersion,
    /// Floor the backend will actually offer
    pub effective_floor: TlsVersion,
    pub ceiling: TlsVersion,
    pub cipher_preference: Vec<CipherSuite>,
}

impl TlsProfile {
    pub fn for_options(options: &TlsOptions) -> Self {
        let requested_floor = if options.allow_legacy {
            TlsVersion::OLDEST
        } else {
            TlsVersion::BASELINE
        };
        let cipher_preference = CipherSuite::PREFERENCE
            .iter()
            .copied()
            .filter(|suite| options.allow_legacy || !suite.is_legacy())
            .collect();
        Self {
            requested_floor,
            effective_floor: requested_floor.max(TlsVersion::BASELINE),
            ceiling: TlsVersion::NEWEST,
            cipher_preference,
        }
    }

    pub fn protocol_versions(&self) -> Vec<&'static SupportedProtocolVersion> {
        [TlsVersion::Tls13, TlsVersion::Tls12]
            .into_iter()
            .filter(|v| *v >= self.effective_floor && *v <= self.ceiling)
            .filter_map(TlsVersion::to_rustls)
            .collect()
    }

    /// Backend suites in preference order; suites the backend lacks are skipped.
    pub fn cipher_suites(&self) -> Vec<SupportedCipherSuite> {
        let mut unsupported = Vec::new();
        let suites = self
            .cipher_preference
            .iter()
            .filter_map(|suite| {
                let mapped = suite.to_rustls();
                if mapped.is_none() {
                    unsupported.push(suite.iana_name());
                }
                mapped
            })
            .collect();
        if !unsupported.is_empty() {
            debug!(suites = ?unsupported, "Cipher suites not offered by the TLS backend");
        }
        suites
    }
}

/// DANGEROUS: accepts every server certificate. Handshake signatures are
/// still verified, so the peer must hold the key for what it presents.
struct AcceptAnyServerCert;

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

struct PinnedServerCert {
    fingerprint: [u8; 32],
}

impl ServerCertVerifier for PinnedServerCert {
    fn verify_server_cert(
        &self,
        end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let presented: [u8; 32] = Sha256::digest(&end_entity.0).into();
        if presented == self.fingerprint {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(rustls::Error::General("Pinned certificate hash mismatch".into()))
        }
    }
}

/// Presents the configured identity and remembers whether the server asked.
pub struct IdentityResolver {
    key: Option<Arc<CertifiedKey>>,
    requested: AtomicBool,
}

impl IdentityResolver {
    pub fn new(key: Option<Arc<CertifiedKey>>) -> Self {
        Self {
            key,
            requested: AtomicBool::new(false),
        }
    }

    pub fn was_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Server requested a certificate and there was none to give.
    pub fn missing_requested_identity(&self) -> bool {
        self.was_requested() && self.key.is_none()
    }
}

impl ResolvesClientCert for IdentityResolver {
    fn resolve(
        &self,
        _acceptable_issuers: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.requested.store(true, Ordering::Release);
        self.key.clone()
    }

    fn has_certs(&self) -> bool {
        self.key.is_some()
    }
}

/// SHA-256 fingerprint of a DER certificate as lowercase hex.
pub fn sha256_fingerprint(der: &[u8]) -> String {
    Sha256::digest(der).iter().map(|b| format!("{b:02x}")).collect()
}

fn parse_fingerprint(hex: &str) -> Result<[u8; 32]> {
    let digits: Vec<u8> = hex
        .bytes()
        .filter(|b| !matches!(b, b':' | b' '))
        .collect();
    if !digits.iter().all(u8::is_ascii_hexdigit) {
        return Err(ProtocolError::TlsError("Pinned fingerprint is not hex".into()));
    }
    if digits.len() != 64 {
        return Err(ProtocolError::TlsError(format!(
            "Pinned fingerprint must be 32 bytes of hex, got {} digits",
            digits.len()
        )));
    }
    let mut out = [0u8; 32];
    for (byte, pair) in out.iter_mut().zip(digits.chunks_exact(2)) {
        *byte = (hex_value(pair[0]) << 4) | hex_value(pair[1]);
    }
    Ok(out)
}

fn hex_value(digit: u8) -> u8 {
    match digit {
        b'0'..=b'9' => digit - b'0',
        b'a'..=b'f' => digit - b'a' + 10,
        _ => digit - b'A' + 10,
    }
}

fn root_store(identity: Option<&Identity>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs()
        .map_err(|e| ProtocolError::TlsError(format!("Failed to load native certs: {e}")))?;
    let native: Vec<Vec<u8>> = native.into_iter().map(|c| c.0).collect();
    let (added, ignored) = roots.add_parsable_certificates(&native);

    if let Some(identity) = identity {
        let chain: Vec<Vec<u8>> = identity.chain().to_vec();
        roots.add_parsable_certificates(&chain);
    }
    debug!(added, ignored, total = roots.len(), "Root store loaded");
    Ok(roots)
}

/// Build the client configuration for `options`, presenting `identity` on request.
pub fn client_config(
    options: &TlsOptions,
    identity: Option<&Identity>,
) -> Result<(Arc<ClientConfig>, Arc<IdentityResolver>)> {
    let profile = TlsProfile::for_options(options);
    if options.allow_legacy {
        warn!(
            requested_floor = ?profile.requested_floor,
            effective_floor = ?profile.effective_floor,
            "Legacy TLS allowed for this server: weaker protocol versions and CBC suites requested"
        );
    }

    let key = identity.map(Identity::certified_key).transpose()?;
    let resolver = Arc::new(IdentityResolver::new(key));

    let builder = ClientConfig::builder()
        .with_cipher_suites(&profile.cipher_suites())
        .with_safe_default_kx_groups()
        .with_protocol_versions(&profile.protocol_versions())
        .map_err(|e| ProtocolError::TlsError(format!("Invalid TLS profile: {e}")))?;

    let builder = match &options.trust {
        ServerTrust::AcceptAny => {
            warn!("Server certificate verification disabled (accept-any trust mode)");
            builder.with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        }
        ServerTrust::Pinned { sha256 } => {
            let fingerprint = parse_fingerprint(sha256)?;
            builder.with_custom_certificate_verifier(Arc::new(PinnedServerCert { fingerprint }))
        }
        ServerTrust::Verified => {
            let verifier = WebPkiVerifier::new(root_store(identity)?, None);
            builder.with_custom_certificate_verifier(Arc::new(verifier))
        }
    };

    let config = builder.with_client_cert_resolver(resolver.clone());
    Ok((Arc::new(config), resolver))
}

pub fn server_name(descriptor: &ServerDescriptor) -> Result<ServerName> {
    let name = descriptor
        .tls
        .server_name
        .as_deref()
        .unwrap_or(descriptor.host.trim_start_matches('[').trim_end_matches(']'));
    ServerName::try_from(name)
        .map_err(|_| ProtocolError::TlsError(format!("Invalid server name: '{name}'")))
}

fn classify_handshake_error(e: io::Error, resolver: &IdentityResolver) -> ProtocolError {
    if resolver.missing_requested_identity() {
        return ProtocolError::ClientCertificateRequired;
    }
    let tls_error = e
        .get_ref()
        .and_then(|inner| inner.downcast_ref::<rustls::Error>());
    match tls_error {
        Some(rustls::Error::AlertReceived(AlertDescription::CertificateRequired))
            if !resolver.has_certs() =>
        {
            ProtocolError::ClientCertificateRequired
        }
        Some(err) => ProtocolError::TlsError(format!("Handshake failed: {err}")),
        None => ProtocolError::TlsError(format!("Handshake failed: {e}")),
    }
}

/// Established TLS session plus any application bytes read while waiting
/// for the server's verdict on a missing client certificate.
pub struct TlsSession {
    pub stream: TlsStream<TcpStream>,
    pub early_data: Vec<u8>,
}

/// Run the TLS handshake for `descriptor` over an established TCP stream.
#[instrument(skip(tcp, identity), fields(server = %descriptor.id))]
pub async fn handshake(
    tcp: TcpStream,
    descriptor: &ServerDescriptor,
    identity: Option<&Identity>,
) -> Result<TlsSession> {
    let (config, resolver) = client_config(&descriptor.tls, identity)?;
    let connector = TlsConnector::from(config);
    let domain = server_name(descriptor)?;

    let mut stream = connector
        .connect(domain, tcp)
        .await
        .map_err(|e| classify_handshake_error(e, &resolver))?;

    let mut early_data = Vec::new();
    if resolver.missing_requested_identity() {
        // TLS 1.3 servers reject an empty client certificate after the client
        // has already finished its side of the handshake.
        let mut first_read = vec![0u8; 4096];
        match tokio::time::timeout(CERT_VERDICT_WINDOW, stream.read(&mut first_read)).await {
            Ok(Ok(0)) => return Err(ProtocolError::ClientCertificateRequired),
            Ok(Err(e)) => return Err(classify_handshake_error(e, &resolver)),
            Ok(Ok(n)) => {
                first_read.truncate(n);
                early_data = first_read;
            }
            Err(_) => debug!("Server accepted the connection without a client certificate"),
        }
    }

    let (_, session) = stream.get_ref();
    info!(
        version = ?session.protocol_version(),
        suite = ?session.negotiated_cipher_suite().map(|s| s.suite()),
        client_auth = resolver.was_requested(),
        "TLS session established"
    );

    Ok(TlsSession { stream, early_data })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modern_profile_excludes_cbc() {
        let profile = TlsProfile::for_options(&TlsOptions::default());
        assert_eq!(profile.requested_floor, TlsVersion::Tls12);
        assert_eq!(profile.ceiling, TlsVersion::Tls13);
        assert!(profile.cipher_preference.iter().all(|s| !s.is_legacy()));
        assert_eq!(profile.protocol_versions().len(), 2);
    }

    #[test]
    fn legacy_profile_records_floor_but_clamps() {
        let options = TlsOptions {
            allow_legacy: true,
            ..TlsOptions::default()
        };
        let profile = TlsProfile::for_options(&options);
        assert_eq!(profile.requested_floor, TlsVersion::Tls10);
        assert_eq!(profile.effective_floor, TlsVersion::Tls12);
        assert!(profile.cipher_preference.iter().any(|s| s.is_legacy()));
        // CBC entries come last and are dropped by the backend
        assert!(!profile.cipher_preference[0].is_legacy());
        assert_eq!(profile.cipher_suites().len(), 9);
    }

    #[test]
    fn fingerprint_parsing_accepts_colons() {
        let hex = sha256_fingerprint(b"abc");
        let with_colons: String = hex
            .as_bytes()
            .chunks(2)
            .map(|c| std::str::from_utf8(c).unwrap())
            .collect::<Vec<_>>()
            .join(":");
        assert_eq!(parse_fingerprint(&with_colons).unwrap(), parse_fingerprint(&hex).unwrap());
        assert!(parse_fingerprint("abcd").is_err());
    }

    #[test]
    fn fingerprint_parsing_rejects_non_ascii_without_panicking() {
        // 64 bytes, but multi-byte characters
        let pin = format!("a{}b", "é".repeat(31));
        assert_eq!(pin.len(), 64);
        assert!(matches!(parse_fingerprint(&pin), Err(ProtocolError::TlsError(_))));
        assert!(parse_fingerprint(&"g".repeat(64)).is_err());
        assert_eq!(parse_fingerprint(&"AB".repeat(32)).unwrap(), [0xab; 32]);
    }

    #[test]
    fn pinned_trust_with_bad_pin_fails_config() {
        let options = TlsOptions {
            trust: ServerTrust::Pinned {
                sha256: "ü".repeat(32),
            },
            ..TlsOptions::default()
        };
        assert!(client_config(&options, None).is_err());
    }

    #[test]
    fn accept_any_config_builds_without_identity() {
        let options = TlsOptions {
            trust: ServerTrust::AcceptAny,
            ..TlsOptions::default()
        };
        let (_, resolver) = client_config(&options, None).unwrap();
        assert!(!resolver.has_certs());
        assert!(!resolver.was_requested());
    }

    #[test]
    fn resolver_records_request() {
        let resolver = IdentityResolver::new(None);
        assert!(resolver.resolve(&[], &[]).is_none());
        assert!(resolver.missing_requested_identity());
    }
}
