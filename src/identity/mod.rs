//! # Client Identities
//!
//! An [`Identity`] is the certificate, private key and trust chain a client
//! presents during mutual TLS. Identities are created by enrollment or
//! imported from PEM, stored under an alias in an [`IdentityStore`], and
//! never mutated; re-enrollment replaces the whole bundle.
//!
//! ## Components
//! - **Identity**: DER material plus expiry inspection
//! - **Store**: abstract store with in-memory and file-backed adapters
//! - **Enrollment**: CSR-based enrollment against a TAK server

pub mod enrollment;
pub mod store;

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::{DateTime, TimeZone, Utc};
use rustls::{Certificate, PrivateKey};
use rustls_pemfile::Item;
use serde::{Deserialize, Serialize};
use x509_parser::prelude::{FromDer, X509Certificate};
use zeroize::Zeroizing;

use crate::error::{constants, ProtocolError, Result};

pub use enrollment::{CertificateConfig, EnrollmentClient, EnrollmentRequest};
pub use store::{FileIdentityStore, IdentityStore, MemoryIdentityStore};

/// Reference from a server descriptor to a stored identity
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityRef {
    pub alias: String,
    /// Unlocks the private key in stores that encrypt it at rest
    #[serde(default)]
    pub passphrase: Option<String>,
}

impl IdentityRef {
    pub fn new(alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            passphrase: None,
        }
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }
}

impl fmt::Debug for IdentityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityRef")
            .field("alias", &self.alias)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Certificate, private key and trust chain
#[derive(Clone)]
pub struct Identity {
    alias: String,
    certificate: Vec<u8>,
    private_key: Zeroizing<Vec<u8>>,
    chain: Vec<Vec<u8>>,
}

impl Identity {
    /// Build from DER material. `private_key` is PKCS#8 (SEC1 and PKCS#1 are also accepted by rustls).
    pub fn new(
        alias: impl Into<String>,
        certificate: Vec<u8>,
        private_key: Vec<u8>,
        chain: Vec<Vec<u8>>,
    ) -> Result<Self> {
        X509Certificate::from_der(&certificate)
            .map_err(|e| ProtocolError::IdentityStorage(format!("Invalid certificate: {e}")))?;
        if private_key.is_empty() {
            return Err(ProtocolError::IdentityStorage(
                constants::ERR_NO_PRIVATE_KEY.into(),
            ));
        }
        Ok(Self {
            alias: alias.into(),
            certificate,
            private_key: Zeroizing::new(private_key),
            chain,
        })
    }

    /// Build from PEM text: the first certificate in `cert_pem` is the leaf,
    /// further certificates there and everything in `chain_pem` form the chain.
    pub fn from_pem(alias: impl Into<String>, cert_pem: &str, key_pem: &str, chain_pem: &str) -> Result<Self> {
        let mut certs = pem_certificates(cert_pem)?;
        if certs.is_empty() {
            return Err(ProtocolError::IdentityStorage(
                constants::ERR_NO_CERTIFICATE.into(),
            ));
        }
        let leaf = certs.remove(0);
        certs.extend(pem_certificates(chain_pem)?);
        let key = pem_private_key(key_pem)?;
        Self::new(alias, leaf, key.to_vec(), certs)
    }

    pub fn alias(&self) -> &str {
        &self.alias
    }

    /// Leaf certificate, DER
    pub fn certificate(&self) -> &[u8] {
        &self.certificate
    }

    /// Private key, DER
    pub fn private_key(&self) -> &[u8] {
        &self.private_key
    }

    /// Issuer chain, DER, closest issuer first
    pub fn chain(&self) -> &[Vec<u8>] {
        &self.chain
    }

    /// Copy of this identity under a different alias.
    pub fn with_alias(&self, alias: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            ..self.clone()
        }
    }

    pub fn not_after(&self) -> Result<DateTime<Utc>> {
        let (_, cert) = X509Certificate::from_der(&self.certificate)
            .map_err(|e| ProtocolError::IdentityStorage(format!("Invalid certificate: {e}")))?;
        let ts = cert.validity().not_after.timestamp();
        Utc.timestamp_opt(ts, 0)
            .single()
            .ok_or_else(|| ProtocolError::IdentityStorage("Certificate expiry out of range".into()))
    }

    /// Whole days until expiry; negative once expired.
    pub fn days_until_expiry(&self, now: DateTime<Utc>) -> Result<i64> {
        Ok((self.not_after()? - now).num_days())
    }

    /// Subject common name of the leaf certificate, if present.
    pub fn common_name(&self) -> Option<String> {
        let (_, cert) = X509Certificate::from_der(&self.certificate).ok()?;
        let cn = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|cn| cn.as_str().ok())
            .map(str::to_owned);
        cn
    }

    /// Leaf followed by chain, as rustls certificates.
    pub fn rustls_chain(&self) -> Vec<Certificate> {
        std::iter::once(&self.certificate)
            .chain(self.chain.iter())
            .map(|der| Certificate(der.clone()))
            .collect()
    }

    /// Certified key for presenting this identity during a handshake.
    pub fn certified_key(&self) -> Result<Arc<rustls::sign::CertifiedKey>> {
        let key = rustls::sign::any_supported_type(&PrivateKey(self.private_key.to_vec()))
            .map_err(|e| ProtocolError::TlsError(format!("Unsupported private key: {e}")))?;
        Ok(Arc::new(rustls::sign::CertifiedKey::new(
            self.rustls_chain(),
            key,
        )))
    }

    pub fn certificate_pem(&self) -> String {
        pem_encode("CERTIFICATE", &self.certificate)
    }

    pub fn chain_pem(&self) -> String {
        self.chain
            .iter()
            .map(|der| pem_encode("CERTIFICATE", der))
            .collect()
    }

    pub fn private_key_pem(&self) -> Zeroizing<String> {
        Zeroizing::new(pem_encode("PRIVATE KEY", &self.private_key))
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("alias", &self.alias)
            .field("certificate_len", &self.certificate.len())
            .field("chain_len", &self.chain.len())
            .finish_non_exhaustive()
    }
}

/// Encode DER as a PEM block with 64-column lines.
pub fn pem_encode(label: &str, der: &[u8]) -> String {
    let body = STANDARD.encode(der);
    let mut out = format!("-----BEGIN {label}-----\n");
    for line in body.as_bytes().chunks(64) {
        out.push_str(&String::from_utf8_lossy(line));
        out.push('\n');
    }
    out.push_str(&format!("-----END {label}-----\n"));
    out
}

/// All certificates in a PEM document.
pub fn pem_certificates(pem: &str) -> Result<Vec<Vec<u8>>> {
    rustls_pemfile::certs(&mut pem.as_bytes())
        .map_err(|e| ProtocolError::IdentityStorage(format!("Failed to parse certificate PEM: {e}")))
}

/// First private key in a PEM document (PKCS#8, SEC1 or PKCS#1).
pub fn pem_private_key(pem: &str) -> Result<Zeroizing<Vec<u8>>> {
    let items = rustls_pemfile::read_all(&mut pem.as_bytes())
        .map_err(|e| ProtocolError::IdentityStorage(format!("Failed to parse key PEM: {e}")))?;
    items
        .into_iter()
        .find_map(|item| match item {
            Item::PKCS8Key(key) | Item::ECKey(key) | Item::RSAKey(key) => Some(Zeroizing::new(key)),
            _ => None,
        })
        .ok_or_else(|| ProtocolError::IdentityStorage(constants::ERR_NO_PRIVATE_KEY.into()))
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pem_round_trip_preserves_material() {
        let identity = test_support::self_signed("a", "client.local");
        let restored = Identity::from_pem(
            "b",
            &identity.certificate_pem(),
            &identity.private_key_pem(),
            &identity.chain_pem(),
        )
        .unwrap();
        assert_eq!(restored.certificate(), identity.certificate());
        assert_eq!(restored.private_key(), identity.private_key());
        assert_eq!(restored.alias(), "b");
    }

    #[test]
    fn expiry_is_in_the_future_for_fresh_certificates() {
        let identity = test_support::self_signed("a", "client.local");
        assert!(identity.days_until_expiry(Utc::now()).unwrap() > 365);
        assert!(identity.certified_key().is_ok());
    }

    #[test]
    fn rejects_garbage_certificate() {
        let err = Identity::new("x", vec![1, 2, 3], vec![4], Vec::new()).unwrap_err();
        assert!(matches!(err, ProtocolError::IdentityStorage(_)));
    }

    #[test]
    fn debug_output_hides_secrets() {
        let reference = IdentityRef::new("alias").with_passphrase("hunter2");
        assert!(!format!("{reference:?}").contains("hunter2"));
    }
}
