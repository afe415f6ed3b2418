//! # Certificate Enrollment
//!
//! Obtains a signed client certificate from a TAK-style enrollment endpoint
//! so a new client does not need a pre-installed identity.
//!
//! ## Sequence
//! 1. `GET {config_path}`: XML with `<nameEntry name=".." value=".."/>`
//!    entries describing the subject the CA expects.
//! 2. Generate an ECDSA P-256 key and a CSR whose subject is CN=username (or
//!    the request's common name override) plus the configured name entries.
//! 3. `POST {sign_path}?clientUid=..&version=..` with the base64 DER CSR as a
//!    `text/plain` body. A requested validity, or the one the CA published,
//!    goes along as `validityDays`.
//! 4. Read `signedCert` and the `ca*` entries from the JSON reply, store the
//!    identity and return a descriptor that references it.
//!
//! Every request walks the same authentication chain. A 401 or 403 moves to
//! the next scheme; anything else ends the walk. With a token the chain is
//! bearer, basic, then `?token=`; without one it is basic only.
//!
//! The enrollment HTTP client accepts any server certificate. Enrollment
//! servers normally present a certificate from the private CA the client is
//! about to trust, so there is nothing to validate against yet.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use chrono::Utc;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use rcgen::{CertificateParams, DistinguishedName, DnType, DnValue, KeyPair};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use tracing::{debug, info, instrument, warn};

use super::{pem_certificates, Identity, IdentityRef, IdentityStore};
use crate::config::EnrollmentConfig;
use crate::error::{constants, ProtocolError, Result};
use crate::transport::{EnrollmentCredentials, ServerDescriptor, ServerTrust};

/// OID of the domainComponent attribute (0.9.2342.19200300.100.1.25)
const DOMAIN_COMPONENT_OID: [u64; 7] = [0, 9, 2342, 19200300, 100, 1, 25];

/// One enrollment attempt
#[derive(Clone)]
pub struct EnrollmentRequest {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Bearer token; enables the bearer and query-token schemes
    pub token: Option<String>,
    /// Seals the private key in stores that support it
    pub passphrase: Option<String>,
    /// Requested certificate lifetime; the CA's published value otherwise
    pub validity_days: Option<u32>,
    /// Subject CN; the username otherwise
    pub common_name: Option<String>,
}

impl EnrollmentRequest {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            username: username.into(),
            password: password.into(),
            token: None,
            passphrase: None,
            validity_days: None,
            common_name: None,
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Zero means "use the CA default".
    pub fn with_validity_days(mut self, days: u32) -> Self {
        self.validity_days = (days > 0).then_some(days);
        self
    }

    pub fn with_common_name(mut self, common_name: impl Into<String>) -> Self {
        self.common_name = Some(common_name.into());
        self
    }

    fn subject_common_name(&self) -> &str {
        self.common_name
            .as_deref()
            .filter(|cn| !cn.trim().is_empty())
            .unwrap_or(&self.username)
    }
}

impl std::fmt::Debug for EnrollmentRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnrollmentRequest")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("validity_days", &self.validity_days)
            .field("common_name", &self.common_name)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthScheme {
    Bearer,
    Basic,
    QueryToken,
}

impl AuthScheme {
    fn chain(request: &EnrollmentRequest) -> &'static [AuthScheme] {
        if request.token.is_some() {
            &[AuthScheme::Bearer, AuthScheme::Basic, AuthScheme::QueryToken]
        } else {
            &[AuthScheme::Basic]
        }
    }

    fn apply(self, builder: RequestBuilder, request: &EnrollmentRequest) -> RequestBuilder {
        let token = request.token.as_deref().unwrap_or_default();
        match self {
            AuthScheme::Bearer => builder.bearer_auth(token),
            AuthScheme::Basic => builder.basic_auth(&request.username, Some(&request.password)),
            AuthScheme::QueryToken => builder.query(&[("token", token)]),
        }
    }
}

/// Subject configuration published by the CA
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertificateConfig {
    /// Name entries in document order
    pub name_entries: Vec<(String, String)>,
    pub validity_days: Option<u32>,
}

impl CertificateConfig {
    /// Parse the config endpoint's XML. Unknown elements are ignored.
    pub fn parse(xml: &str) -> Result<Self> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);
        let mut config = CertificateConfig::default();
        let mut in_validity = false;

        loop {
            match reader.read_event().map_err(response_error)? {
                Event::Start(e) | Event::Empty(e) => {
                    let local = e.local_name();
                    let is_entry = local.as_ref() == b"nameEntry";
                    in_validity = local.as_ref() == b"validityDays";

                    let mut name = None;
                    let mut value = None;
                    for attr in e.attributes() {
                        let attr = attr.map_err(|e| ProtocolError::EnrollmentResponse(e.to_string()))?;
                        let text = attr.unescape_value().map_err(response_error)?.into_owned();
                        match attr.key.local_name().as_ref() {
                            b"name" => name = Some(text),
                            b"value" => value = Some(text),
                            b"validityDays" => config.validity_days = text.trim().parse().ok(),
                            _ => {}
                        }
                    }
                    if is_entry {
                        if let (Some(name), Some(value)) = (name, value) {
                            config.name_entries.push((name, value));
                        }
                    }
                }
                Event::Text(t) if in_validity => {
                    let text = t.unescape().map_err(response_error)?;
                    config.validity_days = text.trim().parse().ok();
                }
                Event::End(_) => in_validity = false,
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(config)
    }

    /// First value for a name entry, case-insensitive.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.name_entries
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Subject for the CSR: CN from the username, the rest from the config.
    pub fn subject(&self, common_name: &str) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
        let mapped = [
            ("O", DnType::OrganizationName),
            ("OU", DnType::OrganizationalUnitName),
            ("DC", DnType::CustomDnType(DOMAIN_COMPONENT_OID.to_vec())),
            ("C", DnType::CountryName),
            ("ST", DnType::StateOrProvinceName),
            ("L", DnType::LocalityName),
        ];
        for (name, ty) in mapped {
            if let Some(value) = self.get(name) {
                dn.push(ty, DnValue::Utf8String(value.to_string()));
            }
        }
        dn
    }
}

/// Signed certificate and CA chain from the signing endpoint
#[derive(Debug, Clone)]
pub struct SigningResponse {
    pub certificate: Vec<u8>,
    pub chain: Vec<Vec<u8>>,
}

impl SigningResponse {
    /// Parse the JSON reply. `ca*` entries are ordered by numeric suffix.
    pub fn parse(body: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(body)
            .map_err(|e| ProtocolError::EnrollmentResponse(format!("Invalid JSON: {e}")))?;
        let object = value
            .as_object()
            .ok_or_else(|| ProtocolError::EnrollmentResponse("Expected a JSON object".into()))?;

        let signed = object
            .get("signedCert")
            .and_then(|v| v.as_str())
            .ok_or_else(|| ProtocolError::EnrollmentResponse(constants::ERR_NO_SIGNED_CERT.into()))?;
        let certificate = decode_certificate(signed)?;

        let mut ca_entries: Vec<(u64, &String, &str)> = object
            .iter()
            .filter_map(|(key, v)| Some((ca_index(key)?, key, v.as_str()?)))
            .collect();
        ca_entries.sort_by(|(a, a_key, _), (b, b_key, _)| a.cmp(b).then_with(|| a_key.cmp(b_key)));

        let chain = ca_entries
            .into_iter()
            .map(|(_, _, v)| decode_certificate(v))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { certificate, chain })
    }
}

/// Position of a `ca<N>` key; `None` for any other key.
fn ca_index(key: &str) -> Option<u64> {
    let digits = key.strip_prefix("ca")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(digits.parse().unwrap_or(u64::MAX))
}

/// Accepts a PEM block or bare base64 DER.
fn decode_certificate(text: &str) -> Result<Vec<u8>> {
    if text.contains("-----BEGIN") {
        let mut certs = pem_certificates(text)
            .map_err(|e| ProtocolError::EnrollmentResponse(e.to_string()))?;
        if certs.is_empty() {
            return Err(ProtocolError::EnrollmentResponse(constants::ERR_NO_CERTIFICATE.into()));
        }
        return Ok(certs.remove(0));
    }
    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    STANDARD
        .decode(compact)
        .map_err(|e| ProtocolError::EnrollmentResponse(format!("Invalid certificate encoding: {e}")))
}

/// Alias under which an enrolled identity for `host` is stored.
pub fn alias_for_host(host: &str) -> String {
    let sanitized: String = host
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '-' | '.') { c } else { '_' })
        .collect();
    format!("enrolled-{sanitized}")
}

/// HTTP client for the enrollment endpoints
pub struct EnrollmentClient {
    http: Client,
    config: EnrollmentConfig,
    store: Arc<dyn IdentityStore>,
}

impl EnrollmentClient {
    pub fn new(config: EnrollmentConfig, store: Arc<dyn IdentityStore>) -> Result<Self> {
        warn!("Enrollment HTTP client accepts any server certificate (private-CA mode)");
        let http = Client::builder()
            .use_rustls_tls()
            .danger_accept_invalid_certs(true)
            .timeout(config.request_timeout)
            .user_agent(format!("takstream/{}", crate::VERSION))
            .build()
            .map_err(|e| ProtocolError::Network(e.to_string()))?;
        Ok(Self { http, config, store })
    }

    pub fn store(&self) -> &Arc<dyn IdentityStore> {
        &self.store
    }

    /// Enroll and return a TLS descriptor referencing the stored identity.
    #[instrument(skip(self, request), fields(host = %request.host, port = request.port))]
    pub async fn enroll(&self, request: &EnrollmentRequest) -> Result<ServerDescriptor> {
        let config_url = self.url(&request.host, request.port, &self.config.config_path)?;
        let mut sign_url = self.url(&request.host, request.port, &self.config.sign_path)?;

        let body = self
            .send(request, |http| http.get(config_url.clone()))
            .await?;
        let cert_config = CertificateConfig::parse(&body)?;
        debug!(
            entries = cert_config.name_entries.len(),
            validity_days = ?cert_config.validity_days,
            "Fetched certificate configuration"
        );

        let validity_days = request.validity_days.or(cert_config.validity_days);
        {
            let mut query = sign_url.query_pairs_mut();
            query
                .append_pair("clientUid", &self.config.client_uid)
                .append_pair("version", crate::VERSION);
            if let Some(days) = validity_days {
                query.append_pair("validityDays", &days.to_string());
            }
        }

        let (key_pair, csr_der) = signing_request(cert_config.subject(request.subject_common_name()))?;
        let csr_body = STANDARD.encode(csr_der);

        let body = self
            .send(request, |http| {
                http.post(sign_url.clone())
                    .header(reqwest::header::CONTENT_TYPE, "text/plain")
                    .body(csr_body.clone())
            })
            .await?;
        let signed = SigningResponse::parse(&body)?;

        let alias = alias_for_host(&request.host);
        let identity = Identity::new(
            alias.clone(),
            signed.certificate,
            key_pair.serialize_der(),
            signed.chain,
        )?;
        self.store.store(&identity, request.passphrase.as_deref())?;

        let days = identity.days_until_expiry(Utc::now()).unwrap_or_default();
        info!(
            alias = %alias,
            chain_len = identity.chain().len(),
            days_until_expiry = days,
            "Enrollment complete"
        );

        let mut identity_ref = IdentityRef::new(alias);
        identity_ref.passphrase = request.passphrase.clone();

        let streaming_port = self.config.streaming_port;
        Ok(
            ServerDescriptor::tls(format!("{}:{streaming_port}", request.host), &request.host, streaming_port)
                .with_trust(ServerTrust::AcceptAny)
                .with_identity(identity_ref)
                .with_enrollment(EnrollmentCredentials {
                    username: request.username.clone(),
                    password: request.password.clone(),
                    token: request.token.clone(),
                    port: request.port,
                }),
        )
    }

    fn url(&self, host: &str, port: u16, path: &str) -> Result<Url> {
        if host.trim().is_empty() {
            return Err(ProtocolError::InvalidUrl("Host cannot be empty".into()));
        }
        let host = if host.contains(':') && !host.starts_with('[') {
            format!("[{host}]")
        } else {
            host.to_string()
        };
        let raw = format!("{}://{host}:{port}{path}", self.config.scheme.as_str());
        Url::parse(&raw).map_err(|e| ProtocolError::InvalidUrl(format!("{raw}: {e}")))
    }

    /// Run a request through the authentication chain and return the body of
    /// the first non-auth-rejected response.
    async fn send<F>(&self, request: &EnrollmentRequest, build: F) -> Result<String>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut last_status = None;
        for &scheme in AuthScheme::chain(request) {
            let response = scheme
                .apply(build(&self.http), request)
                .send()
                .await
                .map_err(network_error)?;
            let status = response.status();

            if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
                debug!(?scheme, status = status.as_u16(), "Authentication rejected, trying next scheme");
                last_status = Some(status);
                continue;
            }

            let body = response.text().await.map_err(network_error)?;
            if !status.is_success() {
                return Err(ProtocolError::ServerError {
                    status: status.as_u16(),
                    body,
                });
            }
            return Ok(body);
        }

        Err(ProtocolError::AuthenticationFailed(format!(
            "All authentication schemes rejected (last status {})",
            last_status.map(|s| s.as_u16()).unwrap_or_default()
        )))
    }
}

/// Fresh P-256 key and the DER CSR for `subject`.
fn signing_request(subject: DistinguishedName) -> Result<(KeyPair, Vec<u8>)> {
    let key_pair = KeyPair::generate().map_err(csr_error)?;
    let mut params = CertificateParams::new(Vec::<String>::new()).map_err(csr_error)?;
    params.distinguished_name = subject;
    let csr = params.serialize_request(&key_pair).map_err(csr_error)?;
    Ok((key_pair, csr.der().to_vec()))
}

fn network_error(e: reqwest::Error) -> ProtocolError {
    ProtocolError::Network(e.to_string())
}

fn response_error(e: quick_xml::Error) -> ProtocolError {
    ProtocolError::EnrollmentResponse(e.to_string())
}

fn csr_error(e: rcgen::Error) -> ProtocolError {
    ProtocolError::Custom(format!("CSR generation failed: {e}"))
}
