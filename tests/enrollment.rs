//! Integration tests for certificate enrollment against a mock CA endpoint

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use mockito::{Matcher, Server, ServerGuard};
use takstream::config::{EngineConfig, EnrollmentConfig, EnrollmentScheme};
use takstream::identity::{pem_encode, EnrollmentClient, EnrollmentRequest};
use takstream::{
    Coordinator, FileIdentityStore, IdentityStore, MemoryIdentityStore, ProtocolError,
    ServerTrust, TransportKind,
};

const CONFIG_PATH: &str = "^/Marti/api/tls/config";
const SIGN_PATH: &str = "^/Marti/api/tls/signClient/v2";

const CERT_CONFIG: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<certificateConfig validityDays="30">
  <nameEntries>
    <nameEntry name="O" value="TAK"/>
    <nameEntry name="OU" value="Operators"/>
  </nameEntries>
</certificateConfig>"#;

fn http_config() -> EnrollmentConfig {
    EnrollmentConfig {
        scheme: EnrollmentScheme::Http,
        ..EnrollmentConfig::default()
    }
}

fn mock_port(server: &ServerGuard) -> u16 {
    let host = server.host_with_port();
    let (_, port) = host.rsplit_once(':').expect("host:port");
    port.parse().expect("numeric port")
}

/// JSON body the CA returns: a signed leaf plus one CA certificate.
fn signing_body() -> String {
    let leaf = rcgen::generate_simple_self_signed(vec!["operator".to_string()]).unwrap();
    let ca = rcgen::generate_simple_self_signed(vec!["tak-ca".to_string()]).unwrap();
    serde_json::json!({
        "signedCert": STANDARD.encode(leaf.cert.der()),
        "ca0": pem_encode("CERTIFICATE", ca.cert.der()),
    })
    .to_string()
}

fn sign_query() -> Matcher {
    Matcher::AllOf(vec![
        Matcher::UrlEncoded("clientUid".into(), "takstream-client".into()),
        Matcher::UrlEncoded("version".into(), takstream::VERSION.into()),
    ])
}

#[tokio::test]
async fn test_basic_enrollment_stores_identity_and_returns_descriptor() {
    let mut server = Server::new_async().await;
    let config_mock = server
        .mock("GET", Matcher::Regex(CONFIG_PATH.into()))
        .match_header("authorization", Matcher::Regex("^Basic ".into()))
        .with_status(200)
        .with_header("content-type", "application/xml")
        .with_body(CERT_CONFIG)
        .expect(1)
        .create_async()
        .await;
    let sign_mock = server
        .mock("POST", Matcher::Regex(SIGN_PATH.into()))
        .match_query(sign_query())
        .match_header("authorization", Matcher::Regex("^Basic ".into()))
        .match_header("content-type", "text/plain")
        .match_body(Matcher::Regex("^[A-Za-z0-9+/]+=*$".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(signing_body())
        .expect(1)
        .create_async()
        .await;

    let store: Arc<dyn IdentityStore> = Arc::new(MemoryIdentityStore::new());
    let client = EnrollmentClient::new(http_config(), store.clone()).unwrap();
    let request = EnrollmentRequest::new("127.0.0.1", mock_port(&server), "operator", "secret");
    let descriptor = client.enroll(&request).await.expect("enrollment succeeds");

    config_mock.assert_async().await;
    sign_mock.assert_async().await;

    assert_eq!(descriptor.id, "127.0.0.1:8089");
    assert_eq!(descriptor.transport, TransportKind::Tls);
    assert_eq!(descriptor.port, 8089);
    assert_eq!(descriptor.tls.trust, ServerTrust::AcceptAny);
    let credentials = descriptor.enrollment.as_ref().expect("credentials kept for re-enrollment");
    assert_eq!(credentials.username, "operator");
    assert_eq!(credentials.port, request.port);

    let reference = descriptor.identity.expect("identity reference");
    let identity = store
        .load(&reference.alias, None)
        .unwrap()
        .expect("identity stored under the returned alias");
    assert_eq!(identity.chain().len(), 1);
    assert!(!identity.private_key().is_empty());
}

#[tokio::test]
async fn test_token_falls_back_from_bearer_to_query_parameter() {
    let mut server = Server::new_async().await;
    let bearer = server
        .mock("GET", Matcher::Regex(CONFIG_PATH.into()))
        .match_header("authorization", Matcher::Regex("^Bearer tok-1$".into()))
        .with_status(401)
        .expect(1)
        .create_async()
        .await;
    let basic = server
        .mock("GET", Matcher::Regex(CONFIG_PATH.into()))
        .match_header("authorization", Matcher::Regex("^Basic ".into()))
        .with_status(403)
        .expect(1)
        .create_async()
        .await;
    let query = server
        .mock("GET", Matcher::Regex(CONFIG_PATH.into()))
        .match_header("authorization", Matcher::Missing)
        .match_query(Matcher::UrlEncoded("token".into(), "tok-1".into()))
        .with_status(200)
        .with_body(CERT_CONFIG)
        .expect(1)
        .create_async()
        .await;
    let sign = server
        .mock("POST", Matcher::Regex(SIGN_PATH.into()))
        .match_header("authorization", Matcher::Regex("^Bearer tok-1$".into()))
        .with_status(200)
        .with_body(signing_body())
        .expect(1)
        .create_async()
        .await;

    let client = EnrollmentClient::new(http_config(), Arc::new(MemoryIdentityStore::new())).unwrap();
    let request = EnrollmentRequest::new("127.0.0.1", mock_port(&server), "operator", "secret")
        .with_token("tok-1");
    let descriptor = client.enroll(&request).await.expect("query token accepted");

    bearer.assert_async().await;
    basic.assert_async().await;
    query.assert_async().await;
    sign.assert_async().await;
    assert_eq!(
        descriptor.enrollment.and_then(|c| c.token).as_deref(),
        Some("tok-1")
    );
}

#[tokio::test]
async fn test_rejected_credentials_are_authentication_failure() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", Matcher::Regex(CONFIG_PATH.into()))
        .with_status(401)
        .create_async()
        .await;

    let client = EnrollmentClient::new(http_config(), Arc::new(MemoryIdentityStore::new())).unwrap();
    let request = EnrollmentRequest::new("127.0.0.1", mock_port(&server), "operator", "wrong");
    let err = client.enroll(&request).await.unwrap_err();

    assert!(matches!(err, ProtocolError::AuthenticationFailed(_)), "got {err:?}");
    assert!(err.is_authentication_failure());
}

#[tokio::test]
async fn test_server_error_keeps_status_and_body() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", Matcher::Regex(CONFIG_PATH.into()))
        .with_status(500)
        .with_body("ca offline")
        .create_async()
        .await;

    let client = EnrollmentClient::new(http_config(), Arc::new(MemoryIdentityStore::new())).unwrap();
    let request = EnrollmentRequest::new("127.0.0.1", mock_port(&server), "operator", "secret");
    match client.enroll(&request).await {
        Err(ProtocolError::ServerError { status, body }) => {
            assert_eq!(status, 500);
            assert_eq!(body, "ca offline");
        }
        other => panic!("expected ServerError, got {other:?}"),
    }
}

#[tokio::test]
async fn test_signing_response_without_certificate_is_rejected() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", Matcher::Regex(CONFIG_PATH.into()))
        .with_status(200)
        .with_body(CERT_CONFIG)
        .create_async()
        .await;
    server
        .mock("POST", Matcher::Regex(SIGN_PATH.into()))
        .with_status(200)
        .with_body(r#"{"ca0": "not a certificate"}"#)
        .create_async()
        .await;

    let store = Arc::new(MemoryIdentityStore::new());
    let client = EnrollmentClient::new(http_config(), store.clone()).unwrap();
    let request = EnrollmentRequest::new("127.0.0.1", mock_port(&server), "operator", "secret");
    let err = client.enroll(&request).await.unwrap_err();

    assert!(matches!(err, ProtocolError::EnrollmentResponse(_)), "got {err:?}");
    assert!(store.aliases().unwrap().is_empty(), "nothing stored on failure");
}

#[tokio::test]
async fn test_empty_host_is_invalid_url() {
    let client = EnrollmentClient::new(http_config(), Arc::new(MemoryIdentityStore::new())).unwrap();
    let err = client
        .enroll(&EnrollmentRequest::new("  ", 8446, "u", "p"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::InvalidUrl(_)), "got {err:?}");
}

#[tokio::test]
async fn test_unreachable_host_is_network_error() {
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };
    let client = EnrollmentClient::new(http_config(), Arc::new(MemoryIdentityStore::new())).unwrap();
    let err = client
        .enroll(&EnrollmentRequest::new("127.0.0.1", port, "u", "p"))
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::Network(_)), "got {err:?}");
}

#[tokio::test]
async fn test_coordinator_enrollment_seals_key_in_file_store() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", Matcher::Regex(CONFIG_PATH.into()))
        .with_status(200)
        .with_body(CERT_CONFIG)
        .create_async()
        .await;
    server
        .mock("POST", Matcher::Regex(SIGN_PATH.into()))
        .match_query(sign_query())
        .with_status(200)
        .with_body(signing_body())
        .create_async()
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileIdentityStore::open(dir.path()).unwrap());
    let config = EngineConfig::default_with_overrides(|c| c.enrollment = http_config());
    let coordinator = Coordinator::new(config, store.clone());

    let request = EnrollmentRequest::new("127.0.0.1", mock_port(&server), "operator", "secret")
        .with_passphrase("field-kit");
    let descriptor = coordinator.enroll_with(request).await.unwrap();
    let reference = descriptor.identity.expect("identity reference");
    assert_eq!(reference.passphrase.as_deref(), Some("field-kit"));

    assert!(store.load(&reference.alias, None).is_err(), "sealed key needs the passphrase");
    let identity = store
        .load(&reference.alias, Some("field-kit"))
        .unwrap()
        .expect("stored identity");
    assert_eq!(identity.alias(), reference.alias);
}

#[tokio::test]
async fn test_requested_validity_overrides_published_validity() {
    let mut server = Server::new_async().await;
    server
        .mock("GET", Matcher::Regex(CONFIG_PATH.into()))
        .with_status(200)
        .with_body(CERT_CONFIG)
        .expect(2)
        .create_async()
        .await;
    let requested = server
        .mock("POST", Matcher::Regex(SIGN_PATH.into()))
        .match_query(Matcher::AllOf(vec![
            sign_query(),
            Matcher::UrlEncoded("validityDays".into(), "90".into()),
        ]))
        .with_status(200)
        .with_body(signing_body())
        .expect(1)
        .create_async()
        .await;
    let published = server
        .mock("POST", Matcher::Regex(SIGN_PATH.into()))
        .match_query(Matcher::AllOf(vec![
            sign_query(),
            Matcher::UrlEncoded("validityDays".into(), "30".into()),
        ]))
        .with_status(200)
        .with_body(signing_body())
        .expect(1)
        .create_async()
        .await;

    let client = EnrollmentClient::new(http_config(), Arc::new(MemoryIdentityStore::new())).unwrap();
    let port = mock_port(&server);
    client
        .enroll(
            &EnrollmentRequest::new("127.0.0.1", port, "operator", "secret")
                .with_validity_days(90)
                .with_common_name("ALPHA-6"),
        )
        .await
        .expect("requested validity accepted");
    client
        .enroll(&EnrollmentRequest::new("127.0.0.1", port, "operator", "secret"))
        .await
        .expect("published validity accepted");

    requested.assert_async().await;
    published.assert_async().await;
}
