//! Integration tests for TLS channels against a local rustls server
//!
//! Covers client certificate presentation, the missing-certificate diagnosis
//! and the pinned and accept-any trust modes.

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use rustls::server::AllowAnyAuthenticatedClient;
use rustls::{Certificate, PrivateKey, RootCertStore, ServerConfig};
use takstream::transport::tls::sha256_fingerprint;
use takstream::transport::{ChannelEvent, ChannelOptions, TransportChannel};
use takstream::utils::TrafficCounters;
use takstream::{
    ConnectionState, Identity, IdentityRef, IdentityStore, MemoryIdentityStore, ProtocolError,
    ServerDescriptor, ServerTrust,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tokio_rustls::TlsAcceptor;

const GREETING: &str = "<event uid=\"server-hello\" type=\"a-f-G\"><detail/></event>";

struct TestPki {
    server_cert: Vec<u8>,
    server_key: Vec<u8>,
    client: Identity,
}

fn pki() -> TestPki {
    let server = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let client = rcgen::generate_simple_self_signed(vec!["field-client".to_string()]).unwrap();
    TestPki {
        server_cert: server.cert.der().to_vec(),
        server_key: server.signing_key.serialize_der(),
        client: Identity::new(
            "field-client",
            client.cert.der().to_vec(),
            client.signing_key.serialize_der(),
            Vec::new(),
        )
        .unwrap(),
    }
}

fn server_config(pki: &TestPki, require_client: bool) -> Arc<ServerConfig> {
    let builder = ServerConfig::builder().with_safe_defaults();
    let chain = vec![Certificate(pki.server_cert.clone())];
    let key = PrivateKey(pki.server_key.clone());
    let config = if require_client {
        let mut client_roots = RootCertStore::empty();
        client_roots
            .add(&Certificate(pki.client.certificate().to_vec()))
            .unwrap();
        builder
            .with_client_cert_verifier(Arc::new(AllowAnyAuthenticatedClient::new(client_roots)))
            .with_single_cert(chain, key)
    } else {
        builder.with_no_client_auth().with_single_cert(chain, key)
    };
    Arc::new(config.unwrap())
}

/// Serve one TLS session: greet, then hold the connection open.
/// Reports the client certificate the server saw, if any.
async fn tls_server(config: Arc<ServerConfig>) -> (u16, oneshot::Receiver<Option<Vec<u8>>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (seen_tx, seen_rx) = oneshot::channel();
    tokio::spawn(async move {
        let (tcp, _) = listener.accept().await.unwrap();
        let Ok(mut tls) = TlsAcceptor::from(config).accept(tcp).await else {
            let _ = seen_tx.send(None);
            return;
        };
        let peer = tls
            .get_ref()
            .1
            .peer_certificates()
            .and_then(|certs| certs.first())
            .map(|cert| cert.0.clone());
        let _ = seen_tx.send(peer);
        tls.write_all(GREETING.as_bytes()).await.unwrap();
        tls.flush().await.unwrap();
        let mut sink = [0u8; 1024];
        while matches!(tls.read(&mut sink).await, Ok(n) if n > 0) {}
    });
    (port, seen_rx)
}

fn channel(store: Arc<dyn IdentityStore>) -> (TransportChannel, mpsc::UnboundedReceiver<ChannelEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let options = ChannelOptions {
        connect_timeout: Duration::from_secs(5),
        ..ChannelOptions::default()
    };
    let channel = TransportChannel::new(options, store, Arc::new(TrafficCounters::new()), tx);
    (channel, rx)
}

fn descriptor(port: u16) -> ServerDescriptor {
    let mut descriptor = ServerDescriptor::tls("tak", "127.0.0.1", port);
    descriptor.tls.server_name = Some("localhost".to_string());
    descriptor
}

async fn next_message(rx: &mut mpsc::UnboundedReceiver<ChannelEvent>) -> String {
    timeout(Duration::from_secs(5), async {
        loop {
            if let ChannelEvent::MessageReceived { payload, .. } = rx.recv().await.expect("events") {
                return payload;
            }
        }
    })
    .await
    .expect("no message received")
}

#[tokio::test]
async fn test_missing_identity_reports_client_certificate_required() {
    let pki = pki();
    let (port, _seen) = tls_server(server_config(&pki, true)).await;
    let (channel, _rx) = channel(Arc::new(MemoryIdentityStore::new()));

    let err = channel
        .connect(&descriptor(port).with_trust(ServerTrust::AcceptAny))
        .await
        .unwrap_err();

    assert!(
        matches!(err, ProtocolError::ClientCertificateRequired),
        "expected ClientCertificateRequired, got {err:?}"
    );
    assert!(matches!(channel.state(), ConnectionState::Failed(_)));
}

#[tokio::test]
async fn test_identity_is_presented_and_events_flow() {
    let pki = pki();
    let (port, seen) = tls_server(server_config(&pki, true)).await;
    let store = Arc::new(MemoryIdentityStore::new());
    store.store(&pki.client, None).unwrap();
    let (channel, mut rx) = channel(store);

    channel
        .connect(
            &descriptor(port)
                .with_trust(ServerTrust::AcceptAny)
                .with_identity(IdentityRef::new("field-client")),
        )
        .await
        .expect("mutual TLS handshake");
    assert!(channel.is_connected());

    let presented = seen.await.unwrap().expect("server saw a client certificate");
    assert_eq!(presented, pki.client.certificate());
    assert_eq!(next_message(&mut rx).await, GREETING);

    channel.disconnect();
    assert_eq!(channel.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_pinned_trust_accepts_matching_certificate() {
    let pki = pki();
    let (port, _seen) = tls_server(server_config(&pki, false)).await;
    let (channel, mut rx) = channel(Arc::new(MemoryIdentityStore::new()));

    let pin = ServerTrust::Pinned {
        sha256: sha256_fingerprint(&pki.server_cert),
    };
    channel
        .connect(&descriptor(port).with_trust(pin))
        .await
        .expect("pinned certificate accepted");
    assert_eq!(next_message(&mut rx).await, GREETING);
}

#[tokio::test]
async fn test_pinned_trust_rejects_other_certificate() {
    let pki = pki();
    let (port, _seen) = tls_server(server_config(&pki, false)).await;
    let (channel, _rx) = channel(Arc::new(MemoryIdentityStore::new()));

    let pin = ServerTrust::Pinned {
        sha256: "00".repeat(32),
    };
    let err = channel
        .connect(&descriptor(port).with_trust(pin))
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::TlsError(_)), "got {err:?}");
}

#[tokio::test]
async fn test_verified_trust_rejects_self_signed_server() {
    let pki = pki();
    let (port, _seen) = tls_server(server_config(&pki, false)).await;
    let (channel, _rx) = channel(Arc::new(MemoryIdentityStore::new()));

    let err = channel.connect(&descriptor(port)).await.unwrap_err();
    assert!(matches!(err, ProtocolError::TlsError(_)), "got {err:?}");
}

#[tokio::test]
async fn test_unknown_identity_alias_fails_before_connecting() {
    let (channel, _rx) = channel(Arc::new(MemoryIdentityStore::new()));
    let err = channel
        .connect(&descriptor(1).with_identity(IdentityRef::new("nobody")))
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::IdentityUnavailable(_)), "got {err:?}");
}
