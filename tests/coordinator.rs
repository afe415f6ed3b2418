//! Integration tests for the multi-server coordinator over loopback TCP

#![allow(clippy::expect_used, clippy::unwrap_used)]

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use takstream::config::EngineConfig;
use takstream::{
    ConnectionState, Coordinator, CotEvent, Delivery, EngineEvent, MemoryIdentityStore, Priority,
    ProtocolError, ServerDescriptor,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

fn test_config(reconnect: bool) -> EngineConfig {
    EngineConfig::default_with_overrides(|config| {
        config.reconnect.enabled = reconnect;
        config.reconnect.initial_delay = Duration::from_millis(200);
        config.reconnect.max_delay = Duration::from_millis(400);
        config.coordinator.connect_timeout = Duration::from_secs(2);
        config.coordinator.drain_interval = Duration::from_millis(25);
        // queued entries must outlive the reconnect backoff
        config.coordinator.max_retries = 1_000;
    })
}

fn coordinator(reconnect: bool) -> Coordinator {
    Coordinator::new(test_config(reconnect), Arc::new(MemoryIdentityStore::new()))
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// Accept one connection and close it immediately.
async fn closing_server() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);
        tokio::time::sleep(Duration::from_secs(30)).await;
    });
    port
}

/// Accept connections forever and forward everything read to the returned channel.
async fn recording_server() -> (u16, mpsc::UnboundedReceiver<Vec<u8>>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, rx) = mpsc::unbounded_channel();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 4096];
                loop {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            let _ = tx.send(buf[..n].to_vec());
                        }
                    }
                }
            });
        }
    });
    (port, rx)
}

async fn read_until_contains(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>, needle: &str) -> String {
    let mut seen = String::new();
    timeout(Duration::from_secs(5), async {
        while !seen.contains(needle) {
            let chunk = rx.recv().await.expect("server channel closed");
            seen.push_str(&String::from_utf8_lossy(&chunk));
        }
    })
    .await
    .unwrap_or_else(|_| panic!("server never received {needle:?}; got {seen:?}"));
    seen
}

#[tokio::test]
async fn test_broadcast_sends_to_connected_and_queues_the_rest() {
    let coordinator = coordinator(false);
    let (live_port, mut live_rx) = recording_server().await;
    let dead_a = closing_server().await;
    let dead_b = closing_server().await;

    coordinator
        .add_connection(ServerDescriptor::tcp("live", "127.0.0.1", live_port))
        .await
        .expect("live server connects");
    coordinator
        .add_connection(ServerDescriptor::tcp("dead-a", "127.0.0.1", dead_a))
        .await
        .expect("dead-a connects before closing");
    coordinator
        .add_connection(ServerDescriptor::tcp("dead-b", "127.0.0.1", dead_b))
        .await
        .expect("dead-b connects before closing");

    wait_until("peers to close", || {
        coordinator.connection_state("dead-a") == Some(ConnectionState::Disconnected)
            && coordinator.connection_state("dead-b") == Some(ConnectionState::Disconnected)
    })
    .await;

    let payload = CotEvent::new("bcast-1", "a-f-G-U-C", Duration::from_secs(60)).to_xml();
    let outcomes = coordinator.broadcast_message(payload.clone(), Priority::Normal);

    assert_eq!(outcomes.len(), 3);
    assert_eq!(outcomes["live"], Delivery::Sent);
    assert_eq!(outcomes["dead-a"], Delivery::Queued);
    assert_eq!(outcomes["dead-b"], Delivery::Queued);
    assert_eq!(coordinator.queue_len("dead-a"), Some(1));
    assert_eq!(coordinator.queue_len("dead-b"), Some(1));
    assert_eq!(coordinator.queue_len("live"), Some(0));

    read_until_contains(&mut live_rx, "bcast-1").await;
    coordinator.shutdown();
}

#[tokio::test]
async fn test_emergency_to_disconnected_server_is_queued() {
    let coordinator = coordinator(false);
    let port = closing_server().await;
    coordinator
        .add_connection(ServerDescriptor::tcp("s1", "127.0.0.1", port))
        .await
        .unwrap();
    wait_until("peer close", || {
        coordinator.connection_state("s1") == Some(ConnectionState::Disconnected)
    })
    .await;

    let delivery = coordinator
        .send_message("<event uid=\"sos\"/>", "s1", Priority::Emergency)
        .unwrap();
    assert_eq!(delivery, Delivery::Queued);
    assert_eq!(coordinator.queue_len("s1"), Some(1));
}

#[tokio::test]
async fn test_send_to_unknown_server_fails() {
    let coordinator = coordinator(false);
    let err = coordinator
        .send_message("<event/>", "nowhere", Priority::Normal)
        .unwrap_err();
    assert!(matches!(err, ProtocolError::UnknownServer(id) if id == "nowhere"));
}

#[tokio::test]
async fn test_duplicate_and_disabled_servers_are_rejected() {
    let coordinator = coordinator(false);
    let (port, _rx) = recording_server().await;

    coordinator
        .add_connection(ServerDescriptor::tcp("one", "127.0.0.1", port))
        .await
        .unwrap();
    let err = coordinator
        .add_connection(ServerDescriptor::tcp("one", "127.0.0.1", port))
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::DuplicateServer(_)));

    let err = coordinator
        .add_connection(ServerDescriptor::tcp("off", "127.0.0.1", port).disabled())
        .await
        .unwrap_err();
    assert!(matches!(err, ProtocolError::ServerDisabled(_)));
    assert_eq!(coordinator.server_ids(), vec!["one".to_string()]);
}

#[tokio::test]
async fn test_failed_connect_leaves_no_slot_and_no_primary() {
    let coordinator = coordinator(false);
    let refused = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    };

    let result = coordinator
        .add_connection(ServerDescriptor::tcp("gone", "127.0.0.1", refused))
        .await;
    assert!(result.is_err());
    assert!(coordinator.server_ids().is_empty());
    assert!(coordinator.primary().is_none());
}

#[tokio::test]
async fn test_primary_follows_first_connection_and_removal() {
    let coordinator = coordinator(false);
    let (a, _rx_a) = recording_server().await;
    let (b, _rx_b) = recording_server().await;

    coordinator
        .add_connection(ServerDescriptor::tcp("a", "127.0.0.1", a))
        .await
        .unwrap();
    coordinator
        .add_connection(ServerDescriptor::tcp("b", "127.0.0.1", b))
        .await
        .unwrap();
    assert_eq!(coordinator.primary().as_deref(), Some("a"));

    coordinator.set_primary("b").unwrap();
    assert_eq!(coordinator.primary().as_deref(), Some("b"));

    coordinator.remove_connection("b").unwrap();
    assert_eq!(coordinator.primary().as_deref(), Some("a"));
    assert!(coordinator.descriptor("b").is_none());
    assert!(matches!(
        coordinator.remove_connection("b"),
        Err(ProtocolError::UnknownServer(_))
    ));
}

#[tokio::test]
async fn test_inbound_events_are_routed_and_pongs_consumed() {
    let coordinator = coordinator(false);
    let mut events = coordinator.take_events().expect("event stream");
    assert!(coordinator.take_events().is_none(), "stream is handed out once");

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let pong = CotEvent::new("takPong", "t-x-c-t-r", Duration::from_secs(20)).to_xml();
        let chat = "<event uid=\"chat-1\" type=\"b-t-f\"><detail/></event>";
        // split the chat event across two writes
        let stream = format!("{pong}{chat}");
        let (head, tail) = stream.split_at(stream.len() - 10);
        socket.write_all(head.as_bytes()).await.unwrap();
        socket.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        socket.write_all(tail.as_bytes()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;
    });

    coordinator
        .add_connection(ServerDescriptor::tcp("srv", "127.0.0.1", port))
        .await
        .unwrap();

    let received = timeout(Duration::from_secs(5), async {
        loop {
            match events.next().await.expect("event stream ended") {
                EngineEvent::MessageReceived { server_id, payload } => return (server_id, payload),
                _ => continue,
            }
        }
    })
    .await
    .expect("no message routed");

    assert_eq!(received.0, "srv");
    assert_eq!(received.1, "<event uid=\"chat-1\" type=\"b-t-f\"><detail/></event>");
}

#[tokio::test]
async fn test_reconnect_then_drain_delivers_queued_message() {
    let coordinator = coordinator(true);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    tokio::spawn(async move {
        // first session is cut immediately
        let (first, _) = listener.accept().await.unwrap();
        drop(first);
        let (mut second, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        loop {
            match second.read(&mut buf).await {
                Ok(0) | Err(_) => return,
                Ok(n) => {
                    let _ = tx.send(buf[..n].to_vec());
                }
            }
        }
    });

    coordinator
        .add_connection(ServerDescriptor::tcp("flaky", "127.0.0.1", port))
        .await
        .unwrap();
    wait_until("first session to drop", || {
        !matches!(coordinator.connection_state("flaky"), Some(ConnectionState::Connected))
    })
    .await;

    let delivery = coordinator
        .send_message("<event uid=\"queued-1\"/>", "flaky", Priority::High)
        .unwrap();
    assert_eq!(delivery, Delivery::Queued);

    wait_until("reconnect", || {
        coordinator.connection_state("flaky") == Some(ConnectionState::Connected)
    })
    .await;
    read_until_contains(&mut rx, "queued-1").await;
    wait_until("queue drained", || coordinator.queue_len("flaky") == Some(0)).await;
}

#[tokio::test]
async fn test_reconnect_exhaustion_marks_failed() {
    let config = EngineConfig::default_with_overrides(|config| {
        config.reconnect.enabled = true;
        config.reconnect.max_attempts = 2;
        config.reconnect.initial_delay = Duration::from_millis(10);
        config.reconnect.max_delay = Duration::from_millis(20);
        config.coordinator.connect_timeout = Duration::from_millis(500);
    });
    let coordinator = Coordinator::new(config, Arc::new(MemoryIdentityStore::new()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);
        drop(listener);
    });

    coordinator
        .add_connection(ServerDescriptor::tcp("doomed", "127.0.0.1", port))
        .await
        .unwrap();
    wait_until("reconnect exhaustion", || {
        matches!(
            coordinator.connection_state("doomed"),
            Some(ConnectionState::Failed(reason)) if reason == "reconnect attempts exhausted"
        )
    })
    .await;
}

#[tokio::test]
async fn test_failed_server_queue_is_dropped_after_max_retries() {
    let config = EngineConfig::default_with_overrides(|config| {
        config.reconnect.enabled = true;
        config.reconnect.max_attempts = 1;
        config.reconnect.initial_delay = Duration::from_millis(10);
        config.reconnect.max_delay = Duration::from_millis(20);
        config.coordinator.connect_timeout = Duration::from_millis(500);
        config.coordinator.drain_interval = Duration::from_millis(25);
        config.coordinator.max_retries = 2;
    });
    let coordinator = Coordinator::new(config, Arc::new(MemoryIdentityStore::new()));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        let (socket, _) = listener.accept().await.unwrap();
        drop(socket);
        drop(listener);
    });

    coordinator
        .add_connection(ServerDescriptor::tcp("stuck", "127.0.0.1", port))
        .await
        .unwrap();
    wait_until("server to fail", || {
        matches!(coordinator.connection_state("stuck"), Some(ConnectionState::Failed(_)))
    })
    .await;

    let delivery = coordinator
        .send_message("<event uid=\"never\"/>", "stuck", Priority::Normal)
        .unwrap();
    assert_eq!(delivery, Delivery::Queued);
    assert_eq!(coordinator.queue_len("stuck"), Some(1));

    wait_until("undeliverable entry to be dropped", || {
        coordinator.queue_len("stuck") == Some(0)
    })
    .await;
    assert!(matches!(
        coordinator.connection_state("stuck"),
        Some(ConnectionState::Failed(_))
    ));
}
