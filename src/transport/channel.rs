//! # Transport Channel
//!
//! Owns one live connection to one server. A reader task frames inbound
//! bytes into CoT messages and a writer task drains a bounded queue of
//! outbound payloads; both are aborted by [`TransportChannel::disconnect`].
//!
//! The channel never retries on its own. A failed read or peer close moves
//! it to `Disconnected` and the reconnect decision belongs to the caller.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{lookup_host, TcpStream, UdpSocket};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, FramedRead, FramedWrite};
use tracing::{debug, info, instrument, trace, warn};

use super::descriptor::{ConnectionState, ServerDescriptor, TransportKind};
use super::tls;
use crate::config::{EngineConfig, FramerConfig};
use crate::core::framer::CotCodec;
use crate::error::{constants, ProtocolError, Result};
use crate::identity::{Identity, IdentityStore};
use crate::utils::metrics::TrafficCounters;
use crate::utils::timeout::with_timeout;

const MAX_DATAGRAM: usize = 65_536;

/// Event emitted by a channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    MessageReceived { server_id: String, payload: String },
    StateChanged { server_id: String, state: ConnectionState },
}

/// Tunables for a channel
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    pub connect_timeout: Duration,
    pub writer_queue_depth: usize,
    pub framer: FramerConfig,
}

impl ChannelOptions {
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            connect_timeout: config.coordinator.connect_timeout,
            writer_queue_depth: config.coordinator.writer_queue_depth,
            framer: config.framer.clone(),
        }
    }
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self::from_config(&EngineConfig::default())
    }
}

struct Session {
    writer: mpsc::Sender<Bytes>,
    tasks: [JoinHandle<()>; 2],
}

/// State shared with the reader and writer tasks
struct Shared {
    server_id: Mutex<String>,
    state: Mutex<ConnectionState>,
    /// Bumped on every connect/disconnect so stale tasks cannot report loss
    generation: AtomicU64,
    /// Generation whose tasks have already ended
    ended: AtomicU64,
    counters: Arc<TrafficCounters>,
    events: mpsc::UnboundedSender<ChannelEvent>,
}

impl Shared {
    fn server_id(&self) -> String {
        self.server_id
            .lock()
            .map(|id| id.clone())
            .unwrap_or_default()
    }

    fn set_state(&self, next: ConnectionState) {
        let changed = match self.state.lock() {
            Ok(mut state) if *state != next => {
                *state = next.clone();
                true
            }
            _ => false,
        };
        if changed {
            let server_id = self.server_id();
            debug!(server = %server_id, state = %next, "Channel state changed");
            let _ = self.events.send(ChannelEvent::StateChanged {
                server_id,
                state: next,
            });
        }
    }

    fn state(&self) -> ConnectionState {
        self.state
            .lock()
            .map(|s| s.clone())
            .unwrap_or(ConnectionState::Disconnected)
    }

    /// Called by a task whose connection ended on its own.
    fn lost(&self, generation: u64, reason: &ProtocolError) {
        if self.generation.load(Ordering::Acquire) != generation {
            return;
        }
        self.ended.store(generation, Ordering::Release);
        if self.state().is_connected() {
            info!(server = %self.server_id(), reason = %reason, "Connection lost");
            self.counters.connection_closed();
            self.set_state(ConnectionState::Disconnected);
        }
    }
}

/// One connection to one server
pub struct TransportChannel {
    options: ChannelOptions,
    store: Arc<dyn IdentityStore>,
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
    descriptor: Mutex<Option<ServerDescriptor>>,
}

impl TransportChannel {
    pub fn new(
        options: ChannelOptions,
        store: Arc<dyn IdentityStore>,
        counters: Arc<TrafficCounters>,
        events: mpsc::UnboundedSender<ChannelEvent>,
    ) -> Self {
        Self {
            options,
            store,
            shared: Arc::new(Shared {
                server_id: Mutex::new(String::new()),
                state: Mutex::new(ConnectionState::Disconnected),
                generation: AtomicU64::new(0),
                ended: AtomicU64::new(0),
                counters,
                events,
            }),
            session: Mutex::new(None),
            descriptor: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn counters(&self) -> &Arc<TrafficCounters> {
        &self.shared.counters
    }

    /// Snapshot of the descriptor this channel last connected with.
    pub fn descriptor(&self) -> Option<ServerDescriptor> {
        self.descriptor.lock().ok().and_then(|d| d.clone())
    }

    /// Open the connection described by `descriptor`, bounded by the connect timeout.
    #[instrument(skip(self, descriptor), fields(server = %descriptor.id, transport = %descriptor.transport))]
    pub async fn connect(&self, descriptor: &ServerDescriptor) -> Result<()> {
        if !descriptor.enabled {
            return Err(ProtocolError::ServerDisabled(descriptor.id.clone()));
        }
        self.teardown();

        if let Ok(mut id) = self.shared.server_id.lock() {
            *id = descriptor.id.clone();
        }
        if let Ok(mut snapshot) = self.descriptor.lock() {
            *snapshot = Some(descriptor.clone());
        }
        let generation = self.shared.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.shared.set_state(ConnectionState::Connecting);

        match with_timeout(self.options.connect_timeout, self.open(descriptor, generation)).await {
            Ok(session) => {
                if let Ok(mut slot) = self.session.lock() {
                    *slot = Some(session);
                }
                self.shared.counters.connection_established();
                self.shared.set_state(ConnectionState::Connected);
                info!(address = %descriptor.address(), "Connected");
                if self.shared.ended.load(Ordering::Acquire) == generation {
                    self.shared.lost(generation, &ProtocolError::ConnectionClosed);
                }
                Ok(())
            }
            Err(e) => {
                let e = match e {
                    ProtocolError::Timeout => ProtocolError::ConnectFailed(format!(
                        "{} after {:?}",
                        constants::ERR_CONNECT_TIMEOUT,
                        self.options.connect_timeout
                    )),
                    other => other,
                };
                warn!(error = %e, "Connect failed");
                self.shared.counters.connection_error();
                self.shared.set_state(ConnectionState::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    fn identity(&self, descriptor: &ServerDescriptor) -> Result<Option<Identity>> {
        let Some(reference) = &descriptor.identity else {
            return Ok(None);
        };
        let identity = self
            .store
            .load(&reference.alias, reference.passphrase.as_deref())
            .map_err(|e| ProtocolError::IdentityUnavailable(format!("{}: {e}", reference.alias)))?
            .ok_or_else(|| ProtocolError::IdentityUnavailable(reference.alias.clone()))?;
        Ok(Some(identity))
    }

    async fn open(&self, descriptor: &ServerDescriptor, generation: u64) -> Result<Session> {
        let (writer, rx) = mpsc::channel(self.options.writer_queue_depth.max(1));

        let tasks = match descriptor.transport {
            TransportKind::Tcp => {
                let tcp = tcp_connect(descriptor).await?;
                let (read, write) = tcp.into_split();
                self.spawn_stream(read, write, Vec::new(), rx, generation)
            }
            TransportKind::Tls => {
                let identity = self.identity(descriptor)?;
                let tcp = tcp_connect(descriptor).await?;
                let session = tls::handshake(tcp, descriptor, identity.as_ref()).await?;
                let (read, write) = tokio::io::split(session.stream);
                self.spawn_stream(read, write, session.early_data, rx, generation)
            }
            TransportKind::Udp => {
                let socket = Arc::new(udp_connect(descriptor).await?);
                self.spawn_datagram(socket, rx, generation)
            }
        };

        Ok(Session { writer, tasks })
    }

    fn codec(&self) -> CotCodec {
        CotCodec::new(self.options.framer.clone()).with_counters(self.shared.counters.clone())
    }

    fn spawn_stream<R, W>(
        &self,
        read: R,
        write: W,
        early_data: Vec<u8>,
        rx: mpsc::Receiver<Bytes>,
        generation: u64,
    ) -> [JoinHandle<()>; 2]
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let mut frames = FramedRead::new(read, self.codec());
        frames.read_buffer_mut().extend_from_slice(&early_data);
        let sink = FramedWrite::new(write, self.codec());

        let reader = tokio::spawn(read_loop(frames, self.shared.clone(), generation));
        let writer = tokio::spawn({
            let shared = self.shared.clone();
            async move {
                let mut sink = sink;
                let mut rx = rx;
                while let Some(payload) = rx.recv().await {
                    let len = payload.len() as u64;
                    if let Err(e) = sink.send(payload).await {
                        shared.lost(generation, &ProtocolError::SendFailed(e.to_string()));
                        return;
                    }
                    shared.counters.message_sent(len);
                }
            }
        });
        [reader, writer]
    }

    fn spawn_datagram(
        &self,
        socket: Arc<UdpSocket>,
        rx: mpsc::Receiver<Bytes>,
        generation: u64,
    ) -> [JoinHandle<()>; 2] {
        let frames = datagram_frames(socket.clone(), self.codec());
        let reader = tokio::spawn(read_loop(Box::pin(frames), self.shared.clone(), generation));
        let writer = tokio::spawn({
            let shared = self.shared.clone();
            async move {
                let mut rx = rx;
                while let Some(payload) = rx.recv().await {
                    match socket.send(&payload).await {
                        Ok(n) => shared.counters.message_sent(n as u64),
                        Err(e) => {
                            shared.lost(generation, &ProtocolError::SendFailed(e.to_string()));
                            return;
                        }
                    }
                }
            }
        });
        [reader, writer]
    }

    /// Queue `payload` for the writer without waiting.
    ///
    /// Returns `false` when not connected or the writer queue is full.
    pub fn send(&self, payload: impl Into<Bytes>) -> bool {
        match self.try_send(payload) {
            Ok(()) => true,
            Err(e) => {
                trace!(server = %self.shared.server_id(), error = %e, "Send refused");
                false
            }
        }
    }

    /// Like [`send`](Self::send), but says why the payload was refused.
    pub fn try_send(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.shared.counters.send_attempt();
        if !self.is_connected() {
            return Err(ProtocolError::NotConnected);
        }
        let session = self
            .session
            .lock()
            .map_err(|_| ProtocolError::SendFailed(constants::ERR_LOCK_POISONED.into()))?;
        let writer = &session.as_ref().ok_or(ProtocolError::NotConnected)?.writer;
        writer.try_send(payload.into()).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                ProtocolError::SendFailed(constants::ERR_WRITER_FULL.into())
            }
            mpsc::error::TrySendError::Closed(_) => ProtocolError::ConnectionClosed,
        })
    }

    /// Close the connection and cancel its tasks immediately.
    pub fn disconnect(&self) {
        self.teardown();
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Abort the current session, if any, without publishing a state change.
    fn teardown(&self) {
        self.shared.generation.fetch_add(1, Ordering::AcqRel);
        let session = self.session.lock().ok().and_then(|mut s| s.take());
        if let Some(session) = session {
            for task in &session.tasks {
                task.abort();
            }
            if self.is_connected() {
                self.shared.counters.connection_closed();
            }
            debug!(server = %self.shared.server_id(), "Channel session closed");
        }
    }

    /// Record a state the channel itself does not produce (e.g. `Reconnecting`).
    pub fn mark(&self, state: ConnectionState) {
        self.shared.set_state(state);
    }
}

impl Drop for TransportChannel {
    fn drop(&mut self) {
        if let Ok(mut session) = self.session.lock() {
            if let Some(session) = session.take() {
                for task in &session.tasks {
                    task.abort();
                }
            }
        }
    }
}

async fn read_loop<S>(mut frames: S, shared: Arc<Shared>, generation: u64)
where
    S: Stream<Item = Result<String>> + Unpin,
{
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(payload) => {
                shared.counters.message_received(payload.len() as u64);
                let _ = shared.events.send(ChannelEvent::MessageReceived {
                    server_id: shared.server_id(),
                    payload,
                });
            }
            Err(e) => {
                shared.lost(generation, &e);
                return;
            }
        }
    }
    shared.lost(generation, &ProtocolError::ConnectionClosed);
}

/// Frames from a connected UDP socket; datagram boundaries are not message boundaries.
fn datagram_frames(
    socket: Arc<UdpSocket>,
    codec: CotCodec,
) -> impl Stream<Item = Result<String>> + Send {
    futures::stream::unfold(
        (socket, codec, BytesMut::with_capacity(MAX_DATAGRAM)),
        |(socket, mut codec, mut buf)| async move {
            loop {
                match codec.decode(&mut buf) {
                    Ok(Some(frame)) => return Some((Ok(frame), (socket, codec, buf))),
                    Ok(None) => {}
                    Err(e) => return Some((Err(e), (socket, codec, buf))),
                }
                buf.reserve(MAX_DATAGRAM);
                if let Err(e) = socket.recv_buf(&mut buf).await {
                    return Some((Err(ProtocolError::Io(e)), (socket, codec, buf)));
                }
            }
        },
    )
}

async fn tcp_connect(descriptor: &ServerDescriptor) -> Result<TcpStream> {
    let stream = TcpStream::connect(descriptor.address())
        .await
        .map_err(|e| ProtocolError::ConnectFailed(format!("{}: {e}", descriptor.address())))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn udp_connect(descriptor: &ServerDescriptor) -> Result<UdpSocket> {
    let target = lookup_host(descriptor.address())
        .await
        .map_err(|e| ProtocolError::ConnectFailed(format!("{}: {e}", descriptor.address())))?
        .next()
        .ok_or_else(|| ProtocolError::ConnectFailed(format!("No address for {}", descriptor.host)))?;
    let bind = if target.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
    let socket = UdpSocket::bind(bind).await?;
    socket
        .connect(target)
        .await
        .map_err(|e| ProtocolError::ConnectFailed(format!("{target}: {e}")))?;
    Ok(socket)
}
