//! # Multi-Server Coordinator
//!
//! The entry point for application code. Owns one [`TransportChannel`] per
//! server id, each with its own outbound [`PriorityQueue`] and
//! [`HealthMonitor`], and publishes everything that happens as
//! [`EngineEvent`]s on a single stream.
//!
//! ## Background tasks
//! - **router**: turns channel events into engine events, feeds pongs to the
//!   health monitor and starts the reconnect supervisor on unexpected loss
//! - **drain**: every `drain_interval`, offers queued messages to connected
//!   channels in priority order
//! - **sampler**: per-second traffic samples for [`NetworkMetricsSampler`]
//! - per server: a scoring task and a ping task
//!
//! ## Locking
//! The server map is only locked long enough to clone an `Arc<ServerSlot>`.
//! Each slot guards its own queue, so a slow server never blocks another.
//! No lock is held across an `.await`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, instrument, warn};

use super::health::{CertificateHealth, HealthMetrics, HealthMonitor};
use super::queue::{Priority, PriorityQueue, QueuedMessage};
use crate::config::{EngineConfig, HealthConfig, ReconnectConfig};
use crate::core::cot::{self, CotEvent};
use crate::error::{ProtocolError, Result};
use crate::identity::{EnrollmentClient, EnrollmentRequest, IdentityStore};
use crate::transport::{
    ChannelEvent, ChannelOptions, ConnectionState, ServerDescriptor, TransportChannel,
};
use crate::utils::metrics::{NetworkMetricsSampler, TrafficCounters};

/// Outcome of a unicast or broadcast send
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Delivery {
    /// Handed to the channel's writer
    Sent,
    /// Stored in the server's queue for a later drain
    Queued,
}

/// Event published to the application
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    MessageReceived { server_id: String, payload: String },
    StateChanged { server_id: String, state: ConnectionState },
    HealthUpdated { server_id: String, metrics: HealthMetrics },
    /// Fair or worse on consecutive samples
    HealthWarning { server_id: String, metrics: HealthMetrics },
}

struct ServerSlot {
    descriptor: ServerDescriptor,
    channel: TransportChannel,
    queue: Mutex<PriorityQueue>,
    health: HealthMonitor,
    /// Client certificate expiry, loaded once when the slot is created
    certificate_expiry: Option<Option<DateTime<Utc>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    removed: AtomicBool,
    reconnecting: AtomicBool,
}

impl ServerSlot {
    fn certificate_health(&self, now: DateTime<Utc>) -> CertificateHealth {
        match self.certificate_expiry {
            None => CertificateHealth::NotRequired,
            Some(None) => CertificateHealth::Missing,
            Some(Some(not_after)) => CertificateHealth::DaysRemaining((not_after - now).num_days()),
        }
    }

    fn queue(&self) -> std::sync::MutexGuard<'_, PriorityQueue> {
        self.queue.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn track(&self, task: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(task);
        }
    }

    /// Stop background work and close the channel.
    fn stop(&self) {
        self.removed.store(true, Ordering::Release);
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        self.channel.disconnect();
        self.queue().clear();
    }

    /// Try the channel first, queue on failure.
    fn deliver(&self, payload: Bytes, priority: Priority) -> Delivery {
        if self.channel.send(payload.clone()) {
            return Delivery::Sent;
        }
        let evicted = self.queue().push(QueuedMessage::new(payload, priority));
        if let Some(evicted) = evicted {
            warn!(
                server = %self.descriptor.id,
                evicted_id = evicted.id,
                evicted_priority = ?evicted.priority,
                "Queue full, evicted lowest-priority message"
            );
        }
        Delivery::Queued
    }
}

struct Inner {
    config: EngineConfig,
    store: Arc<dyn IdentityStore>,
    servers: RwLock<HashMap<String, Arc<ServerSlot>>>,
    primary: RwLock<Option<String>>,
    counters: Arc<TrafficCounters>,
    sampler: Arc<NetworkMetricsSampler>,
    events: mpsc::UnboundedSender<EngineEvent>,
    event_stream: Mutex<Option<mpsc::UnboundedReceiver<EngineEvent>>>,
    channel_events: mpsc::UnboundedSender<ChannelEvent>,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl Inner {
    fn slot(&self, id: &str) -> Option<Arc<ServerSlot>> {
        self.servers.read().ok().and_then(|servers| servers.get(id).cloned())
    }

    fn slots(&self) -> Vec<Arc<ServerSlot>> {
        self.servers
            .read()
            .map(|servers| servers.values().cloned().collect())
            .unwrap_or_default()
    }

    fn primary(&self) -> Option<String> {
        self.primary.read().ok().and_then(|p| p.clone())
    }

    fn set_primary(&self, id: Option<String>) {
        if let Ok(mut primary) = self.primary.write() {
            *primary = id;
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(mut background) = self.background.lock() {
            for task in background.drain(..) {
                task.abort();
            }
        }
        if let Ok(servers) = self.servers.read() {
            for slot in servers.values() {
                slot.stop();
            }
        }
    }
}

/// Multi-server connection coordinator
///
/// Must be created inside a Tokio runtime. Cloning is cheap and every clone
/// drives the same set of connections.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn new(config: EngineConfig, store: Arc<dyn IdentityStore>) -> Self {
        let (events, event_stream) = mpsc::unbounded_channel();
        let (channel_events, channel_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(TrafficCounters::new());
        let sampler = Arc::new(NetworkMetricsSampler::new(counters.clone(), config.metrics.window));

        let inner = Arc::new(Inner {
            config,
            store,
            servers: RwLock::new(HashMap::new()),
            primary: RwLock::new(None),
            counters,
            sampler,
            events,
            event_stream: Mutex::new(Some(event_stream)),
            channel_events,
            background: Mutex::new(Vec::new()),
        });

        let background = vec![
            tokio::spawn(route_events(Arc::downgrade(&inner), channel_rx)),
            tokio::spawn(drain_queues(
                Arc::downgrade(&inner),
                inner.config.coordinator.drain_interval,
            )),
            inner.sampler.clone().spawn(inner.config.metrics.sample_interval),
        ];
        if let Ok(mut tasks) = inner.background.lock() {
            tasks.extend(background);
        }

        info!(
            drain_ms = inner.config.coordinator.drain_interval.as_millis() as u64,
            queue_capacity = inner.config.coordinator.queue_capacity,
            "Coordinator started"
        );
        Self { inner }
    }

    /// Engine events; available once; `None` after the first call.
    pub fn take_events(&self) -> Option<UnboundedReceiverStream<EngineEvent>> {
        self.inner
            .event_stream
            .lock()
            .ok()
            .and_then(|mut rx| rx.take())
            .map(UnboundedReceiverStream::new)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn identity_store(&self) -> &Arc<dyn IdentityStore> {
        &self.inner.store
    }

    /// Aggregate counters across every channel.
    pub fn counters(&self) -> &Arc<TrafficCounters> {
        &self.inner.counters
    }

    pub fn metrics(&self) -> &Arc<NetworkMetricsSampler> {
        &self.inner.sampler
    }

    /// Connect to a new server. The first successful connection becomes primary.
    #[instrument(skip(self, descriptor), fields(server = %descriptor.id))]
    pub async fn add_connection(&self, descriptor: ServerDescriptor) -> Result<()> {
        if !descriptor.enabled {
            return Err(ProtocolError::ServerDisabled(descriptor.id.clone()));
        }

        let slot = Arc::new(self.build_slot(descriptor));
        {
            let mut servers = self
                .inner
                .servers
                .write()
                .map_err(|_| ProtocolError::Custom(crate::error::constants::ERR_LOCK_POISONED.into()))?;
            if servers.contains_key(&slot.descriptor.id) {
                return Err(ProtocolError::DuplicateServer(slot.descriptor.id.clone()));
            }
            servers.insert(slot.descriptor.id.clone(), slot.clone());
        }

        if let Err(e) = slot.channel.connect(&slot.descriptor).await {
            if let Ok(mut servers) = self.inner.servers.write() {
                servers.remove(&slot.descriptor.id);
            }
            slot.stop();
            return Err(e);
        }

        slot.health.record_connected(Instant::now());
        start_monitoring(&slot, &self.inner.config.health, self.inner.events.clone());

        if self.inner.primary().is_none() {
            info!("Primary server set");
            self.inner.set_primary(Some(slot.descriptor.id.clone()));
        }
        Ok(())
    }

    fn build_slot(&self, descriptor: ServerDescriptor) -> ServerSlot {
        let counters = Arc::new(TrafficCounters::child(self.inner.counters.clone()));
        let channel = TransportChannel::new(
            ChannelOptions::from_config(&self.inner.config),
            self.inner.store.clone(),
            counters,
            self.inner.channel_events.clone(),
        );

        let certificate_expiry = descriptor.requires_identity().then(|| {
            descriptor.identity.as_ref().and_then(|reference| {
                self.inner
                    .store
                    .load(&reference.alias, reference.passphrase.as_deref())
                    .ok()
                    .flatten()
                    .and_then(|identity| identity.not_after().ok())
            })
        });

        ServerSlot {
            channel,
            queue: Mutex::new(PriorityQueue::new(self.inner.config.coordinator.queue_capacity)),
            health: HealthMonitor::new(self.inner.config.health.clone()),
            certificate_expiry,
            tasks: Mutex::new(Vec::new()),
            removed: AtomicBool::new(false),
            reconnecting: AtomicBool::new(false),
            descriptor,
        }
    }

    /// Disconnect a server and discard its queue.
    #[instrument(skip(self))]
    pub fn remove_connection(&self, id: &str) -> Result<()> {
        let slot = self
            .inner
            .servers
            .write()
            .ok()
            .and_then(|mut servers| servers.remove(id))
            .ok_or_else(|| ProtocolError::UnknownServer(id.to_string()))?;
        slot.stop();

        if self.inner.primary().as_deref() == Some(id) {
            let next = self
                .inner
                .slots()
                .into_iter()
                .find(|s| s.channel.is_connected())
                .map(|s| s.descriptor.id.clone());
            debug!(next = ?next, "Primary server removed");
            self.inner.set_primary(next);
        }
        info!("Server removed");
        Ok(())
    }

    /// Send to one server now, or queue it when the server cannot take it.
    pub fn send_message(
        &self,
        payload: impl Into<Bytes>,
        server_id: &str,
        priority: Priority,
    ) -> Result<Delivery> {
        let slot = self
            .inner
            .slot(server_id)
            .ok_or_else(|| ProtocolError::UnknownServer(server_id.to_string()))?;
        Ok(slot.deliver(payload.into(), priority))
    }

    /// Send to every server; the map holds one outcome per server id.
    pub fn broadcast_message(
        &self,
        payload: impl Into<Bytes>,
        priority: Priority,
    ) -> HashMap<String, Delivery> {
        let payload = payload.into();
        self.inner
            .slots()
            .into_iter()
            .map(|slot| {
                let delivery = slot.deliver(payload.clone(), priority);
                (slot.descriptor.id.clone(), delivery)
            })
            .collect()
    }

    pub fn queue_len(&self, server_id: &str) -> Option<usize> {
        self.inner.slot(server_id).map(|slot| slot.queue().len())
    }

    pub fn primary(&self) -> Option<String> {
        self.inner.primary()
    }

    pub fn set_primary(&self, server_id: &str) -> Result<()> {
        if self.inner.slot(server_id).is_none() {
            return Err(ProtocolError::UnknownServer(server_id.to_string()));
        }
        self.inner.set_primary(Some(server_id.to_string()));
        Ok(())
    }

    pub fn connection_state(&self, server_id: &str) -> Option<ConnectionState> {
        self.inner.slot(server_id).map(|slot| slot.channel.state())
    }

    pub fn descriptor(&self, server_id: &str) -> Option<ServerDescriptor> {
        self.inner.slot(server_id).map(|slot| slot.descriptor.clone())
    }

    pub fn server_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .inner
            .slots()
            .iter()
            .map(|slot| slot.descriptor.id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Latest health snapshot for a server.
    pub fn health(&self, server_id: &str) -> Option<HealthMetrics> {
        self.inner.slot(server_id).and_then(|slot| slot.health.latest())
    }

    pub fn health_history(&self, server_id: &str) -> Vec<HealthMetrics> {
        self.inner
            .slot(server_id)
            .map(|slot| slot.health.history())
            .unwrap_or_default()
    }

    /// Enroll against `host:port` and return a TLS descriptor for the new identity.
    pub async fn enroll(
        &self,
        host: &str,
        port: u16,
        username: &str,
        password: &str,
    ) -> Result<ServerDescriptor> {
        self.enroll_with(EnrollmentRequest::new(host, port, username, password))
            .await
    }

    pub async fn enroll_with(&self, request: EnrollmentRequest) -> Result<ServerDescriptor> {
        let client = EnrollmentClient::new(self.inner.config.enrollment.clone(), self.inner.store.clone())?;
        client.enroll(&request).await
    }

    /// Stop every background task and disconnect every server.
    pub fn shutdown(&self) {
        if let Ok(mut background) = self.inner.background.lock() {
            for task in background.drain(..) {
                task.abort();
            }
        }
        let slots: Vec<Arc<ServerSlot>> = self
            .inner
            .servers
            .write()
            .map(|mut servers| servers.drain().map(|(_, slot)| slot).collect())
            .unwrap_or_default();
        for slot in &slots {
            slot.stop();
        }
        self.inner.set_primary(None);
        self.inner.counters.log_metrics();
        info!(servers = slots.len(), "Coordinator shut down");
    }
}

fn start_monitoring(slot: &Arc<ServerSlot>, config: &HealthConfig, events: mpsc::UnboundedSender<EngineEvent>) {
    let scoring = tokio::spawn({
        let slot = slot.clone();
        let period = config.score_interval;
        async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let now = Utc::now();
                let metrics = slot.health.evaluate(
                    Instant::now(),
                    now,
                    &slot.channel.counters().snapshot(),
                    slot.certificate_health(now),
                );
                let server_id = slot.descriptor.id.clone();
                if metrics.degraded {
                    warn!(server = %server_id, score = metrics.score, status = ?metrics.status, "Connection health degraded");
                    let _ = events.send(EngineEvent::HealthWarning {
                        server_id: server_id.clone(),
                        metrics: metrics.clone(),
                    });
                }
                let _ = events.send(EngineEvent::HealthUpdated { server_id, metrics });
            }
        }
    });

    let pinging = tokio::spawn({
        let slot = slot.clone();
        let period = config.ping_interval;
        let client_uid = format!("takstream-{}", slot.descriptor.id);
        async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let now = Instant::now();
                for _ in 0..slot.health.expire_pings(now) {
                    slot.channel.counters().ping_lost();
                }
                if slot.channel.is_connected()
                    && slot.channel.send(CotEvent::ping(&client_uid).to_xml())
                {
                    slot.health.ping_sent(now);
                    slot.channel.counters().ping_sent();
                }
            }
        }
    });

    slot.track(scoring);
    slot.track(pinging);
}

async fn route_events(inner: Weak<Inner>, mut channel_rx: mpsc::UnboundedReceiver<ChannelEvent>) {
    while let Some(event) = channel_rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match event {
            ChannelEvent::MessageReceived { server_id, payload } => {
                if cot::is_pong(&payload) {
                    if let Some(slot) = inner.slot(&server_id) {
                        if let Some(rtt) = slot.health.pong_received(Instant::now()) {
                            slot.channel.counters().latency_sample(rtt);
                        }
                    }
                    continue;
                }
                let _ = inner
                    .events
                    .send(EngineEvent::MessageReceived { server_id, payload });
            }
            ChannelEvent::StateChanged { server_id, state } => {
                if state == ConnectionState::Disconnected {
                    if let Some(slot) = inner.slot(&server_id) {
                        if !slot.removed.load(Ordering::Acquire) {
                            slot.health.record_disconnect(Instant::now());
                            if inner.config.reconnect.enabled {
                                let supervisor = tokio::spawn(reconnect(
                                    slot.clone(),
                                    inner.config.reconnect.clone(),
                                ));
                                slot.track(supervisor);
                            }
                        }
                    }
                }
                let _ = inner.events.send(EngineEvent::StateChanged { server_id, state });
            }
        }
    }
}

/// Re-establish a lost connection with exponential backoff and jitter.
async fn reconnect(slot: Arc<ServerSlot>, config: ReconnectConfig) {
    if slot.reconnecting.swap(true, Ordering::AcqRel) {
        return;
    }
    let server_id = slot.descriptor.id.clone();

    for attempt in 0..config.max_attempts {
        if slot.removed.load(Ordering::Acquire) {
            break;
        }
        slot.channel.mark(ConnectionState::Reconnecting);
        let delay = jittered(config.backoff(attempt));
        debug!(server = %server_id, attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "Reconnecting");
        tokio::time::sleep(delay).await;
        if slot.removed.load(Ordering::Acquire) {
            break;
        }

        match slot.channel.connect(&slot.descriptor).await {
            Ok(()) => {
                info!(server = %server_id, attempt = attempt + 1, "Reconnected");
                slot.health.record_connected(Instant::now());
                slot.reconnecting.store(false, Ordering::Release);
                return;
            }
            Err(e) => warn!(server = %server_id, attempt = attempt + 1, error = %e, "Reconnect attempt failed"),
        }
    }

    if !slot.removed.load(Ordering::Acquire) {
        error!(server = %server_id, attempts = config.max_attempts, "Reconnect attempts exhausted");
        slot.channel
            .mark(ConnectionState::Failed("reconnect attempts exhausted".into()));
    }
    slot.reconnecting.store(false, Ordering::Release);
}

/// ±20 % around `delay`.
fn jittered(delay: Duration) -> Duration {
    let factor: f64 = rand::rng().random_range(0.8..=1.2);
    delay.mul_f64(factor)
}

async fn drain_queues(inner: Weak<Inner>, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let max_retries = inner.config.coordinator.max_retries;
        // a server that is not connected still burns one retry per entry
        for slot in inner.slots() {
            let report = {
                let mut queue = slot.queue();
                if queue.is_empty() {
                    continue;
                }
                queue.drain_with(max_retries, |message| slot.channel.send(message.payload.clone()))
            };
            debug!(
                server = %slot.descriptor.id,
                sent = report.sent,
                retried = report.retried,
                dropped = report.dropped,
                "Queue drained"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::MemoryIdentityStore;

    fn coordinator() -> Coordinator {
        Coordinator::new(EngineConfig::default(), Arc::new(MemoryIdentityStore::new()))
    }

    #[test]
    fn jitter_stays_within_twenty_percent() {
        for _ in 0..100 {
            let d = jittered(Duration::from_millis(1000));
            assert!(d >= Duration::from_millis(800) && d <= Duration::from_millis(1200));
        }
    }

    #[tokio::test]
    async fn unknown_server_is_an_error() {
        let coordinator = coordinator();
        assert!(matches!(
            coordinator.send_message("<event/>", "nope", Priority::Normal),
            Err(ProtocolError::UnknownServer(_))
        ));
        assert!(coordinator.remove_connection("nope").is_err());
        assert!(coordinator.set_primary("nope").is_err());
    }

    #[tokio::test]
    async fn disabled_descriptor_is_rejected() {
        let coordinator = coordinator();
        let err = coordinator
            .add_connection(ServerDescriptor::tcp("off", "127.0.0.1", 1).disabled())
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::ServerDisabled(_)));
        assert!(coordinator.server_ids().is_empty());
    }

    #[tokio::test]
    async fn events_can_be_taken_once() {
        let coordinator = coordinator();
        assert!(coordinator.take_events().is_some());
        assert!(coordinator.take_events().is_none());
    }
}
