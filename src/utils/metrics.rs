//! Observability and Metrics
//!
//! Traffic counters incremented by transport channels, and a sampler that
//! turns them into a trailing per-second history.
//!
//! Counters are atomics so the receive loop, the writer task and the health
//! monitor can update them without locking. A channel's counters may have a
//! parent; every increment is mirrored into it so the engine keeps an
//! aggregate across servers.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::error::{ProtocolError, Result};

/// Traffic counters for one channel (or the aggregate of many)
#[derive(Debug)]
pub struct TrafficCounters {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connection_errors: AtomicU64,
    /// Sends requested by callers
    pub send_attempts: AtomicU64,
    /// Sends written to the socket
    pub messages_sent: AtomicU64,
    pub messages_received: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub pings_sent: AtomicU64,
    pub pings_lost: AtomicU64,
    pub latency_total_ms: AtomicU64,
    pub latency_samples: AtomicU64,
    parent: Option<Arc<TrafficCounters>>,
    start_time: Instant,
}

macro_rules! bump {
    ($self:ident, $field:ident, $n:expr) => {{
        $self.$field.fetch_add($n, Ordering::Relaxed);
        if let Some(parent) = &$self.parent {
            parent.$field.fetch_add($n, Ordering::Relaxed);
        }
    }};
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Counters whose increments are mirrored into `parent`.
    pub fn child(parent: Arc<TrafficCounters>) -> Self {
        Self::build(Some(parent))
    }

    fn build(parent: Option<Arc<TrafficCounters>>) -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            send_attempts: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            pings_sent: AtomicU64::new(0),
            pings_lost: AtomicU64::new(0),
            latency_total_ms: AtomicU64::new(0),
            latency_samples: AtomicU64::new(0),
            parent,
            start_time: Instant::now(),
        }
    }

    pub fn connection_established(&self) {
        bump!(self, connections_total, 1);
        bump!(self, connections_active, 1);
    }

    /// Saturates at zero.
    pub fn connection_closed(&self) {
        decrement(&self.connections_active);
        if let Some(parent) = &self.parent {
            decrement(&parent.connections_active);
        }
    }

    pub fn connection_error(&self) {
        bump!(self, connection_errors, 1);
    }

    pub fn send_attempt(&self) {
        bump!(self, send_attempts, 1);
    }

    pub fn message_sent(&self, byte_count: u64) {
        bump!(self, messages_sent, 1);
        bump!(self, bytes_sent, byte_count);
    }

    pub fn message_received(&self, byte_count: u64) {
        bump!(self, messages_received, 1);
        bump!(self, bytes_received, byte_count);
    }

    pub fn protocol_error(&self) {
        bump!(self, protocol_errors, 1);
    }

    pub fn ping_sent(&self) {
        bump!(self, pings_sent, 1);
    }

    pub fn ping_lost(&self) {
        bump!(self, pings_lost, 1);
    }

    pub fn latency_sample(&self, rtt: Duration) {
        bump!(self, latency_total_ms, rtt.as_millis() as u64);
        bump!(self, latency_samples, 1);
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            send_attempts: self.send_attempts.load(Ordering::Relaxed),
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            pings_sent: self.pings_sent.load(Ordering::Relaxed),
            pings_lost: self.pings_lost.load(Ordering::Relaxed),
            latency_total_ms: self.latency_total_ms.load(Ordering::Relaxed),
            latency_samples: self.latency_samples.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    /// Log current counters
    pub fn log_metrics(&self) {
        let s = self.snapshot();
        info!(
            connections_total = s.connections_total,
            connections_active = s.connections_active,
            connection_errors = s.connection_errors,
            send_attempts = s.send_attempts,
            messages_sent = s.messages_sent,
            messages_received = s.messages_received,
            bytes_sent = s.bytes_sent,
            bytes_received = s.bytes_received,
            protocol_errors = s.protocol_errors,
            pings_sent = s.pings_sent,
            pings_lost = s.pings_lost,
            uptime_seconds = s.uptime_seconds,
            "Traffic counters snapshot"
        );
    }
}

impl Default for TrafficCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Counters at a point in time
#[derive(Debug, Clone, Default, Serialize)]
pub struct CountersSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub connection_errors: u64,
    pub send_attempts: u64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub protocol_errors: u64,
    pub pings_sent: u64,
    pub pings_lost: u64,
    pub latency_total_ms: u64,
    pub latency_samples: u64,
    pub uptime_seconds: u64,
}

impl CountersSnapshot {
    /// Mean round-trip time over all samples, if any.
    pub fn average_latency_ms(&self) -> Option<f64> {
        (self.latency_samples > 0)
            .then(|| self.latency_total_ms as f64 / self.latency_samples as f64)
    }

    /// Share of sends that reached the socket, 0.0..=1.0 (1.0 with no attempts).
    pub fn success_ratio(&self) -> f64 {
        if self.send_attempts == 0 {
            1.0
        } else {
            (self.messages_sent as f64 / self.send_attempts as f64).min(1.0)
        }
    }

    /// Lost pings as a percentage of pings sent.
    pub fn packet_loss_pct(&self) -> f64 {
        if self.pings_sent == 0 {
            0.0
        } else {
            (self.pings_lost as f64 / self.pings_sent as f64 * 100.0).min(100.0)
        }
    }
}

/// One entry of the sampler history
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSample {
    pub timestamp: DateTime<Utc>,
    pub bytes_per_sec: f64,
    pub messages_per_sec: f64,
    pub avg_latency_ms: f64,
    pub packet_loss_pct: f64,
}

/// Minimum, maximum and mean of one metric across the history
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Aggregate {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

impl Aggregate {
    fn over<I: Iterator<Item = f64>>(values: I) -> Self {
        let mut count = 0usize;
        let mut sum = 0.0;
        let mut min = f64::INFINITY;
        let mut max = f64::NEG_INFINITY;
        for v in values {
            count += 1;
            sum += v;
            min = min.min(v);
            max = max.max(v);
        }
        if count == 0 {
            return Self::default();
        }
        Self {
            min,
            max,
            avg: sum / count as f64,
        }
    }

    /// Peak value (alias of `max`)
    pub fn peak(&self) -> f64 {
        self.max
    }
}

/// Aggregate view over the retained history
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricsSummary {
    pub samples: usize,
    pub bytes_per_sec: Aggregate,
    pub messages_per_sec: Aggregate,
    pub avg_latency_ms: Aggregate,
    pub packet_loss_pct: Aggregate,
}

struct SamplerState {
    last: Option<(DateTime<Utc>, CountersSnapshot)>,
    samples: VecDeque<MetricsSample>,
}

/// Trailing-window sampler over a set of [`TrafficCounters`]
pub struct NetworkMetricsSampler {
    counters: Arc<TrafficCounters>,
    window: Duration,
    state: Mutex<SamplerState>,
}

impl NetworkMetricsSampler {
    pub fn new(counters: Arc<TrafficCounters>, window: Duration) -> Self {
        Self {
            counters,
            window,
            state: Mutex::new(SamplerState {
                last: None,
                samples: VecDeque::new(),
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SamplerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take a sample now.
    pub fn sample(&self) -> MetricsSample {
        self.sample_at(Utc::now())
    }

    /// Take a sample stamped `now`, evicting entries older than the window.
    pub fn sample_at(&self, now: DateTime<Utc>) -> MetricsSample {
        let current = self.counters.snapshot();
        let mut state = self.state();

        let previous_sample = state.samples.back().cloned();
        let sample = match &state.last {
            Some((at, prev)) => {
                let elapsed = (now - *at).num_milliseconds().max(1) as f64 / 1000.0;
                let bytes = (current.bytes_sent + current.bytes_received)
                    .saturating_sub(prev.bytes_sent + prev.bytes_received);
                let messages = (current.messages_sent + current.messages_received)
                    .saturating_sub(prev.messages_sent + prev.messages_received);
                let latency_samples = current.latency_samples.saturating_sub(prev.latency_samples);
                let avg_latency_ms = if latency_samples > 0 {
                    current.latency_total_ms.saturating_sub(prev.latency_total_ms) as f64
                        / latency_samples as f64
                } else {
                    previous_sample.as_ref().map_or(0.0, |s| s.avg_latency_ms)
                };
                MetricsSample {
                    timestamp: now,
                    bytes_per_sec: bytes as f64 / elapsed,
                    messages_per_sec: messages as f64 / elapsed,
                    avg_latency_ms,
                    packet_loss_pct: current.packet_loss_pct(),
                }
            }
            None => MetricsSample {
                timestamp: now,
                bytes_per_sec: 0.0,
                messages_per_sec: 0.0,
                avg_latency_ms: current.average_latency_ms().unwrap_or(0.0),
                packet_loss_pct: current.packet_loss_pct(),
            },
        };

        state.last = Some((now, current));
        state.samples.push_back(sample.clone());

        let window = chrono::Duration::from_std(self.window).unwrap_or_else(|_| chrono::Duration::days(365));
        let cutoff = now - window;
        let before = state.samples.len();
        while state.samples.front().is_some_and(|s| s.timestamp < cutoff) {
            state.samples.pop_front();
        }
        if before != state.samples.len() {
            debug!(evicted = before - state.samples.len(), "Metrics samples evicted");
        }

        sample
    }

    /// Retained samples, oldest first.
    pub fn history(&self) -> Vec<MetricsSample> {
        self.state().samples.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.state().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn summary(&self) -> MetricsSummary {
        let state = self.state();
        let samples = &state.samples;
        MetricsSummary {
            samples: samples.len(),
            bytes_per_sec: Aggregate::over(samples.iter().map(|s| s.bytes_per_sec)),
            messages_per_sec: Aggregate::over(samples.iter().map(|s| s.messages_per_sec)),
            avg_latency_ms: Aggregate::over(samples.iter().map(|s| s.avg_latency_ms)),
            packet_loss_pct: Aggregate::over(samples.iter().map(|s| s.packet_loss_pct)),
        }
    }

    /// Export the history as CSV with a header row.
    pub fn to_csv(&self) -> String {
        let mut out =
            String::from("timestamp,bytes_per_sec,messages_per_sec,avg_latency_ms,packet_loss_pct\n");
        for s in self.state().samples.iter() {
            let _ = writeln!(
                out,
                "{},{:.2},{:.2},{:.2},{:.2}",
                s.timestamp.to_rfc3339(),
                s.bytes_per_sec,
                s.messages_per_sec,
                s.avg_latency_ms,
                s.packet_loss_pct
            );
        }
        out
    }

    /// Export the history and summary as a JSON document.
    pub fn to_json(&self) -> Result<String> {
        #[derive(Serialize)]
        struct Export {
            summary: MetricsSummary,
            samples: Vec<MetricsSample>,
        }
        let export = Export {
            summary: self.summary(),
            samples: self.history(),
        };
        serde_json::to_string_pretty(&export)
            .map_err(|e| ProtocolError::Custom(format!("Failed to export metrics: {e}")))
    }

    /// Sample on a fixed period until the returned task is aborted.
    pub fn spawn(self: Arc<Self>, period: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.sample();
            }
        })
    }
}

fn decrement(counter: &AtomicU64) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
}
