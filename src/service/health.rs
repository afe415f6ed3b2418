//! # Connection Health
//!
//! Scores one connection on a 0-100 scale from four components:
//!
//! | component   | max | input                                          |
//! |-------------|-----|------------------------------------------------|
//! | stability   | 30  | disconnects in the trailing hour, uptime bonus |
//! | latency     | 30  | average ping round trip                        |
//! | success     | 20  | delivered / attempted sends                    |
//! | certificate | 20  | days until the client certificate expires      |
//!
//! Every component is clamped to its maximum independently. Round trips are
//! measured with CoT pings; a pong answers the oldest outstanding ping and
//! pings left unanswered for a full ping interval count as lost.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::HealthConfig;
use crate::utils::metrics::CountersSnapshot;

const STABILITY_MAX: f64 = 30.0;
const LATENCY_MAX: f64 = 30.0;
const SUCCESS_MAX: f64 = 20.0;
const CERTIFICATE_MAX: f64 = 20.0;

const DISCONNECT_PENALTY: f64 = 5.0;
const DISCONNECT_WINDOW: Duration = Duration::from_secs(3600);
const CERTIFICATE_COMFORT_DAYS: i64 = 30;
const RECENT_RTT_SAMPLES: usize = 10;

/// Qualitative bucket for a score
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Critical,
    Poor,
    Fair,
    Good,
    Excellent,
}

impl HealthStatus {
    pub fn from_score(score: f64) -> Self {
        match score {
            s if s >= 90.0 => HealthStatus::Excellent,
            s if s >= 75.0 => HealthStatus::Good,
            s if s >= 50.0 => HealthStatus::Fair,
            s if s >= 25.0 => HealthStatus::Poor,
            _ => HealthStatus::Critical,
        }
    }

    /// Fair or worse.
    pub fn is_degraded(self) -> bool {
        self <= HealthStatus::Fair
    }
}

/// State of the client certificate for scoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertificateHealth {
    /// Plain transport, or TLS without a client identity
    NotRequired,
    Missing,
    DaysRemaining(i64),
}

impl CertificateHealth {
    pub fn days_until_expiry(self) -> Option<i64> {
        match self {
            CertificateHealth::DaysRemaining(days) => Some(days),
            _ => None,
        }
    }
}

pub fn stability_score(disconnects_last_hour: usize, uptime: Option<Duration>) -> f64 {
    let penalty = DISCONNECT_PENALTY * disconnects_last_hour as f64;
    let bonus = match uptime {
        Some(up) if up >= Duration::from_secs(3600) => 5.0,
        Some(up) if up >= Duration::from_secs(600) => 2.0,
        _ => 0.0,
    };
    (STABILITY_MAX - penalty + bonus).clamp(0.0, STABILITY_MAX)
}

pub fn latency_score(avg_latency_ms: Option<f64>) -> f64 {
    match avg_latency_ms {
        None => 15.0,
        Some(ms) if ms < 100.0 => LATENCY_MAX,
        Some(ms) if ms < 250.0 => 25.0,
        Some(ms) if ms < 500.0 => 20.0,
        Some(ms) if ms < 1000.0 => 10.0,
        Some(ms) if ms < 2000.0 => 5.0,
        Some(_) => 0.0,
    }
}

pub fn success_score(attempted: u64, delivered: u64) -> f64 {
    if attempted == 0 {
        return SUCCESS_MAX;
    }
    (SUCCESS_MAX * delivered as f64 / attempted as f64).clamp(0.0, SUCCESS_MAX)
}

pub fn certificate_score(certificate: CertificateHealth) -> f64 {
    match certificate {
        CertificateHealth::NotRequired => CERTIFICATE_MAX,
        CertificateHealth::Missing => 0.0,
        CertificateHealth::DaysRemaining(days) if days <= 0 => 0.0,
        CertificateHealth::DaysRemaining(days) if days >= CERTIFICATE_COMFORT_DAYS => CERTIFICATE_MAX,
        CertificateHealth::DaysRemaining(days) => {
            CERTIFICATE_MAX * days as f64 / CERTIFICATE_COMFORT_DAYS as f64
        }
    }
}

/// One scored sample
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthMetrics {
    pub timestamp: DateTime<Utc>,
    pub score: f64,
    pub stability: f64,
    pub latency: f64,
    pub success: f64,
    pub certificate: f64,
    pub avg_latency_ms: Option<f64>,
    pub packet_loss_pct: f64,
    pub success_pct: f64,
    pub days_until_expiry: Option<i64>,
    pub status: HealthStatus,
    /// Fair or worse on this and the previous sample
    pub degraded: bool,
}

#[derive(Debug, Default)]
struct MonitorState {
    disconnects: VecDeque<Instant>,
    connected_since: Option<Instant>,
    outstanding_pings: VecDeque<Instant>,
    recent_rtts: VecDeque<Duration>,
    consecutive_degraded: u32,
    history: VecDeque<HealthMetrics>,
}

/// Health bookkeeping for one server
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    state: Mutex<MonitorState>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        Self {
            config,
            state: Mutex::new(MonitorState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_connected(&self, at: Instant) {
        self.state().connected_since = Some(at);
    }

    pub fn record_disconnect(&self, at: Instant) {
        let mut state = self.state();
        state.connected_since = None;
        state.disconnects.push_back(at);
        state.outstanding_pings.clear();
    }

    pub fn ping_sent(&self, at: Instant) {
        self.state().outstanding_pings.push_back(at);
    }

    /// Match a pong against the oldest outstanding ping; returns the round trip.
    pub fn pong_received(&self, at: Instant) -> Option<Duration> {
        let mut state = self.state();
        let sent = state.outstanding_pings.pop_front()?;
        let rtt = at.saturating_duration_since(sent);
        state.recent_rtts.push_back(rtt);
        while state.recent_rtts.len() > RECENT_RTT_SAMPLES {
            state.recent_rtts.pop_front();
        }
        debug!(rtt_ms = rtt.as_millis() as u64, "Pong received");
        Some(rtt)
    }

    /// Forget pings older than the ping interval; returns how many were lost.
    pub fn expire_pings(&self, now: Instant) -> usize {
        let mut state = self.state();
        let before = state.outstanding_pings.len();
        let limit = self.config.ping_interval;
        state
            .outstanding_pings
            .retain(|sent| now.saturating_duration_since(*sent) < limit);
        before - state.outstanding_pings.len()
    }

    pub fn average_latency_ms(&self) -> Option<f64> {
        let state = self.state();
        if state.recent_rtts.is_empty() {
            return None;
        }
        let total: f64 = state.recent_rtts.iter().map(|d| d.as_secs_f64() * 1000.0).sum();
        Some(total / state.recent_rtts.len() as f64)
    }

    /// Score the connection now and append the result to the history.
    pub fn evaluate(
        &self,
        now: Instant,
        timestamp: DateTime<Utc>,
        traffic: &CountersSnapshot,
        certificate: CertificateHealth,
    ) -> HealthMetrics {
        let avg_latency_ms = self.average_latency_ms();
        let mut state = self.state();

        while let Some(oldest) = state.disconnects.front() {
            if now.saturating_duration_since(*oldest) > DISCONNECT_WINDOW {
                state.disconnects.pop_front();
            } else {
                break;
            }
        }
        let uptime = state.connected_since.map(|since| now.saturating_duration_since(since));

        let stability = stability_score(state.disconnects.len(), uptime);
        let latency = latency_score(avg_latency_ms);
        let success = success_score(traffic.send_attempts, traffic.messages_sent);
        let certificate_points = certificate_score(certificate);
        let score = stability + latency + success + certificate_points;
        let status = HealthStatus::from_score(score);

        if status.is_degraded() {
            state.consecutive_degraded += 1;
        } else {
            state.consecutive_degraded = 0;
        }

        let metrics = HealthMetrics {
            timestamp,
            score,
            stability,
            latency,
            success,
            certificate: certificate_points,
            avg_latency_ms,
            packet_loss_pct: traffic.packet_loss_pct(),
            success_pct: traffic.success_ratio() * 100.0,
            days_until_expiry: certificate.days_until_expiry(),
            status,
            degraded: state.consecutive_degraded >= 2,
        };

        state.history.push_back(metrics.clone());
        while state.history.len() > self.config.history_len {
            state.history.pop_front();
        }
        metrics
    }

    pub fn latest(&self) -> Option<HealthMetrics> {
        self.state().history.back().cloned()
    }

    pub fn history(&self) -> Vec<HealthMetrics> {
        self.state().history.iter().cloned().collect()
    }
}
