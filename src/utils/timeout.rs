//! Timeout constants and async timeout helpers.

use std::future::Future;
use std::time::Duration;

use crate::error::{ProtocolError, Result};

/// Upper bound for establishing a connection (TCP connect + TLS handshake).
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between queue drain passes.
pub const DRAIN_INTERVAL: Duration = Duration::from_millis(500);

/// Interval between health scoring passes.
pub const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Interval between latency pings.
pub const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Interval between traffic samples.
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Timeout applied to each enrollment HTTP request.
pub const ENROLLMENT_TIMEOUT: Duration = Duration::from_secs(30);

/// Run `fut` with an upper bound, mapping expiry to [`ProtocolError::Timeout`].
pub async fn with_timeout<F, T>(limit: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(ProtocolError::Timeout),
    }
}
