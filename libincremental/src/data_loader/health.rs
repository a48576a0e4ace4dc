//! Pending-read age classification.

use std::time::{Duration, Instant};

use crate::constants::{HEALTH_TOLERANCE, MIN_UNHEALTHY_MONITORING};
use crate::types::{HealthCheckParams, HealthStatus, StreamStatus};

/// Pairs a local instant with the kernel boot-clock time observed at that
/// instant, translating kernel timestamps into local elapsed time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthBase {
    pub user_ts: Instant,
    pub kernel_ts_us: u64,
}

impl HealthBase {
    /// Time elapsed at `now` since the kernel timestamp `kernel_ts_us`.
    pub fn elapsed_since(&self, now: Instant, kernel_ts_us: u64) -> Duration {
        let delta = Duration::from_micros(kernel_ts_us.saturating_sub(self.kernel_ts_us));
        now.saturating_duration_since(self.user_ts + delta)
    }
}

/// Classifies the age of the oldest pending read. Returns the verdict and
/// when to look again.
pub fn classify(params: &HealthCheckParams, elapsed: Duration) -> (HealthStatus, Duration) {
    let with_tolerance = elapsed + HEALTH_TOLERANCE;
    if with_tolerance < params.blocked_timeout {
        (HealthStatus::ReadsPending, params.blocked_timeout - elapsed)
    } else if with_tolerance < params.unhealthy_timeout {
        (HealthStatus::Blocked, params.unhealthy_timeout - elapsed)
    } else {
        (
            HealthStatus::Unhealthy,
            params.unhealthy_monitoring.max(MIN_UNHEALTHY_MONITORING),
        )
    }
}

/// Folds the loader's own stream report into a verdict.
pub fn degrade(status: HealthStatus, stream: StreamStatus) -> HealthStatus {
    match stream {
        StreamStatus::StorageError => HealthStatus::UnhealthyStorage,
        StreamStatus::TransportError | StreamStatus::SourceError | StreamStatus::IntegrityError
            if status == HealthStatus::Unhealthy =>
        {
            HealthStatus::UnhealthyTransport
        }
        _ => status,
    }
}
