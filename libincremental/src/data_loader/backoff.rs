//! Bind retry policy for a data loader that keeps going away.

use std::time::{Duration, Instant};

use rand::Rng;

use crate::constants::{
    BIND_DELAY_JITTER_DIVIDER, BIND_DELAY_MULTIPLIER, BIND_GRACE_PERIOD, BIND_RETRY_INTERVAL,
    BINDING_TIMEOUT, HEALTHY_DATA_LOADER_UPTIME, MAX_BIND_DELAY, MIN_BIND_DELAY,
    MIN_CRASH_INTERVAL,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindDecision {
    /// A bind is in flight; leave it alone.
    Wait,
    /// Re-issue the in-flight bind right away.
    Retry,
    /// Bind after the given delay.
    Bind(Duration),
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BindBackoff {
    previous_bind_ts: Option<Instant>,
    previous_bind_delay: Duration,
}

impl BindBackoff {
    pub fn previous_bind_ts(&self) -> Option<Instant> {
        self.previous_bind_ts
    }

    pub fn previous_bind_delay(&self) -> Duration {
        self.previous_bind_delay
    }

    pub fn is_healthy(&self) -> bool {
        self.previous_bind_delay.is_zero()
    }

    /// Decides how to bind at `now`. `binding_since` is the time the stub
    /// entered `Binding`, if that is its current status.
    pub fn next(
        &mut self,
        now: Instant,
        binding_since: Option<Instant>,
        rng: &mut impl Rng,
    ) -> BindDecision {
        if let Some(since) = binding_since {
            if now.saturating_duration_since(since) <= BINDING_TIMEOUT {
                if !self.is_healthy() {
                    return BindDecision::Wait;
                }
                let in_grace = self
                    .previous_bind_ts
                    .is_some_and(|ts| now.saturating_duration_since(ts) <= BIND_GRACE_PERIOD);
                if in_grace {
                    if now.saturating_duration_since(since) >= BIND_RETRY_INTERVAL {
                        self.previous_bind_delay = Duration::ZERO;
                        return BindDecision::Retry;
                    }
                    return BindDecision::Wait;
                }
                // grace period is over, back off
            }
        }

        let previous_ts = self.previous_bind_ts.replace(now);
        let Some(previous_ts) = previous_ts else {
            self.previous_bind_delay = Duration::ZERO;
            return BindDecision::Bind(Duration::ZERO);
        };
        let non_crashing = now
            .saturating_duration_since(previous_ts)
            .saturating_sub(self.previous_bind_delay)
            .max(MIN_CRASH_INTERVAL);
        if non_crashing > HEALTHY_DATA_LOADER_UPTIME {
            self.previous_bind_delay = Duration::ZERO;
            return BindDecision::Bind(Duration::ZERO);
        }

        let delay_ms = (self.previous_bind_delay * BIND_DELAY_MULTIPLIER)
            .clamp(MIN_BIND_DELAY, MAX_BIND_DELAY)
            .as_millis() as i64;
        let jitter_range = delay_ms / i64::from(BIND_DELAY_JITTER_DIVIDER);
        let jitter = if jitter_range > 0 {
            rng.random_range(-jitter_range..jitter_range)
        } else {
            0
        };
        self.previous_bind_delay = Duration::from_millis((delay_ms + jitter) as u64);
        BindDecision::Bind(self.previous_bind_delay)
    }
}
