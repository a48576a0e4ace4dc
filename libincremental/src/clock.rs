use std::time::Instant;

use nix::time::{ClockId, clock_gettime};

pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;

    /// Microseconds on the boot clock, the base of kernel read timestamps.
    fn boot_time_us(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn boot_time_us(&self) -> u64 {
        match clock_gettime(ClockId::CLOCK_BOOTTIME) {
            Ok(ts) => ts.tv_sec() as u64 * 1_000_000 + ts.tv_nsec() as u64 / 1_000,
            Err(_) => 0,
        }
    }
}
