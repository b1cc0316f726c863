//! UTC time and periodic background ticks (C2).

use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Ticks of 100ns since the Unix epoch.
///
/// The wire format (spec §6) specifies 100ns ticks since "UTC epoch"
/// without pinning which epoch; this crate ticks from 1970-01-01
/// rather than .NET's 0001-01-01 (see SPEC_FULL.md section E.2). Field
/// width and resolution match the wire format exactly.
pub type Timestamp = i64;

pub const TICKS_PER_SECOND: i64 = 10_000_000;

pub fn now() -> Timestamp {
    system_time_to_ticks(SystemTime::now())
}

pub fn system_time_to_ticks(time: SystemTime) -> Timestamp {
    match time.duration_since(UNIX_EPOCH) {
        Ok(elapsed) => {
            elapsed.as_secs() as i64 * TICKS_PER_SECOND
                + i64::from(elapsed.subsec_nanos()) / 100
        }
        Err(before_epoch) => -system_time_to_ticks(UNIX_EPOCH + before_epoch.duration()),
    }
}

pub fn duration_since(now: Timestamp, then: Timestamp) -> Duration {
    let delta_ticks = now.saturating_sub(then);
    if delta_ticks <= 0 {
        Duration::ZERO
    } else {
        Duration::from_nanos(delta_ticks as u64 * 100)
    }
}

pub fn abs_diff(a: Timestamp, b: Timestamp) -> Duration {
    let delta_ticks = a.abs_diff(b);
    Duration::from_nanos(delta_ticks * 100)
}

/// A source of "now", fakeable for deterministic TTL/replay tests.
///
/// The real clock reads `SystemTime::now()`; the fake clock is an
/// atomic tick counter a test can advance by hand without depending on
/// wall-clock sleeps.
pub trait Clock: Send + Sync + 'static {
    fn now(&self) -> Timestamp;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        now()
    }
}

#[derive(Debug)]
pub struct FakeClock(AtomicI64);

impl FakeClock {
    pub fn new(start: Timestamp) -> Self {
        Self(AtomicI64::new(start))
    }

    pub fn advance(&self, by: Duration) {
        self.0
            .fetch_add((by.as_nanos() / 100) as i64, Ordering::SeqCst);
    }

    pub fn set(&self, value: Timestamp) {
        self.0.store(value, Ordering::SeqCst)
    }
}

impl Clock for FakeClock {
    fn now(&self) -> Timestamp {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_system_time() {
        let t = SystemTime::now();
        let ticks = system_time_to_ticks(t);
        let back = UNIX_EPOCH + Duration::from_nanos(ticks as u64 * 100);
        let delta = t.duration_since(back).unwrap_or_else(|e| e.duration());
        assert!(delta < Duration::from_micros(1));
    }

    #[test]
    fn abs_diff_is_symmetric() {
        assert_eq!(abs_diff(100, 200), abs_diff(200, 100));
    }

    #[test]
    fn fake_clock_advances_deterministically() {
        let clock = FakeClock::new(0);
        clock.advance(Duration::from_secs(1));
        assert_eq!(clock.now(), TICKS_PER_SECOND);
    }
}
