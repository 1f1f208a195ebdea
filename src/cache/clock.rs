//! Injectable time source.

use std::sync::Mutex;
use std::time::Duration;

use time::{OffsetDateTime, PrimitiveDateTime};

use super::lock::mutex_lock;

const SOURCE: &str = "cache::clock";

/// Add `by` to `at`, clamping to the last representable instant.
pub fn saturating_add(at: OffsetDateTime, by: Duration) -> OffsetDateTime {
    time::Duration::try_from(by)
        .ok()
        .and_then(|by| at.checked_add(by))
        .unwrap_or_else(far_future)
}

fn far_future() -> OffsetDateTime {
    PrimitiveDateTime::MAX.assume_utc()
}

/// Supplies the current time to the cache.
pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

/// Wall clock in UTC.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = mutex_lock(&self.now, SOURCE, "advance");
        *now = saturating_add(*now, by);
    }

    pub fn set(&self, at: OffsetDateTime) {
        *mutex_lock(&self.now, SOURCE, "set") = at;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new(OffsetDateTime::UNIX_EPOCH)
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *mutex_lock(&self.now, SOURCE, "now")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::default();
        let start = clock.now();
        clock.advance(Duration::from_secs(90));
        assert_eq!(clock.now() - start, time::Duration::seconds(90));
    }

    #[test]
    fn huge_advance_clamps_instead_of_overflowing() {
        let clock = ManualClock::default();
        clock.advance(Duration::from_secs(u64::MAX / 2));
        assert_eq!(clock.now(), far_future());

        clock.advance(Duration::MAX);
        assert_eq!(clock.now(), far_future());
    }

    #[test]
    fn saturating_add_is_exact_in_range() {
        let start = OffsetDateTime::UNIX_EPOCH;
        assert_eq!(
            saturating_add(start, Duration::from_millis(1500)),
            start + time::Duration::milliseconds(1500)
        );
    }
}
