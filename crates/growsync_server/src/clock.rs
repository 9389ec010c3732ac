//! Server clocks.

use growsync_protocol::Timestamp;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Source of server time.
pub trait Clock: Send + Sync {
    /// Returns the current time. Successive calls never return the same value.
    fn now(&self) -> Timestamp;

    /// Tells the clock a stamp exists; later `now()` calls return something greater.
    fn observe(&self, _stamp: Timestamp) {}
}

/// Wall clock that never repeats or goes backwards.
///
/// Two reads in the same millisecond get distinct values, so a pull timestamp
/// is never equal to the stamp of a later write.
#[derive(Debug, Default)]
pub struct SystemClock {
    last: AtomicI64,
}

impl SystemClock {
    /// Creates a new system clock.
    pub fn new() -> Self {
        Self::default()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let wall = Timestamp::now().as_millis();
        let previous = self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(wall.max(last.saturating_add(1)))
            })
            .unwrap_or(wall);
        Timestamp::from_millis(wall.max(previous.saturating_add(1)))
    }

    fn observe(&self, stamp: Timestamp) {
        self.last.fetch_max(stamp.as_millis(), Ordering::SeqCst);
    }
}

/// Deterministic clock for tests. Each read advances it by one millisecond.
#[derive(Debug)]
pub struct ManualClock {
    current: AtomicI64,
}

impl ManualClock {
    /// Creates a clock starting at `start`.
    pub fn new(start: Timestamp) -> Self {
        Self {
            current: AtomicI64::new(start.as_millis()),
        }
    }

    /// Sets the next value `now()` returns.
    pub fn set(&self, next: Timestamp) {
        self.current.store(next.as_millis(), Ordering::SeqCst);
    }

    /// Moves the clock forward.
    pub fn advance(&self, by: Duration) {
        let millis = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.current.fetch_add(millis, Ordering::SeqCst);
    }

    /// Returns the next value `now()` will return, without advancing.
    pub fn peek(&self) -> Timestamp {
        Timestamp::from_millis(self.current.load(Ordering::SeqCst))
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp::from_millis(self.current.fetch_add(1, Ordering::SeqCst))
    }

    fn observe(&self, stamp: Timestamp) {
        self.current
            .fetch_max(stamp.as_millis().saturating_add(1), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn system_clock_is_strictly_increasing() {
        let clock = SystemClock::new();
        let mut last = clock.now();
        for _ in 0..1000 {
            let next = clock.now();
            assert!(next > last);
            last = next;
        }
    }

    #[test]
    fn system_clock_respects_observed_stamps() {
        let clock = SystemClock::new();
        let future = Timestamp::now().saturating_add(Duration::from_secs(3600));
        clock.observe(future);
        assert!(clock.now() > future);
    }

    #[test]
    fn manual_clock_ticks() {
        let clock = ManualClock::new(Timestamp::from_millis(100));
        assert_eq!(clock.now(), Timestamp::from_millis(100));
        assert_eq!(clock.now(), Timestamp::from_millis(101));

        clock.set(Timestamp::from_millis(500));
        assert_eq!(clock.now(), Timestamp::from_millis(500));

        clock.advance(Duration::from_millis(10));
        assert_eq!(clock.peek(), Timestamp::from_millis(511));
    }
}
