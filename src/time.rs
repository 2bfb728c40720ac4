//! Time sources
//!
//! The session layer is driven by explicit `now_ms` values. Only the cache
//! needs to read a clock on its own, to bound how long a producer may wait.

use crate::protocol::TimeSource;

/// Monotonic millisecond clock
pub trait Clock {
    fn now_ms(&self) -> u64;
}

/// Embassy time driver clock
#[cfg(feature = "embedded")]
#[derive(Debug, Clone, Copy, Default)]
pub struct EmbassyClock;

#[cfg(feature = "embedded")]
impl Clock for EmbassyClock {
    fn now_ms(&self) -> u64 {
        embassy_time::Instant::now().as_millis()
    }
}

/// Unix time fed by the application, extrapolated with the monotonic clock
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock {
    anchor_unix: u64,
    anchor_ms: u64,
    source: TimeSource,
}

impl WallClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that it is `unix_time` seconds at monotonic time `now_ms`
    pub fn set(&mut self, unix_time: u64, source: TimeSource, now_ms: u64) {
        self.anchor_unix = unix_time;
        self.anchor_ms = now_ms;
        self.source = source;
    }

    pub fn source(&self) -> TimeSource {
        self.source
    }

    pub fn is_synced(&self) -> bool {
        self.source != TimeSource::Unsynced
    }

    /// Current Unix time in seconds, or 0 while unsynced
    pub fn unix_time(&self, now_ms: u64) -> u64 {
        if !self.is_synced() {
            return 0;
        }
        self.anchor_unix + now_ms.saturating_sub(self.anchor_ms) / 1000
    }
}

#[cfg(test)]
pub mod mock {
    //! Clocks for host tests

    use super::Clock;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    /// Shared, manually stepped clock
    #[derive(Debug, Clone, Default)]
    pub struct MockClock {
        now: Arc<AtomicU64>,
    }

    impl MockClock {
        pub fn new(start_ms: u64) -> Self {
            Self {
                now: Arc::new(AtomicU64::new(start_ms)),
            }
        }

        pub fn set(&self, ms: u64) {
            self.now.store(ms, Ordering::SeqCst);
        }

        pub fn advance(&self, ms: u64) -> u64 {
            self.now.fetch_add(ms, Ordering::SeqCst) + ms
        }
    }

    impl Clock for MockClock {
        fn now_ms(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    /// Real elapsed time, for contention tests
    #[derive(Debug, Clone, Copy)]
    pub struct StdClock {
        origin: std::time::Instant,
    }

    impl StdClock {
        pub fn new() -> Self {
            Self {
                origin: std::time::Instant::now(),
            }
        }
    }

    impl Clock for StdClock {
        fn now_ms(&self) -> u64 {
            self.origin.elapsed().as_millis() as u64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockClock;
    use super::*;

    #[test]
    fn test_wall_clock_unsynced_reads_zero() {
        let clock = WallClock::new();
        assert_eq!(clock.unix_time(50_000), 0);
        assert!(!clock.is_synced());
    }

    #[test]
    fn test_wall_clock_extrapolates() {
        let mut clock = WallClock::new();
        clock.set(1_700_000_000, TimeSource::Ntp, 10_000);
        assert_eq!(clock.unix_time(10_000), 1_700_000_000);
        assert_eq!(clock.unix_time(72_500), 1_700_000_062);
        assert_eq!(clock.source(), TimeSource::Ntp);
    }

    #[test]
    fn test_mock_clock_shared() {
        let a = MockClock::new(5);
        let b = a.clone();
        assert_eq!(a.advance(10), 15);
        assert_eq!(b.now_ms(), 15);
    }
}
