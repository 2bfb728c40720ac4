//! Cache counters
//!
//! Kept outside the mutex so a timed-out producer can still be counted.

use core::sync::atomic::{AtomicU32, Ordering};

/// Point-in-time copy of the cache counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub transient_added: u32,
    pub transient_sent: u32,
    pub transient_acked: u32,
    /// Entries evicted by overflow
    pub transient_dropped: u32,
    pub transient_current: u32,
    pub transient_max_depth: u32,
    pub state_updates: u32,
    pub state_sent: u32,
    pub state_acked: u32,
    pub state_sections: u32,
    pub mutex_timeouts: u32,
    pub overflow_events: u32,
    pub nvs_write_failures: u32,
    /// Longest time an entry spent in the FIFO before cleanup
    pub max_cache_duration_ms: u32,
}

pub(super) struct Counters {
    transient_added: AtomicU32,
    transient_sent: AtomicU32,
    transient_acked: AtomicU32,
    transient_dropped: AtomicU32,
    transient_max_depth: AtomicU32,
    state_updates: AtomicU32,
    state_sent: AtomicU32,
    state_acked: AtomicU32,
    mutex_timeouts: AtomicU32,
    overflow_events: AtomicU32,
    nvs_write_failures: AtomicU32,
    max_cache_duration_ms: AtomicU32,
    // Depth figures from the last read that got the lock
    last_current: AtomicU32,
    last_sections: AtomicU32,
}

impl Counters {
    pub(super) const fn new() -> Self {
        Self {
            transient_added: AtomicU32::new(0),
            transient_sent: AtomicU32::new(0),
            transient_acked: AtomicU32::new(0),
            transient_dropped: AtomicU32::new(0),
            transient_max_depth: AtomicU32::new(0),
            state_updates: AtomicU32::new(0),
            state_sent: AtomicU32::new(0),
            state_acked: AtomicU32::new(0),
            mutex_timeouts: AtomicU32::new(0),
            overflow_events: AtomicU32::new(0),
            nvs_write_failures: AtomicU32::new(0),
            max_cache_duration_ms: AtomicU32::new(0),
            last_current: AtomicU32::new(0),
            last_sections: AtomicU32::new(0),
        }
    }

    pub(super) fn record_added(&self, depth: usize, evicted: bool) {
        self.transient_added.fetch_add(1, Ordering::Relaxed);
        self.transient_max_depth
            .fetch_max(depth as u32, Ordering::Relaxed);
        if evicted {
            self.transient_dropped.fetch_add(1, Ordering::Relaxed);
            self.overflow_events.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(super) fn bump_transient_sent(&self) {
        self.transient_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn bump_transient_acked(&self) {
        self.transient_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn bump_state_update(&self) {
        self.state_updates.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn bump_state_sent(&self) {
        self.state_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn bump_state_acked(&self) {
        self.state_acked.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn bump_mutex_timeout(&self) {
        self.mutex_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn bump_nvs_failure(&self) {
        self.nvs_write_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(super) fn record_cache_duration(&self, ms: u64) {
        let ms = ms.min(u32::MAX as u64) as u32;
        self.max_cache_duration_ms.fetch_max(ms, Ordering::Relaxed);
    }

    /// `live` is `(transient_current, state_sections)` when the lock was taken
    pub(super) fn snapshot(&self, live: Option<(u32, u32)>) -> CacheStats {
        let (transient_current, state_sections) = match live {
            Some((current, sections)) => {
                self.last_current.store(current, Ordering::Relaxed);
                self.last_sections.store(sections, Ordering::Relaxed);
                (current, sections)
            }
            None => (
                self.last_current.load(Ordering::Relaxed),
                self.last_sections.load(Ordering::Relaxed),
            ),
        };
        CacheStats {
            transient_added: self.transient_added.load(Ordering::Relaxed),
            transient_sent: self.transient_sent.load(Ordering::Relaxed),
            transient_acked: self.transient_acked.load(Ordering::Relaxed),
            transient_dropped: self.transient_dropped.load(Ordering::Relaxed),
            transient_current,
            transient_max_depth: self.transient_max_depth.load(Ordering::Relaxed),
            state_updates: self.state_updates.load(Ordering::Relaxed),
            state_sent: self.state_sent.load(Ordering::Relaxed),
            state_acked: self.state_acked.load(Ordering::Relaxed),
            state_sections,
            mutex_timeouts: self.mutex_timeouts.load(Ordering::Relaxed),
            overflow_events: self.overflow_events.load(Ordering::Relaxed),
            nvs_write_failures: self.nvs_write_failures.load(Ordering::Relaxed),
            max_cache_duration_ms: self.max_cache_duration_ms.load(Ordering::Relaxed),
        }
    }
}
