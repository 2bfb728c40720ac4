//! Dual-storage outbound cache
//!
//! Producers stage data here without waiting on the radio. Two stores share
//! one mutex:
//!
//! - a transient FIFO of telemetry payloads (drop-oldest on overflow, an
//!   entry leaves only once acked)
//! - one versioned state slot per configuration section (overwritten in
//!   place, mirrored to the persistent store, never deleted)
//!
//! Every operation gives up after [`MUTEX_TIMEOUT_MS`] instead of blocking.

mod stats;

use core::fmt;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use heapless::{Deque, Vec};

use crate::config::cache::{MUTEX_TIMEOUT_MS, NAMESPACE, TRANSIENT_CAPACITY};
use crate::config::link::MAX_PAYLOAD;
use crate::config::settings::{MAX_SECTION_BYTES, N_SECTIONS};
use crate::protocol::version::is_newer;
use crate::protocol::SectionId;
use crate::storage::{decode_section_blob, encode_section_blob, BlobError, PersistentStore};
use crate::time::Clock;

pub use stats::CacheStats;
use stats::Counters;

/// Staged telemetry payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransientEntry {
    pub payload: Vec<u8, MAX_PAYLOAD>,
    pub seq: u32,
    pub enqueued_at: u64,
    pub sent: bool,
    pub acked: bool,
    pub retry_count: u8,
}

/// Latest value of one configuration section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateEntry {
    pub section: SectionId,
    pub version: u32,
    pub payload: Vec<u8, MAX_SECTION_BYTES>,
    pub sent: bool,
    pub acked: bool,
    pub is_latest: bool,
}

/// Result of staging a transient payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Added,
    /// Stored, and the oldest entry was evicted to make room
    AddedEvictedOldest,
    Dropped(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    MutexTimeout,
    PayloadTooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheError {
    MutexTimeout,
    PayloadTooLarge,
    /// Version is older than the one already in the slot
    StaleVersion { current: u32, offered: u32 },
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::MutexTimeout => write!(f, "cache mutex timeout"),
            CacheError::PayloadTooLarge => write!(f, "payload too large"),
            CacheError::StaleVersion { current, offered } => {
                write!(f, "stale version {} (slot holds {})", offered, current)
            }
        }
    }
}

/// Outcome of a state write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateUpdate {
    pub version: u32,
    /// False when the persistent write failed; the in-memory slot is still updated
    pub persisted: bool,
}

const EMPTY_SLOT: Option<StateEntry> = None;

struct Inner {
    transient: Deque<TransientEntry, TRANSIENT_CAPACITY>,
    states: [Option<StateEntry>; N_SECTIONS],
}

/// Non-blocking staging area between producers and the transmit pump
pub struct Cache<C: Clock> {
    inner: Mutex<CriticalSectionRawMutex, Inner>,
    counters: Counters,
    clock: C,
}

impl<C: Clock> Cache<C> {
    pub const fn new(clock: C) -> Self {
        Self {
            inner: Mutex::new(Inner {
                transient: Deque::new(),
                states: [EMPTY_SLOT; N_SECTIONS],
            }),
            counters: Counters::new(),
            clock,
        }
    }

    /// Run `f` under the cache mutex, giving up after the timeout
    fn with_inner<R>(&self, f: impl FnOnce(&mut Inner) -> R) -> Result<R, CacheError> {
        let start = self.clock.now_ms();
        loop {
            if let Ok(mut guard) = self.inner.try_lock() {
                return Ok(f(&mut guard));
            }
            // Strictly greater: `start` was truncated to the millisecond
            if self.clock.now_ms().saturating_sub(start) > MUTEX_TIMEOUT_MS {
                self.counters.bump_mutex_timeout();
                return Err(CacheError::MutexTimeout);
            }
            core::hint::spin_loop();
        }
    }

    /// Stage a telemetry payload
    ///
    /// Never waits longer than the mutex timeout. When the FIFO is full the
    /// oldest entry is evicted.
    pub fn put_transient(&self, payload: &[u8], seq: u32, ts: u64) -> PutOutcome {
        let mut stored = Vec::new();
        if stored.extend_from_slice(payload).is_err() {
            log::warn!("cache: transient of {} bytes dropped (too large)", payload.len());
            return PutOutcome::Dropped(DropReason::PayloadTooLarge);
        }
        let entry = TransientEntry {
            payload: stored,
            seq,
            enqueued_at: ts,
            sent: false,
            acked: false,
            retry_count: 0,
        };

        let result = self.with_inner(|inner| {
            let mut evicted = false;
            if inner.transient.is_full() {
                inner.transient.pop_front();
                evicted = true;
            }
            // Cannot fail: a slot was freed above if needed
            let _ = inner.transient.push_back(entry);
            (evicted, inner.transient.len())
        });

        match result {
            Ok((evicted, depth)) => {
                self.counters.record_added(depth, evicted);
                if evicted {
                    PutOutcome::AddedEvictedOldest
                } else {
                    PutOutcome::Added
                }
            }
            Err(_) => PutOutcome::Dropped(DropReason::MutexTimeout),
        }
    }

    /// Oldest entry not yet handed to the radio
    pub fn peek_next_unsent_transient(&self) -> Result<Option<TransientEntry>, CacheError> {
        self.with_inner(|inner| inner.transient.iter().find(|e| !e.sent).cloned())
    }

    /// Returns false when no entry with `seq` is present
    pub fn mark_transient_sent(&self, seq: u32) -> Result<bool, CacheError> {
        let found = self.with_inner(|inner| {
            match inner.transient.iter_mut().find(|e| e.seq == seq && !e.sent) {
                Some(entry) => {
                    entry.sent = true;
                    true
                }
                None => false,
            }
        })?;
        if found {
            self.counters.bump_transient_sent();
        }
        Ok(found)
    }

    /// Record a failed radio attempt; the entry stays unsent
    pub fn note_transient_retry(&self, seq: u32) -> Result<(), CacheError> {
        self.with_inner(|inner| {
            if let Some(entry) = inner.transient.iter_mut().find(|e| e.seq == seq && !e.sent) {
                entry.retry_count = entry.retry_count.saturating_add(1);
            }
        })
    }

    pub fn mark_transient_acked(&self, seq: u32) -> Result<bool, CacheError> {
        let found = self.with_inner(|inner| {
            match inner
                .transient
                .iter_mut()
                .find(|e| e.seq == seq && e.sent && !e.acked)
            {
                Some(entry) => {
                    entry.acked = true;
                    true
                }
                None => false,
            }
        })?;
        if found {
            self.counters.bump_transient_acked();
        }
        Ok(found)
    }

    /// Remove the acked prefix at the head of the FIFO
    pub fn cleanup_acked_transient(&self) -> Result<usize, CacheError> {
        let now = self.clock.now_ms();
        let (removed, oldest_age) = self.with_inner(|inner| {
            let mut removed = 0;
            let mut oldest_age = 0u64;
            while inner.transient.front().is_some_and(|e| e.acked) {
                if let Some(entry) = inner.transient.pop_front() {
                    oldest_age = oldest_age.max(now.saturating_sub(entry.enqueued_at));
                    removed += 1;
                }
            }
            (removed, oldest_age)
        })?;
        if removed > 0 {
            self.counters.record_cache_duration(oldest_age);
            log::trace!("cache: cleaned {} acked transients", removed);
        }
        Ok(removed)
    }

    pub fn transient_len(&self) -> Result<usize, CacheError> {
        self.with_inner(|inner| inner.transient.len())
    }

    /// Overwrite a section's slot and mirror it to the persistent store
    ///
    /// The version is assigned by the settings store. The slot becomes
    /// unsent and unacked. A failed persistent write is logged and reported in
    /// the returned [`StateUpdate`]; the in-memory slot is updated regardless.
    pub fn update_state<S: PersistentStore>(
        &self,
        section: SectionId,
        version: u32,
        payload: &[u8],
        store: &mut S,
    ) -> Result<StateUpdate, CacheError> {
        let mut stored = Vec::new();
        stored
            .extend_from_slice(payload)
            .map_err(|_| CacheError::PayloadTooLarge)?;

        self.with_inner(|inner| {
            let slot = &mut inner.states[section.index()];
            if let Some(existing) = slot {
                if existing.version != version && !is_newer(version, existing.version) {
                    return Err(CacheError::StaleVersion {
                        current: existing.version,
                        offered: version,
                    });
                }
            }
            *slot = Some(StateEntry {
                section,
                version,
                payload: stored,
                sent: false,
                acked: false,
                is_latest: true,
            });
            Ok(())
        })??;
        self.counters.bump_state_update();

        // Persist outside the lock so producers are not held up by flash
        let persisted = match encode_section_blob(version, payload)
            .and_then(|blob| store.put(NAMESPACE, section.key(), &blob))
        {
            Ok(()) => true,
            Err(e) => {
                self.counters.bump_nvs_failure();
                log::warn!("cache: persisting {:?} v{} failed: {}", section, version, e);
                false
            }
        };

        log::debug!("cache: state {:?} now v{}", section, version);
        Ok(StateUpdate { version, persisted })
    }

    pub fn get_state(&self, section: SectionId) -> Result<Option<StateEntry>, CacheError> {
        self.with_inner(|inner| inner.states[section.index()].clone())
    }

    /// Sections whose latest value has not been sent yet
    pub fn unsent_state_sections(&self) -> Result<Vec<SectionId, N_SECTIONS>, CacheError> {
        self.with_inner(|inner| {
            let mut out = Vec::new();
            for entry in inner.states.iter().flatten() {
                if !entry.sent {
                    let _ = out.push(entry.section);
                }
            }
            out
        })
    }

    /// Mark the slot sent if it still holds `version`
    pub fn mark_state_sent(&self, section: SectionId, version: u32) -> Result<bool, CacheError> {
        let marked = self.with_inner(|inner| match &mut inner.states[section.index()] {
            Some(entry) if entry.version == version && !entry.sent => {
                entry.sent = true;
                true
            }
            _ => false,
        })?;
        if marked {
            self.counters.bump_state_sent();
        }
        Ok(marked)
    }

    /// Mark the slot acked if the peer has seen `version` or later
    pub fn mark_state_acked(&self, section: SectionId, version: u32) -> Result<bool, CacheError> {
        let marked = self.with_inner(|inner| match &mut inner.states[section.index()] {
            Some(entry)
                if !entry.acked
                    && (entry.version == version || is_newer(version, entry.version)) =>
            {
                entry.sent = true;
                entry.acked = true;
                true
            }
            _ => false,
        })?;
        if marked {
            self.counters.bump_state_acked();
        }
        Ok(marked)
    }

    /// Reload every state slot from the persistent store
    ///
    /// Missing keys and blobs written with another layout are skipped.
    /// Returns how many slots were restored.
    pub fn restore_all_from_nvs<S: PersistentStore>(&self, store: &S) -> Result<usize, CacheError> {
        let mut restored: Vec<StateEntry, N_SECTIONS> = Vec::new();
        for section in SectionId::ALL {
            let blob = match store.get(NAMESPACE, section.key()) {
                Ok(Some(blob)) => blob,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("cache: reading {:?} failed: {}", section, e);
                    continue;
                }
            };
            match decode_section_blob(&blob) {
                Ok((version, bytes)) => {
                    let mut payload = Vec::new();
                    if payload.extend_from_slice(bytes).is_err() {
                        continue;
                    }
                    let _ = restored.push(StateEntry {
                        section,
                        version,
                        payload,
                        sent: false,
                        acked: false,
                        is_latest: true,
                    });
                }
                Err(BlobError::StructVersion(v)) => {
                    log::warn!("cache: {:?} stored with layout v{}, ignored", section, v);
                }
                Err(e) => log::warn!("cache: {:?} blob unusable: {:?}", section, e),
            }
        }

        let count = restored.len();
        self.with_inner(|inner| {
            for entry in restored {
                let index = entry.section.index();
                inner.states[index] = Some(entry);
            }
        })?;
        log::info!("cache: restored {} state sections", count);
        Ok(count)
    }

    /// Counter snapshot
    ///
    /// When the mutex cannot be taken in time the depth figures are the ones
    /// from the last successful read.
    pub fn stats(&self) -> CacheStats {
        let live = self
            .with_inner(|inner| {
                (
                    inner.transient.len() as u32,
                    inner.states.iter().filter(|s| s.is_some()).count() as u32,
                )
            })
            .ok();
        self.counters.snapshot(live)
    }

    #[cfg(test)]
    fn transient_seqs(&self) -> std::vec::Vec<u32> {
        self.with_inner(|inner| inner.transient.iter().map(|e| e.seq).collect())
            .unwrap()
    }

    /// Keep the cache mutex taken until the returned value is dropped
    #[cfg(test)]
    pub(crate) fn hold_lock(&self) -> HeldLock<'_> {
        HeldLock(self.inner.try_lock().unwrap())
    }
}

#[cfg(test)]
pub(crate) struct HeldLock<'a>(
    #[allow(dead_code)] embassy_sync::mutex::MutexGuard<'a, CriticalSectionRawMutex, Inner>,
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::time::mock::{MockClock, StdClock};
    use std::boxed::Box;

    fn cache() -> Box<Cache<MockClock>> {
        Box::new(Cache::new(MockClock::new(0)))
    }

    #[test]
    fn test_fifo_order() {
        let cache = cache();
        for seq in 0..5u32 {
            assert_eq!(cache.put_transient(&[seq as u8], seq, seq as u64), PutOutcome::Added);
        }
        for expected in 0..5u32 {
            let entry = cache.peek_next_unsent_transient().unwrap().unwrap();
            assert_eq!(entry.seq, expected);
            assert!(cache.mark_transient_sent(entry.seq).unwrap());
        }
        assert_eq!(cache.peek_next_unsent_transient().unwrap(), None);
    }

    #[test]
    fn test_peek_does_not_modify() {
        let cache = cache();
        cache.put_transient(&[1], 1, 0);
        let a = cache.peek_next_unsent_transient().unwrap();
        let b = cache.peek_next_unsent_transient().unwrap();
        assert_eq!(a, b);
        assert!(!a.unwrap().sent);
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let cache = cache();
        let total = 300u32;
        for seq in 0..total {
            cache.put_transient(&seq.to_le_bytes(), seq, seq as u64 * 10);
        }
        let stats = cache.stats();
        assert_eq!(stats.transient_added, 300);
        assert_eq!(stats.transient_dropped, 50);
        assert_eq!(stats.transient_current, 250);
        assert_eq!(stats.overflow_events, 50);
        assert_eq!(
            stats.transient_dropped + stats.transient_current,
            stats.transient_added
        );
        assert_eq!(stats.transient_max_depth, 250);
        let seqs = cache.transient_seqs();
        assert_eq!(seqs.first(), Some(&50));
        assert_eq!(seqs.last(), Some(&299));
    }

    #[test]
    fn test_cleanup_removes_only_acked_prefix() {
        let clock = MockClock::new(0);
        let cache = Box::new(Cache::new(clock.clone()));
        for seq in 1..=4u32 {
            cache.put_transient(&[0], seq, 0);
            cache.mark_transient_sent(seq).unwrap();
        }
        cache.mark_transient_acked(1).unwrap();
        cache.mark_transient_acked(2).unwrap();
        cache.mark_transient_acked(4).unwrap();

        clock.set(700);
        assert_eq!(cache.cleanup_acked_transient().unwrap(), 2);
        assert_eq!(cache.transient_seqs(), vec![3, 4]);
        assert_eq!(cache.stats().max_cache_duration_ms, 700);

        // 3 is still unacked so 4 stays behind it
        assert_eq!(cache.cleanup_acked_transient().unwrap(), 0);
    }

    #[test]
    fn test_ack_requires_sent() {
        let cache = cache();
        cache.put_transient(&[0], 9, 0);
        assert!(!cache.mark_transient_acked(9).unwrap());
        assert!(cache.mark_transient_sent(9).unwrap());
        assert!(cache.mark_transient_acked(9).unwrap());
        // Flags only move forward
        assert!(!cache.mark_transient_sent(9).unwrap());
        assert!(!cache.mark_transient_acked(9).unwrap());
    }

    #[test]
    fn test_retry_count() {
        let cache = cache();
        cache.put_transient(&[0], 3, 0);
        cache.note_transient_retry(3).unwrap();
        cache.note_transient_retry(3).unwrap();
        let entry = cache.peek_next_unsent_transient().unwrap().unwrap();
        assert_eq!(entry.retry_count, 2);
        assert!(!entry.sent);
    }

    #[test]
    fn test_payload_too_large() {
        let cache = cache();
        let big = [0u8; MAX_PAYLOAD + 1];
        assert_eq!(
            cache.put_transient(&big, 1, 0),
            PutOutcome::Dropped(DropReason::PayloadTooLarge)
        );
        assert_eq!(cache.stats().transient_added, 0);
    }

    #[test]
    fn test_mutex_timeout_drops() {
        let cache = Box::new(Cache::new(StdClock::new()));
        let guard = cache.hold_lock();
        let started = std::time::Instant::now();
        let outcome = cache.put_transient(&[1], 1, 0);
        let waited = started.elapsed();
        drop(guard);

        assert_eq!(outcome, PutOutcome::Dropped(DropReason::MutexTimeout));
        assert!(waited >= std::time::Duration::from_millis(MUTEX_TIMEOUT_MS));
        assert!(waited < std::time::Duration::from_millis(MUTEX_TIMEOUT_MS + 40));
        assert_eq!(cache.stats().mutex_timeouts, 1);
        assert_eq!(cache.stats().transient_added, 0);
    }

    #[test]
    fn test_stats_keep_last_depth_on_timeout() {
        let cache = Box::new(Cache::new(StdClock::new()));
        for seq in 0..3u32 {
            cache.put_transient(&[seq as u8], seq, 0);
        }
        assert_eq!(cache.stats().transient_current, 3);

        let guard = cache.hold_lock();
        let stats = cache.stats();
        drop(guard);
        assert_eq!(stats.transient_current, 3);
        assert_eq!(stats.mutex_timeouts, 1);
    }

    #[test]
    fn test_put_under_contention_never_blocks() {
        let cache = Box::new(Cache::new(StdClock::new()));
        let limit = std::time::Duration::from_millis(MUTEX_TIMEOUT_MS + 40);
        let mut uncontended = std::vec::Vec::new();
        for seq in 0..200u32 {
            let t = std::time::Instant::now();
            cache.put_transient(&[0; 32], seq, 0);
            uncontended.push(t.elapsed());
        }
        uncontended.sort();
        assert!(uncontended[(uncontended.len() * 99) / 100] < std::time::Duration::from_millis(1));

        std::thread::scope(|s| {
            let cache = &*cache;
            let producers: std::vec::Vec<_> = (0..2u32)
                .map(|p| {
                    s.spawn(move || {
                        let mut worst = std::time::Duration::ZERO;
                        for i in 0..2000u32 {
                            let t = std::time::Instant::now();
                            let outcome = cache.put_transient(&[p as u8; 64], p * 100_000 + i, 0);
                            worst = worst.max(t.elapsed());
                            assert_ne!(outcome, PutOutcome::Dropped(DropReason::PayloadTooLarge));
                        }
                        worst
                    })
                })
                .collect();
            s.spawn(move || {
                for _ in 0..2000 {
                    if let Ok(Some(entry)) = cache.peek_next_unsent_transient() {
                        let _ = cache.mark_transient_sent(entry.seq);
                        let _ = cache.mark_transient_acked(entry.seq);
                    }
                    let _ = cache.cleanup_acked_transient();
                }
            });
            for p in producers {
                assert!(p.join().unwrap() < limit);
            }
        });
    }

    #[test]
    fn test_state_never_deleted() {
        let cache = cache();
        let mut store = MemoryStore::new();
        cache
            .update_state(SectionId::Battery, 1, &[1, 2], &mut store)
            .unwrap();
        assert!(cache.mark_state_sent(SectionId::Battery, 1).unwrap());
        assert!(cache.mark_state_acked(SectionId::Battery, 1).unwrap());
        cache.cleanup_acked_transient().unwrap();

        let entry = cache.get_state(SectionId::Battery).unwrap().unwrap();
        assert!(entry.acked);
        assert!(entry.is_latest);
        assert_eq!(entry.payload.as_slice(), &[1, 2]);
    }

    #[test]
    fn test_state_update_resets_flags_and_persists() {
        let cache = cache();
        let mut store = MemoryStore::new();
        cache.update_state(SectionId::Mqtt, 1, &[1], &mut store).unwrap();
        cache.mark_state_sent(SectionId::Mqtt, 1).unwrap();
        cache.mark_state_acked(SectionId::Mqtt, 1).unwrap();

        let update = cache.update_state(SectionId::Mqtt, 2, &[2], &mut store).unwrap();
        assert_eq!(update, StateUpdate { version: 2, persisted: true });
        let entry = cache.get_state(SectionId::Mqtt).unwrap().unwrap();
        assert!(!entry.sent && !entry.acked);
        assert_eq!(entry.version, 2);

        let blob = store.get(NAMESPACE, "mqtt").unwrap().unwrap();
        assert_eq!(decode_section_blob(&blob), Ok((2, &[2u8][..])));
        assert_eq!(cache.unsent_state_sections().unwrap().as_slice(), &[SectionId::Mqtt]);
    }

    #[test]
    fn test_stale_state_version_rejected() {
        let cache = cache();
        let mut store = MemoryStore::new();
        cache.update_state(SectionId::Network, 5, &[5], &mut store).unwrap();
        assert_eq!(
            cache.update_state(SectionId::Network, 4, &[4], &mut store),
            Err(CacheError::StaleVersion { current: 5, offered: 4 })
        );
        // Wrapped counter is still newer
        let mut store2 = MemoryStore::new();
        cache.update_state(SectionId::Mqtt, u32::MAX, &[1], &mut store2).unwrap();
        assert!(cache.update_state(SectionId::Mqtt, 0, &[2], &mut store2).is_ok());
    }

    #[test]
    fn test_sent_mark_ignores_superseded_version() {
        let cache = cache();
        let mut store = MemoryStore::new();
        cache.update_state(SectionId::Mqtt, 1, &[1], &mut store).unwrap();
        cache.update_state(SectionId::Mqtt, 2, &[2], &mut store).unwrap();
        assert!(!cache.mark_state_sent(SectionId::Mqtt, 1).unwrap());
        assert!(cache.mark_state_sent(SectionId::Mqtt, 2).unwrap());
    }

    #[test]
    fn test_nvs_failure_is_best_effort() {
        let cache = cache();
        let mut store = MemoryStore::new();
        store.set_fail_writes(true);
        let update = cache.update_state(SectionId::Battery, 1, &[9], &mut store).unwrap();
        assert!(!update.persisted);
        assert!(cache.get_state(SectionId::Battery).unwrap().is_some());
        assert_eq!(cache.stats().nvs_write_failures, 1);
    }

    #[test]
    fn test_restore_from_nvs() {
        let mut store = MemoryStore::new();
        {
            let before = cache();
            before.update_state(SectionId::Network, 3, &[1, 1], &mut store).unwrap();
            before.update_state(SectionId::Battery, 8, &[2], &mut store).unwrap();
        }
        // A blob from some other layout is left alone
        store.put(NAMESPACE, SectionId::Mqtt.key(), &[7, 0, 1, 0, 0, 0, 0, 0]).unwrap();

        let after = cache();
        assert_eq!(after.restore_all_from_nvs(&store).unwrap(), 2);
        let net = after.get_state(SectionId::Network).unwrap().unwrap();
        assert_eq!(net.version, 3);
        assert!(!net.sent);
        assert!(after.get_state(SectionId::Mqtt).unwrap().is_none());
    }

    #[test]
    fn test_restore_with_empty_store() {
        let store = MemoryStore::new();
        let cache = cache();
        assert_eq!(cache.restore_all_from_nvs(&store).unwrap(), 0);
    }
}
