//! Transmit pump
//!
//! Drains the cache to the radio once per tick: at most one transient payload
//! and every state section with an unsent update. Nothing is sent unless the
//! session is linked. A failed send leaves the entry unsent for the next tick;
//! there is no retry within a tick. Bookkeeping that times out on the cache
//! mutex after a successful send is finished before anything new is sent, so
//! an entry is never transmitted twice. Drivers that confirm delivery later
//! hand out tickets; reports for tracked tickets ack the matching entry.

use core::fmt;

use heapless::Deque;

use crate::cache::Cache;
use crate::config::link::MTU;
use crate::config::TxConfig;
use crate::protocol::framing::Fragmenter;
use crate::protocol::{
    encode, encode_datagram, CodecError, Frame, MacAddress, SectionId, SessionState,
};
use crate::protocol::version::is_newer;
use crate::radio::{Delivery, DeliveryReport, LinkRadio, RadioError};
use crate::time::Clock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    Codec(CodecError),
    Radio(RadioError),
}

impl From<CodecError> for SendError {
    fn from(e: CodecError) -> Self {
        SendError::Codec(e)
    }
}

impl From<RadioError> for SendError {
    fn from(e: RadioError) -> Self {
        SendError::Radio(e)
    }
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Codec(e) => write!(f, "codec: {}", e),
            SendError::Radio(e) => write!(f, "radio: {}", e),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxStats {
    pub ticks: u32,
    /// Ticks skipped because the session was not linked
    pub idle_ticks: u32,
    pub transient_sent: u32,
    pub transient_delivered: u32,
    pub transient_failed: u32,
    pub state_sent: u32,
    pub state_failed: u32,
    pub fragments_sent: u32,
    pub cleaned: u32,
    /// Cache bookkeeping calls that hit the mutex timeout
    pub mark_failures: u32,
    /// Tracked tickets that never got a report
    pub reports_lost: u32,
}

// Transients whose delivery report is still outstanding
const AWAITING_DEPTH: usize = 8;

/// Sent transient whose cache bookkeeping is still outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingMark {
    seq: u32,
    delivered: bool,
}

pub struct TxWorker {
    cleanup_interval_ms: u64,
    last_cleanup_ms: u64,
    fragmenter: Fragmenter,
    pending: Option<PendingMark>,
    /// `(ticket, seq)` in send order
    awaiting: Deque<(u32, u32), AWAITING_DEPTH>,
    stats: TxStats,
}

impl TxWorker {
    pub fn new(config: &TxConfig, initial_fragment_seq: u32) -> Self {
        Self {
            cleanup_interval_ms: config.cleanup_interval_ms,
            last_cleanup_ms: 0,
            fragmenter: Fragmenter::new(initial_fragment_seq),
            pending: None,
            awaiting: Deque::new(),
            stats: TxStats::default(),
        }
    }

    pub fn stats(&self) -> TxStats {
        self.stats
    }

    /// Send `frame` to `dest`, fragmenting it when it exceeds the MTU
    pub fn send_frame<R: LinkRadio>(
        &mut self,
        radio: &mut R,
        dest: &MacAddress,
        frame: &Frame,
    ) -> Result<Delivery, SendError> {
        let encoded = encode(frame)?;
        if encoded.len() <= MTU {
            return Ok(radio.send(dest, &encoded)?);
        }

        let fragments = self.fragmenter.split(&encoded)?;
        let mut delivery = Delivery::Delivered;
        for fragment in &fragments {
            let bytes = encode_datagram(fragment)?;
            if radio.send(dest, &bytes)? != Delivery::Delivered {
                delivery = Delivery::Queued;
            }
            self.stats.fragments_sent += 1;
        }
        log::debug!("tx: {:?} sent as {} fragments", frame.tag(), fragments.len());
        Ok(delivery)
    }

    /// One tick of the pump
    pub fn pump<R: LinkRadio, C: Clock>(
        &mut self,
        now_ms: u64,
        state: SessionState,
        peer: Option<MacAddress>,
        radio: &mut R,
        cache: &Cache<C>,
    ) {
        self.stats.ticks += 1;
        self.collect_reports(radio, cache);
        let peer = match peer {
            Some(peer) if state.is_linked() => peer,
            _ => {
                self.stats.idle_ticks += 1;
                return;
            }
        };

        self.pump_transient(radio, &peer, cache);
        self.pump_state(radio, &peer, cache);

        if now_ms.saturating_sub(self.last_cleanup_ms) >= self.cleanup_interval_ms {
            self.last_cleanup_ms = now_ms;
            match cache.cleanup_acked_transient() {
                Ok(removed) => self.stats.cleaned += removed as u32,
                Err(e) => log::debug!("tx: cleanup skipped: {}", e),
            }
        }
    }

    fn pump_transient<R: LinkRadio, C: Clock>(
        &mut self,
        radio: &mut R,
        peer: &MacAddress,
        cache: &Cache<C>,
    ) {
        // Already retried this tick by `collect_reports`
        if self.pending.is_some() {
            return;
        }

        let entry = match cache.peek_next_unsent_transient() {
            Ok(Some(entry)) => entry,
            Ok(None) => return,
            Err(e) => {
                log::debug!("tx: transient peek skipped: {}", e);
                return;
            }
        };

        let frame = Frame::TransientData {
            payload: entry.payload,
        };
        let sent = encode_datagram(&frame)
            .map_err(SendError::from)
            .and_then(|bytes| radio.send(peer, &bytes).map_err(SendError::from));
        match sent {
            Ok(delivery) => {
                self.stats.transient_sent += 1;
                let delivered = delivery == Delivery::Delivered;
                if delivered {
                    self.stats.transient_delivered += 1;
                }
                self.settle(
                    cache,
                    PendingMark {
                        seq: entry.seq,
                        delivered,
                    },
                );
                if let Delivery::Pending(ticket) = delivery {
                    self.await_report(ticket, entry.seq);
                }
            }
            Err(e) => {
                self.stats.transient_failed += 1;
                log::debug!("tx: transient {} not sent: {}", entry.seq, e);
                if let Err(e) = cache.note_transient_retry(entry.seq) {
                    self.stats.mark_failures += 1;
                    log::warn!("tx: retry count for {} lost: {}", entry.seq, e);
                }
            }
        }
    }

    /// Record a sent transient in the cache; false while the mutex is busy
    ///
    /// Both marks are idempotent, so a half-finished attempt is simply
    /// repeated.
    fn settle<C: Clock>(&mut self, cache: &Cache<C>, mark: PendingMark) -> bool {
        let result = cache.mark_transient_sent(mark.seq).and_then(|_| {
            if mark.delivered {
                cache.mark_transient_acked(mark.seq).map(|_| ())
            } else {
                Ok(())
            }
        });
        match result {
            Ok(()) => {
                self.pending = None;
                true
            }
            Err(e) => {
                self.stats.mark_failures += 1;
                self.pending = Some(mark);
                log::warn!("tx: transient {} bookkeeping deferred: {}", mark.seq, e);
                false
            }
        }
    }

    fn await_report(&mut self, ticket: u32, seq: u32) {
        if self.awaiting.is_full() {
            self.awaiting.pop_front();
            self.stats.reports_lost += 1;
        }
        // Cannot fail: a slot was freed above if needed
        let _ = self.awaiting.push_back((ticket, seq));
    }

    /// Apply delivery reports from the driver
    ///
    /// Reports come back in send order. Tracked tickets older than a report
    /// will never be reported; their entries stay sent but unacked.
    fn collect_reports<R: LinkRadio, C: Clock>(&mut self, radio: &mut R, cache: &Cache<C>) {
        if let Some(mark) = self.pending {
            if !self.settle(cache, mark) {
                return;
            }
        }
        while let Some(DeliveryReport { ticket, delivered }) = radio.take_delivery_report() {
            while let Some(&(oldest, _)) = self.awaiting.front() {
                if !is_newer(ticket, oldest) {
                    break;
                }
                self.awaiting.pop_front();
                self.stats.reports_lost += 1;
            }
            let seq = match self.awaiting.front() {
                Some(&(front, seq)) if front == ticket => seq,
                // Heartbeats, state sections and the like are not tracked
                _ => continue,
            };
            self.awaiting.pop_front();
            if !delivered {
                continue;
            }
            self.stats.transient_delivered += 1;
            if !self.settle(cache, PendingMark { seq, delivered }) {
                break;
            }
        }
    }

    fn pump_state<R: LinkRadio, C: Clock>(
        &mut self,
        radio: &mut R,
        peer: &MacAddress,
        cache: &Cache<C>,
    ) {
        let sections = match cache.unsent_state_sections() {
            Ok(sections) => sections,
            Err(_) => return,
        };
        for section in sections {
            self.send_state(radio, peer, cache, section);
        }
    }

    fn send_state<R: LinkRadio, C: Clock>(
        &mut self,
        radio: &mut R,
        peer: &MacAddress,
        cache: &Cache<C>,
        section: SectionId,
    ) {
        let Ok(Some(entry)) = cache.get_state(section) else {
            return;
        };
        let frame = Frame::ConfigSection {
            section,
            version: entry.version,
            bytes: entry.payload,
        };
        match self.send_frame(radio, peer, &frame) {
            Ok(_) => {
                self.stats.state_sent += 1;
                log::debug!("tx: state {:?} v{} sent", section, entry.version);
                // Left unsent it goes out again; the receiver ignores the repeat
                if let Err(e) = cache.mark_state_sent(section, entry.version) {
                    self.stats.mark_failures += 1;
                    log::warn!("tx: state {:?} v{} not marked sent: {}", section, entry.version, e);
                }
            }
            Err(e) => {
                self.stats.state_failed += 1;
                log::warn!("tx: state {:?} v{} not sent: {}", section, entry.version, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode;
    use crate::radio::mock::MockRadio;
    use crate::cache::HeldLock;
    use crate::storage::MemoryStore;
    use crate::time::mock::{MockClock, StdClock};

    const TX: MacAddress = MacAddress::new([0x10; 6]);
    const RX: MacAddress = MacAddress::new([0x20; 6]);

    fn setup() -> (TxWorker, MockRadio, Cache<MockClock>) {
        let mut radio = MockRadio::new(TX, 6);
        radio.add_peer(&RX, 6).unwrap();
        (
            TxWorker::new(&TxConfig::default(), 100),
            radio,
            Cache::new(MockClock::new(0)),
        )
    }

    fn payloads(radio: &mut MockRadio) -> std::vec::Vec<std::vec::Vec<u8>> {
        radio
            .take_outbox()
            .iter()
            .filter_map(|f| match decode(&f.data) {
                Ok(Frame::TransientData { payload }) => Some(payload.to_vec()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_nothing_sent_unless_linked() {
        let (mut tx, mut radio, cache) = setup();
        cache.put_transient(&[1], 1, 0);
        tx.pump(0, SessionState::Connecting, Some(RX), &mut radio, &cache);
        tx.pump(50, SessionState::Connected, None, &mut radio, &cache);
        assert!(radio.history().is_empty());
        assert_eq!(tx.stats().idle_ticks, 2);
        assert_eq!(cache.transient_len().unwrap(), 1);
    }

    #[test]
    fn test_one_transient_per_tick_in_order() {
        let (mut tx, mut radio, cache) = setup();
        for seq in 0..3u32 {
            cache.put_transient(&[seq as u8], seq, 0);
        }
        for (i, state) in [
            SessionState::Connected,
            SessionState::Degraded,
            SessionState::Failure,
        ]
        .into_iter()
        .enumerate()
        {
            tx.pump(i as u64 * 50, state, Some(RX), &mut radio, &cache);
            assert_eq!(radio.take_outbox().len(), 1);
        }
        let sent: std::vec::Vec<u8> = radio
            .history()
            .iter()
            .filter_map(|f| match decode(&f.data) {
                Ok(Frame::TransientData { payload }) => Some(payload[0]),
                _ => None,
            })
            .collect();
        assert_eq!(sent, vec![0, 1, 2]);
        assert_eq!(cache.stats().transient_sent, 3);
    }

    #[test]
    fn test_delivery_report_acks_and_cleans() {
        let (mut tx, mut radio, cache) = setup();
        radio.set_delivery(Delivery::Delivered);
        cache.put_transient(&[7], 1, 0);
        cache.put_transient(&[8], 2, 0);
        tx.pump(0, SessionState::Connected, Some(RX), &mut radio, &cache);
        tx.pump(1_000, SessionState::Connected, Some(RX), &mut radio, &cache);
        assert_eq!(payloads(&mut radio), vec![vec![7], vec![8]]);
        assert_eq!(cache.transient_len().unwrap(), 0);
        assert_eq!(tx.stats().cleaned, 2);
    }

    #[test]
    fn test_queued_entries_stay_until_acked() {
        let (mut tx, mut radio, cache) = setup();
        cache.put_transient(&[7], 1, 0);
        tx.pump(0, SessionState::Connected, Some(RX), &mut radio, &cache);
        tx.pump(2_000, SessionState::Connected, Some(RX), &mut radio, &cache);
        // Sent once, never resent, still cached
        assert_eq!(payloads(&mut radio).len(), 1);
        assert_eq!(cache.transient_len().unwrap(), 1);
    }

    #[test]
    fn test_late_delivery_reports_ack_entries() {
        let (mut tx, mut radio, cache) = setup();
        radio.set_delivery(Delivery::Pending(0));
        for seq in 1..=3u32 {
            cache.put_transient(&[seq as u8], seq, 0);
        }
        for now in [0, 50, 100] {
            tx.pump(now, SessionState::Connected, Some(RX), &mut radio, &cache);
        }
        assert_eq!(payloads(&mut radio), vec![vec![1], vec![2], vec![3]]);
        assert_eq!(cache.stats().transient_acked, 0);

        // Ticket 0 was never reported, ticket 1 failed on air
        radio.report_delivery(1, false);
        radio.report_delivery(2, true);
        tx.pump(1_000, SessionState::Connected, Some(RX), &mut radio, &cache);

        let stats = cache.stats();
        assert_eq!(stats.transient_acked, 1);
        assert_eq!(tx.stats().transient_delivered, 1);
        assert_eq!(tx.stats().reports_lost, 1);
        // Entries 1 and 2 are still unacked at the head, so nothing is cleaned
        assert_eq!(cache.transient_len().unwrap(), 3);
        assert!(payloads(&mut radio).is_empty());
    }

    #[test]
    fn test_failed_send_retried_next_tick() {
        let (mut tx, mut radio, cache) = setup();
        cache.put_transient(&[9], 1, 0);
        radio.set_next_send_error(RadioError::SendFailed);
        tx.pump(0, SessionState::Connected, Some(RX), &mut radio, &cache);
        assert!(radio.take_outbox().is_empty());
        tx.pump(50, SessionState::Connected, Some(RX), &mut radio, &cache);
        assert_eq!(payloads(&mut radio), vec![vec![9]]);
        assert_eq!(tx.stats().transient_failed, 1);
    }

    #[test]
    fn test_state_update_sent_once() {
        let (mut tx, mut radio, cache) = setup();
        let mut store = MemoryStore::new();
        cache
            .update_state(SectionId::Network, 3, &[1, 2, 3], &mut store)
            .unwrap();
        tx.pump(0, SessionState::Connected, Some(RX), &mut radio, &cache);
        tx.pump(50, SessionState::Connected, Some(RX), &mut radio, &cache);

        let out = radio.take_outbox();
        assert_eq!(out.len(), 1);
        match decode(&out[0].data) {
            Ok(Frame::ConfigSection {
                section,
                version,
                bytes,
            }) => {
                assert_eq!(section, SectionId::Network);
                assert_eq!(version, 3);
                assert_eq!(bytes.as_slice(), &[1, 2, 3]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(cache.get_state(SectionId::Network).unwrap().unwrap().sent);
    }

    #[test]
    fn test_large_state_fragmented() {
        let (mut tx, mut radio, cache) = setup();
        let mut store = MemoryStore::new();
        cache
            .update_state(SectionId::Mqtt, 1, &[0xAA; 300], &mut store)
            .unwrap();
        tx.pump(0, SessionState::Connected, Some(RX), &mut radio, &cache);

        let out = radio.take_outbox();
        assert_eq!(out.len(), 2);
        for (i, sent) in out.iter().enumerate() {
            assert!(sent.data.len() <= MTU);
            match decode(&sent.data) {
                Ok(Frame::Fragment {
                    seq, index, total, ..
                }) => {
                    assert_eq!(seq, 100);
                    assert_eq!(index as usize, i);
                    assert_eq!(total, 2);
                }
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(tx.stats().fragments_sent, 2);
    }

    /// Takes the cache mutex after its first send and keeps it
    struct LockingRadio<'a> {
        inner: MockRadio,
        cache: &'a Cache<StdClock>,
        held: Option<HeldLock<'a>>,
        armed: bool,
    }

    impl LinkRadio for LockingRadio<'_> {
        fn send(&mut self, dest: &MacAddress, data: &[u8]) -> Result<Delivery, RadioError> {
            let delivery = self.inner.send(dest, data)?;
            if self.armed {
                self.armed = false;
                self.held = Some(self.cache.hold_lock());
            }
            Ok(delivery)
        }

        fn set_channel(&mut self, channel: u8) -> Result<(), RadioError> {
            self.inner.set_channel(channel)
        }

        fn channel(&self) -> u8 {
            self.inner.channel()
        }

        fn add_peer(&mut self, addr: &MacAddress, channel: u8) -> Result<(), RadioError> {
            self.inner.add_peer(addr, channel)
        }

        fn remove_peer(&mut self, addr: &MacAddress) -> Result<(), RadioError> {
            self.inner.remove_peer(addr)
        }

        fn is_peer_registered(&self, addr: &MacAddress) -> bool {
            self.inner.is_peer_registered(addr)
        }
    }

    #[test]
    fn test_busy_cache_after_send_does_not_resend() {
        let boxed = Box::new(Cache::new(StdClock::new()));
        let cache: &Cache<StdClock> = &boxed;
        cache.put_transient(&[1], 1, 0);
        cache.put_transient(&[2], 2, 0);

        let mut inner = MockRadio::new(TX, 6);
        inner.add_peer(&RX, 6).unwrap();
        inner.set_delivery(Delivery::Delivered);
        let mut radio = LockingRadio {
            inner,
            cache,
            held: None,
            armed: true,
        };
        let mut tx = TxWorker::new(&TxConfig::default(), 100);

        tx.pump(0, SessionState::Connected, Some(RX), &mut radio, cache);
        assert_eq!(payloads(&mut radio.inner), vec![vec![1]]);
        assert!(tx.stats().mark_failures >= 1);

        // Still busy: the outstanding marks block any new send
        let failures = tx.stats().mark_failures;
        tx.pump(50, SessionState::Connected, Some(RX), &mut radio, cache);
        assert!(radio.inner.take_outbox().is_empty());
        assert!(tx.stats().mark_failures > failures);

        radio.held = None;
        tx.pump(100, SessionState::Connected, Some(RX), &mut radio, cache);
        assert_eq!(payloads(&mut radio.inner), vec![vec![2]]);

        let stats = cache.stats();
        assert_eq!(stats.transient_sent, 2);
        assert_eq!(stats.transient_acked, 2);
    }
}
