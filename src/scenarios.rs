//! Two complete nodes on a simulated air interface
//!
//! Frames only reach a node tuned to the sender's channel, and only when
//! addressed to it or broadcast. Time moves in fixed steps; each step ticks,
//! beacons and pumps both nodes, then delivers everything in flight until both
//! outboxes are empty.

use std::sync::Mutex;
use std::time::{Duration, Instant};
use std::vec::Vec as StdVec;

use rand_core::RngCore;

use crate::cache::Cache;
use crate::config::link::MTU;
use crate::config::{DiscoveryConfig, LinkConfig};
use crate::link_session::LinkSession;
use crate::protocol::version::is_newer;
use crate::protocol::{
    decode, encode, Frame, Heartbeat, MacAddress, RuntimeFlags, SectionId, SessionState,
    TimeSource,
};
use crate::radio::mock::{MockRadio, SentFrame};
use crate::radio::LinkRadio;
use crate::router::subtype;
use crate::settings::{MqttSettings, Section};
use crate::storage::MemoryStore;
use crate::time::mock::MockClock;

const TX_ADDR: MacAddress = MacAddress::new([0x24, 0x6F, 0x28, 0x00, 0x00, 0x01]);
const RX_ADDR: MacAddress = MacAddress::new([0x24, 0x6F, 0x28, 0x00, 0x00, 0x02]);
const STEP_MS: u64 = 50;

struct FixedRng;

impl RngCore for FixedRng {
    fn next_u32(&mut self) -> u32 {
        0xDEAD_BEEF
    }
    fn next_u64(&mut self) -> u64 {
        0xDEAD_BEEF
    }
    fn fill_bytes(&mut self, dest: &mut [u8]) {
        dest.fill(0xAA);
    }
    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}

type Node = LinkSession<MockRadio, MemoryStore, FixedRng>;

struct Sim {
    now: u64,
    tx: Node,
    rx: Node,
    tx_cache: Cache<MockClock>,
    rx_cache: Cache<MockClock>,
    /// Drop everything the Receiver transmits
    mute_rx: bool,
    to_tx: StdVec<(u64, Frame)>,
    to_rx: StdVec<(u64, Frame)>,
}

fn fast_sweep() -> LinkConfig {
    LinkConfig {
        discovery: DiscoveryConfig {
            attempts_per_channel: 1,
            ..DiscoveryConfig::default()
        },
        ..LinkConfig::transmitter()
    }
}

fn reaches(frame: &SentFrame, node: &Node) -> bool {
    frame.channel == node.radio().channel()
        && (frame.dest.is_broadcast() || frame.dest == node.radio().address())
}

impl Sim {
    fn new(tx_config: LinkConfig, rx_channel: u8) -> Self {
        let tx_cache = Cache::new(MockClock::new(0));
        let rx_cache = Cache::new(MockClock::new(0));
        let mut tx = LinkSession::new(
            tx_config,
            MockRadio::new(TX_ADDR, 1),
            MemoryStore::new(),
            FixedRng,
        );
        let mut rx = LinkSession::new(
            LinkConfig::receiver(rx_channel),
            MockRadio::new(RX_ADDR, rx_channel),
            MemoryStore::new(),
            FixedRng,
        );
        tx.boot(0, &tx_cache);
        rx.boot(0, &rx_cache);
        Self {
            now: 0,
            tx,
            rx,
            tx_cache,
            rx_cache,
            mute_rx: false,
            to_tx: StdVec::new(),
            to_rx: StdVec::new(),
        }
    }

    /// Both nodes started and linked, Receiver on channel 7
    fn connected() -> Self {
        let mut sim = Self::new(fast_sweep(), 7);
        sim.start();
        let linked = sim.run_until(10_000, |s| {
            s.tx.state() == SessionState::Connected && s.rx.state() == SessionState::Connected
        });
        assert!(linked, "link did not come up");
        sim
    }

    fn start(&mut self) {
        self.rx.start(self.now);
        self.tx.start(self.now);
        self.deliver();
    }

    fn step(&mut self) {
        self.now += STEP_MS;
        self.tx.tick(self.now);
        self.tx.poll_beacon(self.now);
        self.tx.pump(self.now, &self.tx_cache);
        self.rx.tick(self.now);
        self.rx.pump(self.now, &self.rx_cache);
        self.deliver();
    }

    fn run_for(&mut self, ms: u64) {
        let end = self.now + ms;
        while self.now < end {
            self.step();
        }
    }

    /// Step until `done` holds or `ms` elapses; true if `done` was reached
    fn run_until(&mut self, ms: u64, done: impl Fn(&Self) -> bool) -> bool {
        let end = self.now + ms;
        while self.now < end {
            self.step();
            if done(self) {
                return true;
            }
        }
        false
    }

    fn deliver(&mut self) {
        loop {
            let from_tx = self.tx.radio_mut().take_outbox();
            let from_rx = self.rx.radio_mut().take_outbox();
            if from_tx.is_empty() && from_rx.is_empty() {
                break;
            }
            for frame in from_tx {
                if !reaches(&frame, &self.rx) {
                    continue;
                }
                if let Ok(decoded) = decode(&frame.data) {
                    self.to_rx.push((self.now, decoded));
                }
                self.rx
                    .handle_rx(self.now, TX_ADDR, &frame.data, -42, &self.rx_cache);
            }
            for frame in from_rx {
                if self.mute_rx || !reaches(&frame, &self.tx) {
                    continue;
                }
                if let Ok(decoded) = decode(&frame.data) {
                    self.to_tx.push((self.now, decoded));
                }
                self.tx
                    .handle_rx(self.now, RX_ADDR, &frame.data, -47, &self.tx_cache);
            }
        }
    }

    fn tx_states_since(&self, since_ms: u64) -> StdVec<(SessionState, u64)> {
        self.tx
            .session()
            .history()
            .filter(|t| t.at_ms > since_ms)
            .map(|t| (t.to, t.at_ms))
            .collect()
    }
}

fn text<const N: usize>(s: &str) -> heapless::String<N> {
    let mut out = heapless::String::new();
    out.push_str(s).unwrap();
    out
}

#[test]
fn test_cold_discovery() {
    let mut sim = Sim::new(fast_sweep(), 7);
    sim.start();
    let linked = sim.run_until(8_000, |s| s.tx.state() == SessionState::Connected);
    assert!(linked, "not connected after {} ms", sim.now);
    assert!(sim.now <= 8_000);

    assert!(sim.to_tx.iter().any(|(_, f)| *f
        == Frame::Ack {
            seq: 0xDEAD_BEEF,
            channel: 7
        }));
    assert_eq!(sim.tx.peer(), Some(RX_ADDR));
    assert_eq!(sim.tx.radio().channel(), 7);
    assert_eq!(sim.rx.state(), SessionState::Connected);
    assert_eq!(sim.rx.peer(), Some(TX_ADDR));

    let stats = sim.tx.discovery_stats();
    assert_eq!(stats.acks_matched, 1);
    assert_eq!(stats.sweeps_failed, 0);
    assert_eq!(stats.last_lock_channel, 7);
}

#[test]
fn test_lock_matches_ack_channel() {
    let sim = Sim::connected();
    let ack_channel = sim
        .to_tx
        .iter()
        .find_map(|(_, f)| match f {
            Frame::Ack { channel, .. } => Some(*channel),
            _ => None,
        })
        .unwrap();
    assert_eq!(sim.tx.channels().locked_channel(), Some(ack_channel));
    assert!(sim.tx.radio().peers().contains(&(RX_ADDR, ack_channel)));
}

static EVENT_SEQS: Mutex<StdVec<u32>> = Mutex::new(StdVec::new());

fn record_event(_src: &MacAddress, payload: &[u8]) {
    let seq = u32::from_le_bytes([payload[1], payload[2], payload[3], payload[4]]);
    EVENT_SEQS.lock().unwrap().push(seq);
}

#[test]
fn test_cache_during_outage_then_drains_in_order() {
    let mut sim = Sim::new(fast_sweep(), 7);
    assert!(sim.rx.register_payload_hook(subtype::EVENTS, record_event));

    // 300 events at 100/s while the link is idle
    let mut slowest = Duration::ZERO;
    for seq in 0..300u32 {
        let mut payload = [0u8; 5];
        payload[0] = subtype::EVENTS;
        payload[1..].copy_from_slice(&seq.to_le_bytes());
        let started = Instant::now();
        sim.tx_cache.put_transient(&payload, seq, seq as u64 * 10);
        slowest = slowest.max(started.elapsed());
        sim.step();
    }
    assert!(slowest < Duration::from_millis(10));
    assert_eq!(sim.tx.state(), SessionState::Idle);
    assert_eq!(sim.tx.tx_stats().transient_sent, 0);

    let stats = sim.tx_cache.stats();
    assert_eq!(stats.transient_added, 300);
    assert_eq!(stats.transient_dropped, 50);
    assert_eq!(stats.transient_current, 250);
    assert_eq!(
        stats.transient_dropped + stats.transient_current,
        stats.transient_added
    );
    let head = sim.tx_cache.peek_next_unsent_transient().unwrap().unwrap();
    assert_eq!(head.seq, 50);

    sim.start();
    let drained = sim.run_until(30_000, |_| EVENT_SEQS.lock().unwrap().len() == 250);
    assert!(drained);
    let seen = EVENT_SEQS.lock().unwrap().clone();
    assert_eq!(seen, (50..300).collect::<StdVec<u32>>());
}

#[test]
fn test_version_driven_pull() {
    let mut sim = Sim::connected();
    sim.run_for(2_000);

    let mqtt = MqttSettings {
        enabled: true,
        host: text("telemetry-broker-eu-central-1.internal.example-battery-fleet.net"),
        port: 8883,
        username: text("transmitter-0001-fleet-operator"),
        password: text("s3cr3t-passphrase-that-is-long-enough-to-need-fragmentation-ok"),
        client_id: text("espnow_transmitter_site42_pack07"),
        topic_prefix: text("fleet/site-42/pack-07/espnow/transmitter/telemetry/v1/extra-data"),
    };
    let bytes = mqtt.encode().unwrap();
    assert!(bytes.len() > MTU);
    assert_eq!(sim.rx.settings().version(SectionId::Mqtt), 0);

    let set_at = sim.now;
    let version = sim
        .tx
        .update_setting(SectionId::Mqtt, &bytes, &sim.tx_cache)
        .unwrap();
    assert_eq!(version, 1);

    let mut observed = StdVec::new();
    let done = sim.run_until(3_000, |s| {
        s.rx.settings().version(SectionId::Mqtt) == version
    });
    observed.push(sim.rx.settings().version(SectionId::Mqtt));
    assert!(done);

    let beacon_at = sim
        .to_rx
        .iter()
        .find_map(|(at, f)| match f {
            Frame::VersionBeacon(b) if b.versions[SectionId::Mqtt.index()] == version => Some(*at),
            _ => None,
        })
        .unwrap();
    assert!(beacon_at - set_at <= 1_000);
    assert!(sim.to_tx.iter().any(|(_, f)| *f
        == Frame::ConfigSectionRequest {
            section: SectionId::Mqtt,
            requested_version: version
        }));
    assert!(sim
        .to_rx
        .iter()
        .any(|(_, f)| matches!(f, Frame::Fragment { .. })));
    assert_eq!(sim.rx.settings().typed::<MqttSettings>(), Ok(mqtt.clone()));

    // Serving the request acknowledged the staged slot without clearing it
    let slot = sim.tx_cache.get_state(SectionId::Mqtt).unwrap().unwrap();
    assert!(slot.acked);
    assert_eq!(slot.version, version);

    // A second change moves the Receiver forward again, never back
    let mut newer = mqtt;
    newer.port = 1884;
    let v2 = sim
        .tx
        .update_setting(SectionId::Mqtt, &newer.encode().unwrap(), &sim.tx_cache)
        .unwrap();
    for _ in 0..60 {
        sim.step();
        observed.push(sim.rx.settings().version(SectionId::Mqtt));
    }
    assert_eq!(*observed.last().unwrap(), v2);
    for pair in observed.windows(2) {
        assert!(pair[0] == pair[1] || is_newer(pair[1], pair[0]));
    }
}

#[test]
fn test_heartbeat_loss_trace() {
    let mut sim = Sim::connected();
    sim.mute_rx = true;
    let base = sim.tx.session().last_rx_ms();
    let muted_at = sim.now;

    sim.run_for(base + 90_000 + STEP_MS - sim.now);

    let trace = sim.tx_states_since(muted_at);
    let states: StdVec<SessionState> = trace.iter().map(|(s, _)| *s).collect();
    assert_eq!(
        &states[..4],
        &[
            SessionState::Degraded,
            SessionState::Failure,
            SessionState::Disconnected,
            SessionState::Connecting
        ]
    );
    let at = |i: usize| trace[i].1 - base;
    assert!((30_000..30_000 + STEP_MS).contains(&at(0)));
    assert!((60_000..60_000 + STEP_MS).contains(&at(1)));
    assert!((90_000..90_000 + STEP_MS).contains(&at(2)));
    assert_eq!(trace[2].1, trace[3].1);
    assert!(sim.tx.session_stats().longest_downtime_ms >= 90_000);
}

#[test]
fn test_recovers_after_heartbeats_return() {
    let mut sim = Sim::connected();
    sim.mute_rx = true;
    let muted_at = sim.now;
    sim.run_for(95_000);
    assert_eq!(sim.tx.state(), SessionState::Connecting);
    assert_eq!(sim.tx.peer(), None);

    sim.mute_rx = false;
    let back = sim.run_until(20_000, |s| s.tx.state() == SessionState::Connected);
    assert!(back);

    let states: StdVec<SessionState> = sim
        .tx_states_since(muted_at)
        .into_iter()
        .map(|(s, _)| s)
        .collect();
    assert_eq!(
        states,
        vec![
            SessionState::Degraded,
            SessionState::Failure,
            SessionState::Disconnected,
            SessionState::Connecting,
            SessionState::Connected,
        ]
    );
    assert_eq!(sim.tx.channels().locked_channel(), Some(7));
    assert_eq!(sim.tx.session_stats().reconnects, 1);
}

#[test]
fn test_corrupted_heartbeat_dropped() {
    let mut sim = Sim::connected();
    sim.run_for(1_000);
    let state = sim.rx.state();
    let last_rx = sim.rx.session().last_rx_ms();
    let bad_before = sim.rx.router_stats().bad_checksum;

    let mut bytes = encode(&Frame::Heartbeat(Heartbeat {
        seq: 99,
        uptime_ms: 1_234,
        unix_time: 0,
        source: TimeSource::Unsynced,
        state: SessionState::Connected,
        rssi: -40,
        flags: RuntimeFlags::empty(),
    }))
    .unwrap();
    bytes[6] ^= 0x10;
    sim.rx
        .handle_rx(sim.now + 10, TX_ADDR, &bytes, -40, &sim.rx_cache);

    assert_eq!(sim.rx.router_stats().bad_checksum, bad_before + 1);
    assert_eq!(sim.rx.state(), state);
    assert_eq!(sim.rx.session().last_rx_ms(), last_rx);
    assert!(sim.rx.radio().history().iter().all(|f| decode(&f.data)
        .map(|frame| !matches!(
            frame,
            Frame::HeartbeatAck(ack) if ack.ack_seq == 99
        ))
        .unwrap_or(true)));
}

#[test]
fn test_channel_mismatch_restored() {
    let mut sim = Sim::connected();
    assert_eq!(sim.tx.channels().locked_channel(), Some(7));
    sim.tx.radio_mut().force_channel(3);

    let restored = sim.run_until(30_000, |s| s.tx.session_stats().channel_mismatches == 1);
    assert!(restored);
    assert_eq!(sim.tx.radio().channel(), 7);
    assert_eq!(sim.tx.channels().locked_channel(), Some(7));

    sim.run_for(1_000);
    assert_eq!(sim.tx.session_stats().channel_mismatches, 1);
}
