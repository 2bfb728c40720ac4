//! Active channel-hopping discovery
//!
//! The Transmitter walks the channel plan, broadcasting `Probe` frames with a
//! fresh random sequence number and waiting for an `Ack` that echoes it. The
//! first matching ack wins the sweep. The lock itself (channel pin plus peer
//! registration) is committed from [`Discovery::poll`], never from the ack
//! handler.
//!
//! The state machine is tick driven: every wait is a deadline checked on the
//! next poll, so cancelling is just a phase change.

use core::fmt;

use rand_core::RngCore;

use crate::config::channels::SWEEP;
use crate::config::DiscoveryConfig;
use crate::link::channel::{is_valid, owner};
use crate::link::{ChannelError, ChannelManager, PeerError, PeerTable};
use crate::protocol::{encode_datagram, CodecError, Frame, MacAddress};
use crate::radio::{LinkRadio, RadioError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryError {
    Channel(ChannelError),
    Peer(PeerError),
    Radio(RadioError),
    Codec(CodecError),
}

impl From<ChannelError> for DiscoveryError {
    fn from(e: ChannelError) -> Self {
        DiscoveryError::Channel(e)
    }
}

impl From<PeerError> for DiscoveryError {
    fn from(e: PeerError) -> Self {
        DiscoveryError::Peer(e)
    }
}

impl From<RadioError> for DiscoveryError {
    fn from(e: RadioError) -> Self {
        DiscoveryError::Radio(e)
    }
}

impl From<CodecError> for DiscoveryError {
    fn from(e: CodecError) -> Self {
        DiscoveryError::Codec(e)
    }
}

impl fmt::Display for DiscoveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryError::Channel(e) => write!(f, "channel: {}", e),
            DiscoveryError::Peer(e) => write!(f, "peer: {}", e),
            DiscoveryError::Radio(e) => write!(f, "radio: {}", e),
            DiscoveryError::Codec(e) => write!(f, "codec: {}", e),
        }
    }
}

/// Where the sweep currently is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    /// Switch to `SWEEP[index]` on the next poll
    Hop { index: usize },
    /// Waiting for the driver to settle on the new channel
    Stabilizing { index: usize, until: u64 },
    /// Probe `seq` is out, waiting for its ack
    AwaitAck {
        index: usize,
        attempt: u8,
        seq: u32,
        deadline: u64,
    },
    /// Whole sweep failed, waiting before starting over
    Backoff { until: u64 },
    Locked,
}

/// Reported by [`Discovery::poll`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryEvent {
    None,
    /// Channel pinned and peer registered
    Locked { peer: MacAddress, channel: u8 },
    /// Every channel exhausted without an ack
    SweepFailed { consecutive: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DiscoveryStats {
    pub sweeps_started: u32,
    pub sweeps_failed: u32,
    pub consecutive_failures: u32,
    pub probes_sent: u32,
    pub probe_send_failures: u32,
    pub acks_matched: u32,
    pub acks_ignored: u32,
    pub lock_failures: u32,
    pub hop_failures: u32,
    pub last_lock_channel: u8,
    pub last_lock_ms: u64,
}

#[derive(Debug, Clone, Copy)]
struct MatchedAck {
    src: MacAddress,
    channel: u8,
}

pub struct Discovery {
    config: DiscoveryConfig,
    phase: Phase,
    matched: Option<MatchedAck>,
    stats: DiscoveryStats,
}

impl Discovery {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            phase: Phase::Idle,
            matched: None,
            stats: DiscoveryStats::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn stats(&self) -> DiscoveryStats {
        self.stats
    }

    pub fn is_active(&self) -> bool {
        !matches!(self.phase, Phase::Idle | Phase::Locked)
    }

    /// Start a fresh sweep from the first channel
    pub fn begin(&mut self, now_ms: u64) {
        self.phase = Phase::Hop { index: 0 };
        self.matched = None;
        self.stats.sweeps_started += 1;
        log::info!("discovery: sweep started at {} ms", now_ms);
    }

    /// Abandon any sweep in progress; pending acks are discarded
    pub fn cancel(&mut self) {
        if self.is_active() {
            log::debug!("discovery: cancelled in {:?}", self.phase);
        }
        self.phase = Phase::Idle;
        self.matched = None;
    }

    /// Offer an `Ack` received from `src`
    ///
    /// Only an ack echoing the outstanding probe is kept, and only the first
    /// one per wait window. Returns whether it was accepted.
    pub fn on_ack(&mut self, src: MacAddress, seq: u32, channel: u8) -> bool {
        let accepted = match self.phase {
            Phase::AwaitAck { seq: expected, .. } => {
                expected == seq && self.matched.is_none() && is_valid(channel) && !src.is_broadcast()
            }
            _ => false,
        };
        if accepted {
            self.matched = Some(MatchedAck { src, channel });
            self.stats.acks_matched += 1;
            log::info!("discovery: ack {:#010x} from {} (channel {})", seq, src, channel);
        } else {
            self.stats.acks_ignored += 1;
            log::debug!("discovery: ignoring ack {:#010x} from {}", seq, src);
        }
        accepted
    }

    /// Advance the sweep
    pub fn poll<R: LinkRadio, G: RngCore>(
        &mut self,
        now_ms: u64,
        radio: &mut R,
        channels: &mut ChannelManager,
        peers: &mut PeerTable,
        rng: &mut G,
    ) -> DiscoveryEvent {
        match self.phase {
            Phase::Idle | Phase::Locked => DiscoveryEvent::None,
            Phase::Hop { index } => {
                let channel = SWEEP[index];
                match channels.force_set(radio, channel) {
                    Ok(()) => {
                        log::debug!("discovery: hopped to channel {}", channel);
                        self.phase = Phase::Stabilizing {
                            index,
                            until: now_ms + self.config.stabilize_ms,
                        };
                        DiscoveryEvent::None
                    }
                    Err(e) => {
                        self.stats.hop_failures += 1;
                        log::warn!("discovery: hop to {} failed: {}", channel, e);
                        self.next_channel(now_ms, index)
                    }
                }
            }
            Phase::Stabilizing { index, until } => {
                if now_ms < until {
                    return DiscoveryEvent::None;
                }
                if let Err(e) = peers.add_broadcast(radio) {
                    log::warn!("discovery: broadcast peer: {}", e);
                }
                self.send_probe(now_ms, index, 0, radio, rng);
                DiscoveryEvent::None
            }
            Phase::AwaitAck {
                index,
                attempt,
                deadline,
                ..
            } => {
                if let Some(ack) = self.matched.take() {
                    match self.commit(now_ms, ack, radio, channels, peers) {
                        Ok(event) => return event,
                        Err(e) => {
                            self.stats.lock_failures += 1;
                            log::warn!("discovery: lock on {} failed: {}", ack.channel, e);
                        }
                    }
                } else if now_ms < deadline {
                    return DiscoveryEvent::None;
                }

                if attempt + 1 < self.config.attempts_per_channel {
                    self.send_probe(now_ms, index, attempt + 1, radio, rng);
                    DiscoveryEvent::None
                } else {
                    self.next_channel(now_ms, index)
                }
            }
            Phase::Backoff { until } => {
                if now_ms >= until {
                    self.begin(now_ms);
                }
                DiscoveryEvent::None
            }
        }
    }

    fn send_probe<R: LinkRadio, G: RngCore>(
        &mut self,
        now_ms: u64,
        index: usize,
        attempt: u8,
        radio: &mut R,
        rng: &mut G,
    ) {
        let seq = rng.next_u32();
        let sent = encode_datagram(&Frame::Probe { seq })
            .map_err(DiscoveryError::from)
            .and_then(|bytes| {
                radio
                    .send(&MacAddress::BROADCAST, &bytes)
                    .map_err(DiscoveryError::from)
            });
        match sent {
            Ok(_) => {
                self.stats.probes_sent += 1;
                log::trace!("discovery: probe {:#010x} on {}", seq, SWEEP[index]);
            }
            Err(e) => {
                self.stats.probe_send_failures += 1;
                log::warn!("discovery: probe on {} failed: {}", SWEEP[index], e);
            }
        }
        // Wait out the window even after a failed send so the sweep keeps its pace
        self.phase = Phase::AwaitAck {
            index,
            attempt,
            seq,
            deadline: now_ms + self.config.ack_wait_ms,
        };
    }

    fn next_channel(&mut self, now_ms: u64, index: usize) -> DiscoveryEvent {
        if index + 1 < SWEEP.len() {
            self.phase = Phase::Hop { index: index + 1 };
            return DiscoveryEvent::None;
        }
        self.stats.sweeps_failed += 1;
        self.stats.consecutive_failures += 1;
        let consecutive = self.stats.consecutive_failures;
        let wait = self.backoff_ms(consecutive);
        self.phase = Phase::Backoff {
            until: now_ms + wait,
        };
        log::warn!(
            "discovery: sweep failed ({} in a row), retrying in {} ms",
            consecutive,
            wait
        );
        DiscoveryEvent::SweepFailed { consecutive }
    }

    fn commit<R: LinkRadio>(
        &mut self,
        now_ms: u64,
        ack: MatchedAck,
        radio: &mut R,
        channels: &mut ChannelManager,
        peers: &mut PeerTable,
    ) -> Result<DiscoveryEvent, DiscoveryError> {
        channels.lock(radio, ack.channel, owner::DISCOVERY)?;
        if let Err(e) = peers.add(radio, ack.src, ack.channel) {
            let _ = channels.unlock(owner::DISCOVERY);
            return Err(e.into());
        }
        self.phase = Phase::Locked;
        self.stats.consecutive_failures = 0;
        self.stats.last_lock_channel = ack.channel;
        self.stats.last_lock_ms = now_ms;
        log::info!("discovery: locked to channel {} with {}", ack.channel, ack.src);
        Ok(DiscoveryEvent::Locked {
            peer: ack.src,
            channel: ack.channel,
        })
    }

    /// Wait before the next sweep: base doubled per failure, capped
    pub fn backoff_ms(&self, consecutive_failures: u32) -> u64 {
        let shift = consecutive_failures.saturating_sub(1).min(16);
        self.config
            .backoff_base_ms
            .saturating_mul(1 << shift)
            .min(self.config.backoff_max_ms)
    }
}

/// Receiver side of discovery: register the prober and echo its sequence
pub fn answer_probe<R: LinkRadio>(
    radio: &mut R,
    peers: &mut PeerTable,
    channels: &ChannelManager,
    src: MacAddress,
    seq: u32,
) -> Result<(), DiscoveryError> {
    let channel = channels.current();
    let registered = peers
        .current()
        .is_some_and(|p| p.addr == src && p.channel == channel);
    if !registered {
        peers.add(radio, src, channel)?;
    }
    let bytes = encode_datagram(&Frame::Ack { seq, channel })?;
    radio.send(&src, &bytes)?;
    log::debug!("discovery: answered probe {:#010x} from {}", seq, src);
    Ok(())
}
