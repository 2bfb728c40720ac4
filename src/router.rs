//! Inbound frame routing
//!
//! Decodes datagrams, reassembles fragments, filters frames from strangers and
//! hands telemetry payloads to application hooks keyed by their first byte.
//! Control and configuration frames are returned to the caller, which owns
//! the session and beacon state.
//!
//! Malformed input is dropped and counted; the matching log line is rate
//! limited so a noisy neighbour cannot flood the log.

use heapless::Vec;

use crate::config::router::{LOG_INTERVAL_MS, MAX_HOOKS};
use crate::protocol::framing::{Reassembler, ReassemblyStats};
use crate::protocol::{decode, CodecError, Frame, MacAddress};

/// Application payload hook: source address and the full payload
pub type PayloadHook = fn(&MacAddress, &[u8]);

/// Data categories carried in the first payload byte
pub mod subtype {
    pub const SETTINGS: u8 = 1;
    pub const SYSTEM_INFO: u8 = 2;
    pub const EVENTS: u8 = 3;
    pub const LOGS: u8 = 4;
    pub const CELL_INFO: u8 = 5;
    pub const POWER_PROFILE: u8 = 6;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub frames: u32,
    pub bad_checksum: u32,
    pub too_short: u32,
    pub unknown_tag: u32,
    pub length_mismatch: u32,
    pub invalid_field: u32,
    pub foreign_frames: u32,
    pub payloads_delivered: u32,
    pub payloads_unhandled: u32,
    pub watchdog_fired: u32,
}

/// What became of one datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Routed {
    /// Malformed or not for us
    Dropped,
    /// A fragment was stored; the message is not complete yet
    Partial,
    Frame(Frame),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ErrorKind {
    Checksum,
    Short,
    Tag,
    Length,
    Field,
}

const ERROR_KINDS: usize = 5;

/// Allows one event per interval
#[derive(Debug, Clone, Copy)]
struct RateLimit {
    last_ms: Option<u64>,
    suppressed: u32,
}

impl RateLimit {
    const fn new() -> Self {
        Self {
            last_ms: None,
            suppressed: 0,
        }
    }

    /// `Some(n)` when allowed, with the number of events suppressed since
    fn allow(&mut self, now_ms: u64) -> Option<u32> {
        let open = match self.last_ms {
            Some(last) => now_ms.saturating_sub(last) >= LOG_INTERVAL_MS,
            None => true,
        };
        if open {
            self.last_ms = Some(now_ms);
            Some(core::mem::take(&mut self.suppressed))
        } else {
            self.suppressed += 1;
            None
        }
    }
}

pub struct Router {
    reassembler: Reassembler,
    hooks: Vec<(u8, PayloadHook), MAX_HOOKS>,
    default_hook: Option<PayloadHook>,
    limits: [RateLimit; ERROR_KINDS],
    last_peer_rx_ms: Option<u64>,
    disconnect_ms: u64,
    stats: RouterStats,
}

impl Router {
    pub fn new(disconnect_ms: u64) -> Self {
        Self {
            reassembler: Reassembler::new(),
            hooks: Vec::new(),
            default_hook: None,
            limits: [RateLimit::new(); ERROR_KINDS],
            last_peer_rx_ms: None,
            disconnect_ms,
            stats: RouterStats::default(),
        }
    }

    pub fn stats(&self) -> RouterStats {
        self.stats
    }

    pub fn reassembly_stats(&self) -> ReassemblyStats {
        self.reassembler.stats()
    }

    /// Register `hook` for payloads whose first byte is `subtype`
    ///
    /// Replaces an existing hook for the same subtype. Returns false when the
    /// table is full.
    pub fn register_hook(&mut self, subtype: u8, hook: PayloadHook) -> bool {
        if let Some(entry) = self.hooks.iter_mut().find(|(s, _)| *s == subtype) {
            entry.1 = hook;
            return true;
        }
        if self.hooks.push((subtype, hook)).is_err() {
            log::warn!("router: no room for subtype {} hook", subtype);
            return false;
        }
        true
    }

    /// Hook for payloads no subtype hook claims
    pub fn set_default_hook(&mut self, hook: PayloadHook) {
        self.default_hook = Some(hook);
    }

    /// Decode and route one datagram from `src`
    ///
    /// `peer` is the currently registered peer. Anything but discovery
    /// frames from another address is dropped.
    pub fn route(
        &mut self,
        now_ms: u64,
        src: MacAddress,
        data: &[u8],
        peer: Option<MacAddress>,
    ) -> Routed {
        let frame = match decode(data) {
            Ok(frame) => frame,
            Err(e) => {
                self.reject(now_ms, src, e);
                return Routed::Dropped;
            }
        };
        self.stats.frames += 1;

        let discovery = matches!(frame, Frame::Probe { .. } | Frame::Ack { .. });
        if !discovery && peer != Some(src) {
            self.stats.foreign_frames += 1;
            log::trace!("router: {:?} from non-peer {}", frame.tag(), src);
            return Routed::Dropped;
        }
        if !discovery {
            self.last_peer_rx_ms = Some(now_ms);
        }

        let frame = match frame {
            Frame::Fragment {
                seq,
                index,
                total,
                bytes,
            } => match self.reassembler.push(now_ms, src, seq, index, total, &bytes) {
                Ok(None) => return Routed::Partial,
                Ok(Some(message)) => match decode(&message) {
                    Ok(Frame::Fragment { .. }) => {
                        self.reject(now_ms, src, CodecError::InvalidField);
                        return Routed::Dropped;
                    }
                    Ok(inner) => inner,
                    Err(e) => {
                        self.reject(now_ms, src, e);
                        return Routed::Dropped;
                    }
                },
                Err(e) => {
                    self.reject(now_ms, src, e);
                    return Routed::Dropped;
                }
            },
            other => other,
        };

        if let Frame::TransientData { payload } = &frame {
            self.deliver(&src, payload);
        }
        Routed::Frame(frame)
    }

    fn deliver(&mut self, src: &MacAddress, payload: &[u8]) {
        let hook = payload
            .first()
            .and_then(|sub| self.hooks.iter().find(|(s, _)| s == sub))
            .map(|(_, hook)| *hook)
            .or(self.default_hook);
        match hook {
            Some(hook) => {
                hook(src, payload);
                self.stats.payloads_delivered += 1;
            }
            None => self.stats.payloads_unhandled += 1,
        }
    }

    fn reject(&mut self, now_ms: u64, src: MacAddress, error: CodecError) {
        let kind = match error {
            CodecError::BadChecksum => {
                self.stats.bad_checksum += 1;
                ErrorKind::Checksum
            }
            CodecError::TooShort => {
                self.stats.too_short += 1;
                ErrorKind::Short
            }
            CodecError::UnknownTag(_) => {
                self.stats.unknown_tag += 1;
                ErrorKind::Tag
            }
            CodecError::LengthMismatch | CodecError::TooLarge => {
                self.stats.length_mismatch += 1;
                ErrorKind::Length
            }
            CodecError::InvalidField => {
                self.stats.invalid_field += 1;
                ErrorKind::Field
            }
        };
        if let Some(suppressed) = self.limits[kind as usize].allow(now_ms) {
            if suppressed > 0 {
                log::warn!("router: {} from {} ({} more suppressed)", error, src, suppressed);
            } else {
                log::warn!("router: {} from {}", error, src);
            }
        }
    }

    /// Start the connection watchdog from `now_ms`
    pub fn arm_watchdog(&mut self, now_ms: u64) {
        self.last_peer_rx_ms = Some(now_ms);
    }

    /// Link torn down: stop watching and drop partial messages
    pub fn reset(&mut self) {
        self.last_peer_rx_ms = None;
        self.reassembler.clear();
    }

    /// True once when nothing has come from the peer for the disconnect time
    pub fn watchdog(&mut self, now_ms: u64) -> bool {
        match self.last_peer_rx_ms {
            Some(last) if now_ms.saturating_sub(last) >= self.disconnect_ms => {
                self.last_peer_rx_ms = None;
                self.stats.watchdog_fired += 1;
                log::warn!("router: no frame from peer for {} ms", now_ms - last);
                true
            }
            _ => false,
        }
    }
}
