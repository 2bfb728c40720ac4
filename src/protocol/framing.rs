//! Fragmentation of messages larger than the radio MTU
//!
//! A logical message is the encoded frame followed by a little-endian 16-bit
//! byte sum. It is cut into `Fragment` frames of [`FRAGMENT_CHUNK`] bytes
//! (the last one shorter). The receiving side reassembles per `(seq, source)`.

use heapless::Vec;

use crate::config::framing::{MAX_PARTIAL, PARTIAL_TIMEOUT_MS};
use crate::config::link::MAX_MESSAGE;
use crate::protocol::checksum::byte_sum16;
use crate::protocol::codec::{CodecError, Encoded};
use crate::protocol::frame::{Frame, MacAddress, FRAGMENT_CHUNK};

/// Largest logical message including its trailing sum
const MAX_LOGICAL: usize = MAX_MESSAGE + 2;

/// Most fragments a single message can need
pub const MAX_FRAGMENTS: usize = MAX_LOGICAL.div_ceil(FRAGMENT_CHUNK);

/// Splits oversized messages into fragment frames
pub struct Fragmenter {
    next_seq: u32,
}

impl Fragmenter {
    pub fn new(initial_seq: u32) -> Self {
        Self {
            next_seq: initial_seq,
        }
    }

    /// Sequence number the next message will carry
    pub fn peek_seq(&self) -> u32 {
        self.next_seq
    }

    /// Cut `message` into fragments sharing one fresh sequence number
    pub fn split(&mut self, message: &[u8]) -> Result<Vec<Frame, MAX_FRAGMENTS>, CodecError> {
        let mut logical: Vec<u8, MAX_LOGICAL> = Vec::new();
        logical
            .extend_from_slice(message)
            .map_err(|_| CodecError::TooLarge)?;
        logical
            .extend_from_slice(&byte_sum16(message).to_le_bytes())
            .map_err(|_| CodecError::TooLarge)?;

        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);

        let total = logical.len().div_ceil(FRAGMENT_CHUNK) as u16;
        let mut frames = Vec::new();
        for (index, chunk) in logical.chunks(FRAGMENT_CHUNK).enumerate() {
            let mut bytes = Vec::new();
            bytes
                .extend_from_slice(chunk)
                .map_err(|_| CodecError::TooLarge)?;
            frames
                .push(Frame::Fragment {
                    seq,
                    index: index as u16,
                    total,
                    bytes,
                })
                .map_err(|_| CodecError::TooLarge)?;
        }
        Ok(frames)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReassemblyStats {
    pub completed: u32,
    pub duplicates: u32,
    pub expired: u32,
    pub evicted: u32,
    pub checksum_failures: u32,
    pub malformed: u32,
}

struct Partial {
    src: MacAddress,
    seq: u32,
    total: u16,
    received: u32,
    started_at: u64,
    len: usize,
    buffer: [u8; MAX_LOGICAL],
}

impl Partial {
    fn complete(&self) -> bool {
        self.received.count_ones() == self.total as u32
    }
}

/// Collects fragments until a message is whole
pub struct Reassembler {
    partials: Vec<Partial, MAX_PARTIAL>,
    stats: ReassemblyStats,
}

impl Reassembler {
    pub fn new() -> Self {
        Self {
            partials: Vec::new(),
            stats: ReassemblyStats::default(),
        }
    }

    pub fn stats(&self) -> ReassemblyStats {
        self.stats
    }

    pub fn in_flight(&self) -> usize {
        self.partials.len()
    }

    /// Drop partial messages that have waited too long
    pub fn expire(&mut self, now_ms: u64) {
        let before = self.partials.len();
        self.partials
            .retain(|p| now_ms.saturating_sub(p.started_at) < PARTIAL_TIMEOUT_MS);
        self.stats.expired += (before - self.partials.len()) as u32;
    }

    /// Feed one fragment
    ///
    /// Returns the message without its trailing sum once every index of
    /// `(seq, src)` has arrived.
    pub fn push(
        &mut self,
        now_ms: u64,
        src: MacAddress,
        seq: u32,
        index: u16,
        total: u16,
        bytes: &[u8],
    ) -> Result<Option<Encoded>, CodecError> {
        self.expire(now_ms);

        let max_total = MAX_FRAGMENTS as u16;
        if total == 0 || total > max_total || index >= total {
            self.stats.malformed += 1;
            return Err(CodecError::InvalidField);
        }
        let is_last = index + 1 == total;
        if (!is_last && bytes.len() != FRAGMENT_CHUNK) || bytes.len() > FRAGMENT_CHUNK {
            self.stats.malformed += 1;
            return Err(CodecError::LengthMismatch);
        }

        let pos = match self.position(src, seq) {
            Some(pos) => pos,
            None => self.open(now_ms, src, seq, total),
        };

        let partial = &mut self.partials[pos];
        if partial.total != total {
            self.partials.swap_remove(pos);
            self.stats.malformed += 1;
            return Err(CodecError::LengthMismatch);
        }

        let bit = 1u32 << index;
        if partial.received & bit != 0 {
            self.stats.duplicates += 1;
            return Ok(None);
        }

        let offset = index as usize * FRAGMENT_CHUNK;
        let end = offset + bytes.len();
        if end > MAX_LOGICAL {
            self.partials.swap_remove(pos);
            self.stats.malformed += 1;
            return Err(CodecError::TooLarge);
        }
        partial.buffer[offset..end].copy_from_slice(bytes);
        partial.received |= bit;
        if is_last {
            partial.len = end;
        }

        if !partial.complete() {
            return Ok(None);
        }

        let done = self.partials.swap_remove(pos);
        if done.len < 2 {
            self.stats.malformed += 1;
            return Err(CodecError::TooShort);
        }
        let body = &done.buffer[..done.len - 2];
        let sum = u16::from_le_bytes([done.buffer[done.len - 2], done.buffer[done.len - 1]]);
        if byte_sum16(body) != sum {
            self.stats.checksum_failures += 1;
            return Err(CodecError::BadChecksum);
        }

        let mut message = Encoded::new();
        message
            .extend_from_slice(body)
            .map_err(|_| CodecError::TooLarge)?;
        self.stats.completed += 1;
        Ok(Some(message))
    }

    /// Forget everything in flight (peer changed)
    pub fn clear(&mut self) {
        self.partials.clear();
    }

    fn position(&self, src: MacAddress, seq: u32) -> Option<usize> {
        self.partials
            .iter()
            .position(|p| p.src == src && p.seq == seq)
    }

    fn open(&mut self, now_ms: u64, src: MacAddress, seq: u32, total: u16) -> usize {
        if self.partials.is_full() {
            if let Some((oldest, _)) = self
                .partials
                .iter()
                .enumerate()
                .min_by_key(|(_, p)| p.started_at)
            {
                self.partials.swap_remove(oldest);
                self.stats.evicted += 1;
            }
        }
        let _ = self.partials.push(Partial {
            src,
            seq,
            total,
            received: 0,
            started_at: now_ms,
            len: 0,
            buffer: [0; MAX_LOGICAL],
        });
        self.partials.len() - 1
    }
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}
