//! Frame codec
//!
//! The only place that knows the wire layout. See [`crate::protocol::frame`]
//! for the byte-level description of each frame.

use core::fmt;

use heapless::{String, Vec};

use crate::config::link::{MAX_MESSAGE, MTU};
use crate::config::settings::N_SECTIONS;
use crate::protocol::checksum::{crc16, verify_trailing_crc};
use crate::protocol::frame::{
    Frame, FrameTag, FwMeta, Heartbeat, HeartbeatAck, RuntimeFlags, SectionId, SessionState,
    TimeSource, VersionBeacon,
};

/// Encoded frame or logical message
pub type Encoded = Vec<u8, MAX_MESSAGE>;

const PROBE_LEN: usize = 5;
const ACK_LEN: usize = 6;
const HEARTBEAT_LEN: usize = 23;
const HEARTBEAT_ACK_LEN: usize = 12;
const SECTION_REQ_LEN: usize = 6;
const SECTION_HEADER_LEN: usize = 8;
const FRAGMENT_HEADER_LEN: usize = 11;

/// Reasons a frame is rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CodecError {
    /// Fewer bytes than the layout needs
    TooShort,
    /// First byte is not a known tag
    UnknownTag(u8),
    /// A length field disagrees with the bytes present
    LengthMismatch,
    /// Checksum does not match the frame contents
    BadChecksum,
    /// An enumerated field holds a value outside its range
    InvalidField,
    /// Encoded form does not fit the output buffer
    TooLarge,
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::TooShort => write!(f, "frame too short"),
            CodecError::UnknownTag(tag) => write!(f, "unknown tag 0x{:02X}", tag),
            CodecError::LengthMismatch => write!(f, "length mismatch"),
            CodecError::BadChecksum => write!(f, "bad checksum"),
            CodecError::InvalidField => write!(f, "invalid field value"),
            CodecError::TooLarge => write!(f, "frame too large"),
        }
    }
}

/// Cursor over a received frame
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], CodecError> {
        let end = self.pos.checked_add(n).ok_or(CodecError::TooShort)?;
        if end > self.buf.len() {
            return Err(CodecError::TooShort);
        }
        let out = &self.buf[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, CodecError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, CodecError> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, CodecError> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u64(&mut self) -> Result<u64, CodecError> {
        let b = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(b);
        Ok(u64::from_le_bytes(raw))
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Trailing bytes after a complete layout are a length error
    fn finish(&self) -> Result<(), CodecError> {
        if self.remaining() == 0 {
            Ok(())
        } else {
            Err(CodecError::LengthMismatch)
        }
    }
}

fn put(out: &mut Encoded, bytes: &[u8]) -> Result<(), CodecError> {
    out.extend_from_slice(bytes).map_err(|_| CodecError::TooLarge)
}

fn put_u8(out: &mut Encoded, byte: u8) -> Result<(), CodecError> {
    out.push(byte).map_err(|_| CodecError::TooLarge)
}

/// Encode a frame into its wire form
///
/// The result may exceed the MTU only for `ConfigSection`; callers split
/// those with [`crate::protocol::framing::Fragmenter`].
pub fn encode(frame: &Frame) -> Result<Encoded, CodecError> {
    let mut out = Encoded::new();
    put_u8(&mut out, frame.tag() as u8)?;

    match frame {
        Frame::Probe { seq } => put(&mut out, &seq.to_le_bytes())?,
        Frame::Ack { seq, channel } => {
            put(&mut out, &seq.to_le_bytes())?;
            put_u8(&mut out, *channel)?;
        }
        Frame::Heartbeat(hb) => {
            put(&mut out, &hb.seq.to_le_bytes())?;
            put(&mut out, &hb.uptime_ms.to_le_bytes())?;
            put(&mut out, &hb.unix_time.to_le_bytes())?;
            put_u8(&mut out, hb.source as u8)?;
            put_u8(&mut out, hb.state as u8)?;
            put_u8(&mut out, hb.rssi as u8)?;
            put_u8(&mut out, hb.flags.bits())?;
            let crc = crc16(&out);
            put(&mut out, &crc.to_le_bytes())?;
        }
        Frame::HeartbeatAck(ack) => {
            put(&mut out, &ack.ack_seq.to_le_bytes())?;
            put(&mut out, &ack.uptime_ms.to_le_bytes())?;
            put_u8(&mut out, ack.state as u8)?;
            let crc = crc16(&out);
            put(&mut out, &crc.to_le_bytes())?;
        }
        Frame::TransientData { payload } => {
            put_u8(&mut out, payload.len() as u8)?;
            put(&mut out, payload)?;
        }
        Frame::VersionBeacon(beacon) => {
            put_u8(&mut out, N_SECTIONS as u8)?;
            for section in SectionId::ALL {
                put_u8(&mut out, section as u8)?;
                put(&mut out, &beacon.versions[section.index()].to_le_bytes())?;
            }
            put_u8(&mut out, beacon.flags.bits())?;
            put_u8(&mut out, beacon.meta.major)?;
            put_u8(&mut out, beacon.meta.minor)?;
            put_u8(&mut out, beacon.meta.patch)?;
            put_u8(&mut out, beacon.meta.env.len() as u8)?;
            put(&mut out, beacon.meta.env.as_bytes())?;
        }
        Frame::ConfigSectionRequest {
            section,
            requested_version,
        } => {
            put_u8(&mut out, *section as u8)?;
            put(&mut out, &requested_version.to_le_bytes())?;
        }
        Frame::ConfigSection {
            section,
            version,
            bytes,
        } => {
            put_u8(&mut out, *section as u8)?;
            put(&mut out, &version.to_le_bytes())?;
            put(&mut out, &(bytes.len() as u16).to_le_bytes())?;
            put(&mut out, bytes)?;
        }
        Frame::Fragment {
            seq,
            index,
            total,
            bytes,
        } => {
            put(&mut out, &seq.to_le_bytes())?;
            put(&mut out, &index.to_le_bytes())?;
            put(&mut out, &total.to_le_bytes())?;
            put(&mut out, &(bytes.len() as u16).to_le_bytes())?;
            put(&mut out, bytes)?;
        }
    }

    Ok(out)
}

/// Encode a frame that must fit a single radio datagram
pub fn encode_datagram(frame: &Frame) -> Result<Encoded, CodecError> {
    let out = encode(frame)?;
    if out.len() > MTU {
        return Err(CodecError::TooLarge);
    }
    Ok(out)
}

/// Decode one frame or one reassembled message
pub fn decode(data: &[u8]) -> Result<Frame, CodecError> {
    let mut r = Reader::new(data);
    let tag_byte = r.u8()?;
    let tag = FrameTag::from_byte(tag_byte).ok_or(CodecError::UnknownTag(tag_byte))?;

    let frame = match tag {
        FrameTag::Probe => {
            expect_len(data, PROBE_LEN)?;
            Frame::Probe { seq: r.u32()? }
        }
        FrameTag::Ack => {
            expect_len(data, ACK_LEN)?;
            Frame::Ack {
                seq: r.u32()?,
                channel: r.u8()?,
            }
        }
        FrameTag::Heartbeat => {
            expect_len(data, HEARTBEAT_LEN)?;
            if !verify_trailing_crc(data) {
                return Err(CodecError::BadChecksum);
            }
            let seq = r.u32()?;
            let uptime_ms = r.u32()?;
            let unix_time = r.u64()?;
            let source = TimeSource::from_byte(r.u8()?).ok_or(CodecError::InvalidField)?;
            let state = SessionState::from_byte(r.u8()?).ok_or(CodecError::InvalidField)?;
            let rssi = r.u8()? as i8;
            let flags = RuntimeFlags::from_bits_truncate(r.u8()?);
            r.u16()?;
            Frame::Heartbeat(Heartbeat {
                seq,
                uptime_ms,
                unix_time,
                source,
                state,
                rssi,
                flags,
            })
        }
        FrameTag::HeartbeatAck => {
            expect_len(data, HEARTBEAT_ACK_LEN)?;
            if !verify_trailing_crc(data) {
                return Err(CodecError::BadChecksum);
            }
            let ack_seq = r.u32()?;
            let uptime_ms = r.u32()?;
            let state = SessionState::from_byte(r.u8()?).ok_or(CodecError::InvalidField)?;
            r.u16()?;
            Frame::HeartbeatAck(HeartbeatAck {
                ack_seq,
                uptime_ms,
                state,
            })
        }
        FrameTag::TransientData => {
            let len = r.u8()? as usize;
            let bytes = r.take(len).map_err(|_| CodecError::LengthMismatch)?;
            let mut payload = Vec::new();
            payload
                .extend_from_slice(bytes)
                .map_err(|_| CodecError::LengthMismatch)?;
            Frame::TransientData { payload }
        }
        FrameTag::VersionBeacon => Frame::VersionBeacon(decode_beacon(&mut r)?),
        FrameTag::ConfigSectionRequest => {
            expect_len(data, SECTION_REQ_LEN)?;
            let section = SectionId::from_byte(r.u8()?).ok_or(CodecError::InvalidField)?;
            Frame::ConfigSectionRequest {
                section,
                requested_version: r.u32()?,
            }
        }
        FrameTag::ConfigSection => {
            if data.len() < SECTION_HEADER_LEN {
                return Err(CodecError::TooShort);
            }
            let section = SectionId::from_byte(r.u8()?).ok_or(CodecError::InvalidField)?;
            let version = r.u32()?;
            let len = r.u16()? as usize;
            let body = r.take(len).map_err(|_| CodecError::LengthMismatch)?;
            let mut bytes = Vec::new();
            bytes
                .extend_from_slice(body)
                .map_err(|_| CodecError::LengthMismatch)?;
            Frame::ConfigSection {
                section,
                version,
                bytes,
            }
        }
        FrameTag::Fragment => {
            if data.len() < FRAGMENT_HEADER_LEN {
                return Err(CodecError::TooShort);
            }
            let seq = r.u32()?;
            let index = r.u16()?;
            let total = r.u16()?;
            let len = r.u16()? as usize;
            let body = r.take(len).map_err(|_| CodecError::LengthMismatch)?;
            if total == 0 || index >= total {
                return Err(CodecError::InvalidField);
            }
            let mut bytes = Vec::new();
            bytes
                .extend_from_slice(body)
                .map_err(|_| CodecError::LengthMismatch)?;
            Frame::Fragment {
                seq,
                index,
                total,
                bytes,
            }
        }
    };

    r.finish()?;
    Ok(frame)
}

fn expect_len(data: &[u8], len: usize) -> Result<(), CodecError> {
    if data.len() < len {
        Err(CodecError::TooShort)
    } else if data.len() > len {
        Err(CodecError::LengthMismatch)
    } else {
        Ok(())
    }
}

fn decode_beacon(r: &mut Reader<'_>) -> Result<VersionBeacon, CodecError> {
    let nsec = r.u8()? as usize;
    let mut versions = [0u32; N_SECTIONS];
    for _ in 0..nsec {
        let id = r.u8()?;
        let version = r.u32()?;
        // Sections this build does not know about are skipped
        if let Some(section) = SectionId::from_byte(id) {
            versions[section.index()] = version;
        }
    }
    let flags = RuntimeFlags::from_bits_truncate(r.u8()?);
    let major = r.u8()?;
    let minor = r.u8()?;
    let patch = r.u8()?;
    let env_len = r.u8()? as usize;
    let env_bytes = r.take(env_len).map_err(|_| CodecError::LengthMismatch)?;
    let env_str = core::str::from_utf8(env_bytes).map_err(|_| CodecError::InvalidField)?;
    let mut env = String::new();
    env.push_str(env_str).map_err(|_| CodecError::LengthMismatch)?;

    Ok(VersionBeacon {
        versions,
        flags,
        meta: FwMeta {
            major,
            minor,
            patch,
            env,
        },
    })
}
