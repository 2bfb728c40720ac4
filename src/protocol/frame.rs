//! Link frame types
//!
//! # Wire layout
//!
//! Every frame starts with a one byte tag. Multi-byte fields are little-endian.
//!
//! ```text
//! 0x01 Probe             tag | u32 seq
//! 0x02 Ack               tag | u32 seq | u8 channel
//! 0x10 Heartbeat         tag | u32 seq | u32 uptime_ms | u64 unix_time
//!                        | u8 source | u8 state | i8 rssi | u8 flags | u16 crc16
//! 0x11 HeartbeatAck      tag | u32 ack_seq | u32 uptime_ms | u8 state | u16 crc16
//! 0x20 TransientData     tag | u8 len | bytes[len]
//! 0x30 VersionBeacon     tag | u8 nsec | { u8 id | u32 ver } x nsec | u8 flags | FwMeta
//! 0x31 ConfigSectionReq  tag | u8 section | u32 requested_version
//! 0x32 ConfigSection     tag | u8 section | u32 version | u16 len | bytes[len]
//! 0x40 Fragment          tag | u32 seq | u16 index | u16 total | u16 len | bytes[len]
//! ```
//!
//! `FwMeta` is `u8 major | u8 minor | u8 patch | u8 env_len | env[env_len]`.
//! Checksums are the last two bytes of a frame and cover every byte before them.

use core::fmt;

use bitflags::bitflags;
use heapless::{String, Vec};

use crate::config::{firmware, link, settings::MAX_SECTION_BYTES, settings::N_SECTIONS};

/// Bytes of section data that fit in one fragment
pub const FRAGMENT_CHUNK: usize = link::MTU - 11;

/// Frame tags
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameTag {
    Probe = 0x01,
    Ack = 0x02,
    Heartbeat = 0x10,
    HeartbeatAck = 0x11,
    TransientData = 0x20,
    VersionBeacon = 0x30,
    ConfigSectionRequest = 0x31,
    ConfigSection = 0x32,
    Fragment = 0x40,
}

impl FrameTag {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(Self::Probe),
            0x02 => Some(Self::Ack),
            0x10 => Some(Self::Heartbeat),
            0x11 => Some(Self::HeartbeatAck),
            0x20 => Some(Self::TransientData),
            0x30 => Some(Self::VersionBeacon),
            0x31 => Some(Self::ConfigSectionRequest),
            0x32 => Some(Self::ConfigSection),
            0x40 => Some(Self::Fragment),
            _ => None,
        }
    }
}

/// 6-byte radio hardware address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddress(pub [u8; link::ADDR_LEN]);

impl MacAddress {
    /// All-ones address, only used while discovering
    pub const BROADCAST: Self = Self([0xFF; link::ADDR_LEN]);

    pub const fn new(bytes: [u8; link::ADDR_LEN]) -> Self {
        Self(bytes)
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn as_bytes(&self) -> &[u8; link::ADDR_LEN] {
        &self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

/// Connection state, owned by the session state machine
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle = 0,
    Connecting = 1,
    Connected = 2,
    Degraded = 3,
    Failure = 4,
    Disconnected = 5,
}

impl SessionState {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Idle),
            1 => Some(Self::Connecting),
            2 => Some(Self::Connected),
            3 => Some(Self::Degraded),
            4 => Some(Self::Failure),
            5 => Some(Self::Disconnected),
            _ => None,
        }
    }

    /// States in which a peer is locked and keep-alive runs
    pub fn is_linked(&self) -> bool {
        matches!(self, Self::Connected | Self::Degraded | Self::Failure)
    }
}

/// Where the node's wall clock came from
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TimeSource {
    #[default]
    Unsynced = 0,
    Ntp = 1,
    Manual = 2,
    Gps = 3,
}

impl TimeSource {
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Unsynced),
            1 => Some(Self::Ntp),
            2 => Some(Self::Manual),
            3 => Some(Self::Gps),
            _ => None,
        }
    }
}

/// Configuration section identifiers
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SectionId {
    Network = 0,
    Mqtt = 1,
    Battery = 2,
}

impl SectionId {
    pub const ALL: [SectionId; N_SECTIONS] = [Self::Network, Self::Mqtt, Self::Battery];

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Network),
            1 => Some(Self::Mqtt),
            2 => Some(Self::Battery),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// Persistent store key for this section
    pub fn key(self) -> &'static str {
        match self {
            Self::Network => "net",
            Self::Mqtt => "mqtt",
            Self::Battery => "battery",
        }
    }
}

bitflags! {
    /// Runtime status bits published in beacons and heartbeats
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct RuntimeFlags: u8 {
        const MQTT_CONNECTED = 0x01;
        const UPLINK_UP = 0x02;
        const TIME_SYNCED = 0x04;
    }
}

/// Firmware identity carried in every beacon
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FwMeta {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
    pub env: String<{ firmware::MAX_ENV_NAME }>,
}

impl FwMeta {
    /// Identity of the running build
    pub fn current() -> Self {
        let mut env = String::new();
        for c in firmware::ENV_NAME.chars() {
            if env.push(c).is_err() {
                break;
            }
        }
        Self {
            major: firmware::VERSION_MAJOR,
            minor: firmware::VERSION_MINOR,
            patch: firmware::VERSION_PATCH,
            env,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    pub seq: u32,
    pub uptime_ms: u32,
    pub unix_time: u64,
    pub source: TimeSource,
    pub state: SessionState,
    pub rssi: i8,
    pub flags: RuntimeFlags,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatAck {
    pub ack_seq: u32,
    pub uptime_ms: u32,
    pub state: SessionState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionBeacon {
    pub versions: [u32; N_SECTIONS],
    pub flags: RuntimeFlags,
    pub meta: FwMeta,
}

/// Decoded link frame
///
/// Checksums are not part of the decoded value: the codec computes them on
/// encode and verifies them on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Probe {
        seq: u32,
    },
    Ack {
        seq: u32,
        channel: u8,
    },
    Heartbeat(Heartbeat),
    HeartbeatAck(HeartbeatAck),
    TransientData {
        payload: Vec<u8, { link::MAX_PAYLOAD }>,
    },
    VersionBeacon(VersionBeacon),
    ConfigSectionRequest {
        section: SectionId,
        requested_version: u32,
    },
    ConfigSection {
        section: SectionId,
        version: u32,
        bytes: Vec<u8, MAX_SECTION_BYTES>,
    },
    Fragment {
        seq: u32,
        index: u16,
        total: u16,
        bytes: Vec<u8, FRAGMENT_CHUNK>,
    },
}

impl Frame {
    pub fn tag(&self) -> FrameTag {
        match self {
            Frame::Probe { .. } => FrameTag::Probe,
            Frame::Ack { .. } => FrameTag::Ack,
            Frame::Heartbeat(_) => FrameTag::Heartbeat,
            Frame::HeartbeatAck(_) => FrameTag::HeartbeatAck,
            Frame::TransientData { .. } => FrameTag::TransientData,
            Frame::VersionBeacon(_) => FrameTag::VersionBeacon,
            Frame::ConfigSectionRequest { .. } => FrameTag::ConfigSectionRequest,
            Frame::ConfigSection { .. } => FrameTag::ConfigSection,
            Frame::Fragment { .. } => FrameTag::Fragment,
        }
    }
}
