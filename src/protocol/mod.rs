//! Link frame protocol: types, codec, checksums, fragmentation, versions

pub mod checksum;
pub mod codec;
pub mod frame;
pub mod framing;
pub mod version;

pub use codec::{decode, encode, encode_datagram, CodecError, Encoded};
pub use frame::{
    Frame, FrameTag, FwMeta, Heartbeat, HeartbeatAck, MacAddress, RuntimeFlags, SectionId,
    SessionState, TimeSource, VersionBeacon,
};
