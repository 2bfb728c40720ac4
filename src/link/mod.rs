//! Peer registration and channel ownership

pub mod channel;
pub mod peer_table;

pub use channel::{owner, ChannelError, ChannelManager};
pub use peer_table::{Peer, PeerError, PeerTable};
