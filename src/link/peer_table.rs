//! Registered peer bookkeeping
//!
//! The radio keeps its own peer registry; this wrapper enforces that at most
//! one non-broadcast peer is registered at a time.

use core::fmt;

use crate::protocol::MacAddress;
use crate::radio::{LinkRadio, RadioError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerError {
    Radio(RadioError),
    /// The broadcast address is managed by `add_broadcast`
    BroadcastNotAllowed,
}

impl From<RadioError> for PeerError {
    fn from(e: RadioError) -> Self {
        PeerError::Radio(e)
    }
}

impl fmt::Display for PeerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerError::Radio(e) => write!(f, "radio: {}", e),
            PeerError::BroadcastNotAllowed => write!(f, "broadcast address not allowed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Peer {
    pub addr: MacAddress,
    pub channel: u8,
}

#[derive(Debug, Default)]
pub struct PeerTable {
    peer: Option<Peer>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self { peer: None }
    }

    /// The single remote peer, if any
    pub fn current(&self) -> Option<Peer> {
        self.peer
    }

    /// Register `addr` on `channel`, replacing any previous peer
    pub fn add<R: LinkRadio>(
        &mut self,
        radio: &mut R,
        addr: MacAddress,
        channel: u8,
    ) -> Result<(), PeerError> {
        if addr.is_broadcast() {
            return Err(PeerError::BroadcastNotAllowed);
        }
        if let Some(old) = self.peer.take() {
            if radio.is_peer_registered(&old.addr) {
                if let Err(e) = radio.remove_peer(&old.addr) {
                    log::warn!("peers: removing {} failed: {}", old.addr, e);
                }
            }
        }
        if radio.is_peer_registered(&addr) {
            radio.remove_peer(&addr)?;
        }
        radio.add_peer(&addr, channel)?;
        self.peer = Some(Peer { addr, channel });
        log::info!("peers: registered {} on channel {}", addr, channel);
        Ok(())
    }

    pub fn remove<R: LinkRadio>(&mut self, radio: &mut R, addr: MacAddress) -> Result<(), PeerError> {
        if self.peer.is_some_and(|p| p.addr == addr) {
            self.peer = None;
        }
        if radio.is_peer_registered(&addr) {
            radio.remove_peer(&addr)?;
            log::info!("peers: removed {}", addr);
        }
        Ok(())
    }

    /// Remove whatever peer is registered
    pub fn clear<R: LinkRadio>(&mut self, radio: &mut R) -> Result<(), PeerError> {
        match self.peer {
            Some(peer) => self.remove(radio, peer.addr),
            None => Ok(()),
        }
    }

    pub fn exists<R: LinkRadio>(&self, radio: &R, addr: MacAddress) -> bool {
        radio.is_peer_registered(&addr)
    }

    /// Register the broadcast address on the current channel if missing
    pub fn add_broadcast<R: LinkRadio>(&mut self, radio: &mut R) -> Result<(), PeerError> {
        if !radio.is_peer_registered(&MacAddress::BROADCAST) {
            radio.add_peer(&MacAddress::BROADCAST, 0)?;
        }
        Ok(())
    }

    /// Move the peer to another channel (remove and re-add)
    pub fn set_channel<R: LinkRadio>(
        &mut self,
        radio: &mut R,
        addr: MacAddress,
        channel: u8,
    ) -> Result<(), PeerError> {
        self.remove(radio, addr)?;
        self.add(radio, addr, channel)
    }
}
