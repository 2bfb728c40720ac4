//! Link radio traits for abstraction and testability
//!
//! The session layer talks to a connection-less datagram radio with a
//! settable channel and a small registry of known peers. Sending and peer
//! management are synchronous (the driver queues frames); receiving is async
//! and lives on its own handle so the RX task can own it.

use core::fmt;
use core::future::Future;

use heapless::Vec;

use crate::config::link::MTU;
use crate::protocol::MacAddress;

/// Errors reported by the radio driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RadioError {
    /// Driver refused or failed to queue the frame
    SendFailed,
    /// Destination is not a registered peer
    PeerAbsent,
    /// Channel switch rejected by the driver
    SetChannelFailed,
    /// Peer registry is full
    PeerTableFull,
    /// Nothing received within the wait
    Timeout,
    /// Frame larger than the MTU
    FrameTooLarge,
    /// Driver not started
    NotInitialised,
}

impl fmt::Display for RadioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            RadioError::SendFailed => "send failed",
            RadioError::PeerAbsent => "peer absent",
            RadioError::SetChannelFailed => "set channel failed",
            RadioError::PeerTableFull => "peer table full",
            RadioError::Timeout => "timeout",
            RadioError::FrameTooLarge => "frame too large",
            RadioError::NotInitialised => "not initialised",
        };
        f.write_str(text)
    }
}

/// What the driver knows about a frame it accepted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for the air, no delivery report
    Queued,
    /// The peer's MAC layer acknowledged the frame
    Delivered,
    /// Handed to a transmit queue; the outcome arrives later as a
    /// [`DeliveryReport`] carrying this ticket
    Pending(u32),
}

/// Late outcome of a [`Delivery::Pending`] send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryReport {
    pub ticket: u32,
    pub delivered: bool,
}

/// Received datagram with metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxFrame {
    pub src: MacAddress,
    pub data: Vec<u8, MTU>,
    /// Received Signal Strength Indicator in dBm
    pub rssi: i8,
}

/// Transmit side and channel/peer control
pub trait LinkRadio {
    /// Queue one datagram of at most [`MTU`] bytes
    fn send(&mut self, dest: &MacAddress, data: &[u8]) -> Result<Delivery, RadioError>;

    fn set_channel(&mut self, channel: u8) -> Result<(), RadioError>;

    /// Channel the hardware is actually on
    fn channel(&self) -> u8;

    /// Register a peer; channel 0 means "whatever the radio is on"
    fn add_peer(&mut self, addr: &MacAddress, channel: u8) -> Result<(), RadioError>;

    fn remove_peer(&mut self, addr: &MacAddress) -> Result<(), RadioError>;

    fn is_peer_registered(&self, addr: &MacAddress) -> bool;

    /// Next outstanding delivery outcome, oldest first
    fn take_delivery_report(&mut self) -> Option<DeliveryReport> {
        None
    }
}

/// Receive side
pub trait LinkReceiver {
    /// Wait for the next datagram
    fn receive(&mut self) -> impl Future<Output = Result<RxFrame, RadioError>>;
}
