//! ESP-NOW driver over esp-radio
//!
//! The esp-radio handle is split three ways. The manager (peers, channel)
//! lives in [`EspNowRadio`], which the link session owns. The sender goes to
//! [`EspNowTx`], whose task transmits outside the session lock and reports
//! each unicast outcome back as a [`DeliveryReport`]. The receiver goes to
//! the RX task as [`EspNowRx`].

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use esp_radio::esp_now::{
    EspNow, EspNowManager, EspNowReceiver, EspNowSender, EspNowWifiInterface, PeerInfo,
};
use heapless::Vec;
use rand_core::RngCore;

use crate::config::link::MTU;
use crate::protocol::MacAddress;
use crate::radio::traits::{
    Delivery, DeliveryReport, LinkRadio, LinkReceiver, RadioError, RxFrame,
};

const OUTBOUND_DEPTH: usize = 16;
const REPORT_DEPTH: usize = 16;

struct Outbound {
    ticket: u32,
    dest: MacAddress,
    data: Vec<u8, MTU>,
}

static OUTBOUND: Channel<CriticalSectionRawMutex, Outbound, OUTBOUND_DEPTH> = Channel::new();
static REPORTS: Channel<CriticalSectionRawMutex, DeliveryReport, REPORT_DEPTH> = Channel::new();

pub struct EspNowRadio<'d> {
    manager: EspNowManager<'d>,
    channel: u8,
    next_ticket: u32,
}

pub struct EspNowTx<'d> {
    sender: EspNowSender<'d>,
}

pub struct EspNowRx<'d> {
    receiver: EspNowReceiver<'d>,
}

/// Split an initialised ESP-NOW handle and tune it to `channel`
pub fn split(
    esp_now: EspNow<'_>,
    channel: u8,
) -> Result<(EspNowRadio<'_>, EspNowTx<'_>, EspNowRx<'_>), RadioError> {
    let (manager, sender, receiver) = esp_now.split();
    let mut radio = EspNowRadio {
        manager,
        channel,
        next_ticket: 0,
    };
    radio.set_channel(channel)?;
    Ok((radio, EspNowTx { sender }, EspNowRx { receiver }))
}

impl EspNowTx<'_> {
    /// Transmit queued datagrams forever
    pub async fn run(&mut self) -> ! {
        loop {
            let out = OUTBOUND.receive().await;
            let result = self.sender.send_async(out.dest.as_bytes(), &out.data).await;
            if let Err(e) = &result {
                log::trace!("esp-now: {} not acked: {:?}", out.dest, e);
            }
            if out.dest.is_broadcast() {
                continue;
            }
            let report = DeliveryReport {
                ticket: out.ticket,
                delivered: result.is_ok(),
            };
            if REPORTS.try_send(report).is_err() {
                log::debug!("esp-now: delivery report {} dropped", out.ticket);
            }
        }
    }
}

impl LinkRadio for EspNowRadio<'_> {
    fn send(&mut self, dest: &MacAddress, data: &[u8]) -> Result<Delivery, RadioError> {
        if !self.manager.peer_exists(dest.as_bytes()) {
            return Err(RadioError::PeerAbsent);
        }
        let mut buf = Vec::new();
        buf.extend_from_slice(data)
            .map_err(|_| RadioError::FrameTooLarge)?;
        let ticket = self.next_ticket;
        OUTBOUND
            .try_send(Outbound {
                ticket,
                dest: *dest,
                data: buf,
            })
            .map_err(|_| RadioError::SendFailed)?;
        self.next_ticket = self.next_ticket.wrapping_add(1);
        if dest.is_broadcast() {
            Ok(Delivery::Queued)
        } else {
            Ok(Delivery::Pending(ticket))
        }
    }

    fn set_channel(&mut self, channel: u8) -> Result<(), RadioError> {
        self.manager
            .set_channel(channel)
            .map_err(|_| RadioError::SetChannelFailed)?;
        self.channel = channel;
        Ok(())
    }

    // esp-radio does not expose a channel read-back; this is the last channel
    // the driver accepted
    fn channel(&self) -> u8 {
        self.channel
    }

    fn add_peer(&mut self, addr: &MacAddress, channel: u8) -> Result<(), RadioError> {
        let info = PeerInfo {
            interface: EspNowWifiInterface::Sta,
            peer_address: *addr.as_bytes(),
            lmk: None,
            channel: (channel != 0).then_some(channel),
            encrypt: false,
        };
        self.manager.add_peer(info).map_err(|e| {
            log::warn!("esp-now: add_peer {} failed: {:?}", addr, e);
            RadioError::PeerTableFull
        })
    }

    fn remove_peer(&mut self, addr: &MacAddress) -> Result<(), RadioError> {
        self.manager
            .remove_peer(addr.as_bytes())
            .map_err(|_| RadioError::PeerAbsent)
    }

    fn is_peer_registered(&self, addr: &MacAddress) -> bool {
        self.manager.peer_exists(addr.as_bytes())
    }

    fn take_delivery_report(&mut self) -> Option<DeliveryReport> {
        REPORTS.try_receive().ok()
    }
}

impl LinkReceiver for EspNowRx<'_> {
    async fn receive(&mut self) -> Result<RxFrame, RadioError> {
        let received = self.receiver.receive_async().await;
        let mut data = Vec::new();
        data.extend_from_slice(received.data())
            .map_err(|_| RadioError::FrameTooLarge)?;
        Ok(RxFrame {
            src: MacAddress::new(received.info.src_address),
            data,
            rssi: received.info.rx_control.rssi as i8,
        })
    }
}

/// Hardware RNG as a `rand_core` source for probe sequence numbers
pub struct HwRng(esp_hal::rng::Rng);

impl HwRng {
    pub fn new() -> Self {
        Self(esp_hal::rng::Rng::new())
    }
}

impl RngCore for HwRng {
    fn next_u32(&mut self) -> u32 {
        self.0.random()
    }

    fn next_u64(&mut self) -> u64 {
        ((self.0.random() as u64) << 32) | self.0.random() as u64
    }

    fn fill_bytes(&mut self, dest: &mut [u8]) {
        for chunk in dest.chunks_mut(4) {
            let bytes = self.0.random().to_le_bytes();
            chunk.copy_from_slice(&bytes[..chunk.len()]);
        }
    }

    fn try_fill_bytes(&mut self, dest: &mut [u8]) -> Result<(), rand_core::Error> {
        self.fill_bytes(dest);
        Ok(())
    }
}
