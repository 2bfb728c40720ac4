//! One end of the link with all of its parts
//!
//! `LinkSession` owns the radio, the persistent store and every session-layer
//! component, and wires them together. It is driven from outside by three
//! entry points, each of which maps onto one device task:
//!
//! - [`LinkSession::handle_rx`] for every received datagram
//! - [`LinkSession::tick`] for discovery and keep-alive
//! - [`LinkSession::pump`] for draining the cache to the radio
//! - [`LinkSession::poll_beacon`] for version beacons
//!
//! The cache is not owned: producers share it directly, so every entry point
//! that needs it takes a reference.

use rand_core::RngCore;

use crate::beacon::mirror::MirrorStats;
use crate::beacon::{BeaconManager, BeaconStats, ConfigMirror};
use crate::cache::Cache;
use crate::config::{LinkConfig, Role};
use crate::discovery::{answer_probe, Discovery, DiscoveryEvent, DiscoveryStats};
use crate::link::channel::owner;
use crate::link::{ChannelError, ChannelManager, PeerTable};
use crate::protocol::{
    Frame, FwMeta, Heartbeat, HeartbeatAck, MacAddress, RuntimeFlags, SectionId, SessionState,
    TimeSource,
};
use crate::radio::LinkRadio;
use crate::router::{PayloadHook, Routed, Router, RouterStats};
use crate::session::{LossReason, RecoveryStatus, Session, SessionAction, SessionError, SessionStats};
use crate::settings::{default_bytes, SettingsError, SettingsStore};
use crate::storage::PersistentStore;
use crate::time::{Clock, WallClock};
use crate::tx_worker::{TxStats, TxWorker};

pub struct LinkSession<R: LinkRadio, S: PersistentStore, G: RngCore> {
    config: LinkConfig,
    radio: R,
    store: S,
    rng: G,
    channels: ChannelManager,
    peers: PeerTable,
    discovery: Discovery,
    session: Session,
    router: Router,
    tx: TxWorker,
    beacon: BeaconManager,
    mirror: ConfigMirror,
    settings: SettingsStore,
    wall_clock: WallClock,
    boot_ms: u64,
}

impl<R: LinkRadio, S: PersistentStore, G: RngCore> LinkSession<R, S, G> {
    pub fn new(config: LinkConfig, radio: R, store: S, mut rng: G) -> Self {
        let initial_channel = match config.role {
            Role::Transmitter => radio.channel(),
            Role::Receiver => config.home_channel,
        };
        let tx = TxWorker::new(&config.tx, rng.next_u32());
        Self {
            channels: ChannelManager::new(initial_channel),
            peers: PeerTable::new(),
            discovery: Discovery::new(config.discovery.clone()),
            session: Session::new(config.session.clone()),
            router: Router::new(config.session.disconnect_ms),
            tx,
            beacon: BeaconManager::new(config.beacon.clone(), FwMeta::current()),
            mirror: ConfigMirror::new(config.beacon.request_retry_ms),
            settings: SettingsStore::new(),
            wall_clock: WallClock::new(),
            boot_ms: 0,
            config,
            radio,
            store,
            rng,
        }
    }

    /// Restore persisted state; call once before `start`
    pub fn boot<C: Clock>(&mut self, now_ms: u64, cache: &Cache<C>) {
        self.boot_ms = now_ms;
        let sections = self.settings.load_from_nvs(&self.store);
        match cache.restore_all_from_nvs(&self.store) {
            Ok(slots) => log::info!("link: restored {} settings, {} state slots", sections, slots),
            Err(e) => log::warn!("link: state slots not restored: {}", e),
        }
        self.beacon.load_versions(self.settings.versions());

        if self.config.role == Role::Receiver {
            let home = self.config.home_channel;
            if let Err(e) = self.channels.lock(&mut self.radio, home, owner::SESSION) {
                log::error!("link: cannot hold home channel {}: {}", home, e);
            }
        }
    }

    /// Leave `Idle` and start looking for the peer
    pub fn start(&mut self, now_ms: u64) {
        let actions = self.session.start(now_ms);
        self.apply(now_ms, &actions);
    }

    /// Drive discovery and the keep-alive state machine
    pub fn tick(&mut self, now_ms: u64) {
        if self.config.role == Role::Transmitter && self.discovery.is_active() {
            let event = self.discovery.poll(
                now_ms,
                &mut self.radio,
                &mut self.channels,
                &mut self.peers,
                &mut self.rng,
            );
            self.on_discovery_event(now_ms, event);
        }

        if self.router.watchdog(now_ms) {
            let actions = self.session.on_watchdog(now_ms);
            self.apply(now_ms, &actions);
        }

        let actions = self.session.poll(now_ms);
        self.apply(now_ms, &actions);
    }

    /// Send a version beacon if one is due; true when one went out
    pub fn poll_beacon(&mut self, now_ms: u64) -> bool {
        if self.config.role != Role::Transmitter || !self.session.state().is_linked() {
            return false;
        }
        match self.beacon.poll(now_ms) {
            Some(beacon) => self.send_to_peer(&beacon),
            None => false,
        }
    }

    /// Move cached data to the radio
    pub fn pump<C: Clock>(&mut self, now_ms: u64, cache: &Cache<C>) {
        let peer = self.peer();
        self.tx
            .pump(now_ms, self.session.state(), peer, &mut self.radio, cache);
    }

    /// Handle one received datagram
    pub fn handle_rx<C: Clock>(
        &mut self,
        now_ms: u64,
        src: MacAddress,
        data: &[u8],
        rssi: i8,
        cache: &Cache<C>,
    ) {
        let frame = match self.router.route(now_ms, src, data, self.peer()) {
            Routed::Dropped => return,
            Routed::Partial => {
                self.session.on_frame_from_peer(now_ms);
                return;
            }
            Routed::Frame(frame) => frame,
        };

        match frame {
            Frame::Probe { seq } => self.on_probe(now_ms, src, seq),
            Frame::Ack { seq, channel } => {
                if self.config.role == Role::Transmitter {
                    self.discovery.on_ack(src, seq, channel);
                }
            }
            other => {
                self.session.on_frame_from_peer(now_ms);
                self.on_peer_frame(now_ms, src, other, rssi, cache);
            }
        }
    }

    fn on_peer_frame<C: Clock>(
        &mut self,
        now_ms: u64,
        src: MacAddress,
        frame: Frame,
        rssi: i8,
        cache: &Cache<C>,
    ) {
        match frame {
            Frame::Heartbeat(hb) => {
                self.session.on_heartbeat(&hb, rssi);
                let ack = Frame::HeartbeatAck(HeartbeatAck {
                    ack_seq: hb.seq,
                    uptime_ms: self.uptime_ms(now_ms),
                    state: self.session.state(),
                });
                self.send_to(&src, &ack);
            }
            Frame::HeartbeatAck(ack) => self.session.on_heartbeat_ack(&ack),
            Frame::VersionBeacon(beacon) => {
                if self.config.role == Role::Receiver {
                    let requests = self.mirror.on_beacon(now_ms, &beacon, &self.settings);
                    for request in &requests {
                        self.send_to(&src, request);
                    }
                }
            }
            Frame::ConfigSectionRequest {
                section,
                requested_version,
            } => {
                let response = self
                    .beacon
                    .handle_request(section, requested_version, &self.settings);
                if self.send_to(&src, &response) {
                    let served = self.settings.version(section);
                    if let Err(e) = cache.mark_state_acked(section, served) {
                        log::debug!("link: {:?} ack not recorded: {}", section, e);
                    }
                }
            }
            Frame::ConfigSection {
                section,
                version,
                bytes,
            } => {
                if self.config.role == Role::Receiver {
                    let _ = self.mirror.on_section(
                        section,
                        version,
                        &bytes,
                        &mut self.settings,
                        &mut self.store,
                    );
                } else {
                    log::debug!("link: ignoring {:?} pushed to the Transmitter", section);
                }
            }
            // Payloads already went to the hooks; fragments never get this far
            Frame::TransientData { .. } | Frame::Fragment { .. } => {}
            Frame::Probe { .. } | Frame::Ack { .. } => {}
        }
    }

    fn on_probe(&mut self, now_ms: u64, src: MacAddress, seq: u32) {
        if self.config.role != Role::Receiver || self.session.state() == SessionState::Idle {
            return;
        }
        match answer_probe(&mut self.radio, &mut self.peers, &self.channels, src, seq) {
            Ok(()) => {
                self.session.on_locked(now_ms);
                self.router.arm_watchdog(now_ms);
            }
            Err(e) => log::warn!("link: probe from {} not answered: {}", src, e),
        }
    }

    fn on_discovery_event(&mut self, now_ms: u64, event: DiscoveryEvent) {
        match event {
            DiscoveryEvent::None => {}
            DiscoveryEvent::Locked { peer, channel } => {
                log::info!("link: connected to {} on channel {}", peer, channel);
                self.session.on_locked(now_ms);
                self.router.arm_watchdog(now_ms);
                self.beacon.trigger();
            }
            DiscoveryEvent::SweepFailed { consecutive } => {
                let max = self.config.discovery.max_restart_failures;
                if let Err(e) = self.session.on_sweep_failed(consecutive, max, now_ms) {
                    log::error!("link: {}", e);
                }
            }
        }
    }

    fn apply(&mut self, now_ms: u64, actions: &[SessionAction]) {
        for action in actions {
            match *action {
                SessionAction::StartDiscovery => {
                    if self.config.role == Role::Transmitter {
                        self.discovery.begin(now_ms);
                    } else {
                        log::info!(
                            "link: waiting for a probe on channel {}",
                            self.channels.current()
                        );
                    }
                }
                SessionAction::SendHeartbeat { seq } => self.send_heartbeat(now_ms, seq),
                SessionAction::Teardown(reason) => self.teardown(reason),
                SessionAction::ValidateChannel => {
                    let _ = self.validate_channel();
                }
                SessionAction::RequestRestart => {
                    log::error!("link: restart requested");
                }
            }
        }
    }

    fn teardown(&mut self, reason: LossReason) {
        log::warn!("link: tearing down ({:?})", reason);
        self.discovery.cancel();
        if let Err(e) = self.peers.clear(&mut self.radio) {
            log::warn!("link: removing peer failed: {}", e);
        }
        if self.config.role == Role::Transmitter {
            let _ = self.channels.unlock(owner::DISCOVERY);
        }
        self.router.reset();
        self.mirror.reset();
    }

    fn send_heartbeat(&mut self, now_ms: u64, seq: u32) {
        let hb = Frame::Heartbeat(Heartbeat {
            seq,
            uptime_ms: self.uptime_ms(now_ms),
            unix_time: self.wall_clock.unix_time(now_ms),
            source: self.wall_clock.source(),
            state: self.session.state(),
            rssi: self.session.stats().last_rssi,
            flags: self.beacon.flags(),
        });
        self.send_to_peer(&hb);
    }

    /// Check the radio is still on the locked channel, and put it back if not
    pub fn validate_channel(&mut self) -> Result<(), SessionError> {
        let Some(expected) = self.channels.locked_channel() else {
            return Ok(());
        };
        match self.channels.verify(&self.radio) {
            Ok(()) => Ok(()),
            Err(ChannelError::Mismatch { actual, .. }) => {
                let error = self.session.record_channel_mismatch(expected, actual);
                match self.channels.force_set(&mut self.radio, expected) {
                    Ok(()) => log::info!("link: channel restored to {}", expected),
                    Err(e) => log::error!("link: restoring channel {} failed: {}", expected, e),
                }
                Err(error)
            }
            Err(e) => {
                log::warn!("link: channel check failed: {}", e);
                Ok(())
            }
        }
    }

    fn send_to_peer(&mut self, frame: &Frame) -> bool {
        match self.peer() {
            Some(peer) => self.send_to(&peer, frame),
            None => false,
        }
    }

    fn send_to(&mut self, dest: &MacAddress, frame: &Frame) -> bool {
        match self.tx.send_frame(&mut self.radio, dest, frame) {
            Ok(_) => true,
            Err(e) => {
                log::debug!("link: {:?} to {} failed: {}", frame.tag(), dest, e);
                false
            }
        }
    }

    fn uptime_ms(&self, now_ms: u64) -> u32 {
        now_ms.saturating_sub(self.boot_ms) as u32
    }

    /// Change a settings section from a configuration interface
    ///
    /// Bumps the section's version, stages it for the peer and schedules a
    /// beacon. Invalid input changes nothing.
    pub fn update_setting<C: Clock>(
        &mut self,
        section: SectionId,
        bytes: &[u8],
        cache: &Cache<C>,
    ) -> Result<u32, SettingsError> {
        let version = self.settings.set(section, bytes, &mut self.store)?;
        match cache.update_state(section, version, bytes, &mut self.store) {
            Ok(update) if !update.persisted => {
                log::warn!("link: {:?} v{} staged but not persisted", section, version)
            }
            Ok(_) => {}
            Err(e) => log::warn!("link: {:?} v{} not staged: {}", section, version, e),
        }
        self.beacon.set_version(section, version);
        Ok(version)
    }

    /// Restore a section's compile-time defaults (a versioned change)
    pub fn factory_reset<C: Clock>(
        &mut self,
        section: SectionId,
        cache: &Cache<C>,
    ) -> Result<u32, SettingsError> {
        let bytes = default_bytes(section);
        self.update_setting(section, &bytes, cache)
    }

    pub fn set_mqtt_connected(&mut self, connected: bool) {
        self.beacon.set_flag(RuntimeFlags::MQTT_CONNECTED, connected);
    }

    pub fn set_uplink_up(&mut self, up: bool) {
        self.beacon.set_flag(RuntimeFlags::UPLINK_UP, up);
    }

    pub fn set_wall_clock(&mut self, unix_time: u64, source: TimeSource, now_ms: u64) {
        self.wall_clock.set(unix_time, source, now_ms);
        self.beacon
            .set_flag(RuntimeFlags::TIME_SYNCED, self.wall_clock.is_synced());
    }

    pub fn register_payload_hook(&mut self, subtype: u8, hook: PayloadHook) -> bool {
        self.router.register_hook(subtype, hook)
    }

    pub fn set_default_payload_hook(&mut self, hook: PayloadHook) {
        self.router.set_default_hook(hook);
    }

    pub fn role(&self) -> Role {
        self.config.role
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn session_stats(&self) -> SessionStats {
        self.session.stats()
    }

    pub fn recovery(&self) -> RecoveryStatus {
        self.session.recovery()
    }

    pub fn restart_requested(&self) -> bool {
        self.session.restart_requested()
    }

    pub fn discovery_stats(&self) -> DiscoveryStats {
        self.discovery.stats()
    }

    pub fn router_stats(&self) -> RouterStats {
        self.router.stats()
    }

    pub fn tx_stats(&self) -> TxStats {
        self.tx.stats()
    }

    pub fn beacon_stats(&self) -> BeaconStats {
        self.beacon.stats()
    }

    pub fn mirror_stats(&self) -> MirrorStats {
        self.mirror.stats()
    }

    /// Runtime flags last published by the peer (Receiver)
    pub fn peer_flags(&self) -> RuntimeFlags {
        self.mirror.peer_flags()
    }

    pub fn settings(&self) -> &SettingsStore {
        &self.settings
    }

    pub fn channels(&self) -> &ChannelManager {
        &self.channels
    }

    pub fn peer(&self) -> Option<MacAddress> {
        self.peers.current().map(|p| p.addr)
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn radio_mut(&mut self) -> &mut R {
        &mut self.radio
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut S {
        &mut self.store
    }
}
