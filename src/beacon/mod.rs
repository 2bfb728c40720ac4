//! Version beacons and configuration pull responses
//!
//! The Transmitter publishes one `u32` per settings section every beacon
//! period, plus an immediate beacon whenever a version or a runtime flag
//! changes (never more than one per minimum interval). The Receiver pulls the
//! sections it is missing with `ConfigSectionRequest`, see [`mirror`].

pub mod mirror;

use crate::config::settings::N_SECTIONS;
use crate::config::BeaconConfig;
use crate::protocol::version::is_newer;
use crate::protocol::{Frame, FwMeta, RuntimeFlags, SectionId, VersionBeacon};
use crate::settings::SettingsStore;

pub use mirror::ConfigMirror;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BeaconStats {
    pub beacons_sent: u32,
    /// Beacons sent ahead of the period because something changed
    pub triggered: u32,
    pub requests_served: u32,
    /// Requests naming a version other than the current one
    pub requests_mismatched: u32,
}

pub struct BeaconManager {
    config: BeaconConfig,
    versions: [u32; N_SECTIONS],
    flags: RuntimeFlags,
    meta: FwMeta,
    last_sent_ms: Option<u64>,
    pending: bool,
    stats: BeaconStats,
}

impl BeaconManager {
    pub fn new(config: BeaconConfig, meta: FwMeta) -> Self {
        Self {
            config,
            versions: [0; N_SECTIONS],
            flags: RuntimeFlags::empty(),
            meta,
            last_sent_ms: None,
            pending: false,
            stats: BeaconStats::default(),
        }
    }

    pub fn stats(&self) -> BeaconStats {
        self.stats
    }

    pub fn versions(&self) -> [u32; N_SECTIONS] {
        self.versions
    }

    pub fn flags(&self) -> RuntimeFlags {
        self.flags
    }

    /// Whether a change is waiting for the next beacon
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Adopt all versions at once (boot), without forcing a beacon
    pub fn load_versions(&mut self, versions: [u32; N_SECTIONS]) {
        self.versions = versions;
    }

    pub fn set_version(&mut self, section: SectionId, version: u32) {
        let slot = &mut self.versions[section.index()];
        if *slot != version {
            *slot = version;
            self.pending = true;
            log::debug!("beacon: {:?} now v{}", section, version);
        }
    }

    pub fn set_flag(&mut self, flag: RuntimeFlags, on: bool) {
        let before = self.flags;
        self.flags.set(flag, on);
        if self.flags != before {
            self.pending = true;
        }
    }

    /// Make the next poll send a beacon, subject to the minimum interval
    pub fn trigger(&mut self) {
        self.pending = true;
    }

    /// Beacon to send now, if one is due
    pub fn poll(&mut self, now_ms: u64) -> Option<Frame> {
        let due = match self.last_sent_ms {
            None => true,
            Some(last) => {
                let since = now_ms.saturating_sub(last);
                since >= self.config.period_ms
                    || (self.pending && since >= self.config.min_interval_ms)
            }
        };
        if !due {
            return None;
        }
        if self.pending {
            self.stats.triggered += 1;
        }
        self.pending = false;
        self.last_sent_ms = Some(now_ms);
        self.stats.beacons_sent += 1;
        log::trace!("beacon: versions {:?} flags {:?}", self.versions, self.flags);
        Some(Frame::VersionBeacon(VersionBeacon {
            versions: self.versions,
            flags: self.flags,
            meta: self.meta.clone(),
        }))
    }

    /// Answer a pull request with the section as it is now
    ///
    /// The current value is sent even when the requested version differs;
    /// the requester asked, so it gets the latest.
    pub fn handle_request(
        &mut self,
        section: SectionId,
        requested_version: u32,
        settings: &SettingsStore,
    ) -> Frame {
        let version = settings.version(section);
        if requested_version != version {
            self.stats.requests_mismatched += 1;
            if is_newer(requested_version, version) {
                log::warn!(
                    "beacon: {:?} v{} requested but only v{} exists",
                    section,
                    requested_version,
                    version
                );
            } else {
                log::debug!(
                    "beacon: {:?} v{} requested, sending v{}",
                    section,
                    requested_version,
                    version
                );
            }
        }
        self.stats.requests_served += 1;
        Frame::ConfigSection {
            section,
            version,
            bytes: settings.section_bytes(section).clone(),
        }
    }
}
