//! Receiver-side copy of the Transmitter's configuration
//!
//! Beacons tell the mirror which sections moved on. It asks for each of them
//! and applies the answers to the local settings store, only ever moving a
//! section forward.

use heapless::Vec;

use crate::config::settings::N_SECTIONS;
use crate::protocol::version::is_newer;
use crate::protocol::{Frame, FwMeta, RuntimeFlags, SectionId, VersionBeacon};
use crate::settings::{SettingsError, SettingsStore};
use crate::storage::PersistentStore;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MirrorStats {
    pub beacons_seen: u32,
    pub requests_sent: u32,
    pub sections_applied: u32,
    /// Sections that arrived at or below the version already held
    pub sections_stale: u32,
    pub sections_rejected: u32,
}

#[derive(Debug, Clone, Copy)]
struct Outstanding {
    version: u32,
    asked_at_ms: u64,
}

pub struct ConfigMirror {
    retry_ms: u64,
    outstanding: [Option<Outstanding>; N_SECTIONS],
    peer_flags: RuntimeFlags,
    peer_meta: Option<FwMeta>,
    stats: MirrorStats,
}

impl ConfigMirror {
    pub fn new(retry_ms: u64) -> Self {
        Self {
            retry_ms,
            outstanding: [None; N_SECTIONS],
            peer_flags: RuntimeFlags::empty(),
            peer_meta: None,
            stats: MirrorStats::default(),
        }
    }

    pub fn stats(&self) -> MirrorStats {
        self.stats
    }

    /// Runtime flags from the latest beacon
    pub fn peer_flags(&self) -> RuntimeFlags {
        self.peer_flags
    }

    pub fn peer_meta(&self) -> Option<&FwMeta> {
        self.peer_meta.as_ref()
    }

    /// Requests for every section the beacon shows as newer than ours
    pub fn on_beacon(
        &mut self,
        now_ms: u64,
        beacon: &VersionBeacon,
        settings: &SettingsStore,
    ) -> Vec<Frame, N_SECTIONS> {
        self.stats.beacons_seen += 1;
        self.peer_flags = beacon.flags;
        if self.peer_meta.as_ref() != Some(&beacon.meta) {
            log::info!(
                "mirror: peer firmware {}.{}.{} ({})",
                beacon.meta.major,
                beacon.meta.minor,
                beacon.meta.patch,
                beacon.meta.env
            );
            self.peer_meta = Some(beacon.meta.clone());
        }

        let mut requests = Vec::new();
        for section in SectionId::ALL {
            let remote = beacon.versions[section.index()];
            if !is_newer(remote, settings.version(section)) {
                continue;
            }
            let slot = &mut self.outstanding[section.index()];
            let recently_asked = slot.is_some_and(|o| {
                o.version == remote && now_ms.saturating_sub(o.asked_at_ms) < self.retry_ms
            });
            if recently_asked {
                continue;
            }
            *slot = Some(Outstanding {
                version: remote,
                asked_at_ms: now_ms,
            });
            self.stats.requests_sent += 1;
            log::debug!("mirror: requesting {:?} v{}", section, remote);
            let _ = requests.push(Frame::ConfigSectionRequest {
                section,
                requested_version: remote,
            });
        }
        requests
    }

    /// Apply a section received from the peer
    ///
    /// Returns `Ok(true)` when the local copy moved forward.
    pub fn on_section<S: PersistentStore>(
        &mut self,
        section: SectionId,
        version: u32,
        bytes: &[u8],
        settings: &mut SettingsStore,
        store: &mut S,
    ) -> Result<bool, SettingsError> {
        let applied = match settings.adopt(section, version, bytes, store) {
            Ok(applied) => applied,
            Err(e) => {
                self.stats.sections_rejected += 1;
                log::warn!("mirror: {:?} v{} rejected: {}", section, version, e);
                return Err(e);
            }
        };
        if applied {
            self.stats.sections_applied += 1;
            let slot = &mut self.outstanding[section.index()];
            if slot.is_some_and(|o| !is_newer(o.version, version)) {
                *slot = None;
            }
        } else {
            self.stats.sections_stale += 1;
            log::debug!("mirror: {:?} v{} is not newer, ignored", section, version);
        }
        Ok(applied)
    }

    /// Forget outstanding requests (link went down)
    pub fn reset(&mut self) {
        self.outstanding = [None; N_SECTIONS];
    }
}
