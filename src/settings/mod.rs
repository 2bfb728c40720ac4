//! Canonical configuration with per-section version counters
//!
//! On the Transmitter every accepted `set` bumps the section's version. On the
//! Receiver sections are only written through `adopt`, which takes the
//! Transmitter's version as-is.

pub mod sections;

use core::fmt;

use crate::config::settings::{NAMESPACE, N_SECTIONS};
use crate::protocol::version::{is_newer, next_version};
use crate::protocol::SectionId;
use crate::storage::{decode_section_blob, encode_section_blob, PersistentStore};

pub use sections::{
    default_bytes, validate_bytes, BatterySettings, MqttSettings, NetworkSettings, Section,
    SectionBytes,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsError {
    /// Value rejected; nothing was changed
    InvalidSetting { field: &'static str },
}

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SettingsError::InvalidSetting { field } => write!(f, "invalid setting: {}", field),
        }
    }
}

#[derive(Debug, Clone)]
struct Slot {
    version: u32,
    bytes: SectionBytes,
}

pub struct SettingsStore {
    slots: [Slot; N_SECTIONS],
}

impl SettingsStore {
    /// Compile-time defaults, every section at version 0
    pub fn new() -> Self {
        Self {
            slots: SectionId::ALL.map(|section| Slot {
                version: 0,
                bytes: default_bytes(section),
            }),
        }
    }

    pub fn get(&self, section: SectionId) -> &[u8] {
        &self.slots[section.index()].bytes
    }

    /// Same as [`get`](Self::get), in the bounded form frames carry
    pub fn section_bytes(&self, section: SectionId) -> &SectionBytes {
        &self.slots[section.index()].bytes
    }

    pub fn version(&self, section: SectionId) -> u32 {
        self.slots[section.index()].version
    }

    pub fn versions(&self) -> [u32; N_SECTIONS] {
        SectionId::ALL.map(|section| self.version(section))
    }

    /// Decoded view of a section
    pub fn typed<T: Section>(&self) -> Result<T, SettingsError> {
        T::decode(self.get(T::ID))
    }

    /// Replace a section and bump its version
    ///
    /// Invalid input leaves both value and version untouched. The write to the
    /// persistent store is best-effort.
    pub fn set<S: PersistentStore>(
        &mut self,
        section: SectionId,
        bytes: &[u8],
        store: &mut S,
    ) -> Result<u32, SettingsError> {
        validate_bytes(section, bytes)?;
        let mut value = SectionBytes::new();
        value
            .extend_from_slice(bytes)
            .map_err(|_| SettingsError::InvalidSetting { field: "length" })?;

        let slot = &mut self.slots[section.index()];
        slot.version = next_version(slot.version);
        slot.bytes = value;
        let version = slot.version;

        persist(store, section, version, bytes);
        log::info!("settings: {:?} set, now v{}", section, version);
        Ok(version)
    }

    /// Encode and `set` a typed section
    pub fn set_typed<T: Section, S: PersistentStore>(
        &mut self,
        value: &T,
        store: &mut S,
    ) -> Result<u32, SettingsError> {
        let bytes = value.encode()?;
        self.set(T::ID, &bytes, store)
    }

    /// Restore compile-time defaults for a section (a versioned change)
    pub fn factory_reset<S: PersistentStore>(
        &mut self,
        section: SectionId,
        store: &mut S,
    ) -> Result<u32, SettingsError> {
        let bytes = default_bytes(section);
        self.set(section, &bytes, store)
    }

    /// Take a section published by the peer at its version
    ///
    /// Returns `Ok(false)` when `version` is not newer than what we hold.
    pub fn adopt<S: PersistentStore>(
        &mut self,
        section: SectionId,
        version: u32,
        bytes: &[u8],
        store: &mut S,
    ) -> Result<bool, SettingsError> {
        if !is_newer(version, self.version(section)) {
            return Ok(false);
        }
        validate_bytes(section, bytes)?;
        let mut value = SectionBytes::new();
        value
            .extend_from_slice(bytes)
            .map_err(|_| SettingsError::InvalidSetting { field: "length" })?;

        let slot = &mut self.slots[section.index()];
        slot.version = version;
        slot.bytes = value;
        persist(store, section, version, bytes);
        log::info!("settings: adopted {:?} v{}", section, version);
        Ok(true)
    }

    /// Load persisted sections; absent or unusable ones keep their defaults
    pub fn load_from_nvs<S: PersistentStore>(&mut self, store: &S) -> usize {
        let mut loaded = 0;
        for section in SectionId::ALL {
            let blob = match store.get(NAMESPACE, section.key()) {
                Ok(Some(blob)) => blob,
                Ok(None) => continue,
                Err(e) => {
                    log::warn!("settings: reading {:?} failed: {}", section, e);
                    continue;
                }
            };
            let Ok((version, bytes)) = decode_section_blob(&blob) else {
                log::warn!("settings: {:?} blob unusable, keeping defaults", section);
                continue;
            };
            if let Err(e) = validate_bytes(section, bytes) {
                log::warn!("settings: stored {:?} rejected: {}", section, e);
                continue;
            }
            let mut value = SectionBytes::new();
            if value.extend_from_slice(bytes).is_err() {
                continue;
            }
            self.slots[section.index()] = Slot {
                version,
                bytes: value,
            };
            loaded += 1;
        }
        log::info!("settings: loaded {} sections", loaded);
        loaded
    }
}

impl Default for SettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

fn persist<S: PersistentStore>(store: &mut S, section: SectionId, version: u32, bytes: &[u8]) {
    let result =
        encode_section_blob(version, bytes).and_then(|blob| store.put(NAMESPACE, section.key(), &blob));
    if let Err(e) = result {
        log::warn!("settings: persisting {:?} v{} failed: {}", section, version, e);
    }
}
