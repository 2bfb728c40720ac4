//! Log-structured store on NOR flash
//!
//! Two erase sectors take turns. A sector opens with
//! `magic u32 | generation u32`, followed by records written back to back:
//!
//! ```text
//! 0xA5 | kind u8 | ns_len u8 | key_len u8 | value_len u16 | crc u16 | ns | key | value | 0xFF pad
//! ```
//!
//! Records are padded to four bytes. The CRC-16 covers the first six header
//! bytes and the body. Opening replays the sector with the newest generation
//! into a RAM image that serves every read. When the active sector is full the
//! image is rewritten into the other sector, whose header goes down last, so a
//! sector with a valid header is always complete.

use crc::{Crc, CRC_16_IBM_3740};
use embedded_storage::nor_flash::NorFlash;
use heapless::Vec;

use super::{Blob, MemoryStore, PersistentStore, StoreError};
use crate::config::storage::{MAX_BLOB, MAX_KEYS, MAX_KEY_LEN};
use crate::protocol::version::is_newer;

const CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

const SECTOR_MAGIC: u32 = 0x4C53_5331;
const SECTOR_HEADER_LEN: usize = 8;
const RECORD_MARK: u8 = 0xA5;
const RECORD_HEADER_LEN: usize = 8;
const ALIGN: usize = 4;
const MAX_RECORD: usize = RECORD_HEADER_LEN + 2 * MAX_KEY_LEN + MAX_BLOB + ALIGN;

const KIND_PUT: u8 = 1;
const KIND_ERASE_NAMESPACE: u8 = 2;

type Record = Vec<u8, MAX_RECORD>;

fn encode_record(kind: u8, namespace: &str, key: &str, value: &[u8]) -> Result<Record, StoreError> {
    if namespace.len() > MAX_KEY_LEN || key.len() > MAX_KEY_LEN {
        return Err(StoreError::KeyTooLong);
    }
    if value.len() > MAX_BLOB {
        return Err(StoreError::TooLarge);
    }
    let mut header = [
        RECORD_MARK,
        kind,
        namespace.len() as u8,
        key.len() as u8,
        0,
        0,
        0,
        0,
    ];
    header[4..6].copy_from_slice(&(value.len() as u16).to_le_bytes());
    let mut digest = CRC.digest();
    digest.update(&header[..6]);
    digest.update(namespace.as_bytes());
    digest.update(key.as_bytes());
    digest.update(value);
    header[6..8].copy_from_slice(&digest.finalize().to_le_bytes());

    let mut record = Record::new();
    for part in [&header[..], namespace.as_bytes(), key.as_bytes(), value] {
        record
            .extend_from_slice(part)
            .map_err(|_| StoreError::TooLarge)?;
    }
    while record.len() % ALIGN != 0 {
        record.push(0xFF).map_err(|_| StoreError::TooLarge)?;
    }
    Ok(record)
}

/// [`PersistentStore`] over two erase sectors of a [`NorFlash`]
pub struct FlashStore<F> {
    flash: F,
    base: u32,
    active: usize,
    generation: u32,
    write_offset: usize,
    /// A write failed part way; the next change goes through compaction
    damaged: bool,
    image: MemoryStore,
}

impl<F: NorFlash> FlashStore<F> {
    /// Open the store kept in the two sectors starting at `base`
    ///
    /// A region without a valid sector header is formatted.
    pub fn open(flash: F, base: u32) -> Result<Self, StoreError> {
        let aligned = ALIGN % F::WRITE_SIZE == 0
            && ALIGN % F::READ_SIZE == 0
            && base as usize % F::ERASE_SIZE == 0;
        let fits = F::ERASE_SIZE >= SECTOR_HEADER_LEN + MAX_RECORD
            && base as usize + 2 * F::ERASE_SIZE <= flash.capacity();
        if !aligned || !fits {
            return Err(StoreError::BadRegion);
        }

        let mut store = Self {
            flash,
            base,
            active: 0,
            generation: 0,
            write_offset: SECTOR_HEADER_LEN,
            damaged: false,
            image: MemoryStore::new(),
        };
        let newest = match (store.read_generation(0)?, store.read_generation(1)?) {
            (Some(a), Some(b)) if is_newer(b, a) => Some((1, b)),
            (Some(a), _) => Some((0, a)),
            (None, Some(b)) => Some((1, b)),
            (None, None) => None,
        };

        match newest {
            Some((sector, generation)) => {
                store.active = sector;
                store.generation = generation;
                if !store.replay()? {
                    log::warn!("storage: damaged record in sector {}, compacting", sector);
                    let image = store.image.clone();
                    store.compact(&image)?;
                }
            }
            None => {
                log::info!("storage: formatting flash at {:#x}", base);
                store.compact(&MemoryStore::new())?;
            }
        }
        log::info!(
            "storage: {} keys, sector {} generation {}",
            store.image.len(),
            store.active,
            store.generation
        );
        Ok(store)
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    /// Bytes used in the active sector
    pub fn used_bytes(&self) -> usize {
        self.write_offset
    }

    pub fn into_inner(self) -> F {
        self.flash
    }

    fn sector_start(&self, sector: usize) -> u32 {
        self.base + (sector * F::ERASE_SIZE) as u32
    }

    fn read_at(&mut self, sector: usize, offset: usize, buf: &mut [u8]) -> Result<(), StoreError> {
        if buf.is_empty() {
            return Ok(());
        }
        let at = self.sector_start(sector) + offset as u32;
        self.flash.read(at, buf).map_err(|_| StoreError::ReadFailed)
    }

    fn write_at(&mut self, sector: usize, offset: usize, bytes: &[u8]) -> Result<(), StoreError> {
        let at = self.sector_start(sector) + offset as u32;
        self.flash.write(at, bytes).map_err(|_| StoreError::WriteFailed)
    }

    fn read_generation(&mut self, sector: usize) -> Result<Option<u32>, StoreError> {
        let mut header = [0u8; SECTOR_HEADER_LEN];
        self.read_at(sector, 0, &mut header)?;
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let generation = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        Ok((magic == SECTOR_MAGIC).then_some(generation))
    }

    /// Rebuild the image from the active sector
    ///
    /// Returns false when replay stopped at a damaged record.
    fn replay(&mut self) -> Result<bool, StoreError> {
        let mut buf = [0u8; MAX_RECORD];
        let mut offset = SECTOR_HEADER_LEN;
        let clean = loop {
            if offset + RECORD_HEADER_LEN > F::ERASE_SIZE {
                break true;
            }
            let mut header = [0u8; RECORD_HEADER_LEN];
            self.read_at(self.active, offset, &mut header)?;
            if header.iter().all(|&b| b == 0xFF) {
                break true;
            }
            if header[0] != RECORD_MARK {
                break false;
            }
            let ns_len = header[2] as usize;
            let key_len = header[3] as usize;
            let value_len = u16::from_le_bytes([header[4], header[5]]) as usize;
            let crc = u16::from_le_bytes([header[6], header[7]]);
            if ns_len > MAX_KEY_LEN || key_len > MAX_KEY_LEN || value_len > MAX_BLOB {
                break false;
            }
            let body_len = ns_len + key_len + value_len;
            let total = (RECORD_HEADER_LEN + body_len).div_ceil(ALIGN) * ALIGN;
            if offset + total > F::ERASE_SIZE {
                break false;
            }

            buf[..RECORD_HEADER_LEN].copy_from_slice(&header);
            self.read_at(
                self.active,
                offset + RECORD_HEADER_LEN,
                &mut buf[RECORD_HEADER_LEN..total],
            )?;
            let body = &buf[RECORD_HEADER_LEN..RECORD_HEADER_LEN + body_len];
            let mut digest = CRC.digest();
            digest.update(&header[..6]);
            digest.update(body);
            if digest.finalize() != crc {
                break false;
            }

            let (namespace, rest) = body.split_at(ns_len);
            let (key, value) = rest.split_at(key_len);
            let (Ok(namespace), Ok(key)) = (core::str::from_utf8(namespace), core::str::from_utf8(key))
            else {
                break false;
            };
            let applied = match header[1] {
                KIND_PUT => self.image.put(namespace, key, value),
                KIND_ERASE_NAMESPACE => self.image.erase_namespace(namespace),
                _ => break false,
            };
            if let Err(e) = applied {
                log::warn!("storage: {}/{} not restored: {}", namespace, key, e);
            }
            offset += total;
        };
        self.write_offset = offset;
        Ok(clean)
    }

    /// Write `image` into the spare sector and make it active
    fn compact(&mut self, image: &MemoryStore) -> Result<(), StoreError> {
        let target = 1 - self.active;
        let start = self.sector_start(target);
        self.flash
            .erase(start, start + F::ERASE_SIZE as u32)
            .map_err(|_| StoreError::WriteFailed)?;

        let mut offset = SECTOR_HEADER_LEN;
        for entry in image.entries.iter() {
            let record = encode_record(KIND_PUT, &entry.namespace, &entry.key, &entry.value)?;
            if offset + record.len() > F::ERASE_SIZE {
                return Err(StoreError::Full);
            }
            self.write_at(target, offset, &record)?;
            offset += record.len();
        }

        let generation = self.generation.wrapping_add(1);
        let mut header = [0u8; SECTOR_HEADER_LEN];
        header[..4].copy_from_slice(&SECTOR_MAGIC.to_le_bytes());
        header[4..].copy_from_slice(&generation.to_le_bytes());
        self.write_at(target, 0, &header)?;

        self.active = target;
        self.generation = generation;
        self.write_offset = offset;
        log::debug!(
            "storage: compacted into sector {} (generation {}, {} bytes)",
            target,
            generation,
            offset
        );
        Ok(())
    }

    /// Append `record` and apply `change` to the image
    fn commit(
        &mut self,
        record: &Record,
        change: impl Fn(&mut MemoryStore) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        if self.damaged || self.write_offset + record.len() > F::ERASE_SIZE {
            let mut next = self.image.clone();
            change(&mut next)?;
            self.compact(&next)?;
            self.image = next;
            self.damaged = false;
            return Ok(());
        }
        if let Err(e) = self.write_at(self.active, self.write_offset, record) {
            self.damaged = true;
            return Err(e);
        }
        self.write_offset += record.len();
        change(&mut self.image)
    }
}

impl<F: NorFlash> PersistentStore for FlashStore<F> {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Blob>, StoreError> {
        self.image.get(namespace, key)
    }

    fn put(&mut self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let existing = self.image.find(namespace, key);
        if let Some(i) = existing {
            if self.image.entries[i].value.as_slice() == bytes {
                return Ok(());
            }
        } else if self.image.len() >= MAX_KEYS {
            return Err(StoreError::Full);
        }
        let record = encode_record(KIND_PUT, namespace, key, bytes)?;
        self.commit(&record, |image| image.put(namespace, key, bytes))
    }

    fn erase_namespace(&mut self, namespace: &str) -> Result<(), StoreError> {
        if !self
            .image
            .entries
            .iter()
            .any(|e| e.namespace.as_str() == namespace)
        {
            return Ok(());
        }
        let record = encode_record(KIND_ERASE_NAMESPACE, namespace, "", &[])?;
        self.commit(&record, |image| image.erase_namespace(namespace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::protocol::SectionId;
    use crate::settings::SettingsStore;
    use crate::time::mock::MockClock;
    use embedded_storage::nor_flash::{ErrorType, NorFlashErrorKind, ReadNorFlash};

    const SECTOR: usize = 1024;

    /// RAM flash where writes can only clear bits
    struct RamFlash {
        data: std::vec::Vec<u8>,
    }

    impl RamFlash {
        fn new(sectors: usize) -> Self {
            Self {
                data: vec![0xFF; sectors * SECTOR],
            }
        }

        fn range(&self, offset: u32, len: usize) -> Result<core::ops::Range<usize>, NorFlashErrorKind> {
            let start = offset as usize;
            if start + len > self.data.len() {
                return Err(NorFlashErrorKind::OutOfBounds);
            }
            Ok(start..start + len)
        }
    }

    impl ErrorType for RamFlash {
        type Error = NorFlashErrorKind;
    }

    impl ReadNorFlash for RamFlash {
        const READ_SIZE: usize = 4;

        fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            if offset as usize % Self::READ_SIZE != 0 || bytes.len() % Self::READ_SIZE != 0 {
                return Err(NorFlashErrorKind::NotAligned);
            }
            let range = self.range(offset, bytes.len())?;
            bytes.copy_from_slice(&self.data[range]);
            Ok(())
        }

        fn capacity(&self) -> usize {
            self.data.len()
        }
    }

    impl NorFlash for RamFlash {
        const WRITE_SIZE: usize = 4;
        const ERASE_SIZE: usize = SECTOR;

        fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
            if from as usize % SECTOR != 0 || to as usize % SECTOR != 0 {
                return Err(NorFlashErrorKind::NotAligned);
            }
            let range = self.range(from, (to - from) as usize)?;
            self.data[range].fill(0xFF);
            Ok(())
        }

        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            if offset as usize % Self::WRITE_SIZE != 0 || bytes.len() % Self::WRITE_SIZE != 0 {
                return Err(NorFlashErrorKind::NotAligned);
            }
            let range = self.range(offset, bytes.len())?;
            for (cell, b) in self.data[range].iter_mut().zip(bytes) {
                *cell &= *b;
            }
            Ok(())
        }
    }

    fn value(store: &FlashStore<RamFlash>, ns: &str, key: &str) -> Option<std::vec::Vec<u8>> {
        store.get(ns, key).unwrap().map(|blob| blob.to_vec())
    }

    #[test]
    fn test_blank_region_is_formatted() {
        let store = FlashStore::open(RamFlash::new(2), 0).unwrap();
        assert_eq!(store.generation(), 1);
        assert_eq!(value(&store, "settings", "mqtt"), None);
    }

    #[test]
    fn test_values_survive_reopen() {
        let mut store = FlashStore::open(RamFlash::new(3), SECTOR as u32).unwrap();
        store.put("settings", "mqtt", &[1, 2, 3]).unwrap();
        store.put("cache_state", "net", &[9]).unwrap();
        store.put("settings", "mqtt", &[4, 5]).unwrap();

        let store = FlashStore::open(store.into_inner(), SECTOR as u32).unwrap();
        assert_eq!(value(&store, "settings", "mqtt"), Some(vec![4, 5]));
        assert_eq!(value(&store, "cache_state", "net"), Some(vec![9]));
        assert_eq!(store.generation(), 1);
    }

    #[test]
    fn test_unchanged_value_not_rewritten() {
        let mut store = FlashStore::open(RamFlash::new(2), 0).unwrap();
        store.put("settings", "net", &[1; 40]).unwrap();
        let used = store.used_bytes();
        store.put("settings", "net", &[1; 40]).unwrap();
        assert_eq!(store.used_bytes(), used);
    }

    #[test]
    fn test_full_sector_compacts_to_latest() {
        let mut store = FlashStore::open(RamFlash::new(2), 0).unwrap();
        store.put("settings", "net", &[7; 20]).unwrap();
        for i in 0..40u8 {
            store.put("settings", "mqtt", &[i; 200]).unwrap();
        }
        assert!(store.generation() > 1);

        let store = FlashStore::open(store.into_inner(), 0).unwrap();
        assert_eq!(value(&store, "settings", "mqtt"), Some(vec![39; 200]));
        assert_eq!(value(&store, "settings", "net"), Some(vec![7; 20]));
    }

    #[test]
    fn test_erase_namespace_persists() {
        let mut store = FlashStore::open(RamFlash::new(2), 0).unwrap();
        store.put("settings", "net", &[1]).unwrap();
        store.put("cache_state", "net", &[2]).unwrap();
        store.erase_namespace("settings").unwrap();

        let store = FlashStore::open(store.into_inner(), 0).unwrap();
        assert_eq!(value(&store, "settings", "net"), None);
        assert_eq!(value(&store, "cache_state", "net"), Some(vec![2]));
    }

    #[test]
    fn test_torn_record_discarded() {
        let mut store = FlashStore::open(RamFlash::new(2), 0).unwrap();
        store.put("settings", "net", &[1; 16]).unwrap();
        let tail = store.used_bytes();
        store.put("settings", "net", &[2; 16]).unwrap();
        let generation = store.generation();

        // Active sector is 1 after formatting; damage the second record's body
        let mut flash = store.into_inner();
        flash.data[SECTOR + tail + RECORD_HEADER_LEN + 4] = 0;

        let store = FlashStore::open(flash, 0).unwrap();
        assert_eq!(value(&store, "settings", "net"), Some(vec![1; 16]));
        assert_eq!(store.generation(), generation.wrapping_add(1));
    }

    #[test]
    fn test_bad_region_rejected() {
        assert_eq!(
            FlashStore::open(RamFlash::new(2), 100).err(),
            Some(StoreError::BadRegion)
        );
        assert_eq!(
            FlashStore::open(RamFlash::new(2), SECTOR as u32).err(),
            Some(StoreError::BadRegion)
        );
    }

    #[test]
    fn test_section_versions_survive_restart() {
        let mut store = FlashStore::open(RamFlash::new(2), 0).unwrap();
        let cache = Cache::new(MockClock::new(0));
        let mut settings = SettingsStore::new();
        for _ in 0..3 {
            let version = settings.factory_reset(SectionId::Battery, &mut store).unwrap();
            cache
                .update_state(
                    SectionId::Battery,
                    version,
                    settings.get(SectionId::Battery),
                    &mut store,
                )
                .unwrap();
        }
        assert_eq!(settings.version(SectionId::Battery), 3);

        // Power cycle
        let mut store = FlashStore::open(store.into_inner(), 0).unwrap();
        let mut restored = SettingsStore::new();
        restored.load_from_nvs(&store);
        assert_eq!(restored.version(SectionId::Battery), 3);
        let cache = Cache::new(MockClock::new(0));
        assert_eq!(cache.restore_all_from_nvs(&store), Ok(1));
        assert_eq!(cache.get_state(SectionId::Battery).unwrap().unwrap().version, 3);

        // The next edit is newer than anything the receiver holds
        let next = restored.factory_reset(SectionId::Battery, &mut store).unwrap();
        assert_eq!(next, 4);
        assert!(is_newer(next, 3));
    }
}
