//! Persistent key/value storage
//!
//! NVS-like byte-blob store split into namespaces. Versioned section blobs
//! share one layout:
//!
//! ```text
//! u16 struct_version | u32 section_version | u16 len | bytes[len]
//! ```
//!
//! [`MemoryStore`] keeps everything in RAM; [`FlashStore`] puts the same
//! key space on NOR flash.

mod flash;

use core::fmt;

use heapless::{String, Vec};

use crate::config::cache::STRUCT_VERSION;
use crate::config::storage::{MAX_BLOB, MAX_KEYS, MAX_KEY_LEN};

pub use flash::FlashStore;

const BLOB_HEADER_LEN: usize = 8;

pub type Blob = Vec<u8, MAX_BLOB>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// No room for another key
    Full,
    /// Value larger than a blob may be
    TooLarge,
    /// Key or namespace name too long
    KeyTooLong,
    /// Underlying write failed
    WriteFailed,
    /// Underlying read failed
    ReadFailed,
    /// Flash region unusable for this store (alignment, size)
    BadRegion,
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Full => write!(f, "store full"),
            StoreError::TooLarge => write!(f, "value too large"),
            StoreError::KeyTooLong => write!(f, "key too long"),
            StoreError::WriteFailed => write!(f, "write failed"),
            StoreError::ReadFailed => write!(f, "read failed"),
            StoreError::BadRegion => write!(f, "unusable flash region"),
        }
    }
}

/// Byte-blob key/value store with namespaces
pub trait PersistentStore {
    /// Missing keys are `Ok(None)`
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Blob>, StoreError>;

    fn put(&mut self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    fn erase_namespace(&mut self, namespace: &str) -> Result<(), StoreError>;
}

/// Why a stored section blob was not usable
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobError {
    Truncated,
    StructVersion(u16),
    LengthMismatch,
}

/// Build a versioned section blob
pub fn encode_section_blob(section_version: u32, bytes: &[u8]) -> Result<Blob, StoreError> {
    let mut blob = Blob::new();
    blob.extend_from_slice(&STRUCT_VERSION.to_le_bytes())
        .map_err(|_| StoreError::TooLarge)?;
    blob.extend_from_slice(&section_version.to_le_bytes())
        .map_err(|_| StoreError::TooLarge)?;
    blob.extend_from_slice(&(bytes.len() as u16).to_le_bytes())
        .map_err(|_| StoreError::TooLarge)?;
    blob.extend_from_slice(bytes)
        .map_err(|_| StoreError::TooLarge)?;
    Ok(blob)
}

/// Split a versioned section blob into `(section_version, bytes)`
pub fn decode_section_blob(blob: &[u8]) -> Result<(u32, &[u8]), BlobError> {
    if blob.len() < BLOB_HEADER_LEN {
        return Err(BlobError::Truncated);
    }
    let struct_version = u16::from_le_bytes([blob[0], blob[1]]);
    if struct_version != STRUCT_VERSION {
        return Err(BlobError::StructVersion(struct_version));
    }
    let section_version = u32::from_le_bytes([blob[2], blob[3], blob[4], blob[5]]);
    let len = u16::from_le_bytes([blob[6], blob[7]]) as usize;
    let body = &blob[BLOB_HEADER_LEN..];
    if body.len() != len {
        return Err(BlobError::LengthMismatch);
    }
    Ok((section_version, body))
}

#[derive(Clone)]
struct Entry {
    namespace: String<MAX_KEY_LEN>,
    key: String<MAX_KEY_LEN>,
    value: Blob,
}

/// RAM-backed store
///
/// Used by host tests, and as the in-memory image of a [`FlashStore`].
#[derive(Clone)]
pub struct MemoryStore {
    entries: Vec<Entry, MAX_KEYS>,
    fail_writes: bool,
    writes: u32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            fail_writes: false,
            writes: 0,
        }
    }

    /// Make every following `put` fail until cleared
    pub fn set_fail_writes(&mut self, fail: bool) {
        self.fail_writes = fail;
    }

    /// Successful writes so far
    pub fn write_count(&self) -> u32 {
        self.writes
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find(&self, namespace: &str, key: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.namespace.as_str() == namespace && e.key.as_str() == key)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn bounded(s: &str) -> Result<String<MAX_KEY_LEN>, StoreError> {
    let mut out = String::new();
    out.push_str(s).map_err(|_| StoreError::KeyTooLong)?;
    Ok(out)
}

impl PersistentStore for MemoryStore {
    fn get(&self, namespace: &str, key: &str) -> Result<Option<Blob>, StoreError> {
        Ok(self.find(namespace, key).map(|i| self.entries[i].value.clone()))
    }

    fn put(&mut self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(StoreError::WriteFailed);
        }
        let mut value = Blob::new();
        value
            .extend_from_slice(bytes)
            .map_err(|_| StoreError::TooLarge)?;

        match self.find(namespace, key) {
            Some(i) => self.entries[i].value = value,
            None => {
                let entry = Entry {
                    namespace: bounded(namespace)?,
                    key: bounded(key)?,
                    value,
                };
                self.entries.push(entry).map_err(|_| StoreError::Full)?;
            }
        }
        self.writes += 1;
        Ok(())
    }

    fn erase_namespace(&mut self, namespace: &str) -> Result<(), StoreError> {
        self.entries.retain(|e| e.namespace.as_str() != namespace);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_get_overwrite() {
        let mut store = MemoryStore::new();
        assert_eq!(store.get("settings", "mqtt"), Ok(None));

        store.put("settings", "mqtt", &[1, 2, 3]).unwrap();
        store.put("settings", "mqtt", &[4]).unwrap();
        assert_eq!(store.get("settings", "mqtt").unwrap().unwrap().as_slice(), &[4]);
        assert_eq!(store.len(), 1);
        assert_eq!(store.write_count(), 2);
    }

    #[test]
    fn test_namespaces_are_separate() {
        let mut store = MemoryStore::new();
        store.put("settings", "net", &[1]).unwrap();
        store.put("cache_state", "net", &[2]).unwrap();

        store.erase_namespace("settings").unwrap();
        assert_eq!(store.get("settings", "net"), Ok(None));
        assert_eq!(store.get("cache_state", "net").unwrap().unwrap().as_slice(), &[2]);
    }

    #[test]
    fn test_write_failure_injection() {
        let mut store = MemoryStore::new();
        store.set_fail_writes(true);
        assert_eq!(store.put("a", "b", &[1]), Err(StoreError::WriteFailed));
        store.set_fail_writes(false);
        assert!(store.put("a", "b", &[1]).is_ok());
    }

    #[test]
    fn test_key_too_long() {
        let mut store = MemoryStore::new();
        assert_eq!(
            store.put("settings", "a_key_that_is_far_too_long", &[1]),
            Err(StoreError::KeyTooLong)
        );
    }

    #[test]
    fn test_section_blob_layout() {
        let blob = encode_section_blob(0x0102_0304, &[0xAA, 0xBB]).unwrap();
        assert_eq!(
            blob.as_slice(),
            &[1, 0, 0x04, 0x03, 0x02, 0x01, 2, 0, 0xAA, 0xBB]
        );
        assert_eq!(decode_section_blob(&blob), Ok((0x0102_0304, &[0xAA, 0xBB][..])));
    }

    #[test]
    fn test_section_blob_rejects_other_struct_version() {
        let mut blob = encode_section_blob(3, &[1]).unwrap();
        blob[0] = 9;
        assert_eq!(decode_section_blob(&blob), Err(BlobError::StructVersion(9)));
        assert_eq!(decode_section_blob(&[1, 0, 0]), Err(BlobError::Truncated));
    }
}
