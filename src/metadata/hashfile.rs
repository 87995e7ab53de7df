//! Memory-mapped fixed-record hash file with linear probing.
//!
//! Metadata and file-handle mapping files are hash tables persisted on disk.
//! Records are fixed size, addressed by probing from `hash mod capacity`;
//! every record carries the key hash (so mismatching keys are skipped without
//! comparison) and a CRC of its payload (so torn writes are detected when the
//! file is opened again).

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian};
use crc::{Crc, CRC_32_ISO_HDLC};
use memmap2::MmapMut;
use parking_lot::Mutex;
use tracing::warn;

/// Checksum used for record CRCs and key hashes.
pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Hash of a record key, also the probe start.
pub fn key_hash(key: &[u8]) -> u32 {
    CRC32.checksum(key)
}

const MAGIC: &[u8; 4] = b"ZFSH";
const FORMAT_VERSION: u32 = 1;
const HEADER_SIZE: usize = 32;

/// Initial capacity of a fresh file; a prime.
const INITIAL_CAPACITY: u32 = 127;

const SLOT_EMPTY: u32 = 0;
const SLOT_DELETED: u32 = 1;
const SLOT_VALID: u32 = 2;

/// Per-slot overhead: status and key hash before the payload, CRC after it.
const SLOT_PREFIX: usize = 8;
const SLOT_SUFFIX: usize = 4;

/// A persistent hash table of fixed-size records.
///
/// Concurrent access is serialized by an internal latch; the disk image is
/// synchronized after every mutation.
pub struct HashFile {
    inner: Mutex<Inner>,
}

struct Inner {
    file: File,
    map: MmapMut,
    path: PathBuf,
    payload_size: usize,
    capacity: u32,
    elements: u32,
    deleted: u32,
}

impl HashFile {
    /// Open or create the hash file at `path` for records of `payload_size`
    /// bytes. Opening scans for torn writes: a valid slot whose payload CRC
    /// disagrees with the stored one is downgraded to deleted.
    pub fn open(path: &Path, payload_size: usize) -> io::Result<HashFile> {
        let mut inner = if path.exists() {
            Inner::load(path, payload_size)?
        } else {
            Inner::create(path, payload_size, INITIAL_CAPACITY)?
        };
        inner.recover()?;
        Ok(HashFile { inner: Mutex::new(inner) })
    }

    /// Find the record whose key hash is `hash` and whose payload satisfies
    /// `matches`.
    pub fn lookup(&self, hash: u32, matches: impl Fn(&[u8]) -> bool) -> Option<Vec<u8>> {
        let inner = self.inner.lock();
        inner.probe(hash, &matches).map(|slot| inner.payload(slot).to_vec())
    }

    /// Insert the record, replacing an existing record with the same key.
    pub fn insert(
        &self,
        hash: u32,
        matches: impl Fn(&[u8]) -> bool,
        payload: &[u8],
    ) -> io::Result<()> {
        let mut inner = self.inner.lock();
        assert_eq!(payload.len(), inner.payload_size);
        inner.maybe_expand()?;
        inner.insert_record(hash, &matches, payload)?;
        inner.sync_header()
    }

    /// Delete the record if present. Returns whether a record was removed.
    pub fn delete(&self, hash: u32, matches: impl Fn(&[u8]) -> bool) -> io::Result<bool> {
        let mut inner = self.inner.lock();
        let Some(slot) = inner.probe(hash, &matches) else {
            return Ok(false);
        };
        inner.set_status(slot, SLOT_DELETED);
        inner.elements -= 1;
        inner.deleted += 1;
        inner.sync_slot(slot)?;
        inner.sync_header()?;
        Ok(true)
    }

    /// Visit every valid record payload.
    pub fn for_each(&self, mut visit: impl FnMut(&[u8])) {
        let inner = self.inner.lock();
        for slot in 0..inner.capacity {
            if inner.status(slot) == SLOT_VALID {
                visit(inner.payload(slot));
            }
        }
    }

    /// Number of valid records.
    pub fn len(&self) -> u32 {
        self.inner.lock().elements
    }

    /// True if no valid record exists.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Inner {
    fn record_size(payload_size: usize) -> usize {
        SLOT_PREFIX + payload_size + SLOT_SUFFIX
    }

    fn create(path: &Path, payload_size: usize, capacity: u32) -> io::Result<Inner> {
        let file = OpenOptions::new().read(true).write(true).create(true).truncate(true).open(path)?;
        let size = HEADER_SIZE + Self::record_size(payload_size) * capacity as usize;
        file.set_len(size as u64)?;
        let mut map = unsafe { MmapMut::map_mut(&file)? };

        map[0..4].copy_from_slice(MAGIC);
        LittleEndian::write_u32(&mut map[4..8], FORMAT_VERSION);
        LittleEndian::write_u32(&mut map[8..12], Self::record_size(payload_size) as u32);
        LittleEndian::write_u32(&mut map[12..16], capacity);
        LittleEndian::write_u32(&mut map[16..20], 0);
        LittleEndian::write_u32(&mut map[20..24], 0);
        map.flush()?;

        Ok(Inner {
            file,
            map,
            path: path.to_path_buf(),
            payload_size,
            capacity,
            elements: 0,
            deleted: 0,
        })
    }

    fn load(path: &Path, payload_size: usize) -> io::Result<Inner> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let map = unsafe { MmapMut::map_mut(&file)? };

        if map.len() < HEADER_SIZE || &map[0..4] != MAGIC {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad hash file magic"));
        }
        if LittleEndian::read_u32(&map[4..8]) != FORMAT_VERSION {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad hash file version"));
        }
        let record_size = LittleEndian::read_u32(&map[8..12]) as usize;
        if record_size != Self::record_size(payload_size) {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "bad hash file record size"));
        }
        let capacity = LittleEndian::read_u32(&map[12..16]);
        let expected = HEADER_SIZE + record_size * capacity as usize;
        if map.len() < expected {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "truncated hash file"));
        }
        let elements = LittleEndian::read_u32(&map[16..20]);
        let deleted = LittleEndian::read_u32(&map[20..24]);

        Ok(Inner { file, map, path: path.to_path_buf(), payload_size, capacity, elements, deleted })
    }

    /// Downgrade slots whose payload CRC does not verify; recount.
    fn recover(&mut self) -> io::Result<()> {
        let mut elements = 0;
        let mut deleted = 0;
        let mut torn = 0;
        for slot in 0..self.capacity {
            match self.status(slot) {
                SLOT_VALID => {
                    if CRC32.checksum(self.payload(slot)) == self.stored_crc(slot) {
                        elements += 1;
                    } else {
                        self.set_status(slot, SLOT_DELETED);
                        deleted += 1;
                        torn += 1;
                    }
                }
                SLOT_DELETED => deleted += 1,
                _ => {}
            }
        }
        if torn > 0 {
            warn!(path = %self.path.display(), torn, "downgraded torn hash file records");
        }
        if torn > 0 || elements != self.elements || deleted != self.deleted {
            self.elements = elements;
            self.deleted = deleted;
            self.map.flush()?;
            self.sync_header()?;
        }
        Ok(())
    }

    fn slot_offset(&self, slot: u32) -> usize {
        HEADER_SIZE + Self::record_size(self.payload_size) * slot as usize
    }

    fn status(&self, slot: u32) -> u32 {
        LittleEndian::read_u32(&self.map[self.slot_offset(slot)..])
    }

    fn set_status(&mut self, slot: u32, status: u32) {
        let off = self.slot_offset(slot);
        LittleEndian::write_u32(&mut self.map[off..off + 4], status);
    }

    fn slot_hash(&self, slot: u32) -> u32 {
        LittleEndian::read_u32(&self.map[self.slot_offset(slot) + 4..])
    }

    fn payload(&self, slot: u32) -> &[u8] {
        let start = self.slot_offset(slot) + SLOT_PREFIX;
        &self.map[start..start + self.payload_size]
    }

    fn stored_crc(&self, slot: u32) -> u32 {
        let off = self.slot_offset(slot) + SLOT_PREFIX + self.payload_size;
        LittleEndian::read_u32(&self.map[off..])
    }

    /// Linear probe for a valid record matching `hash` and `matches`.
    fn probe(&self, hash: u32, matches: &impl Fn(&[u8]) -> bool) -> Option<u32> {
        let mut slot = hash % self.capacity;
        for _ in 0..self.capacity {
            match self.status(slot) {
                SLOT_EMPTY => return None,
                SLOT_VALID if self.slot_hash(slot) == hash && matches(self.payload(slot)) => {
                    return Some(slot)
                }
                _ => {}
            }
            slot = (slot + 1) % self.capacity;
        }
        None
    }

    fn insert_record(
        &mut self,
        hash: u32,
        matches: &impl Fn(&[u8]) -> bool,
        payload: &[u8],
    ) -> io::Result<()> {
        let mut slot = hash % self.capacity;
        let mut target = None;
        for _ in 0..self.capacity {
            match self.status(slot) {
                SLOT_EMPTY => {
                    if target.is_none() {
                        target = Some((slot, false));
                    }
                    break;
                }
                SLOT_DELETED => {
                    if target.is_none() {
                        target = Some((slot, true));
                    }
                }
                SLOT_VALID if self.slot_hash(slot) == hash && matches(self.payload(slot)) => {
                    target = Some((slot, false));
                    self.elements -= 1;
                    break;
                }
                _ => {}
            }
            slot = (slot + 1) % self.capacity;
        }
        let (slot, was_deleted) = target
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "hash file is full"))?;

        let off = self.slot_offset(slot);
        LittleEndian::write_u32(&mut self.map[off..off + 4], SLOT_VALID);
        LittleEndian::write_u32(&mut self.map[off + 4..off + 8], hash);
        self.map[off + SLOT_PREFIX..off + SLOT_PREFIX + payload.len()].copy_from_slice(payload);
        let crc = CRC32.checksum(payload);
        let crc_off = off + SLOT_PREFIX + payload.len();
        LittleEndian::write_u32(&mut self.map[crc_off..crc_off + 4], crc);

        self.elements += 1;
        if was_deleted {
            self.deleted -= 1;
        }
        self.sync_slot(slot)
    }

    /// Rebuild into a larger file once live plus deleted slots pass ~60% of
    /// capacity. The new file is written beside the old one and renamed over
    /// it, so a crash mid-rebuild leaves the original intact.
    fn maybe_expand(&mut self) -> io::Result<()> {
        if (self.elements as u64 + self.deleted as u64 + 1) * 5 < self.capacity as u64 * 3 {
            return Ok(());
        }

        let capacity = next_prime(self.elements.saturating_mul(4).max(INITIAL_CAPACITY));
        let new_path = self.path.with_extension("rebuild");
        let mut fresh = Inner::create(&new_path, self.payload_size, capacity)?;
        for slot in 0..self.capacity {
            if self.status(slot) == SLOT_VALID {
                let hash = self.slot_hash(slot);
                let payload = self.payload(slot).to_vec();
                fresh.insert_record(hash, &|_| false, &payload)?;
            }
        }
        fresh.sync_header()?;
        std::fs::rename(&new_path, &self.path)?;
        fresh.path = self.path.clone();

        *self = fresh;
        Ok(())
    }

    fn sync_slot(&mut self, slot: u32) -> io::Result<()> {
        let off = self.slot_offset(slot);
        self.map.flush_range(off, Self::record_size(self.payload_size))
    }

    fn sync_header(&mut self) -> io::Result<()> {
        LittleEndian::write_u32(&mut self.map[16..20], self.elements);
        LittleEndian::write_u32(&mut self.map[20..24], self.deleted);
        self.map.flush_range(0, HEADER_SIZE)?;
        self.file.sync_data()
    }
}

/// Smallest prime not less than `n`.
fn next_prime(n: u32) -> u32 {
    fn is_prime(n: u32) -> bool {
        if n < 2 {
            return false;
        }
        let mut d = 2u32;
        while d.saturating_mul(d) <= n {
            if n % d == 0 {
                return false;
            }
            d += 1;
        }
        true
    }
    let mut n = n.max(2);
    while !is_prime(n) {
        n += 1;
    }
    n
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(key: u32, value: u64) -> Vec<u8> {
        let mut buf = vec![0u8; 12];
        LittleEndian::write_u32(&mut buf[0..4], key);
        LittleEndian::write_u64(&mut buf[4..12], value);
        buf
    }

    fn key_of(payload: &[u8]) -> u32 {
        LittleEndian::read_u32(&payload[0..4])
    }

    #[test]
    fn insert_lookup_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.hash");
        let hf = HashFile::open(&path, 12).unwrap();

        for key in 0u32..40 {
            let hash = key_hash(&key.to_le_bytes());
            hf.insert(hash, |p| key_of(p) == key, &payload(key, u64::from(key) * 7)).unwrap();
        }
        assert_eq!(hf.len(), 40);

        let hash = key_hash(&17u32.to_le_bytes());
        let found = hf.lookup(hash, |p| key_of(p) == 17).unwrap();
        assert_eq!(LittleEndian::read_u64(&found[4..12]), 17 * 7);

        assert!(hf.delete(hash, |p| key_of(p) == 17).unwrap());
        assert!(hf.lookup(hash, |p| key_of(p) == 17).is_none());
        assert!(!hf.delete(hash, |p| key_of(p) == 17).unwrap());
    }

    #[test]
    fn replace_keeps_single_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.hash");
        let hf = HashFile::open(&path, 12).unwrap();

        let hash = key_hash(&5u32.to_le_bytes());
        hf.insert(hash, |p| key_of(p) == 5, &payload(5, 1)).unwrap();
        hf.insert(hash, |p| key_of(p) == 5, &payload(5, 2)).unwrap();
        assert_eq!(hf.len(), 1);
        let found = hf.lookup(hash, |p| key_of(p) == 5).unwrap();
        assert_eq!(LittleEndian::read_u64(&found[4..12]), 2);
    }

    #[test]
    fn survives_reopen_and_growth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.hash");
        {
            let hf = HashFile::open(&path, 12).unwrap();
            // enough inserts to force at least one rebuild
            for key in 0u32..300 {
                let hash = key_hash(&key.to_le_bytes());
                hf.insert(hash, |p| key_of(p) == key, &payload(key, u64::from(key))).unwrap();
            }
        }
        let hf = HashFile::open(&path, 12).unwrap();
        assert_eq!(hf.len(), 300);
        for key in [0u32, 123, 299] {
            let hash = key_hash(&key.to_le_bytes());
            assert!(hf.lookup(hash, |p| key_of(p) == key).is_some());
        }
    }

    #[test]
    fn torn_record_is_downgraded_at_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.hash");
        let hash = key_hash(&9u32.to_le_bytes());
        {
            let hf = HashFile::open(&path, 12).unwrap();
            hf.insert(hash, |p| key_of(p) == 9, &payload(9, 9)).unwrap();
        }

        // flip one payload byte behind the CRC's back
        let mut bytes = std::fs::read(&path).unwrap();
        let slot = (hash % INITIAL_CAPACITY) as usize;
        let off = HEADER_SIZE + (SLOT_PREFIX + 12 + SLOT_SUFFIX) * slot + SLOT_PREFIX;
        bytes[off + 4] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let hf = HashFile::open(&path, 12).unwrap();
        assert_eq!(hf.len(), 0);
        assert!(hf.lookup(hash, |p| key_of(p) == 9).is_none());
    }

    #[test]
    fn next_prime_steps_to_primes() {
        assert_eq!(next_prime(1), 2);
        assert_eq!(next_prime(14), 17);
        assert_eq!(next_prime(127), 127);
    }
}
