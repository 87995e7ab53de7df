//! Per-volume persistence: metadata records, handle mappings, hardlink
//! lists, directory journals and interval side files.
//!
//! Everything lives under `<local_path>/.config/`. Journal, interval and
//! hardlink files are spread over a directory tree `AA/BB/...` of
//! `metadata_tree_depth` two-hex-digit levels so no single directory grows
//! large. Any I/O failure here poisons the volume (`delete_mark`) rather
//! than failing the filesystem operation; the caller applies that policy.

pub mod hardlinks;
pub mod hashfile;
pub mod intervals;
pub mod journal;
pub mod record;

use std::io;
use std::path::{Path, PathBuf};

use crate::fh::ZfsFh;
use crate::CONFIG_DIR;

use hardlinks::{Hardlink, HardlinkList};
use hashfile::{key_hash, HashFile};
use intervals::{IntervalSet, INTERVAL_FLUSH_DELTA};
use journal::{Journal, JournalEntry};
use record::{FhMappingRecord, MetadataRecord};

/// Which of the two interval sets of a file a side file belongs to.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum IntervalKind {
    /// Ranges known to equal the master.
    Updated,
    /// Locally dirty ranges.
    Modified,
}

impl IntervalKind {
    fn extension(self) -> &'static str {
        match self {
            IntervalKind::Updated => "u",
            IntervalKind::Modified => "m",
        }
    }
}

/// Handle to one volume's on-disk metadata.
pub struct VolumeMetadata {
    config_root: PathBuf,
    tree_depth: u32,
    metadata: HashFile,
    fh_mapping: HashFile,
}

impl VolumeMetadata {
    /// Open or create the metadata of the volume cached at `local_path`.
    pub fn open(local_path: &Path, tree_depth: u32) -> io::Result<VolumeMetadata> {
        let config_root = local_path.join(CONFIG_DIR);
        std::fs::create_dir_all(&config_root)?;
        let metadata =
            HashFile::open(&config_root.join("metadata.hash"), MetadataRecord::PAYLOAD_SIZE)?;
        let fh_mapping =
            HashFile::open(&config_root.join("fh_mapping.hash"), FhMappingRecord::PAYLOAD_SIZE)?;
        Ok(VolumeMetadata { config_root, tree_depth, metadata, fh_mapping })
    }

    // -- metadata records ---------------------------------------------------

    /// Fetch the record of `(dev, ino)`; `None` means an empty slot the
    /// caller may populate.
    pub fn lookup(&self, dev: u32, ino: u32) -> Option<MetadataRecord> {
        let hash = key_hash(&MetadataRecord::key_bytes(dev, ino));
        self.metadata
            .lookup(hash, |p| MetadataRecord::matches_key(p, dev, ino))
            .map(|p| MetadataRecord::decode(&p))
    }

    /// Durable write-back of a record.
    pub fn flush(&self, record: &MetadataRecord) -> io::Result<()> {
        let hash = key_hash(&MetadataRecord::key_bytes(record.dev, record.ino));
        self.metadata.insert(
            hash,
            |p| MetadataRecord::matches_key(p, record.dev, record.ino),
            &record.encode(),
        )
    }

    /// Remove one hardlink of the record; when the count reaches zero the
    /// record, its mapping and its side files are dropped.
    pub fn delete(
        &self,
        record: &MetadataRecord,
        parent_dev: u32,
        parent_ino: u32,
        name: &str,
    ) -> io::Result<()> {
        let remaining = self.hardlink_remove(record.dev, record.ino, parent_dev, parent_ino, name)?;
        if remaining > 0 {
            return Ok(());
        }
        let hash = key_hash(&MetadataRecord::key_bytes(record.dev, record.ino));
        self.metadata.delete(hash, |p| MetadataRecord::matches_key(p, record.dev, record.ino))?;
        if record.master_fh.is_defined() {
            self.delete_mapping(&record.master_fh)?;
        }
        for kind in [IntervalKind::Updated, IntervalKind::Modified] {
            let _ = std::fs::remove_file(self.interval_path(record.ino, kind));
        }
        let _ = std::fs::remove_file(self.journal_path(record.ino));
        Ok(())
    }

    // -- master handle mapping ----------------------------------------------

    pub fn lookup_mapping(&self, master_fh: &ZfsFh) -> Option<FhMappingRecord> {
        let hash = key_hash(&FhMappingRecord::key_bytes(master_fh));
        self.fh_mapping
            .lookup(hash, |p| FhMappingRecord::matches_key(p, master_fh))
            .map(|p| FhMappingRecord::decode(&p))
    }

    pub fn flush_mapping(&self, record: &FhMappingRecord) -> io::Result<()> {
        let hash = key_hash(&FhMappingRecord::key_bytes(&record.master_fh));
        self.fh_mapping.insert(
            hash,
            |p| FhMappingRecord::matches_key(p, &record.master_fh),
            &record.encode(),
        )
    }

    pub fn delete_mapping(&self, master_fh: &ZfsFh) -> io::Result<()> {
        let hash = key_hash(&FhMappingRecord::key_bytes(master_fh));
        self.fh_mapping.delete(hash, |p| FhMappingRecord::matches_key(p, master_fh))?;
        Ok(())
    }

    // -- hardlink lists -----------------------------------------------------

    pub fn hardlink_insert(
        &self,
        _dev: u32,
        ino: u32,
        parent_dev: u32,
        parent_ino: u32,
        name: &str,
    ) -> io::Result<u32> {
        let path = self.hardlink_path(ino);
        let mut list = HardlinkList::load(&path)?;
        if list.insert(Hardlink { parent_dev, parent_ino, name: name.to_owned() }) {
            list.store(&path)?;
        }
        Ok(list.number())
    }

    pub fn hardlink_replace(
        &self,
        ino: u32,
        old: (u32, u32, &str),
        new_parent_dev: u32,
        new_parent_ino: u32,
        new_name: &str,
    ) -> io::Result<u32> {
        let path = self.hardlink_path(ino);
        let mut list = HardlinkList::load(&path)?;
        list.replace(
            old,
            Hardlink {
                parent_dev: new_parent_dev,
                parent_ino: new_parent_ino,
                name: new_name.to_owned(),
            },
        );
        list.store(&path)?;
        Ok(list.number())
    }

    pub fn hardlink_remove(
        &self,
        _dev: u32,
        ino: u32,
        parent_dev: u32,
        parent_ino: u32,
        name: &str,
    ) -> io::Result<u32> {
        let path = self.hardlink_path(ino);
        let mut list = HardlinkList::load(&path)?;
        if list.remove(parent_dev, parent_ino, name) {
            list.store(&path)?;
        }
        Ok(list.number())
    }

    /// The hardlink count of `(dev, ino)`.
    pub fn hardlink_number(&self, ino: u32) -> io::Result<u32> {
        Ok(HardlinkList::load(&self.hardlink_path(ino))?.number())
    }

    // -- interval side files --------------------------------------------------

    /// Merge `[lo, hi)` into the in-memory set and persist it once enough
    /// inserts accumulated since the last flush.
    pub fn append_interval(
        &self,
        set: &mut IntervalSet,
        ino: u32,
        kind: IntervalKind,
        lo: u64,
        hi: u64,
    ) -> io::Result<()> {
        set.insert(lo, hi);
        if set.pending_flush() >= INTERVAL_FLUSH_DELTA {
            set.store(&self.interval_path(ino, kind))?;
        }
        Ok(())
    }

    /// Load the interval set, reconciled against the file's current size.
    pub fn load_intervals(&self, ino: u32, kind: IntervalKind, size: u64) -> io::Result<IntervalSet> {
        IntervalSet::load(&self.interval_path(ino, kind), size)
    }

    /// Persist the interval set unconditionally.
    pub fn store_intervals(
        &self,
        set: &mut IntervalSet,
        ino: u32,
        kind: IntervalKind,
    ) -> io::Result<()> {
        set.store(&self.interval_path(ino, kind))
    }

    // -- directory journals ----------------------------------------------------

    pub fn read_journal(&self, dir_ino: u32) -> io::Result<Journal> {
        Journal::load(&self.journal_path(dir_ino))
    }

    pub fn write_journal(&self, dir_ino: u32, journal: &Journal) -> io::Result<()> {
        journal.store(&self.journal_path(dir_ino))
    }

    /// Append one entry to the directory's journal file. The in-memory
    /// journal already applied deduplication, so annihilated pairs are
    /// compacted away when the file is next opened.
    pub fn add_journal_entry(&self, dir_ino: u32, entry: &JournalEntry) -> io::Result<()> {
        Journal::append_to(&self.journal_path(dir_ino), entry)
    }

    pub fn journal_empty(&self, dir_ino: u32) -> io::Result<bool> {
        Ok(self.read_journal(dir_ino)?.is_empty())
    }

    // -- paths ------------------------------------------------------------------

    fn tree_path(&self, kind_dir: &str, ino: u32) -> PathBuf {
        let mut path = self.config_root.join(kind_dir);
        for level in 0..self.tree_depth {
            let byte = (ino >> (8 * level)) & 0xff;
            path.push(format!("{byte:02x}"));
        }
        path.push(ino.to_string());
        path
    }

    fn journal_path(&self, dir_ino: u32) -> PathBuf {
        self.tree_path("journal", dir_ino)
    }

    fn interval_path(&self, ino: u32, kind: IntervalKind) -> PathBuf {
        let mut path = self.tree_path("intervals", ino);
        path.set_extension(kind.extension());
        path
    }

    fn hardlink_path(&self, ino: u32) -> PathBuf {
        self.tree_path("hardlinks", ino)
    }
}

#[cfg(test)]
mod tests {
    use super::journal::JournalOp;
    use super::*;

    fn open_store() -> (tempfile::TempDir, VolumeMetadata) {
        let dir = tempfile::tempdir().unwrap();
        let store = VolumeMetadata::open(dir.path(), 1).unwrap();
        (dir, store)
    }

    #[test]
    fn record_lifecycle_tracks_hardlinks() {
        let (_dir, store) = open_store();
        let mut record = MetadataRecord { dev: 3, ino: 42, gen: 1, ..Default::default() };
        record.local_version = 1;

        assert!(store.lookup(3, 42).is_none());
        store.flush(&record).unwrap();
        assert_eq!(store.lookup(3, 42).unwrap(), record);

        store.hardlink_insert(3, 42, 3, 1, "a").unwrap();
        store.hardlink_insert(3, 42, 3, 1, "b").unwrap();
        assert_eq!(store.hardlink_number(42).unwrap(), 2);

        // first unlink keeps the record alive
        store.delete(&record, 3, 1, "a").unwrap();
        assert!(store.lookup(3, 42).is_some());

        store.delete(&record, 3, 1, "b").unwrap();
        assert!(store.lookup(3, 42).is_none());
    }

    #[test]
    fn mapping_roundtrip() {
        let (_dir, store) = open_store();
        let master_fh = ZfsFh::new(1, 7, 9, 100, 2);
        let mapping = FhMappingRecord { master_fh, dev: 3, ino: 42 };
        store.flush_mapping(&mapping).unwrap();
        assert_eq!(store.lookup_mapping(&master_fh).unwrap(), mapping);
        store.delete_mapping(&master_fh).unwrap();
        assert!(store.lookup_mapping(&master_fh).is_none());
    }

    #[test]
    fn journal_file_under_tree() {
        let (dir, store) = open_store();
        let mut journal = Journal::new();
        journal.insert(JournalOp::Add, ZfsFh::new(1, 7, 3, 5, 1), ZfsFh::UNDEFINED, 0, "x");
        store.write_journal(0x1234, &journal).unwrap();

        // depth 1: one two-hex-digit level from the low byte
        assert!(dir.path().join(".config/journal/34/4660").exists());
        assert!(!store.journal_empty(0x1234).unwrap());
        assert_eq!(store.read_journal(0x1234).unwrap(), journal);
    }

    #[test]
    fn interval_flush_threshold() {
        let (_dir, store) = open_store();
        let mut set = IntervalSet::new();
        // stays in memory below the threshold
        store.append_interval(&mut set, 7, IntervalKind::Updated, 0, 10).unwrap();
        assert!(store.load_intervals(7, IntervalKind::Updated, 1000).unwrap().is_empty());

        for i in 0..INTERVAL_FLUSH_DELTA as u64 {
            store
                .append_interval(&mut set, 7, IntervalKind::Updated, i * 100, i * 100 + 10)
                .unwrap();
        }
        let loaded = store.load_intervals(7, IntervalKind::Updated, 100_000).unwrap();
        assert!(!loaded.is_empty());
    }
}
