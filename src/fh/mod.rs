//! File handles and the in-memory inode graph.
//!
//! Every inode the daemon knows about, local or remote, is identified by a
//! [`ZfsFh`] and materialized as an [`InternalFh`]. Named edges between them
//! are [`Dentry`] records kept in the [`FhTable`] together with the lookup
//! indices. The table mutex is the outermost latch of the file-handle
//! hierarchy; per-handle state lives behind each handle's own mutex.

pub mod cleanup;
pub mod dentry;
pub mod lock;
pub mod virtdir;

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use num_derive::FromPrimitive;
use parking_lot::{Condvar, Mutex};

use crate::error::{Result, ZfsError};
use crate::metadata::journal::Journal;
use crate::metadata::record::MetadataRecord;
use crate::metadata::intervals::IntervalSet;
pub use dentry::Dentry;
use lock::{LockLevel, ReintegrationLease};

/// SID used in file handles of virtual directories.
pub const NODE_ID_NONE: u32 = 0;

/// Volume ID of the non-existing root volume backing the virtual tree.
pub const VOLUME_ID_VIRTUAL: u32 = 0;

/// Volume ID of the cluster configuration volume.
pub const VOLUME_ID_CONFIG: u32 = 1;

/// Device number reserved for synthetic conflict directories.
pub const CONFLICT_DEV: u32 = u32::MAX;

/// Device number reserved for the non-existing side of a conflict.
pub const NON_EXIST_DEV: u32 = u32::MAX - 1;

/// A cluster-wide file handle.
///
/// `sid` names the authoritative node, `vid` the volume, `(dev, ino)` the
/// storage inode on that node and `gen` detects inode slot reuse.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ZfsFh {
    pub sid: u32,
    pub vid: u32,
    pub dev: u32,
    pub ino: u32,
    pub gen: u32,
}

impl ZfsFh {
    pub const UNDEFINED: ZfsFh = ZfsFh { sid: 0, vid: 0, dev: 0, ino: 0, gen: 0 };

    pub fn new(sid: u32, vid: u32, dev: u32, ino: u32, gen: u32) -> Self {
        ZfsFh { sid, vid, dev, ino, gen }
    }

    /// Handle of a directory in the mount-point skeleton.
    pub fn is_virtual(&self) -> bool {
        self.sid == NODE_ID_NONE && self.vid == VOLUME_ID_VIRTUAL
    }

    /// Handle of a synthetic conflict directory.
    pub fn is_conflict(&self) -> bool {
        self.sid != NODE_ID_NONE && self.dev == CONFLICT_DEV
    }

    /// Placeholder for the side of a conflict that does not exist here.
    pub fn is_non_exist(&self) -> bool {
        self.sid != NODE_ID_NONE && self.dev == NON_EXIST_DEV
    }

    /// Handle backed by a real file on some node.
    pub fn is_regular(&self) -> bool {
        !self.is_virtual() && !self.is_conflict() && !self.is_non_exist() && *self != Self::UNDEFINED
    }

    pub fn is_defined(&self) -> bool {
        *self != Self::UNDEFINED
    }
}

/// File types carried in attributes and over the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive, Default)]
#[repr(u32)]
pub enum FileType {
    #[default]
    Bad = 0,
    Reg = 1,
    Dir = 2,
    Lnk = 3,
    Blk = 4,
    Chr = 5,
    Sock = 6,
    Fifo = 7,
}

impl FileType {
    /// The `S_IF*` bits corresponding to this type.
    pub fn to_mode_bits(self) -> u32 {
        match self {
            FileType::Bad => 0,
            FileType::Reg => libc::S_IFREG,
            FileType::Dir => libc::S_IFDIR,
            FileType::Lnk => libc::S_IFLNK,
            FileType::Blk => libc::S_IFBLK,
            FileType::Chr => libc::S_IFCHR,
            FileType::Sock => libc::S_IFSOCK,
            FileType::Fifo => libc::S_IFIFO,
        }
    }

    pub fn from_mode_bits(mode: u32) -> Self {
        match mode & libc::S_IFMT {
            libc::S_IFREG => FileType::Reg,
            libc::S_IFDIR => FileType::Dir,
            libc::S_IFLNK => FileType::Lnk,
            libc::S_IFBLK => FileType::Blk,
            libc::S_IFCHR => FileType::Chr,
            libc::S_IFSOCK => FileType::Sock,
            libc::S_IFIFO => FileType::Fifo,
            _ => FileType::Bad,
        }
    }
}

/// Cached attributes of a file, in both directions of the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct Fattr {
    pub ftype: FileType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub nlink: u32,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub atime: i64,
    pub mtime: i64,
    pub ctime: i64,
    pub version: u64,
}

/// Attribute changes requested by `setattr`; `None` fields stay untouched.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Sattr {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<i64>,
    pub mtime: Option<i64>,
}

/// An outstanding open of this file: the verifier handed out in the
/// capability and the open flags it was granted with.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CapGrant {
    pub flags: u32,
    pub verify: [u8; 16],
}

/// The canonical in-memory record of an inode.
pub struct InternalFh {
    /// Key of this record; never changes.
    pub fh: ZfsFh,
    pub data: Mutex<FhData>,
    /// Wakes threads waiting for a lock level change.
    pub cond: Condvar,
}

/// Mutable state of an [`InternalFh`], behind its mutex.
pub struct FhData {
    pub attr: Fattr,
    pub meta: MetadataRecord,
    /// Byte ranges known to equal the master at `meta.master_version`.
    pub updated: IntervalSet,
    /// Locally dirty byte ranges owing a write-back.
    pub modified: IntervalSet,
    /// Whether the interval side files have been read since this record
    /// was materialized.
    pub intervals_loaded: bool,
    /// Pending namespace operations of this directory.
    pub journal: Journal,
    pub level: LockLevel,
    /// Holders of the current level (>1 only for shared).
    pub users: u32,
    pub lease: Option<ReintegrationLease>,
    /// Mirror of the dentry back-index length, kept under this mutex so the
    /// destruction check does not need the table.
    pub ndentries: u32,
    /// Capabilities handed out by `open`/`create` and not yet closed.
    pub caps: Vec<CapGrant>,
}

impl InternalFh {
    fn new(fh: ZfsFh, attr: Fattr, meta: MetadataRecord) -> Arc<InternalFh> {
        Arc::new(InternalFh {
            fh,
            data: Mutex::new(FhData {
                attr,
                meta,
                updated: IntervalSet::new(),
                modified: IntervalSet::new(),
                intervals_loaded: false,
                journal: Journal::new(),
                level: LockLevel::Unlocked,
                users: 0,
                lease: None,
                ndentries: 0,
                caps: Vec::new(),
            }),
            cond: Condvar::new(),
        })
    }
}

/// Key of a dentry: owning directory handle and component name.
pub type DentryKey = (ZfsFh, String);

/// The four lookup indices over handles and dentries plus the destruction
/// queue. Guarded by one mutex, the outermost latch of the hierarchy.
#[derive(Default)]
pub struct FhTable {
    ifhs: HashMap<ZfsFh, Arc<InternalFh>>,
    dentries: HashMap<DentryKey, Dentry>,
    /// Dentries reaching each handle (hard links give several).
    by_child: HashMap<ZfsFh, Vec<DentryKey>>,
    /// Component names under each directory handle.
    children: HashMap<ZfsFh, BTreeSet<String>>,
    /// Volume-relative path index used by configuration notifications.
    by_path: HashMap<(u32, String), ZfsFh>,
    /// Handles with no dentry awaiting the cleanup pass.
    pub(crate) unused: VecDeque<(ZfsFh, Instant)>,
}

impl FhTable {
    pub fn new() -> Self {
        FhTable::default()
    }

    /// Find the handle record.
    pub fn get(&self, fh: &ZfsFh) -> Option<Arc<InternalFh>> {
        self.ifhs.get(fh).cloned()
    }

    /// Find the handle record or fail with [`ZfsError::Stale`].
    pub fn get_or_stale(&self, fh: &ZfsFh) -> Result<Arc<InternalFh>> {
        self.get(fh).ok_or(ZfsError::Stale)
    }

    /// Create the record unless it exists; returns it either way.
    pub fn intern(&mut self, fh: ZfsFh, attr: Fattr, meta: MetadataRecord) -> Arc<InternalFh> {
        match self.ifhs.get(&fh) {
            Some(existing) => {
                let ifh = existing.clone();
                ifh.data.lock().attr = attr;
                ifh
            }
            None => {
                let ifh = InternalFh::new(fh, attr, meta);
                self.ifhs.insert(fh, ifh.clone());
                ifh
            }
        }
    }

    /// Look up a dentry by directory handle and name.
    pub fn dentry(&self, dir: &ZfsFh, name: &str) -> Option<&Dentry> {
        self.dentries.get(&(*dir, name.to_owned()))
    }

    /// All dentries whose child is `fh`, for hardlink walks.
    pub fn dentries_of(&self, fh: &ZfsFh) -> Vec<Dentry> {
        self.by_child
            .get(fh)
            .map(|keys| keys.iter().filter_map(|k| self.dentries.get(k)).cloned().collect())
            .unwrap_or_default()
    }

    /// The primary dentry of `fh`, if any.
    pub fn first_dentry(&self, fh: &ZfsFh) -> Option<Dentry> {
        self.by_child
            .get(fh)
            .and_then(|keys| keys.first())
            .and_then(|k| self.dentries.get(k))
            .cloned()
    }

    /// Names under the directory `dir` (synthetic directories only; real
    /// directories are listed from disk).
    pub fn child_names(&self, dir: &ZfsFh) -> Vec<String> {
        self.children.get(dir).map(|set| set.iter().cloned().collect()).unwrap_or_default()
    }

    /// Number of dentries under `dir`.
    pub fn child_count(&self, dir: &ZfsFh) -> usize {
        self.children.get(dir).map_or(0, |set| set.len())
    }

    /// Handle previously registered for a volume-relative path.
    pub fn by_local_path(&self, vid: u32, rel_path: &str) -> Option<ZfsFh> {
        let fh = *self.by_path.get(&(vid, rel_path.to_owned()))?;
        // the index is advisory; confirm the handle still exists
        self.ifhs.contains_key(&fh).then_some(fh)
    }

    /// Interpose a dentry `dir/name -> fh`. An existing dentry at the same
    /// position pointing elsewhere is replaced.
    pub fn add_dentry(&mut self, parent: Option<ZfsFh>, name: &str, fh: ZfsFh) -> Dentry {
        let key: DentryKey = (parent.unwrap_or(ZfsFh::UNDEFINED), name.to_owned());
        if let Some(old) = self.dentries.get(&key).cloned() {
            if old.fh == fh {
                return old;
            }
            self.remove_dentry(&old);
        }
        let dentry = Dentry { parent, name: name.to_owned(), fh };
        self.dentries.insert(key.clone(), dentry.clone());
        self.by_child.entry(fh).or_default().push(key.clone());
        if let Some(parent) = parent {
            self.children.entry(parent).or_default().insert(name.to_owned());
        }
        if let Some(ifh) = self.ifhs.get(&fh) {
            ifh.data.lock().ndentries += 1;
        }
        if let Some(rel) = dentry::build_relative_path(self, &dentry) {
            self.by_path.insert((fh.vid, rel), fh);
        }
        dentry
    }

    /// Remove a dentry; when the child loses its last dentry and is
    /// unlocked, it is queued for destruction.
    pub fn remove_dentry(&mut self, dentry: &Dentry) {
        let key: DentryKey = (dentry.parent.unwrap_or(ZfsFh::UNDEFINED), dentry.name.clone());
        if self.dentries.remove(&key).is_none() {
            return;
        }
        if let Some(keys) = self.by_child.get_mut(&dentry.fh) {
            keys.retain(|k| *k != key);
            if keys.is_empty() {
                self.by_child.remove(&dentry.fh);
            }
        }
        if let Some(parent) = dentry.parent {
            if let Some(set) = self.children.get_mut(&parent) {
                set.remove(&dentry.name);
                if set.is_empty() {
                    self.children.remove(&parent);
                }
            }
        }
        if let Some(ifh) = self.ifhs.get(&dentry.fh) {
            let mut data = ifh.data.lock();
            data.ndentries = data.ndentries.saturating_sub(1);
            if data.ndentries == 0 && data.level == LockLevel::Unlocked && data.users == 0 {
                self.unused.push_back((dentry.fh, Instant::now()));
            }
        }
    }

    /// Move a dentry to a new position, keeping the child handle.
    pub fn reparent_dentry(
        &mut self,
        from_dir: &ZfsFh,
        from_name: &str,
        to_dir: ZfsFh,
        to_name: &str,
    ) -> Option<Dentry> {
        let dentry = self.dentry(from_dir, from_name)?.clone();
        // replace whatever the target position held
        if let Some(victim) = self.dentry(&to_dir, to_name).cloned() {
            self.remove_dentry(&victim);
        }
        self.remove_dentry(&dentry);
        Some(self.add_dentry(Some(to_dir), to_name, dentry.fh))
    }

    /// Drop a handle record outright (volume destruction, cleanup pass).
    pub fn evict(&mut self, fh: &ZfsFh) {
        for dentry in self.dentries_of(fh) {
            self.remove_dentry(&dentry);
        }
        self.ifhs.remove(fh);
        self.by_path.retain(|_, v| v != fh);
    }

    /// Drop the whole subtree hanging under `fh` (depth first), including
    /// `fh` itself. Used when a volume is removed from service.
    pub fn evict_subtree(&mut self, fh: &ZfsFh) {
        let names = self.child_names(fh);
        for name in names {
            if let Some(child) = self.dentry(fh, &name).map(|d| d.fh) {
                self.evict_subtree(&child);
            }
        }
        self.evict(fh);
    }

    /// Snapshot of every live handle record.
    pub fn handles(&self) -> Vec<Arc<InternalFh>> {
        self.ifhs.values().cloned().collect()
    }

    /// Wake every latch waiter, e.g. so shutdown can be observed.
    pub fn interrupt_all(&self) {
        for ifh in self.ifhs.values() {
            ifh.interrupt();
        }
    }

    /// Number of live handle records.
    pub fn len(&self) -> usize {
        self.ifhs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ifhs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fh(ino: u32) -> ZfsFh {
        ZfsFh::new(2, 7, 11, ino, 1)
    }

    fn intern(table: &mut FhTable, ino: u32) -> Arc<InternalFh> {
        table.intern(fh(ino), Fattr::default(), MetadataRecord::default())
    }

    #[test]
    fn fh_families() {
        assert!(ZfsFh::new(0, 0, 0, 5, 1).is_virtual());
        assert!(ZfsFh::new(2, 7, CONFLICT_DEV, 5, 1).is_conflict());
        assert!(ZfsFh::new(2, 7, NON_EXIST_DEV, 5, 1).is_non_exist());
        assert!(fh(5).is_regular());
        assert!(!ZfsFh::UNDEFINED.is_regular());
    }

    #[test]
    fn hardlinks_share_one_handle() {
        let mut table = FhTable::new();
        let dir = intern(&mut table, 1);
        let file = intern(&mut table, 2);

        table.add_dentry(None, "", dir.fh);
        table.add_dentry(Some(dir.fh), "a", file.fh);
        table.add_dentry(Some(dir.fh), "b", file.fh);

        assert_eq!(table.dentries_of(&file.fh).len(), 2);
        assert_eq!(file.data.lock().ndentries, 2);
        assert_eq!(table.dentry(&dir.fh, "a").unwrap().fh, file.fh);
        assert_eq!(table.child_names(&dir.fh), vec!["a".to_owned(), "b".to_owned()]);
    }

    #[test]
    fn removing_last_dentry_queues_destruction() {
        let mut table = FhTable::new();
        let dir = intern(&mut table, 1);
        let file = intern(&mut table, 2);
        table.add_dentry(None, "", dir.fh);
        let dentry = table.add_dentry(Some(dir.fh), "a", file.fh);

        table.remove_dentry(&dentry);
        assert_eq!(file.data.lock().ndentries, 0);
        assert!(table.unused.iter().any(|(f, _)| *f == file.fh));
        // the handle itself still resolves until the cleanup pass runs
        assert!(table.get(&file.fh).is_some());
    }

    #[test]
    fn reparent_keeps_identity() {
        let mut table = FhTable::new();
        let d1 = intern(&mut table, 1);
        let d2 = intern(&mut table, 2);
        let file = intern(&mut table, 3);
        table.add_dentry(Some(d1.fh), "f", file.fh);

        let moved = table.reparent_dentry(&d1.fh, "f", d2.fh, "g").unwrap();
        assert_eq!(moved.fh, file.fh);
        assert!(table.dentry(&d1.fh, "f").is_none());
        assert_eq!(table.dentry(&d2.fh, "g").unwrap().fh, file.fh);
        assert_eq!(file.data.lock().ndentries, 1);
    }
}
