//! The volume table.
//!
//! A volume is one replicated subtree of the cluster namespace. Exactly one
//! node masters it; nodes below the master in the volume layout hold lazily
//! reconciled copies. A volume with a `local_path` caches data on local
//! disk and carries on-disk metadata.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, info};

use crate::error::{Result, ZfsError};
use crate::fh::ZfsFh;
use crate::metadata::VolumeMetadata;
use crate::{CONFIG_DIR, SHADOW_DIR};

pub use crate::fh::{VOLUME_ID_CONFIG, VOLUME_ID_VIRTUAL};

/// A size limit of zero means the cached copy is unbounded.
pub const VOLUME_NO_LIMIT: u64 = 0;

/// One volume known to this node.
pub struct Volume {
    pub id: u32,
    pub data: Mutex<VolumeData>,
}

/// Mutable state of a volume, behind its mutex.
pub struct VolumeData {
    pub name: String,
    /// Mount point inside the cluster namespace, e.g. `/home`.
    pub mountpoint: String,
    /// Node mastering this volume.
    pub master_sid: u32,
    /// Nodes whose master for this volume is this node.
    pub slaves: BTreeSet<u32>,
    /// Directory with the local copy of the volume, when cached here.
    pub local_path: Option<PathBuf>,
    pub size_limit: u64,
    pub metadata: Option<Arc<VolumeMetadata>>,
    /// Handle of the root dentry's child once the root is materialized.
    pub root_fh: Option<ZfsFh>,
    /// Virtual directory covering the mountpoint.
    pub root_vd: Option<ZfsFh>,
    /// True when another node masters the volume.
    pub is_copy: bool,
    /// Volume is being removed from service at the next safe point.
    pub delete_mark: bool,
    /// Mark-and-sweep bit of the configuration reader.
    pub marked: bool,
    /// Latched file handles on this volume; destruction waits for zero.
    pub n_locked_fhs: u32,
    /// Inode number of the last synthetic conflict directory.
    pub last_conflict_ino: u32,
}

impl Volume {
    fn new(id: u32) -> Arc<Volume> {
        Arc::new(Volume {
            id,
            data: Mutex::new(VolumeData {
                name: String::new(),
                mountpoint: String::new(),
                master_sid: 0,
                slaves: BTreeSet::new(),
                local_path: None,
                size_limit: VOLUME_NO_LIMIT,
                metadata: None,
                root_fh: None,
                root_vd: None,
                is_copy: false,
                delete_mark: false,
                marked: false,
                n_locked_fhs: 0,
                last_conflict_ino: 0,
            }),
        })
    }

    /// Name, mountpoint and master assignment from the cluster config.
    pub fn set_common_info(
        &self,
        name: &str,
        mountpoint: &str,
        master_sid: u32,
        this_sid: u32,
        slaves: BTreeSet<u32>,
    ) {
        let mut data = self.data.lock();
        data.name = name.to_owned();
        data.mountpoint = mountpoint.to_owned();
        data.master_sid = master_sid;
        data.is_copy = master_sid != this_sid;
        data.slaves = slaves;
        data.marked = false;
    }

    /// Local cache location from the node configuration. Reopening is
    /// skipped when the path is unchanged, so open handles stay valid.
    pub fn set_local_info(
        &self,
        local_path: &Path,
        size_limit: u64,
        tree_depth: u32,
    ) -> io::Result<()> {
        let mut data = self.data.lock();
        data.size_limit = size_limit;
        if data.local_path.as_deref() == Some(local_path) && data.metadata.is_some() {
            return Ok(());
        }
        std::fs::create_dir_all(local_path)?;
        std::fs::create_dir_all(local_path.join(SHADOW_DIR))?;
        let metadata = VolumeMetadata::open(local_path, tree_depth)?;
        data.local_path = Some(local_path.to_path_buf());
        data.metadata = Some(Arc::new(metadata));
        Ok(())
    }

    /// Schedule removal from service at the next safe point.
    pub fn mark_delete(&self) {
        self.data.lock().delete_mark = true;
    }

    pub fn is_delete_marked(&self) -> bool {
        self.data.lock().delete_mark
    }

    /// True when this node holds a local cache of the volume.
    pub fn has_local_path(&self) -> bool {
        self.data.lock().local_path.is_some()
    }

    /// Run a metadata operation. Failure poisons the volume: the error is
    /// logged, the volume is marked for removal and the caller sees
    /// [`ZfsError::MetadataError`].
    pub fn metadata_op<T>(
        &self,
        op: impl FnOnce(&VolumeMetadata) -> io::Result<T>,
    ) -> Result<T> {
        let metadata = {
            let data = self.data.lock();
            data.metadata.clone().ok_or(ZfsError::MetadataError)?
        };
        op(&metadata).map_err(|err| {
            error!(vid = self.id, %err, "metadata failure, marking volume for removal");
            self.mark_delete();
            ZfsError::MetadataError
        })
    }

    /// Path of the shadow tree root.
    pub fn shadow_path(&self) -> Option<PathBuf> {
        self.data.lock().local_path.as_ref().map(|p| p.join(SHADOW_DIR))
    }

    /// A name hidden in the volume root (`.shadow`, `.config`).
    pub fn is_special_name(name: &str) -> bool {
        name == SHADOW_DIR || name == CONFIG_DIR
    }

    /// Allocate an inode number for a synthetic conflict directory.
    pub fn alloc_conflict_ino(&self) -> u32 {
        let mut data = self.data.lock();
        data.last_conflict_ino = data.last_conflict_ino.wrapping_add(1);
        if data.last_conflict_ino == 0 {
            data.last_conflict_ino = 1;
        }
        data.last_conflict_ino
    }
}

/// All volumes known to this node.
#[derive(Default)]
pub struct VolumeTable {
    volumes: HashMap<u32, Arc<Volume>>,
}

impl VolumeTable {
    pub fn new() -> VolumeTable {
        VolumeTable::default()
    }

    pub fn lookup(&self, id: u32) -> Option<Arc<Volume>> {
        self.volumes.get(&id).cloned()
    }

    pub fn lookup_name(&self, name: &str) -> Option<Arc<Volume>> {
        self.volumes.values().find(|v| v.data.lock().name == name).cloned()
    }

    /// Find or create the volume record.
    pub fn create(&mut self, id: u32) -> Arc<Volume> {
        self.volumes.entry(id).or_insert_with(|| Volume::new(id)).clone()
    }

    pub fn delete(&mut self, id: u32) -> Option<Arc<Volume>> {
        self.volumes.remove(&id)
    }

    /// Mark every volume for the configuration sweep.
    pub fn mark_all(&self) {
        for volume in self.volumes.values() {
            volume.data.lock().marked = true;
        }
    }

    /// Remove volumes still marked after a configuration reload; the caller
    /// tears their dentry trees down.
    pub fn take_marked(&mut self) -> Vec<Arc<Volume>> {
        let marked: Vec<u32> = self
            .volumes
            .iter()
            .filter(|(_, v)| v.data.lock().marked)
            .map(|(&id, _)| id)
            .collect();
        marked.into_iter().filter_map(|id| self.volumes.remove(&id)).collect()
    }

    /// Remove volumes poisoned by metadata failures whose latch count has
    /// drained.
    pub fn take_delete_marked(&mut self) -> Vec<Arc<Volume>> {
        let ready: Vec<u32> = self
            .volumes
            .iter()
            .filter(|(_, v)| {
                let data = v.data.lock();
                data.delete_mark && data.n_locked_fhs == 0
            })
            .map(|(&id, _)| id)
            .collect();
        for id in &ready {
            info!(vid = id, "removing poisoned volume from service");
        }
        ready.into_iter().filter_map(|id| self.volumes.remove(&id)).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<Volume>> {
        self.volumes.values()
    }

    pub fn len(&self) -> usize {
        self.volumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.volumes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_is_idempotent() {
        let mut table = VolumeTable::new();
        let a = table.create(7);
        let b = table.create(7);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn mark_and_sweep() {
        let mut table = VolumeTable::new();
        let keep = table.create(7);
        table.create(8);
        table.mark_all();
        keep.set_common_info("home", "/home", 1, 1, BTreeSet::new());
        assert!(!keep.data.lock().is_copy);

        let swept = table.take_marked();
        assert_eq!(swept.len(), 1);
        assert_eq!(swept[0].id, 8);
        assert!(table.lookup(7).is_some());
    }

    #[test]
    fn metadata_failure_poisons_volume() {
        let table = {
            let mut t = VolumeTable::new();
            t.create(7);
            t
        };
        let volume = table.lookup(7).unwrap();
        // no local path yet: metadata ops report MetadataError
        let err = volume.metadata_op(|_| Ok(())).unwrap_err();
        assert_eq!(err, ZfsError::MetadataError);

        let dir = tempfile::tempdir().unwrap();
        volume.set_local_info(dir.path(), VOLUME_NO_LIMIT, 1).unwrap();
        assert!(dir.path().join(SHADOW_DIR).exists());
        volume.metadata_op(|_| Ok(())).unwrap();
        assert!(!volume.is_delete_marked());

        let err = volume
            .metadata_op::<()>(|_| Err(io::Error::new(io::ErrorKind::Other, "disk gone")))
            .unwrap_err();
        assert_eq!(err, ZfsError::MetadataError);
        assert!(volume.is_delete_marked());

        let mut t = VolumeTable::new();
        t.volumes.insert(7, volume);
        assert_eq!(t.take_delete_marked().len(), 1);
    }
}
