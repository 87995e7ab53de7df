//! The virtual directory tree: the read-only mount-point skeleton sitting
//! above volume roots.
//!
//! Virtual directories are created at startup and on configuration reloads
//! by splitting every volume mountpoint into components. A lookup in a
//! virtual directory that reaches a mounted volume's root crosses into that
//! volume transparently; all other operations besides `lookup`, `getattr`
//! and `readdir` answer `EROFS`.

use std::collections::{BTreeMap, HashMap};

use crate::error::{Result, ZfsError};

use super::{Fattr, FileType, ZfsFh, NODE_ID_NONE, VOLUME_ID_VIRTUAL};

/// A read-only node of the mount-point skeleton.
#[derive(Debug, Clone)]
pub struct VirtualDir {
    pub fh: ZfsFh,
    pub name: String,
    pub parent: Option<ZfsFh>,
    pub attr: Fattr,
    /// Volume whose root shadows this directory, if one is mounted here.
    pub vol: Option<u32>,
    entries: BTreeMap<String, ZfsFh>,
}

impl VirtualDir {
    /// Names of directories below this one, in order.
    pub fn entry_names(&self) -> impl Iterator<Item = &String> {
        self.entries.keys()
    }

    pub fn entry(&self, name: &str) -> Option<ZfsFh> {
        self.entries.get(name).copied()
    }
}

/// The whole skeleton, indexed by virtual handle.
pub struct VirtualTree {
    dirs: HashMap<ZfsFh, VirtualDir>,
    root: ZfsFh,
    next_ino: u32,
}

fn virtual_attr(ino: u32) -> Fattr {
    Fattr {
        ftype: FileType::Dir,
        mode: 0o755,
        uid: 0,
        gid: 0,
        nlink: 2,
        size: 4096,
        blksize: 4096,
        blocks: 8,
        atime: 0,
        mtime: 0,
        ctime: 0,
        version: u64::from(ino),
    }
}

impl VirtualTree {
    pub fn new() -> VirtualTree {
        let root = ZfsFh::new(NODE_ID_NONE, VOLUME_ID_VIRTUAL, 0, 1, 1);
        let mut dirs = HashMap::new();
        dirs.insert(
            root,
            VirtualDir {
                fh: root,
                name: String::new(),
                parent: None,
                attr: virtual_attr(1),
                vol: None,
                entries: BTreeMap::new(),
            },
        );
        VirtualTree { dirs, root, next_ino: 1 }
    }

    /// Handle of the global root.
    pub fn root(&self) -> ZfsFh {
        self.root
    }

    pub fn get(&self, fh: &ZfsFh) -> Option<&VirtualDir> {
        self.dirs.get(fh)
    }

    /// Resolve `name` in `dir`, honoring `.` and `..`.
    pub fn lookup(&self, dir: &ZfsFh, name: &str) -> Option<&VirtualDir> {
        let dir = self.dirs.get(dir)?;
        match name {
            "." => Some(dir),
            ".." => Some(self.dirs.get(&dir.parent.unwrap_or(dir.fh))?),
            _ => dir.entries.get(name).and_then(|fh| self.dirs.get(fh)),
        }
    }

    /// Create the chain of virtual directories for a mountpoint and attach
    /// the volume to the leaf. Returns the leaf handle.
    pub fn mount(&mut self, mountpoint: &str, vid: u32) -> Result<ZfsFh> {
        let mut cur = self.root;
        for component in mountpoint.split('/').filter(|c| !c.is_empty()) {
            let existing = self.dirs.get(&cur).ok_or(ZfsError::NotFound)?.entry(component);
            cur = match existing {
                Some(child) => child,
                None => {
                    self.next_ino += 1;
                    let fh = ZfsFh::new(NODE_ID_NONE, VOLUME_ID_VIRTUAL, 0, self.next_ino, 1);
                    let child = VirtualDir {
                        fh,
                        name: component.to_owned(),
                        parent: Some(cur),
                        attr: virtual_attr(self.next_ino),
                        vol: None,
                        entries: BTreeMap::new(),
                    };
                    self.dirs.insert(fh, child);
                    if let Some(parent) = self.dirs.get_mut(&cur) {
                        parent.entries.insert(component.to_owned(), fh);
                        parent.attr.nlink += 1;
                    }
                    fh
                }
            };
        }
        if cur == self.root && !mountpoint.trim_matches('/').is_empty() {
            return Err(ZfsError::InvalidArgument);
        }
        let leaf = self.dirs.get_mut(&cur).ok_or(ZfsError::NotFound)?;
        if leaf.vol.is_some() && leaf.vol != Some(vid) {
            return Err(ZfsError::Exists);
        }
        leaf.vol = Some(vid);
        Ok(cur)
    }

    /// Detach a volume and prune now-empty skeleton directories.
    pub fn unmount(&mut self, vid: u32) {
        let Some(mut cur) = self
            .dirs
            .values()
            .find(|d| d.vol == Some(vid))
            .map(|d| d.fh)
        else {
            return;
        };
        if let Some(dir) = self.dirs.get_mut(&cur) {
            dir.vol = None;
        }
        // prune childless, volume-less directories up to the root
        while cur != self.root {
            let Some(dir) = self.dirs.get(&cur) else { break };
            if dir.vol.is_some() || !dir.entries.is_empty() {
                break;
            }
            let name = dir.name.clone();
            let parent = dir.parent;
            self.dirs.remove(&cur);
            let Some(parent_fh) = parent else { break };
            if let Some(parent_dir) = self.dirs.get_mut(&parent_fh) {
                parent_dir.entries.remove(&name);
                parent_dir.attr.nlink = parent_dir.attr.nlink.saturating_sub(1);
            }
            cur = parent_fh;
        }
    }

    /// The virtual directory a volume is mounted on.
    pub fn mountpoint_of(&self, vid: u32) -> Option<&VirtualDir> {
        self.dirs.values().find(|d| d.vol == Some(vid))
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }
}

impl Default for VirtualTree {
    fn default() -> Self {
        VirtualTree::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_builds_component_chain() {
        let mut tree = VirtualTree::new();
        let leaf = tree.mount("/exports/home", 7).unwrap();
        assert_eq!(tree.get(&leaf).unwrap().vol, Some(7));

        let exports = tree.lookup(&tree.root(), "exports").unwrap();
        assert_eq!(exports.name, "exports");
        let home = tree.lookup(&exports.fh.clone(), "home").unwrap();
        assert_eq!(home.fh, leaf);

        // dot and dotdot resolve inside the skeleton
        let root = tree.root();
        assert_eq!(tree.lookup(&root, ".").unwrap().fh, root);
        assert_eq!(tree.lookup(&root, "..").unwrap().fh, root);
        assert_eq!(tree.lookup(&leaf, "..").unwrap().fh, exports.fh);
    }

    #[test]
    fn two_volumes_share_prefix() {
        let mut tree = VirtualTree::new();
        tree.mount("/exports/home", 7).unwrap();
        tree.mount("/exports/data", 8).unwrap();
        let exports = tree.lookup(&tree.root(), "exports").unwrap();
        assert_eq!(exports.entry_names().count(), 2);

        // double mount on the same leaf is rejected
        assert_eq!(tree.mount("/exports/home", 9), Err(ZfsError::Exists));
    }

    #[test]
    fn unmount_prunes_empty_chain() {
        let mut tree = VirtualTree::new();
        tree.mount("/exports/home", 7).unwrap();
        tree.mount("/exports/data", 8).unwrap();
        let before = tree.len();

        tree.unmount(8);
        assert!(tree.mountpoint_of(8).is_none());
        assert_eq!(tree.len(), before - 1);
        assert!(tree.lookup(&tree.root(), "exports").is_some());

        tree.unmount(7);
        // only the root remains
        assert_eq!(tree.len(), 1);
    }
}
