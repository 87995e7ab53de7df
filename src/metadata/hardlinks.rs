//! Per-inode lists of the names reaching an inode on the master.
//!
//! The metadata store keeps, for every locally cached inode, the set of
//! `(parent_dev, parent_ino, name)` triples under which the master knows
//! it. The list length is the authoritative hardlink count of the cached
//! copy.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::ZFS_MAXNAMELEN;

/// One name of an inode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hardlink {
    pub parent_dev: u32,
    pub parent_ino: u32,
    pub name: String,
}

/// All names of one inode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HardlinkList {
    entries: Vec<Hardlink>,
}

impl HardlinkList {
    pub fn new() -> HardlinkList {
        HardlinkList::default()
    }

    /// Add a name; true if it was not present yet.
    pub fn insert(&mut self, link: Hardlink) -> bool {
        if self.entries.contains(&link) {
            return false;
        }
        self.entries.push(link);
        true
    }

    /// Remove a name; true if it was present.
    pub fn remove(&mut self, parent_dev: u32, parent_ino: u32, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|l| {
            !(l.parent_dev == parent_dev && l.parent_ino == parent_ino && l.name == name)
        });
        self.entries.len() != before
    }

    /// Replace one name with another, inserting when the old one is absent.
    pub fn replace(&mut self, old: (u32, u32, &str), new: Hardlink) {
        self.remove(old.0, old.1, old.2);
        self.insert(new);
    }

    /// The hardlink count.
    pub fn number(&self) -> u32 {
        self.entries.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[Hardlink] {
        &self.entries
    }

    /// Read the list file; a missing file is an empty list.
    pub fn load(path: &Path) -> io::Result<HardlinkList> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => return Ok(HardlinkList::new()),
            Err(e) => return Err(e),
        };
        let mut list = HardlinkList::new();
        loop {
            let parent_dev = match file.read_u32::<LittleEndian>() {
                Ok(value) => value,
                Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            };
            let parent_ino = file.read_u32::<LittleEndian>()?;
            let name_len = file.read_u32::<LittleEndian>()? as usize;
            if name_len > ZFS_MAXNAMELEN {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "hardlink name too long"));
            }
            let mut name = vec![0u8; name_len];
            file.read_exact(&mut name)?;
            let name = String::from_utf8(name)
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad hardlink name"))?;
            list.insert(Hardlink { parent_dev, parent_ino, name });
        }
        Ok(list)
    }

    /// Rewrite the list file; an empty list removes it.
    pub fn store(&self, path: &Path) -> io::Result<()> {
        if self.entries.is_empty() {
            match std::fs::remove_file(path) {
                Ok(()) => return Ok(()),
                Err(ref e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file =
            OpenOptions::new().write(true).create(true).truncate(true).open(path)?;
        for link in &self.entries {
            file.write_u32::<LittleEndian>(link.parent_dev)?;
            file.write_u32::<LittleEndian>(link.parent_ino)?;
            file.write_u32::<LittleEndian>(link.name.len() as u32)?;
            file.write_all(link.name.as_bytes())?;
        }
        file.sync_data()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_remove_replace_number() {
        let mut list = HardlinkList::new();
        assert!(list.insert(Hardlink { parent_dev: 1, parent_ino: 2, name: "a".into() }));
        assert!(!list.insert(Hardlink { parent_dev: 1, parent_ino: 2, name: "a".into() }));
        assert!(list.insert(Hardlink { parent_dev: 1, parent_ino: 2, name: "b".into() }));
        assert_eq!(list.number(), 2);

        list.replace((1, 2, "a"), Hardlink { parent_dev: 1, parent_ino: 3, name: "c".into() });
        assert_eq!(list.number(), 2);
        assert!(list.remove(1, 3, "c"));
        assert!(!list.remove(1, 3, "c"));
        assert_eq!(list.number(), 1);
    }

    #[test]
    fn file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("links");
        let mut list = HardlinkList::new();
        list.insert(Hardlink { parent_dev: 1, parent_ino: 2, name: "a".into() });
        list.insert(Hardlink { parent_dev: 1, parent_ino: 9, name: "other".into() });
        list.store(&path).unwrap();

        let loaded = HardlinkList::load(&path).unwrap();
        assert_eq!(loaded, list);

        let empty = HardlinkList::new();
        empty.store(&path).unwrap();
        assert!(!path.exists());
    }
}
