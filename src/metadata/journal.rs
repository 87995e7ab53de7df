//! Per-directory journals of namespace operations awaiting reintegration.
//!
//! A journal entry records an ADD or DEL of one name in one directory. An
//! entry lives from the operation that logged it until the master confirms
//! delivery. A DEL annihilates a pending ADD of the same name; inserting a
//! duplicate `(oper, name)` pair replaces the stale entry, which can only be
//! left behind by a crash.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_derive::FromPrimitive;
use num_traits::FromPrimitive;
use tracing::warn;

use crate::fh::ZfsFh;
use crate::ZFS_MAXNAMELEN;

use super::hashfile::CRC32;
use super::record::{decode_fh, encode_fh};

/// Kind of a journalled namespace operation.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
#[repr(u32)]
pub enum JournalOp {
    Add = 0,
    Del = 1,
}

/// One pending operation of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    pub oper: JournalOp,
    pub local_fh: ZfsFh,
    pub master_fh: ZfsFh,
    pub master_version: u64,
    pub name: String,
}

/// Pending operations of one directory, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Journal {
    entries: Vec<JournalEntry>,
}

impl Journal {
    pub fn new() -> Journal {
        Journal::default()
    }

    /// Insert an entry. Returns true when the journal changed: a DEL first
    /// tries to annihilate the matching ADD, and a duplicate `(oper, name)`
    /// replaces the entry a crash left behind.
    pub fn insert(
        &mut self,
        oper: JournalOp,
        local_fh: ZfsFh,
        master_fh: ZfsFh,
        master_version: u64,
        name: &str,
    ) -> bool {
        if oper == JournalOp::Del && self.delete(JournalOp::Add, name) {
            return true;
        }
        self.delete(oper, name);
        self.entries.push(JournalEntry {
            oper,
            local_fh,
            master_fh,
            master_version,
            name: name.to_owned(),
        });
        true
    }

    /// True if an entry for `(oper, name)` is present.
    pub fn member(&self, oper: JournalOp, name: &str) -> bool {
        self.entries.iter().any(|e| e.oper == oper && e.name == name)
    }

    /// Remove the entry for `(oper, name)`; true if one was removed.
    pub fn delete(&mut self, oper: JournalOp, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|e| !(e.oper == oper && e.name == name));
        self.entries.len() != before
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Entries in insertion order.
    pub fn entries(&self) -> &[JournalEntry] {
        &self.entries
    }

    /// Read the journal file at `path`; a missing file is an empty journal.
    /// Entries replay through [`Journal::insert`], which compacts crash
    /// leftovers; a torn tail entry is discarded.
    pub fn load(path: &Path) -> io::Result<Journal> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => return Ok(Journal::new()),
            Err(e) => return Err(e),
        };
        let mut journal = Journal::new();
        loop {
            match read_entry(&mut file) {
                Ok(Some(entry)) => {
                    journal.insert(
                        entry.oper,
                        entry.local_fh,
                        entry.master_fh,
                        entry.master_version,
                        &entry.name,
                    );
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(path = %path.display(), %err, "discarding torn journal tail");
                    break;
                }
            }
        }
        Ok(journal)
    }

    /// Rewrite the journal file at `path` whole; an empty journal removes
    /// the file.
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
        for entry in &self.entries {
            write_entry(&mut file, entry)?;
        }
        file.sync_data()
    }

    /// Append a single entry to the journal file without rewriting it.
    pub fn append_to(path: &Path, entry: &JournalEntry) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new().append(true).create(true).open(path)?;
        write_entry(&mut file, entry)?;
        file.sync_data()
    }
}

fn entry_bytes(entry: &JournalEntry) -> Vec<u8> {
    let name = entry.name.as_bytes();
    let mut buf = Vec::with_capacity(4 + 20 + 20 + 8 + 4 + name.len());
    buf.write_u32::<LittleEndian>(entry.oper as u32).unwrap();
    let mut fh_buf = [0u8; 20];
    encode_fh(&mut fh_buf, &entry.local_fh);
    buf.extend_from_slice(&fh_buf);
    encode_fh(&mut fh_buf, &entry.master_fh);
    buf.extend_from_slice(&fh_buf);
    buf.write_u64::<LittleEndian>(entry.master_version).unwrap();
    buf.write_u32::<LittleEndian>(name.len() as u32).unwrap();
    buf.extend_from_slice(name);
    buf
}

fn write_entry(dst: &mut impl Write, entry: &JournalEntry) -> io::Result<()> {
    let bytes = entry_bytes(entry);
    dst.write_all(&bytes)?;
    dst.write_u32::<LittleEndian>(CRC32.checksum(&bytes))
}

/// Read one entry; `Ok(None)` at clean EOF, an error for a torn tail.
fn read_entry(src: &mut impl Read) -> io::Result<Option<JournalEntry>> {
    let oper = match src.read_u32::<LittleEndian>() {
        Ok(value) => value,
        Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut fh_buf = [0u8; 20];
    src.read_exact(&mut fh_buf)?;
    let local_fh = decode_fh(&fh_buf);
    src.read_exact(&mut fh_buf)?;
    let master_fh = decode_fh(&fh_buf);
    let master_version = src.read_u64::<LittleEndian>()?;
    let name_len = src.read_u32::<LittleEndian>()? as usize;
    if name_len > ZFS_MAXNAMELEN {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "journal name too long"));
    }
    let mut name = vec![0u8; name_len];
    src.read_exact(&mut name)?;
    let stored_crc = src.read_u32::<LittleEndian>()?;

    let oper = JournalOp::from_u32(oper)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad journal operation"))?;
    let name = String::from_utf8(name)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "bad journal name"))?;
    let entry = JournalEntry { oper, local_fh, master_fh, master_version, name };
    if CRC32.checksum(&entry_bytes(&entry)) != stored_crc {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "journal entry crc mismatch"));
    }
    Ok(Some(entry))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fh(ino: u32) -> ZfsFh {
        ZfsFh::new(1, 7, 3, ino, 1)
    }

    #[test]
    fn add_then_del_annihilates() {
        let mut journal = Journal::new();
        journal.insert(JournalOp::Add, fh(5), fh(5), 1, "a.txt");
        assert!(journal.member(JournalOp::Add, "a.txt"));
        journal.insert(JournalOp::Del, fh(5), fh(5), 1, "a.txt");
        assert!(journal.is_empty());
    }

    #[test]
    fn del_without_add_is_kept() {
        let mut journal = Journal::new();
        journal.insert(JournalOp::Del, fh(5), fh(5), 1, "a.txt");
        assert!(journal.member(JournalOp::Del, "a.txt"));
        assert_eq!(journal.len(), 1);
    }

    #[test]
    fn duplicate_insert_replaces_crash_leftover() {
        let mut journal = Journal::new();
        journal.insert(JournalOp::Add, fh(5), fh(5), 1, "a.txt");
        journal.insert(JournalOp::Add, fh(6), fh(6), 2, "a.txt");
        assert_eq!(journal.len(), 1);
        assert_eq!(journal.entries()[0].local_fh, fh(6));
    }

    #[test]
    fn insertion_order_is_preserved() {
        let mut journal = Journal::new();
        journal.insert(JournalOp::Add, fh(1), fh(1), 1, "x");
        journal.insert(JournalOp::Del, fh(2), fh(2), 1, "y");
        journal.insert(JournalOp::Add, fh(3), fh(3), 1, "z");
        let names: Vec<&str> = journal.entries().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["x", "y", "z"]);
    }

    #[test]
    fn file_roundtrip_compacts_and_truncates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");

        let mut journal = Journal::new();
        journal.insert(JournalOp::Add, fh(1), fh(1), 1, "kept");
        journal.insert(JournalOp::Add, fh(2), fh(2), 1, "temp");
        journal.store(&path).unwrap();
        Journal::append_to(
            &path,
            &JournalEntry {
                oper: JournalOp::Del,
                local_fh: fh(2),
                master_fh: fh(2),
                master_version: 1,
                name: "temp".into(),
            },
        )
        .unwrap();

        // torn tail: half an entry
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0, 0, 0, 0, 1, 2, 3]).unwrap();
        }

        let loaded = Journal::load(&path).unwrap();
        let names: Vec<&str> = loaded.entries().iter().map(|e| e.name.as_str()).collect();
        // the appended DEL annihilated the stored ADD during replay
        assert_eq!(names, vec!["kept"]);
    }

    #[test]
    fn empty_store_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal");
        let mut journal = Journal::new();
        journal.insert(JournalOp::Add, fh(1), fh(1), 1, "a");
        journal.store(&path).unwrap();
        assert!(path.exists());

        journal.clear();
        journal.store(&path).unwrap();
        assert!(!path.exists());
    }
}
