//! Dentries: named edges of the inode graph and path construction.

use std::path::{Path, PathBuf};

use super::{FhTable, ZfsFh};

/// A named edge `parent/name -> fh`.
///
/// Hard links give a handle several dentries; the root dentry of a mounted
/// volume has the covering virtual directory as its parent. Values are
/// cheap copies of what the table holds; after any blocking wait a caller
/// re-looks the dentry up instead of trusting a stale copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dentry {
    /// Owning directory handle; `None` only for detached roots.
    pub parent: Option<ZfsFh>,
    pub name: String,
    /// The child this edge reaches.
    pub fh: ZfsFh,
}

impl Dentry {
    /// True for the root dentry of a volume (no parent or a virtual one).
    pub fn is_volume_root(&self) -> bool {
        match self.parent {
            None => true,
            Some(parent) => parent.is_virtual(),
        }
    }
}

/// Volume-relative path of `dentry`: empty for the volume root, otherwise
/// `/a/b/c`. Children of a conflict directory share the path of the
/// conflict itself. `None` when the chain to the root is no longer intact.
pub fn build_relative_path(table: &FhTable, dentry: &Dentry) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    let mut cur = dentry.clone();
    loop {
        match cur.parent {
            None => break,
            Some(parent) if parent.is_virtual() => break,
            Some(parent) => {
                if !parent.is_conflict() {
                    parts.push(cur.name.clone());
                }
                cur = table.first_dentry(&parent)?;
            }
        }
    }
    if parts.is_empty() {
        return Some(String::new());
    }
    parts.reverse();
    Some(format!("/{}", parts.join("/")))
}

/// Like [`build_relative_path`] with one more component appended.
pub fn build_relative_path_name(table: &FhTable, dir: &Dentry, name: &str) -> Option<String> {
    let base = build_relative_path(table, dir)?;
    Some(format!("{base}/{name}"))
}

/// Local disk path of `dentry` on a volume rooted at `local_path`.
pub fn build_local_path(
    local_path: &Path,
    table: &FhTable,
    dentry: &Dentry,
) -> Option<PathBuf> {
    let rel = build_relative_path(table, dentry)?;
    Some(join_relative(local_path, &rel))
}

/// Local disk path of `name` inside the directory `dentry`.
pub fn build_local_path_name(
    local_path: &Path,
    table: &FhTable,
    dentry: &Dentry,
    name: &str,
) -> Option<PathBuf> {
    let rel = build_relative_path_name(table, dentry, name)?;
    Some(join_relative(local_path, &rel))
}

fn join_relative(local_path: &Path, rel: &str) -> PathBuf {
    let trimmed = rel.trim_start_matches('/');
    if trimmed.is_empty() {
        local_path.to_path_buf()
    } else {
        local_path.join(trimmed)
    }
}

#[cfg(test)]
mod tests {
    use super::super::{Fattr, FhTable, CONFLICT_DEV};
    use super::*;
    use crate::metadata::record::MetadataRecord;

    fn fh(ino: u32) -> ZfsFh {
        ZfsFh::new(2, 7, 11, ino, 1)
    }

    fn setup() -> (FhTable, Dentry) {
        let mut table = FhTable::new();
        for ino in 1..=4 {
            table.intern(fh(ino), Fattr::default(), MetadataRecord::default());
        }
        table.add_dentry(Some(ZfsFh::new(0, 0, 0, 1, 1)), "vol", fh(1));
        table.add_dentry(Some(fh(1)), "d", fh(2));
        let leaf = table.add_dentry(Some(fh(2)), "f", fh(3));
        (table, leaf)
    }

    #[test]
    fn relative_path_walks_to_volume_root() {
        let (table, leaf) = setup();
        assert_eq!(build_relative_path(&table, &leaf).unwrap(), "/d/f");

        let root = table.first_dentry(&fh(1)).unwrap();
        assert_eq!(build_relative_path(&table, &root).unwrap(), "");
    }

    #[test]
    fn local_path_is_rooted_in_volume_cache() {
        let (table, leaf) = setup();
        let path = build_local_path(Path::new("/cache/v7"), &table, &leaf).unwrap();
        assert_eq!(path, PathBuf::from("/cache/v7/d/f"));

        let dir = table.dentry(&fh(1), "d").unwrap().clone();
        let path = build_local_path_name(Path::new("/cache/v7"), &table, &dir, "new").unwrap();
        assert_eq!(path, PathBuf::from("/cache/v7/d/new"));
    }

    #[test]
    fn conflict_children_share_the_conflict_path() {
        let (mut table, leaf) = setup();
        // splice a conflict directory at d/f
        let conflict = ZfsFh::new(2, 7, CONFLICT_DEV, 100, 1);
        table.intern(conflict, Fattr::default(), MetadataRecord::default());
        table.remove_dentry(&leaf);
        table.add_dentry(Some(fh(2)), "f", conflict);
        let side = table.add_dentry(Some(conflict), "node-b", fh(3));

        assert_eq!(build_relative_path(&table, &side).unwrap(), "/d/f");
    }
}
