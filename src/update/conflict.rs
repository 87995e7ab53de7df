//! Conflict directories: building them when both sides of a file have
//! diverged and collapsing them as resolutions narrow the disagreement.
//!
//! A conflict directory is a synthetic read-only directory spliced into
//! the position of the conflicted name. Its two children are named after
//! the participating nodes; the local cache inode keeps backing the name,
//! so every resolution reduces to adjusting the local version pair and
//! letting the update engine converge on the winner.

use std::sync::Arc;

use tracing::{debug, info};

use crate::daemon::Zfsd;
use crate::error::{Result, ZfsError};
use crate::fh::{Dentry, Fattr, FileType, InternalFh, ZfsFh, CONFLICT_DEV};
use crate::metadata::record::{MetadataRecord, FLAG_COMPLETE};
use crate::rpc::client;
use crate::rpc::proto::Request;
use crate::volume::Volume;

fn conflict_attr(ino: u32) -> Fattr {
    Fattr {
        ftype: FileType::Dir,
        mode: 0o555,
        nlink: 2,
        size: 4096,
        blksize: 4096,
        blocks: 8,
        version: u64::from(ino),
        ..Default::default()
    }
}

/// Name a node for a conflict child entry.
fn node_name_of(zfsd: &Arc<Zfsd>, sid: u32) -> String {
    zfsd.nodes
        .lock()
        .lookup(sid)
        .map(|node| node.data.lock().name.clone())
        .unwrap_or_else(|| format!("node-{sid}"))
}

/// Splice a conflict directory at `parent/name` over two disagreeing
/// handles. Returns the dentry of the conflict.
pub fn splice_conflict(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    parent: &ZfsFh,
    name: &str,
    existing_fh: &ZfsFh,
    new_fh: &ZfsFh,
) -> Result<Dentry> {
    let conflict =
        ZfsFh::new(zfsd.this_sid(), vol.id, CONFLICT_DEV, vol.alloc_conflict_ino(), 1);
    info!(?conflict, %name, "splicing conflict directory");

    let mut table = zfsd.fh.lock();
    table.intern(conflict, conflict_attr(conflict.ino), MetadataRecord::default());
    if let Some(old) = table.dentry(parent, name).cloned() {
        table.remove_dentry(&old);
    }
    let dentry = table.add_dentry(Some(*parent), name, conflict);
    let existing_name = {
        drop(table);
        node_name_of(zfsd, existing_fh.sid)
    };
    let new_name = node_name_of(zfsd, new_fh.sid);
    let mut table = zfsd.fh.lock();
    table.add_dentry(Some(conflict), &existing_name, *existing_fh);
    table.add_dentry(Some(conflict), &new_name, *new_fh);
    Ok(dentry)
}

/// Attach one more side to an existing conflict directory.
pub fn attach_side(
    zfsd: &Arc<Zfsd>,
    _vol: &Arc<Volume>,
    conflict: &ZfsFh,
    side_fh: &ZfsFh,
) -> Result<()> {
    let side_name = node_name_of(zfsd, side_fh.sid);
    let mut table = zfsd.fh.lock();
    table.get_or_stale(conflict)?;
    table.add_dentry(Some(*conflict), &side_name, *side_fh);
    Ok(())
}

/// Both sides of a regular file diverged: splice a conflict whose
/// children are the local replica and the master's version.
pub fn build_version_conflict(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    ifh: &Arc<InternalFh>,
    master_attr: &Fattr,
) -> Result<()> {
    let (parent, name, master_fh) = {
        let table = zfsd.fh.lock();
        let dentry = table.first_dentry(&ifh.fh).ok_or(ZfsError::Stale)?;
        let parent = dentry.parent.ok_or(ZfsError::Stale)?;
        if parent.is_conflict() {
            // already spliced
            return Ok(());
        }
        (parent, dentry.name.clone(), ifh.data.lock().meta.master_fh)
    };

    // the master's side resolves through its own handle
    let master_meta = MetadataRecord {
        dev: master_fh.dev,
        ino: master_fh.ino,
        gen: master_fh.gen,
        flags: 0,
        local_version: master_attr.version,
        master_version: master_attr.version,
        master_fh,
    };
    zfsd.fh.lock().intern(master_fh, *master_attr, master_meta);
    splice_conflict(zfsd, vol, &parent, &name, &ifh.fh, &master_fh)?;
    Ok(())
}

/// Resolve a conflict by deleting the side named `name` inside the
/// conflict directory `conflict`.
pub fn resolve_by_delete(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    conflict: &ZfsFh,
    name: &str,
) -> Result<()> {
    let (victim, survivor) = {
        let table = zfsd.fh.lock();
        let victim = table.dentry(conflict, name).cloned().ok_or(ZfsError::NotFound)?;
        let survivor = table
            .child_names(conflict)
            .into_iter()
            .filter(|n| n != name)
            .filter_map(|n| table.dentry(conflict, &n).cloned())
            .next()
            .ok_or(ZfsError::NotFound)?;
        (victim, survivor)
    };
    debug!(?conflict, loser = %name, "resolving conflict by delete");

    let local_side = local_side_of(zfsd, vol, conflict)?;
    if victim.fh.sid == zfsd.this_sid() && victim.fh.is_regular() {
        // the local version loses: fall back to the synchronized state so
        // the next access pulls the winner
        discard_local_version(zfsd, vol, &local_side)?;
    } else {
        // the remote version loses: adopt the master's counter and stay
        // dirty so the local content pushes over it
        adopt_remote_version(zfsd, vol, &local_side, &victim, &survivor)?;
    }

    collapse(zfsd, conflict, &local_side.fh)
}

/// Collapse a conflict after a narrowing `setattr`: when modes and
/// ownership of both sides align and the surviving side's version pair
/// agrees, the conflict has nothing left to show.
pub fn collapse_if_aligned(zfsd: &Arc<Zfsd>, _vol: &Arc<Volume>, fh: &ZfsFh) {
    let Some(conflict) = ({
        let table = zfsd.fh.lock();
        table
            .dentries_of(fh)
            .into_iter()
            .filter_map(|d| d.parent)
            .find(|p| p.is_conflict())
    }) else {
        return;
    };

    let aligned = {
        let table = zfsd.fh.lock();
        let sides: Vec<ZfsFh> = table
            .child_names(&conflict)
            .into_iter()
            .filter_map(|n| table.dentry(&conflict, &n).map(|d| d.fh))
            .collect();
        let attrs: Vec<Fattr> = sides
            .iter()
            .filter_map(|side| table.get(side))
            .map(|ifh| ifh.data.lock().attr)
            .collect();
        let versions_aligned = sides
            .iter()
            .filter(|side| side.sid == zfsd.this_sid() && side.is_regular())
            .all(|side| {
                table
                    .get(side)
                    .map(|ifh| ifh.data.lock().meta.is_clean())
                    .unwrap_or(false)
            });
        attrs.len() == 2
            && attrs[0].mode == attrs[1].mode
            && attrs[0].uid == attrs[1].uid
            && attrs[0].gid == attrs[1].gid
            && versions_aligned
    };
    if !aligned {
        return;
    }

    if let Ok(local_side) = local_side_of(zfsd, _vol, &conflict) {
        let _ = collapse(zfsd, &conflict, &local_side.fh);
    }
}

/// The local cache inode participating in a conflict.
fn local_side_of(zfsd: &Arc<Zfsd>, _vol: &Arc<Volume>, conflict: &ZfsFh) -> Result<Dentry> {
    let table = zfsd.fh.lock();
    table
        .child_names(conflict)
        .into_iter()
        .filter_map(|n| table.dentry(conflict, &n).cloned())
        .find(|d| d.fh.sid == zfsd.this_sid() && d.fh.is_regular())
        .ok_or(ZfsError::NotFound)
}

/// The local content loses: fall back to the last synchronized state so
/// the update engine refetches the winner.
fn discard_local_version(zfsd: &Arc<Zfsd>, vol: &Arc<Volume>, local_side: &Dentry) -> Result<()> {
    let ifh = zfsd.fh.lock().get_or_stale(&local_side.fh)?;
    let ino = ifh.fh.ino;
    let meta = {
        let mut data = ifh.data.lock();
        data.meta.local_version = data.meta.master_version;
        data.meta.set_flag(FLAG_COMPLETE, false);
        data.updated.clear();
        data.modified.clear();
        data.meta
    };
    zfsd.local_files.invalidate(&local_side.fh);
    vol.metadata_op(|store| {
        let mut empty = crate::metadata::intervals::IntervalSet::new();
        store.store_intervals(&mut empty, ino, crate::metadata::IntervalKind::Updated)?;
        store.store_intervals(&mut empty, ino, crate::metadata::IntervalKind::Modified)?;
        store.flush(&meta)
    })
}

fn adopt_remote_version(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    local_side: &Dentry,
    victim: &Dentry,
    _survivor: &Dentry,
) -> Result<()> {
    let remote_version = zfsd
        .fh
        .lock()
        .get(&victim.fh)
        .map(|ifh| ifh.data.lock().attr.version)
        .unwrap_or(0);

    if victim.fh.is_non_exist() {
        // the losing side lives on another node; ask it to discard,
        // naming the file by the identity both sides share
        let shared_identity = zfsd
            .fh
            .lock()
            .get(&local_side.fh)
            .map(|ifh| ifh.data.lock().meta.master_fh)
            .filter(|fh| fh.is_defined())
            .unwrap_or(local_side.fh);
        if let Ok(node) = zfsd.node(victim.fh.sid) {
            let _ = client::oneway(
                zfsd,
                &node,
                &Request::ReintegrateDel {
                    fh: shared_identity,
                    dir: ZfsFh::UNDEFINED,
                    name: String::new(),
                    destroy: true,
                },
            );
        }
    }

    if let Some(ifh) = zfsd.fh.lock().get(&local_side.fh) {
        let meta = {
            let mut data = ifh.data.lock();
            if remote_version > 0 {
                data.meta.master_version = remote_version;
            }
            if data.meta.local_version <= data.meta.master_version {
                data.meta.local_version = data.meta.master_version + 1;
            }
            data.meta
        };
        vol.metadata_op(|store| store.flush(&meta))?;
    }
    Ok(())
}

/// Remove the conflict directory and restore `parent/name` to the local
/// cache inode.
fn collapse(zfsd: &Arc<Zfsd>, conflict: &ZfsFh, local_fh: &ZfsFh) -> Result<()> {
    let mut table = zfsd.fh.lock();
    let conflict_dentry = table.first_dentry(conflict).ok_or(ZfsError::Stale)?;
    let parent = conflict_dentry.parent;
    let name = conflict_dentry.name.clone();

    for child in table.child_names(conflict) {
        if let Some(dentry) = table.dentry(conflict, &child).cloned() {
            table.remove_dentry(&dentry);
        }
    }
    table.remove_dentry(&conflict_dentry);
    table.evict(conflict);
    table.add_dentry(parent, &name, *local_fh);
    info!(?conflict, %name, "conflict collapsed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::record::MetadataRecord as Record;
    use crate::ops;
    use crate::testing::{
        create_file, diverged_cluster, latched_update, master_daemon, meta_of, read_file,
    };
    use crate::update::UpdateMode;

    #[test]
    fn narrowing_setattr_collapses_an_aligned_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let zfsd = master_daemon(1, 7, dir.path());
        let root = ops::zfs_volume_root(&zfsd, 7).unwrap().file;
        let local_fh = create_file(&zfsd, &root, "b", b"same");
        let local_attr = ops::zfs_getattr(&zfsd, &local_fh).unwrap();

        // the other node's side agrees on everything but the mode
        let remote_fh = ZfsFh::new(2, 7, 11, 99, 1);
        {
            let mut table = zfsd.fh.lock();
            table.intern(
                remote_fh,
                Fattr { mode: 0o600, ..local_attr },
                Record::default(),
            );
        }
        let volume = zfsd.volumes.lock().lookup(7).unwrap();
        splice_conflict(&zfsd, &volume, &root, "b", &local_fh, &remote_fh).unwrap();
        assert!(ops::zfs_lookup(&zfsd, &root, "b").unwrap().file.is_conflict());

        // matching the survivor's mode to the other side collapses it
        let narrowed = crate::fh::Sattr { mode: Some(0o600), ..Default::default() };
        ops::zfs_setattr(&zfsd, &local_fh, &narrowed).unwrap();
        let resolved = ops::zfs_lookup(&zfsd, &root, "b").unwrap();
        assert_eq!(resolved.file, local_fh);
        assert!(zfsd.fh.lock().dentries_of(&remote_fh).is_empty());
    }

    #[test]
    fn misaligned_attributes_keep_the_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let zfsd = master_daemon(1, 7, dir.path());
        let root = ops::zfs_volume_root(&zfsd, 7).unwrap().file;
        let local_fh = create_file(&zfsd, &root, "b", b"same");
        let local_attr = ops::zfs_getattr(&zfsd, &local_fh).unwrap();

        let remote_fh = ZfsFh::new(2, 7, 11, 99, 1);
        {
            let mut table = zfsd.fh.lock();
            table.intern(
                remote_fh,
                Fattr { mode: 0o600, uid: local_attr.uid.wrapping_add(1), ..local_attr },
                Record::default(),
            );
        }
        let volume = zfsd.volumes.lock().lookup(7).unwrap();
        splice_conflict(&zfsd, &volume, &root, "b", &local_fh, &remote_fh).unwrap();

        // the uid still disagrees after the mode change
        let narrowed = crate::fh::Sattr { mode: Some(0o600), ..Default::default() };
        ops::zfs_setattr(&zfsd, &local_fh, &narrowed).unwrap();
        assert!(ops::zfs_lookup(&zfsd, &root, "b").unwrap().file.is_conflict());
    }

    #[test]
    fn deleting_the_local_side_pulls_the_masters_content() {
        let (cluster, conflict) = diverged_cluster();

        // n2 is this copy's own divergent version
        ops::zfs_unlink(&cluster.copy, &conflict, "n2").unwrap();

        let resolved = ops::zfs_lookup(&cluster.copy, &cluster.copy_root, "b").unwrap();
        assert_eq!(resolved.file, cluster.file_copy);
        // falling back to the synchronized state makes the next access
        // fetch the winner
        assert_eq!(read_file(&cluster.copy, &cluster.file_copy), b"AA");
        let meta = meta_of(&cluster.copy, &cluster.file_copy);
        assert_eq!(meta.local_version, meta.master_version);

        cluster.shutdown();
    }

    #[test]
    fn deleting_the_remote_side_pushes_the_local_content() {
        let (cluster, conflict) = diverged_cluster();

        // n1 is the master's version; discarding it leaves the copy dirty
        ops::zfs_unlink(&cluster.copy, &conflict, "n1").unwrap();
        let resolved = ops::zfs_lookup(&cluster.copy, &cluster.copy_root, "b").unwrap();
        assert_eq!(resolved.file, cluster.file_copy);
        let meta = meta_of(&cluster.copy, &cluster.file_copy);
        assert!(meta.local_version > meta.master_version);

        // the surviving content wins on the next reintegration
        latched_update(&cluster.copy, &cluster.file_copy, UpdateMode::Reintegrate).unwrap();
        assert_eq!(read_file(&cluster.master, &cluster.file_master), b"BB");

        cluster.shutdown();
    }
}
