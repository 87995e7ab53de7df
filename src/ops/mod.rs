//! The operation surface the host-OS binding calls into, and the shared
//! resolution, latching and interposition helpers behind it.
//!
//! Every operation follows the same shape: validate the handle, resolve it
//! (with one stale refresh), branch on virtual and conflict parents, latch
//! the handle, let the update engine reconcile with the master, do the
//! work locally or over RPC, interpose the resulting dentry and unlatch.

pub mod attr;
pub mod create;
pub mod dir;
pub mod io;
pub mod link;
pub mod local;
pub mod lookup;

use std::sync::Arc;

pub use attr::{zfs_getattr, zfs_setattr};
pub use create::{zfs_close, zfs_create, zfs_open};
pub use dir::{zfs_mkdir, zfs_readdir, zfs_rmdir};
pub use io::{local_md5sum, zfs_file_info, zfs_read, zfs_readlink, zfs_write};
pub use link::{zfs_link, zfs_mknod, zfs_rename, zfs_symlink, zfs_unlink};
pub use lookup::{zfs_extended_lookup, zfs_lookup, zfs_root, zfs_volume_root};

use crate::daemon::Zfsd;
use crate::error::{Result, ZfsError};
use crate::fh::lock::LockLevel;
use crate::fh::virtdir::VirtualDir;
use crate::fh::{CapGrant, Dentry, Fattr, InternalFh, ZfsFh};
use crate::metadata::journal::JournalOp;
use crate::metadata::record::MetadataRecord;
use crate::rpc::proto::ZfsCap;
use crate::volume::Volume;

/// What a handle resolves to.
pub(crate) enum Resolution {
    /// A directory of the mount-point skeleton.
    Virtual(VirtualDir),
    /// A materialized handle on some volume.
    Real { vol: Arc<Volume>, ifh: Arc<InternalFh> },
}

/// Resolve a handle against the tables, without refresh.
pub(crate) fn resolve(zfsd: &Arc<Zfsd>, fh: &ZfsFh) -> Result<Resolution> {
    if !fh.is_defined() {
        return Err(ZfsError::InvalidArgument);
    }
    if fh.is_virtual() {
        let vtree = zfsd.vtree.lock();
        return vtree.get(fh).cloned().map(Resolution::Virtual).ok_or(ZfsError::Stale);
    }
    let vol = zfsd.volumes.lock().lookup(fh.vid).ok_or(ZfsError::Stale)?;
    if vol.is_delete_marked() {
        return Err(ZfsError::Stale);
    }
    let ifh = zfsd.fh.lock().get(fh).ok_or(ZfsError::Stale)?;
    Ok(Resolution::Real { vol, ifh })
}

/// Resolve with one stale refresh: the master may have renumbered the
/// inode behind the handle.
pub(crate) fn resolve_with_refresh(zfsd: &Arc<Zfsd>, fh: &ZfsFh) -> Result<Resolution> {
    match resolve(zfsd, fh) {
        Err(ZfsError::Stale) if fh.is_regular() => {
            lookup::refresh_fh(zfsd, fh)?;
            resolve(zfsd, fh)
        }
        other => other,
    }
}

/// Latch a handle, counting it on the volume. After the (possibly
/// blocking) acquisition the handle is re-validated against the table.
pub(crate) fn lock_fh(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    ifh: &Arc<InternalFh>,
    level: LockLevel,
) -> Result<()> {
    vol.data.lock().n_locked_fhs += 1;
    if let Err(err) = ifh.acquire(level, &zfsd.terminating) {
        vol.data.lock().n_locked_fhs -= 1;
        return Err(err);
    }
    if zfsd.fh.lock().get(&ifh.fh).is_none() {
        unlock_fh(vol, ifh);
        return Err(ZfsError::Stale);
    }
    Ok(())
}

/// Undo one [`lock_fh`].
pub(crate) fn unlock_fh(vol: &Arc<Volume>, ifh: &Arc<InternalFh>) {
    ifh.release();
    vol.data.lock().n_locked_fhs -= 1;
}

/// Latch two handles for an operation spanning two directories, in handle
/// order (see [`crate::fh::lock::acquire_pair`]).
pub(crate) fn lock_fh_pair(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    a: &Arc<InternalFh>,
    b: &Arc<InternalFh>,
    level: LockLevel,
) -> Result<()> {
    let count = if a.fh == b.fh { 1 } else { 2 };
    vol.data.lock().n_locked_fhs += count;
    if let Err(err) = crate::fh::lock::acquire_pair(a, b, level, &zfsd.terminating) {
        vol.data.lock().n_locked_fhs -= count;
        return Err(err);
    }
    let table = zfsd.fh.lock();
    if table.get(&a.fh).is_none() || table.get(&b.fh).is_none() {
        drop(table);
        unlock_fh_pair(vol, a, b);
        return Err(ZfsError::Stale);
    }
    Ok(())
}

/// Undo one [`lock_fh_pair`].
pub(crate) fn unlock_fh_pair(vol: &Arc<Volume>, a: &Arc<InternalFh>, b: &Arc<InternalFh>) {
    let count = if a.fh == b.fh { 1 } else { 2 };
    crate::fh::lock::release_pair(a, b);
    vol.data.lock().n_locked_fhs -= count;
}

/// Interpose the dentry `parent/name -> local_fh`, creating or refreshing
/// the handle record. When a different handle already sits at that
/// position, the conflict machinery splices a synthetic directory and the
/// returned dentry names it.
#[allow(clippy::too_many_arguments)]
pub(crate) fn get_dentry(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    local_fh: &ZfsFh,
    parent: &ZfsFh,
    name: &str,
    attr: &Fattr,
    meta: MetadataRecord,
) -> Result<Dentry> {
    let mut table = zfsd.fh.lock();
    table.intern(*local_fh, *attr, meta);
    match table.dentry(parent, name).cloned() {
        None => Ok(table.add_dentry(Some(*parent), name, *local_fh)),
        Some(existing) if existing.fh == *local_fh => Ok(existing),
        Some(existing) if existing.fh.is_conflict() => {
            // reuse the spliced conflict, attach the resolved side
            let conflict = existing.fh;
            drop(table);
            crate::update::conflict::attach_side(zfsd, vol, &conflict, local_fh)?;
            Ok(existing)
        }
        Some(existing) => {
            drop(table);
            crate::update::conflict::splice_conflict(
                zfsd,
                vol,
                parent,
                name,
                &existing.fh,
                local_fh,
            )
        }
    }
}

/// Remove the dentry at `parent/name`, if any.
pub(crate) fn delete_dentry(zfsd: &Arc<Zfsd>, parent: &ZfsFh, name: &str) {
    let mut table = zfsd.fh.lock();
    if let Some(dentry) = table.dentry(parent, name).cloned() {
        table.remove_dentry(&dentry);
    }
}

/// True when the bytes of `fh` live in this node's cache of `vol`. A
/// handle pointing at another node (a remote-only volume, the master's
/// side of a conflict) is served over RPC instead.
pub(crate) fn locally_backed(zfsd: &Arc<Zfsd>, vol: &Arc<Volume>, fh: &ZfsFh) -> bool {
    fh.sid == zfsd.this_sid() && vol.has_local_path()
}

/// Record a namespace change of a copy volume in the directory's journal
/// and bump the directory's local version. On the master this is a no-op.
pub(crate) fn journal_namespace_op(
    vol: &Arc<Volume>,
    dir_ifh: &Arc<InternalFh>,
    oper: JournalOp,
    local_fh: &ZfsFh,
    master_fh: &ZfsFh,
    master_version: u64,
    name: &str,
) -> Result<()> {
    if !vol.data.lock().is_copy {
        return Ok(());
    }
    crate::update::ensure_journal_loaded(vol, dir_ifh)?;
    let mut data = dir_ifh.data.lock();
    data.journal.insert(oper, *local_fh, *master_fh, master_version, name);
    data.meta.local_version += 1;
    let journal = data.journal.clone();
    let meta = data.meta;
    drop(data);
    let dir_ino = dir_ifh.fh.ino;
    vol.metadata_op(|store| {
        store.write_journal(dir_ino, &journal)?;
        store.flush(&meta)
    })
}

/// Bump the version of a locally changed file on the master: the master's
/// data is the authority, both versions advance together.
pub(crate) fn bump_master_version(vol: &Arc<Volume>, ifh: &Arc<InternalFh>) -> Result<()> {
    let meta = {
        let mut data = ifh.data.lock();
        data.meta.local_version += 1;
        data.meta.master_version = data.meta.local_version;
        data.attr.version = data.meta.local_version;
        data.meta
    };
    vol.metadata_op(|store| store.flush(&meta))
}

/// Grant a capability for `flags` on a latched handle.
pub(crate) fn grant_cap(zfsd: &Arc<Zfsd>, ifh: &Arc<InternalFh>, flags: u32) -> ZfsCap {
    let verify = zfsd.next_verifier();
    ifh.data.lock().caps.push(CapGrant { flags, verify });
    ZfsCap { fh: ifh.fh, flags, verify }
}

/// Check a presented capability against the outstanding grants.
pub(crate) fn check_cap(ifh: &Arc<InternalFh>, cap: &ZfsCap) -> Result<()> {
    let data = ifh.data.lock();
    data.caps
        .iter()
        .any(|grant| grant.verify == cap.verify && grant.flags == cap.flags)
        .then_some(())
        .ok_or(ZfsError::BadFd)
}

/// Drop a capability; unknown verifiers answer `EBADF`.
pub(crate) fn revoke_cap(ifh: &Arc<InternalFh>, cap: &ZfsCap) -> Result<()> {
    let mut data = ifh.data.lock();
    let before = data.caps.len();
    data.caps.retain(|grant| grant.verify != cap.verify);
    if data.caps.len() == before {
        return Err(ZfsError::BadFd);
    }
    Ok(())
}

/// Local disk path of `name` inside a latched directory.
pub(crate) fn dir_entry_path(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    idir: &Arc<InternalFh>,
    name: &str,
) -> Result<std::path::PathBuf> {
    let local_path = vol.data.lock().local_path.clone().ok_or(ZfsError::Stale)?;
    let table = zfsd.fh.lock();
    let dentry = table.first_dentry(&idir.fh).ok_or(ZfsError::Stale)?;
    crate::fh::dentry::build_local_path_name(&local_path, &table, &dentry, name)
        .ok_or(ZfsError::Stale)
}

/// Local disk path of a latched handle.
pub(crate) fn fh_local_path(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    ifh: &Arc<InternalFh>,
) -> Result<std::path::PathBuf> {
    let local_path = vol.data.lock().local_path.clone().ok_or(ZfsError::Stale)?;
    let table = zfsd.fh.lock();
    let dentry = table.first_dentry(&ifh.fh).ok_or(ZfsError::Stale)?;
    crate::fh::dentry::build_local_path(&local_path, &table, &dentry).ok_or(ZfsError::Stale)
}

/// Volume-relative path of a handle.
pub(crate) fn fh_relative_path(zfsd: &Arc<Zfsd>, ifh: &Arc<InternalFh>) -> Result<String> {
    let table = zfsd.fh.lock();
    let dentry = table.first_dentry(&ifh.fh).ok_or(ZfsError::Stale)?;
    crate::fh::dentry::build_relative_path(&table, &dentry).ok_or(ZfsError::Stale)
}

/// Reject names that cannot cross the VFS surface.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(ZfsError::InvalidArgument);
    }
    if name.len() > crate::ZFS_MAXNAMELEN {
        return Err(ZfsError::NameTooLong);
    }
    Ok(())
}

/// True when `name` in the volume root is one of the administrative
/// subtrees hidden from the namespace.
pub(crate) fn hides_special_dir(table_dentry: &Dentry, name: &str) -> bool {
    table_dentry.is_volume_root() && Volume::is_special_name(name)
}

/// Whether a locally cached parent should push before, or pull after, the
/// operation. Remote-only parents skip the engine.
pub(crate) fn update_dir_if_needed(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    ifh: &Arc<InternalFh>,
) -> Result<()> {
    if vol.has_local_path() {
        crate::update::update_fh_if_needed(zfsd, vol, ifh, crate::update::UpdateMode::AllUpdate)
    } else {
        Ok(())
    }
}
