//! Namespace edges: link, unlink, symlink, mknod and rename.

use std::os::unix::fs::MetadataExt;
use std::sync::Arc;

use tracing::debug;

use crate::daemon::Zfsd;
use crate::error::{Result, ZfsError};
use crate::fh::lock::LockLevel;
use crate::fh::{FileType, InternalFh, Sattr, ZfsFh};
use crate::metadata::journal::JournalOp;
use crate::metadata::record::FLAG_SHADOW;
use crate::rpc::client;
use crate::rpc::proto::{DirOp, DirOpRes, Request};
use crate::update::{self, UpdateMode};
use crate::volume::Volume;

use super::create::{intern_remote, record_new_link, reject_special_name, resolve_writable_dir};
use super::{local, lookup};

/// Add a hard link `dir/name` to the file `from`.
pub fn zfs_link(zfsd: &Arc<Zfsd>, from: &ZfsFh, dir: &ZfsFh, name: &str) -> Result<()> {
    super::validate_name(name)?;
    if from.vid != dir.vid && !dir.is_virtual() {
        return Err(ZfsError::CrossDevice);
    }
    let (vol, idir) = resolve_writable_dir(zfsd, dir)?;
    reject_special_name(zfsd, &idir, name)?;
    let source = match super::resolve_with_refresh(zfsd, from)? {
        super::Resolution::Virtual(_) => return Err(ZfsError::ReadOnly),
        super::Resolution::Real { vol: source_vol, ifh } => {
            if !Arc::ptr_eq(&source_vol, &vol) {
                return Err(ZfsError::CrossDevice);
            }
            if ifh.data.lock().attr.ftype == FileType::Dir {
                return Err(ZfsError::Perm);
            }
            ifh
        }
    };

    super::lock_fh_pair(zfsd, &vol, &source, &idir, LockLevel::Exclusive)?;
    let result = locked_link(zfsd, &vol, &source, &idir, name);
    super::unlock_fh_pair(&vol, &source, &idir);
    result
}

fn locked_link(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    source: &Arc<InternalFh>,
    idir: &Arc<InternalFh>,
    name: &str,
) -> Result<()> {
    if !vol.has_local_path() {
        let node = zfsd.node(vol.data.lock().master_sid)?;
        let request = Request::Link {
            from: super::attr::remote_target(vol, source).0,
            to: DirOp { dir: super::attr::remote_target(vol, idir).0, name: name.to_owned() },
        };
        client::call(zfsd, &node, &request)?;
        let (attr, meta) = {
            let data = source.data.lock();
            (data.attr, data.meta)
        };
        super::get_dentry(zfsd, vol, &source.fh, &idir.fh, name, &attr, meta)?;
        return Ok(());
    }

    update::update_fh_if_needed(zfsd, vol, idir, UpdateMode::AllUpdate)?;
    let from_path = super::fh_local_path(zfsd, vol, source)?;
    let to_path = super::dir_entry_path(zfsd, vol, idir, name)?;
    std::fs::hard_link(&from_path, &to_path)?;

    let (attr, meta) = {
        let mut data = source.data.lock();
        data.attr.nlink += 1;
        (data.attr, data.meta)
    };
    super::get_dentry(zfsd, vol, &source.fh, &idir.fh, name, &attr, meta)?;
    record_new_link(zfsd, vol, idir, &source.fh, name)
}

/// Remove the name `dir/name`. Inside a conflict directory this resolves
/// the conflict by discarding the named side.
pub fn zfs_unlink(zfsd: &Arc<Zfsd>, dir: &ZfsFh, name: &str) -> Result<()> {
    super::validate_name(name)?;
    if dir.is_conflict() {
        let vol = zfsd.volume(dir.vid)?;
        return crate::update::conflict::resolve_by_delete(zfsd, &vol, dir, name);
    }
    let (vol, idir) = resolve_writable_dir(zfsd, dir)?;
    reject_special_name(zfsd, &idir, name)?;

    super::lock_fh(zfsd, &vol, &idir, LockLevel::Exclusive)?;
    let result = locked_unlink(zfsd, &vol, &idir, name);
    super::unlock_fh(&vol, &idir);
    result
}

fn locked_unlink(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    idir: &Arc<InternalFh>,
    name: &str,
) -> Result<()> {
    if !vol.has_local_path() {
        let node = zfsd.node(vol.data.lock().master_sid)?;
        let request = Request::Unlink(DirOp {
            dir: super::attr::remote_target(vol, idir).0,
            name: name.to_owned(),
        });
        client::call(zfsd, &node, &request)?;
        super::delete_dentry(zfsd, &idir.fh, name);
        return Ok(());
    }

    update::update_fh_if_needed(zfsd, vol, idir, UpdateMode::AllUpdate)?;
    let path = super::dir_entry_path(zfsd, vol, idir, name)?;
    let md = local::stat_path(&path).map_err(|_| ZfsError::NotFound)?;
    if md.is_dir() {
        return Err(ZfsError::IsDir);
    }
    let (victim, mut victim_meta) = super::dir::victim_record(zfsd, vol, &md)?;

    let is_copy = vol.data.lock().is_copy;
    let owes_master_delete = is_copy && victim_meta.master_fh.is_defined();
    let last_link = md.nlink() == 1;
    if owes_master_delete && last_link && !victim_meta.is_clean() {
        // the master still owes us a delete but the local bytes are the
        // only copy of unreintegrated changes; keep them in the shadow
        move_to_shadow(vol, &victim, &path, &mut victim_meta)?;
    } else {
        std::fs::remove_file(&path)?;
        vol.metadata_op(|store| {
            store.delete(&victim_meta, idir.fh.dev, idir.fh.ino, name)?;
            Ok(())
        })?;
    }
    zfsd.local_files.invalidate(&victim);
    super::delete_dentry(zfsd, &idir.fh, name);

    if is_copy {
        super::journal_namespace_op(
            vol,
            idir,
            JournalOp::Del,
            &victim,
            &victim_meta.master_fh,
            victim_meta.master_version,
            name,
        )?;
    } else {
        super::bump_master_version(vol, idir)?;
    }
    Ok(())
}

/// Move the last hardlink of a dirty, unreintegrated file under the
/// volume's shadow tree.
fn move_to_shadow(
    vol: &Arc<Volume>,
    victim: &ZfsFh,
    path: &std::path::Path,
    meta: &mut crate::metadata::record::MetadataRecord,
) -> Result<()> {
    let shadow_root = vol.shadow_path().ok_or(ZfsError::Stale)?;
    std::fs::create_dir_all(&shadow_root)?;
    let shadow_path = shadow_root.join(format!("{}-{}", victim.dev, victim.ino));
    std::fs::rename(path, &shadow_path)?;
    debug!(?victim, path = %shadow_path.display(), "moved to shadow");

    meta.set_flag(FLAG_SHADOW, true);
    let flushed = *meta;
    vol.metadata_op(|store| store.flush(&flushed))
}

/// Create the symlink `dir/name -> to`.
pub fn zfs_symlink(
    zfsd: &Arc<Zfsd>,
    dir: &ZfsFh,
    name: &str,
    to: &str,
    attr: &Sattr,
) -> Result<DirOpRes> {
    super::validate_name(name)?;
    if to.is_empty() || to.len() > crate::ZFS_MAXPATHLEN {
        return Err(ZfsError::InvalidArgument);
    }
    let (vol, idir) = resolve_writable_dir(zfsd, dir)?;
    reject_special_name(zfsd, &idir, name)?;

    super::lock_fh(zfsd, &vol, &idir, LockLevel::Exclusive)?;
    let result = locked_symlink(zfsd, &vol, &idir, name, to, attr);
    super::unlock_fh(&vol, &idir);
    result
}

fn locked_symlink(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    idir: &Arc<InternalFh>,
    name: &str,
    to: &str,
    attr: &Sattr,
) -> Result<DirOpRes> {
    if !vol.has_local_path() {
        let node = zfsd.node(vol.data.lock().master_sid)?;
        let request = Request::SymLink {
            dir_op: DirOp { dir: super::attr::remote_target(vol, idir).0, name: name.to_owned() },
            to: to.to_owned(),
            attr: *attr,
        };
        let mut reply = client::call(zfsd, &node, &request)?;
        let res = DirOpRes::decode(&mut reply).map_err(|_| ZfsError::InvalidReply)?;
        intern_remote(zfsd, vol, idir, name, &res)?;
        return Ok(res);
    }

    update::update_fh_if_needed(zfsd, vol, idir, UpdateMode::AllUpdate)?;
    let path = super::dir_entry_path(zfsd, vol, idir, name)?;
    std::os::unix::fs::symlink(to, &path)?;
    // ownership applies to the link itself; mode and size do not
    local::apply_sattr(&path, &Sattr { uid: attr.uid, gid: attr.gid, ..Default::default() })?;

    let (fh, fattr, meta) = lookup::local_lookup(zfsd, vol, idir, name)?;
    super::get_dentry(zfsd, vol, &fh, &idir.fh, name, &fattr, meta)?;
    record_new_link(zfsd, vol, idir, &fh, name)?;
    Ok(DirOpRes { file: fh, attr: fattr })
}

/// Create a special file.
pub fn zfs_mknod(
    zfsd: &Arc<Zfsd>,
    dir: &ZfsFh,
    name: &str,
    attr: &Sattr,
    ftype: FileType,
    rdev: u32,
) -> Result<DirOpRes> {
    super::validate_name(name)?;
    if !matches!(ftype, FileType::Blk | FileType::Chr | FileType::Sock | FileType::Fifo) {
        return Err(ZfsError::InvalidArgument);
    }
    let (vol, idir) = resolve_writable_dir(zfsd, dir)?;
    reject_special_name(zfsd, &idir, name)?;

    super::lock_fh(zfsd, &vol, &idir, LockLevel::Exclusive)?;
    let result = locked_mknod(zfsd, &vol, &idir, name, attr, ftype, rdev);
    super::unlock_fh(&vol, &idir);
    result
}

fn locked_mknod(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    idir: &Arc<InternalFh>,
    name: &str,
    attr: &Sattr,
    ftype: FileType,
    rdev: u32,
) -> Result<DirOpRes> {
    if !vol.has_local_path() {
        let node = zfsd.node(vol.data.lock().master_sid)?;
        let request = Request::MkNod {
            dir_op: DirOp { dir: super::attr::remote_target(vol, idir).0, name: name.to_owned() },
            attr: *attr,
            ftype,
            rdev,
        };
        let mut reply = client::call(zfsd, &node, &request)?;
        let res = DirOpRes::decode(&mut reply).map_err(|_| ZfsError::InvalidReply)?;
        intern_remote(zfsd, vol, idir, name, &res)?;
        return Ok(res);
    }

    update::update_fh_if_needed(zfsd, vol, idir, UpdateMode::AllUpdate)?;
    let path = super::dir_entry_path(zfsd, vol, idir, name)?;
    let mode = ftype.to_mode_bits() | (attr.mode.unwrap_or(0o644) & 0o7777);
    let cpath = std::ffi::CString::new(path.as_os_str().as_encoded_bytes())
        .map_err(|_| ZfsError::InvalidArgument)?;
    let rc = unsafe { libc::mknod(cpath.as_ptr(), mode, rdev as libc::dev_t) };
    if rc != 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    local::apply_sattr(&path, &Sattr { uid: attr.uid, gid: attr.gid, ..Default::default() })?;

    let (fh, fattr, meta) = lookup::local_lookup(zfsd, vol, idir, name)?;
    super::get_dentry(zfsd, vol, &fh, &idir.fh, name, &fattr, meta)?;
    record_new_link(zfsd, vol, idir, &fh, name)?;
    Ok(DirOpRes { file: fh, attr: fattr })
}

/// Move `from_dir/from_name` to `to_dir/to_name`. The moved handle keeps
/// its identity; only the dentry is reparented.
pub fn zfs_rename(
    zfsd: &Arc<Zfsd>,
    from_dir: &ZfsFh,
    from_name: &str,
    to_dir: &ZfsFh,
    to_name: &str,
) -> Result<()> {
    super::validate_name(from_name)?;
    super::validate_name(to_name)?;
    let (vol, from_idir) = resolve_writable_dir(zfsd, from_dir)?;
    let (to_vol, to_idir) = resolve_writable_dir(zfsd, to_dir)?;
    if !Arc::ptr_eq(&vol, &to_vol) {
        return Err(ZfsError::CrossDevice);
    }
    reject_special_name(zfsd, &from_idir, from_name)?;
    reject_special_name(zfsd, &to_idir, to_name)?;

    super::lock_fh_pair(zfsd, &vol, &from_idir, &to_idir, LockLevel::Exclusive)?;
    let result = locked_rename(zfsd, &vol, &from_idir, from_name, &to_idir, to_name);
    super::unlock_fh_pair(&vol, &from_idir, &to_idir);
    result
}

fn locked_rename(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    from_idir: &Arc<InternalFh>,
    from_name: &str,
    to_idir: &Arc<InternalFh>,
    to_name: &str,
) -> Result<()> {
    if !vol.has_local_path() {
        let node = zfsd.node(vol.data.lock().master_sid)?;
        let request = Request::Rename {
            from: DirOp {
                dir: super::attr::remote_target(vol, from_idir).0,
                name: from_name.to_owned(),
            },
            to: DirOp {
                dir: super::attr::remote_target(vol, to_idir).0,
                name: to_name.to_owned(),
            },
        };
        client::call(zfsd, &node, &request)?;
        zfsd.fh.lock().reparent_dentry(&from_idir.fh, from_name, to_idir.fh, to_name);
        return Ok(());
    }

    update::update_fh_if_needed(zfsd, vol, from_idir, UpdateMode::AllUpdate)?;
    if to_idir.fh != from_idir.fh {
        update::update_fh_if_needed(zfsd, vol, to_idir, UpdateMode::AllUpdate)?;
    }

    let from_path = super::dir_entry_path(zfsd, vol, from_idir, from_name)?;
    let to_path = super::dir_entry_path(zfsd, vol, to_idir, to_name)?;
    let md = local::stat_path(&from_path).map_err(|_| ZfsError::NotFound)?;
    let (moved, moved_meta) = super::dir::victim_record(zfsd, vol, &md)?;
    let replaced = local::stat_path(&to_path)
        .ok()
        .map(|md| super::dir::victim_record(zfsd, vol, &md))
        .transpose()?;

    std::fs::rename(&from_path, &to_path)?;
    zfsd.local_files.invalidate(&moved);

    vol.metadata_op(|store| {
        if let Some((_, replaced_meta)) = &replaced {
            store.delete(replaced_meta, to_idir.fh.dev, to_idir.fh.ino, to_name)?;
        }
        store.hardlink_replace(
            moved.ino,
            (from_idir.fh.dev, from_idir.fh.ino, from_name),
            to_idir.fh.dev,
            to_idir.fh.ino,
            to_name,
        )?;
        Ok(())
    })?;
    zfsd.fh.lock().reparent_dentry(&from_idir.fh, from_name, to_idir.fh, to_name);

    if vol.data.lock().is_copy {
        // the move is two journal entries: the old name dies, the new
        // name is born
        super::journal_namespace_op(
            vol,
            from_idir,
            JournalOp::Del,
            &moved,
            &moved_meta.master_fh,
            moved_meta.master_version,
            from_name,
        )?;
        super::journal_namespace_op(
            vol,
            to_idir,
            JournalOp::Add,
            &moved,
            &moved_meta.master_fh,
            moved_meta.master_version,
            to_name,
        )?;
    } else {
        super::bump_master_version(vol, from_idir)?;
        if to_idir.fh != from_idir.fh {
            super::bump_master_version(vol, to_idir)?;
        }
    }
    Ok(())
}
