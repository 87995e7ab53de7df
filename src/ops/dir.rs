//! Directory operations: mkdir, rmdir and readdir.

use std::sync::Arc;

use crate::daemon::Zfsd;
use crate::error::{Result, ZfsError};
use crate::fh::lock::LockLevel;
use crate::fh::{FileType, InternalFh, Sattr, ZfsFh};
use crate::metadata::journal::JournalOp;
use crate::rpc::client;
use crate::rpc::proto::{DirEntry, DirList, DirOp, DirOpRes, Request, ZfsCap};
use crate::update::{self, UpdateMode};
use crate::volume::Volume;

use super::create::{intern_remote, record_new_link, reject_special_name, resolve_writable_dir};
use super::{local, lookup};

/// Create a directory.
pub fn zfs_mkdir(zfsd: &Arc<Zfsd>, dir: &ZfsFh, name: &str, attr: &Sattr) -> Result<DirOpRes> {
    super::validate_name(name)?;
    let (vol, idir) = resolve_writable_dir(zfsd, dir)?;
    reject_special_name(zfsd, &idir, name)?;

    super::lock_fh(zfsd, &vol, &idir, LockLevel::Exclusive)?;
    let result = locked_mkdir(zfsd, &vol, &idir, name, attr);
    super::unlock_fh(&vol, &idir);
    result
}

fn locked_mkdir(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    idir: &Arc<InternalFh>,
    name: &str,
    attr: &Sattr,
) -> Result<DirOpRes> {
    if !vol.has_local_path() {
        let node = zfsd.node(vol.data.lock().master_sid)?;
        let request = Request::MkDir {
            dir_op: DirOp { dir: super::attr::remote_target(vol, idir).0, name: name.to_owned() },
            attr: *attr,
        };
        let mut reply = client::call(zfsd, &node, &request)?;
        let res = DirOpRes::decode(&mut reply).map_err(|_| ZfsError::InvalidReply)?;
        intern_remote(zfsd, vol, idir, name, &res)?;
        return Ok(res);
    }

    update::update_fh_if_needed(zfsd, vol, idir, UpdateMode::AllUpdate)?;
    let path = super::dir_entry_path(zfsd, vol, idir, name)?;
    std::fs::create_dir(&path)?;
    local::apply_sattr(&path, attr)?;

    let (fh, fattr, meta) = lookup::local_lookup(zfsd, vol, idir, name)?;
    let dentry = super::get_dentry(zfsd, vol, &fh, &idir.fh, name, &fattr, meta)?;
    if dentry.fh != fh {
        return Err(ZfsError::Exists);
    }
    record_new_link(zfsd, vol, idir, &fh, name)?;
    Ok(DirOpRes { file: fh, attr: fattr })
}

/// Remove an empty directory.
pub fn zfs_rmdir(zfsd: &Arc<Zfsd>, dir: &ZfsFh, name: &str) -> Result<()> {
    super::validate_name(name)?;
    let (vol, idir) = resolve_writable_dir(zfsd, dir)?;
    reject_special_name(zfsd, &idir, name)?;

    super::lock_fh(zfsd, &vol, &idir, LockLevel::Exclusive)?;
    let result = locked_rmdir(zfsd, &vol, &idir, name);
    super::unlock_fh(&vol, &idir);
    result
}

fn locked_rmdir(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    idir: &Arc<InternalFh>,
    name: &str,
) -> Result<()> {
    if !vol.has_local_path() {
        let node = zfsd.node(vol.data.lock().master_sid)?;
        let request = Request::RmDir(DirOp {
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
    if !md.is_dir() {
        return Err(ZfsError::NotDir);
    }
    std::fs::remove_dir(&path).map_err(|err| match err.raw_os_error() {
        Some(code) if code == libc::ENOTEMPTY => ZfsError::NotEmpty,
        _ => ZfsError::from(err),
    })?;

    let (victim, victim_meta) = victim_record(zfsd, vol, &md)?;
    vol.metadata_op(|store| {
        store.delete(&victim_meta, idir.fh.dev, idir.fh.ino, name)?;
        Ok(())
    })?;
    super::delete_dentry(zfsd, &idir.fh, name);

    if vol.data.lock().is_copy {
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

/// The handle and metadata record of a just-removed local inode.
pub(crate) fn victim_record(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    md: &std::fs::Metadata,
) -> Result<(ZfsFh, crate::metadata::record::MetadataRecord)> {
    let is_copy = vol.data.lock().is_copy;
    let meta = local::get_metadata(vol, zfsd.this_sid(), vol.id, md, is_copy)?;
    Ok((local::local_fh(zfsd.this_sid(), vol.id, md, &meta), meta))
}

/// List a directory starting at `cookie`; at most `count` entries.
pub fn zfs_readdir(zfsd: &Arc<Zfsd>, cap: &ZfsCap, cookie: i32, count: u32) -> Result<DirList> {
    let count = count.clamp(1, 1024) as usize;
    match super::resolve_with_refresh(zfsd, &cap.fh)? {
        super::Resolution::Virtual(vd) => {
            let vtree = zfsd.vtree.lock();
            let vd = vtree.get(&vd.fh).ok_or(ZfsError::Stale)?;
            let names: Vec<String> = vd.entry_names().cloned().collect();
            Ok(list_slice(&names, cookie, count))
        }
        super::Resolution::Real { vol, ifh } => {
            if ifh.data.lock().attr.ftype != FileType::Dir {
                return Err(ZfsError::NotDir);
            }
            if cap.fh.is_conflict() {
                let names = zfsd.fh.lock().child_names(&cap.fh);
                return Ok(list_slice(&names, cookie, count));
            }
            if !vol.has_local_path() {
                let node = zfsd.node(vol.data.lock().master_sid)?;
                let request =
                    Request::ReadDir { cap: *cap, cookie, count: count as u32 };
                let mut reply = client::call(zfsd, &node, &request)?;
                return DirList::decode(&mut reply).map_err(|_| ZfsError::InvalidReply);
            }

            super::lock_fh(zfsd, &vol, &ifh, LockLevel::Shared)?;
            let result = locked_readdir(zfsd, &vol, &ifh, cookie, count);
            super::unlock_fh(&vol, &ifh);
            result
        }
    }
}

fn locked_readdir(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    ifh: &Arc<InternalFh>,
    cookie: i32,
    count: usize,
) -> Result<DirList> {
    update::update_fh_if_needed(zfsd, vol, ifh, UpdateMode::AllUpdate)?;
    let path = super::fh_local_path(zfsd, vol, ifh)?;
    let at_root = {
        let table = zfsd.fh.lock();
        table.first_dentry(&ifh.fh).map_or(false, |d| d.is_volume_root())
    };

    let mut names = Vec::new();
    for entry in std::fs::read_dir(&path)? {
        let entry = entry?;
        let name = entry.file_name().into_string().map_err(|_| ZfsError::InvalidArgument)?;
        if at_root && Volume::is_special_name(&name) {
            continue;
        }
        names.push(name);
    }
    names.sort();

    // splice names the graph holds but the disk does not (conflicts)
    let (spliced, table_conflicts) = {
        let table = zfsd.fh.lock();
        let spliced = table.child_names(&ifh.fh);
        let conflicts: Vec<bool> = spliced
            .iter()
            .map(|name| table.dentry(&ifh.fh, name).map_or(false, |d| d.fh.is_conflict()))
            .collect();
        (spliced, conflicts)
    };
    for (name, is_conflict) in spliced.into_iter().zip(table_conflicts) {
        if let Err(pos) = names.binary_search(&name) {
            if is_conflict {
                names.insert(pos, name);
            }
        }
    }

    Ok(list_slice(&names, cookie, count))
}

/// Window a sorted name list by cookie and count; entry inodes are not
/// part of the listing contract here, readers re-resolve by name.
fn list_slice(names: &[String], cookie: i32, count: usize) -> DirList {
    let start = cookie.max(0) as usize;
    let mut entries = Vec::new();
    let mut index = start;
    for name in names.iter().skip(start).take(count) {
        index += 1;
        entries.push(DirEntry { ino: index as u32, cookie: index as i32, name: name.clone() });
    }
    DirList { entries, eof: index >= names.len() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_slice_windows_and_flags_eof() {
        let names: Vec<String> = ["a", "b", "c", "d"].iter().map(|s| s.to_string()).collect();
        let first = list_slice(&names, 0, 3);
        assert_eq!(first.entries.len(), 3);
        assert!(!first.eof);
        assert_eq!(first.entries[2].cookie, 3);

        let rest = list_slice(&names, first.entries[2].cookie, 3);
        assert_eq!(rest.entries.len(), 1);
        assert_eq!(rest.entries[0].name, "d");
        assert!(rest.eof);
    }
}
