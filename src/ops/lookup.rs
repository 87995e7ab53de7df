//! Name resolution: roots, lookup and stale-handle refresh.

use std::sync::Arc;

use tracing::debug;

use crate::daemon::Zfsd;
use crate::error::{Result, ZfsError};
use crate::fh::lock::LockLevel;
use crate::fh::{InternalFh, ZfsFh};
use crate::metadata::record::{FhMappingRecord, MetadataRecord};
use crate::rpc::client;
use crate::rpc::proto::{DirOp, DirOpRes, Request};
use crate::volume::Volume;

use super::local;

/// Handle and attributes of the global root.
pub fn zfs_root(zfsd: &Arc<Zfsd>) -> Result<DirOpRes> {
    let vtree = zfsd.vtree.lock();
    let root = vtree.get(&vtree.root()).ok_or(ZfsError::Stale)?;
    Ok(DirOpRes { file: root.fh, attr: root.attr })
}

/// Handle and attributes of a volume root.
pub fn zfs_volume_root(zfsd: &Arc<Zfsd>, vid: u32) -> Result<DirOpRes> {
    let vol = zfsd.volume(vid)?;
    let (fh, ifh) = get_volume_root_dentry(zfsd, &vol)?;
    let attr = ifh.data.lock().attr;
    Ok(DirOpRes { file: fh, attr })
}

/// Materialize the root handle of a volume, creating its dentry under the
/// covering virtual directory on first use.
pub fn get_volume_root_dentry(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
) -> Result<(ZfsFh, Arc<InternalFh>)> {
    if let Some(root_fh) = vol.data.lock().root_fh {
        if let Some(ifh) = zfsd.fh.lock().get(&root_fh) {
            return Ok((root_fh, ifh));
        }
    }

    let (local_path, is_copy, master_sid, root_vd) = {
        let data = vol.data.lock();
        (data.local_path.clone(), data.is_copy, data.master_sid, data.root_vd)
    };

    let (fh, attr, meta) = if let Some(local_path) = local_path {
        let md = local::stat_path(&local_path)?;
        let mut meta = local::get_metadata(vol, zfsd.this_sid(), vol.id, &md, is_copy)?;
        if is_copy && !meta.master_fh.is_defined() {
            adopt_root_identity(zfsd, vol, master_sid, &mut meta)?;
        }
        let fh = local::local_fh(zfsd.this_sid(), vol.id, &md, &meta);
        (fh, local::fattr_from_stat(&md, meta.local_version), meta)
    } else {
        // remote-only volume: ask the master
        let node = zfsd.node(master_sid)?;
        let mut reply = client::call(zfsd, &node, &Request::VolumeRoot { vid: vol.id })?;
        let res = DirOpRes::decode(&mut reply).map_err(|_| ZfsError::InvalidReply)?;
        let meta = MetadataRecord {
            dev: res.file.dev,
            ino: res.file.ino,
            gen: res.file.gen,
            flags: 0,
            local_version: res.attr.version,
            master_version: res.attr.version,
            master_fh: res.file,
        };
        (res.file, res.attr, meta)
    };

    let ifh = {
        let mut table = zfsd.fh.lock();
        let ifh = table.intern(fh, attr, meta);
        table.add_dentry(root_vd, "", fh);
        ifh
    };
    vol.data.lock().root_fh = Some(fh);
    Ok((fh, ifh))
}

/// Learn the master identity of a freshly materialized copy root. Resets
/// the version pair to zero so the first access pulls; an unreachable
/// master leaves the record alone and the adoption retries on the next
/// materialization.
fn adopt_root_identity(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    master_sid: u32,
    meta: &mut MetadataRecord,
) -> Result<()> {
    let Ok(node) = zfsd.node(master_sid) else { return Ok(()) };
    let Ok(mut reply) = client::call(zfsd, &node, &Request::VolumeRoot { vid: vol.id }) else {
        return Ok(());
    };
    let res = DirOpRes::decode(&mut reply).map_err(|_| ZfsError::InvalidReply)?;
    meta.master_fh = res.file;
    meta.local_version = 0;
    meta.master_version = 0;
    let mapping = FhMappingRecord { master_fh: res.file, dev: meta.dev, ino: meta.ino };
    let flushed = *meta;
    vol.metadata_op(|store| {
        store.flush(&flushed)?;
        store.flush_mapping(&mapping)
    })
}

/// Resolve `name` in `dir` and return the child's handle and attributes.
pub fn zfs_lookup(zfsd: &Arc<Zfsd>, dir: &ZfsFh, name: &str) -> Result<DirOpRes> {
    if name != "." && name != ".." {
        super::validate_name(name)?;
    }

    // virtual parents either answer from the skeleton or cross into the
    // mounted volume's root
    let (vol, idir) = match super::resolve_with_refresh(zfsd, dir)? {
        super::Resolution::Virtual(pvd) => {
            let child = {
                let vtree = zfsd.vtree.lock();
                vtree.lookup(&pvd.fh, name).map(|vd| (vd.fh, vd.attr, vd.vol))
            };
            if let Some((vd_fh, vd_attr, mounted)) = child {
                let Some(vid) = mounted else {
                    return Ok(DirOpRes { file: vd_fh, attr: vd_attr });
                };
                let vol = zfsd.volume(vid)?;
                return match get_volume_root_dentry(zfsd, &vol) {
                    Ok((fh, ifh)) => {
                        let attr = ifh.data.lock().attr;
                        Ok(DirOpRes { file: fh, attr })
                    }
                    // unreadable volume root: fall back to the attributes
                    // of the virtual directory
                    Err(_) => Ok(DirOpRes { file: vd_fh, attr: vd_attr }),
                };
            }
            match pvd.vol {
                Some(vid) => {
                    let vol = zfsd.volume(vid)?;
                    let (_, idir) = get_volume_root_dentry(zfsd, &vol)?;
                    (vol, idir)
                }
                None => return Err(ZfsError::NotFound),
            }
        }
        super::Resolution::Real { vol, ifh } => (vol, ifh),
    };

    lookup_in_dir(zfsd, &vol, &idir, name)
}

/// The non-virtual part of lookup: `.`/`..`, conflict parents, then the
/// locked local or remote resolution.
fn lookup_in_dir(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    idir: &Arc<InternalFh>,
    name: &str,
) -> Result<DirOpRes> {
    {
        let data = idir.data.lock();
        if data.attr.ftype != crate::fh::FileType::Dir {
            return Err(ZfsError::NotDir);
        }
        if name == "." {
            return Ok(DirOpRes { file: idir.fh, attr: data.attr });
        }
    }
    if name == ".." {
        return lookup_dotdot(zfsd, vol, idir);
    }

    if idir.fh.is_conflict() {
        let table = zfsd.fh.lock();
        let dentry = table.dentry(&idir.fh, name).cloned().ok_or(ZfsError::NotFound)?;
        let ifh = table.get_or_stale(&dentry.fh)?;
        let attr = ifh.data.lock().attr;
        return Ok(DirOpRes { file: dentry.fh, attr });
    }

    {
        let table = zfsd.fh.lock();
        if let Some(dentry) = table.first_dentry(&idir.fh) {
            if super::hides_special_dir(&dentry, name) {
                return Err(ZfsError::Access);
            }
        }
    }

    super::lock_fh(zfsd, vol, idir, LockLevel::Exclusive)?;
    let result = locked_lookup(zfsd, vol, idir, name);
    super::unlock_fh(vol, idir);
    result
}

fn locked_lookup(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    idir: &Arc<InternalFh>,
    name: &str,
) -> Result<DirOpRes> {
    if vol.has_local_path() {
        super::update_dir_if_needed(zfsd, vol, idir)?;
        let (fh, attr, meta) = local_lookup(zfsd, vol, idir, name)?;
        let dentry = super::get_dentry(zfsd, vol, &fh, &idir.fh, name, &attr, meta)?;
        if dentry.fh != fh {
            // a conflict was spliced at this position
            let conflict = zfsd.fh.lock().get_or_stale(&dentry.fh)?;
            let attr = conflict.data.lock().attr;
            return Ok(DirOpRes { file: dentry.fh, attr });
        }
        return Ok(DirOpRes { file: fh, attr });
    }

    // remote-only volume: forward to the master
    let res = remote_lookup(zfsd, vol, idir, name)?;
    let meta = MetadataRecord {
        dev: res.file.dev,
        ino: res.file.ino,
        gen: res.file.gen,
        flags: 0,
        local_version: res.attr.version,
        master_version: res.attr.version,
        master_fh: res.file,
    };
    super::get_dentry(zfsd, vol, &res.file, &idir.fh, name, &res.attr, meta)?;
    Ok(res)
}

fn lookup_dotdot(zfsd: &Arc<Zfsd>, vol: &Arc<Volume>, idir: &Arc<InternalFh>) -> Result<DirOpRes> {
    let parent = {
        let table = zfsd.fh.lock();
        table.first_dentry(&idir.fh).and_then(|d| d.parent)
    };
    match parent {
        Some(parent) if !parent.is_virtual() => {
            let ifh = zfsd.fh.lock().get_or_stale(&parent)?;
            let attr = ifh.data.lock().attr;
            Ok(DirOpRes { file: parent, attr })
        }
        _ => {
            // at the volume root `..` leaves through the covering virtual
            // directory
            let root_vd = vol.data.lock().root_vd;
            let vtree = zfsd.vtree.lock();
            let vd = root_vd
                .and_then(|fh| vtree.get(&fh))
                .ok_or(ZfsError::NotFound)?;
            let above = vd.parent.and_then(|fh| vtree.get(&fh)).unwrap_or(vd);
            Ok(DirOpRes { file: above.fh, attr: above.attr })
        }
    }
}

/// Resolve `name` on the local disk copy.
pub(crate) fn local_lookup(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    idir: &Arc<InternalFh>,
    name: &str,
) -> Result<(ZfsFh, crate::fh::Fattr, MetadataRecord)> {
    let path = super::dir_entry_path(zfsd, vol, idir, name)?;
    let md = local::stat_path(&path).map_err(|_| ZfsError::NotFound)?;
    let is_copy = vol.data.lock().is_copy;
    let meta = local::get_metadata(vol, zfsd.this_sid(), vol.id, &md, is_copy)?;
    let fh = local::local_fh(zfsd.this_sid(), vol.id, &md, &meta);
    Ok((fh, local::fattr_from_stat(&md, meta.local_version), meta))
}

/// Forward the lookup to the volume master.
pub(crate) fn remote_lookup(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    idir: &Arc<InternalFh>,
    name: &str,
) -> Result<DirOpRes> {
    let master_fh = {
        let data = idir.data.lock();
        if data.meta.master_fh.is_defined() {
            data.meta.master_fh
        } else {
            idir.fh
        }
    };
    let node = zfsd.node(vol.data.lock().master_sid)?;
    let request = Request::Lookup(DirOp { dir: master_fh, name: name.to_owned() });
    let mut reply = client::call(zfsd, &node, &request)?;
    DirOpRes::decode(&mut reply).map_err(|_| ZfsError::InvalidReply)
}

/// Resolve a volume-relative path, component by component.
pub fn zfs_extended_lookup(zfsd: &Arc<Zfsd>, start: &ZfsFh, path: &str) -> Result<DirOpRes> {
    if path.len() > crate::ZFS_MAXPATHLEN {
        return Err(ZfsError::NameTooLong);
    }
    let mut cur = DirOpRes {
        file: *start,
        attr: match super::resolve_with_refresh(zfsd, start)? {
            super::Resolution::Virtual(vd) => vd.attr,
            super::Resolution::Real { ifh, .. } => ifh.data.lock().attr,
        },
    };
    for component in path.split('/').filter(|c| !c.is_empty()) {
        cur = zfs_lookup(zfsd, &cur.file, component)?;
    }
    Ok(cur)
}

/// Re-resolve a stale handle through its master: ask for the relative
/// path, then walk it from the volume root so the handle is interned
/// again.
pub(crate) fn refresh_fh(zfsd: &Arc<Zfsd>, fh: &ZfsFh) -> Result<()> {
    if fh.sid == zfsd.this_sid() || !fh.is_regular() {
        return Err(ZfsError::Stale);
    }
    debug!(?fh, "refreshing stale handle");
    let node = zfsd.node(fh.sid).map_err(|_| ZfsError::Stale)?;
    let mut reply = client::call(zfsd, &node, &Request::FileInfo { file: *fh })
        .map_err(|_| ZfsError::Stale)?;
    let path = crate::rpc::coding::path(&mut reply).map_err(|_| ZfsError::InvalidReply)?;

    let root = zfs_volume_root(zfsd, fh.vid)?;
    zfs_extended_lookup(zfsd, &root.file, &path)?;
    Ok(())
}
