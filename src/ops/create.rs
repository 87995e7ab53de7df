//! File creation and the open/close capability pair.

use std::fs::OpenOptions;
use std::sync::Arc;

use crate::daemon::Zfsd;
use crate::error::{Result, ZfsError};
use crate::fh::lock::LockLevel;
use crate::fh::{InternalFh, Sattr, ZfsFh};
use crate::metadata::journal::JournalOp;
use crate::rpc::client;
use crate::rpc::proto::{CreateRes, DirOp, DirOpRes, Request, ZfsCap, CAP_VERIFY_LEN};
use crate::update::{self, UpdateMode};
use crate::volume::Volume;

use super::{local, lookup};

/// Resolve a directory handle for a mutating operation: virtual parents
/// are read-only unless a volume root covers them, conflict directories
/// take no new children.
pub(crate) fn resolve_writable_dir(
    zfsd: &Arc<Zfsd>,
    dir: &ZfsFh,
) -> Result<(Arc<Volume>, Arc<InternalFh>)> {
    match super::resolve_with_refresh(zfsd, dir)? {
        super::Resolution::Virtual(vd) => match vd.vol {
            Some(vid) => {
                let vol = zfsd.volume(vid)?;
                let (_, idir) = lookup::get_volume_root_dentry(zfsd, &vol)?;
                Ok((vol, idir))
            }
            None => Err(ZfsError::ReadOnly),
        },
        super::Resolution::Real { vol, ifh } => {
            if ifh.fh.is_conflict() || ifh.fh.is_non_exist() {
                return Err(ZfsError::InvalidArgument);
            }
            if ifh.data.lock().attr.ftype != crate::fh::FileType::Dir {
                return Err(ZfsError::NotDir);
            }
            Ok((vol, ifh))
        }
    }
}

/// Block creation of the administrative names in a volume root.
pub(crate) fn reject_special_name(
    zfsd: &Arc<Zfsd>,
    idir: &Arc<InternalFh>,
    name: &str,
) -> Result<()> {
    let table = zfsd.fh.lock();
    match table.first_dentry(&idir.fh) {
        Some(dentry) if super::hides_special_dir(&dentry, name) => Err(ZfsError::Access),
        _ => Ok(()),
    }
}

/// Create a regular file and return its capability, handle and
/// attributes.
pub fn zfs_create(
    zfsd: &Arc<Zfsd>,
    dir: &ZfsFh,
    name: &str,
    flags: u32,
    attr: &Sattr,
) -> Result<CreateRes> {
    super::validate_name(name)?;
    let (vol, idir) = resolve_writable_dir(zfsd, dir)?;
    reject_special_name(zfsd, &idir, name)?;

    super::lock_fh(zfsd, &vol, &idir, LockLevel::Exclusive)?;
    let result = locked_create(zfsd, &vol, &idir, name, flags, attr);
    super::unlock_fh(&vol, &idir);
    result
}

fn locked_create(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    idir: &Arc<InternalFh>,
    name: &str,
    flags: u32,
    attr: &Sattr,
) -> Result<CreateRes> {
    if !vol.has_local_path() {
        let node = zfsd.node(vol.data.lock().master_sid)?;
        let request = Request::Create {
            dir_op: DirOp { dir: super::attr::remote_target(vol, idir).0, name: name.to_owned() },
            flags,
            attr: *attr,
        };
        let mut reply = client::call(zfsd, &node, &request)?;
        let res = CreateRes::decode(&mut reply).map_err(|_| ZfsError::InvalidReply)?;
        intern_remote(zfsd, vol, idir, name, &res.dor)?;
        return Ok(res);
    }

    update::update_fh_if_needed(zfsd, vol, idir, UpdateMode::AllUpdate)?;
    let path = super::dir_entry_path(zfsd, vol, idir, name)?;

    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    if flags & libc::O_EXCL as u32 != 0 {
        options.create_new(true);
    }
    if flags & libc::O_TRUNC as u32 != 0 {
        options.truncate(true);
    }
    let _file = options.open(&path)?;
    local::apply_sattr(&path, attr)?;

    let (fh, fattr, meta) = lookup::local_lookup(zfsd, vol, idir, name)?;
    let dentry = super::get_dentry(zfsd, vol, &fh, &idir.fh, name, &fattr, meta)?;
    if dentry.fh != fh {
        return Err(ZfsError::Exists);
    }
    record_new_link(zfsd, vol, idir, &fh, name)?;

    let ifh = zfsd.fh.lock().get_or_stale(&fh)?;
    let cap = super::grant_cap(zfsd, &ifh, flags);
    Ok(CreateRes { cap, dor: DirOpRes { file: fh, attr: fattr } })
}

/// Shared tail of local namespace additions: the hardlink record, the
/// journal entry of a copy and the directory version bump of a master.
pub(crate) fn record_new_link(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    idir: &Arc<InternalFh>,
    fh: &ZfsFh,
    name: &str,
) -> Result<()> {
    vol.metadata_op(|store| {
        store.hardlink_insert(fh.dev, fh.ino, idir.fh.dev, idir.fh.ino, name)?;
        Ok(())
    })?;
    if vol.data.lock().is_copy {
        let (master_fh, master_version) = {
            let ifh = zfsd.fh.lock().get_or_stale(fh)?;
            let data = ifh.data.lock();
            (data.meta.master_fh, data.meta.master_version)
        };
        super::journal_namespace_op(
            vol,
            idir,
            JournalOp::Add,
            fh,
            &master_fh,
            master_version,
            name,
        )
    } else {
        super::bump_master_version(vol, idir)
    }
}

/// Register the result of a remotely executed namespace addition.
pub(crate) fn intern_remote(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    idir: &Arc<InternalFh>,
    name: &str,
    res: &DirOpRes,
) -> Result<()> {
    let meta = crate::metadata::record::MetadataRecord {
        dev: res.file.dev,
        ino: res.file.ino,
        gen: res.file.gen,
        flags: 0,
        local_version: res.attr.version,
        master_version: res.attr.version,
        master_fh: res.file,
    };
    super::get_dentry(zfsd, vol, &res.file, &idir.fh, name, &res.attr, meta)?;
    Ok(())
}

/// Open a handle and grant a capability.
pub fn zfs_open(zfsd: &Arc<Zfsd>, fh: &ZfsFh, flags: u32) -> Result<ZfsCap> {
    let accmode = flags & libc::O_ACCMODE as u32;
    match super::resolve_with_refresh(zfsd, fh)? {
        super::Resolution::Virtual(vd) => {
            if accmode != libc::O_RDONLY as u32 {
                return Err(ZfsError::ReadOnly);
            }
            Ok(ZfsCap { fh: vd.fh, flags, verify: [0u8; CAP_VERIFY_LEN] })
        }
        super::Resolution::Real { vol, ifh } => {
            if fh.is_non_exist() {
                return Err(ZfsError::NotFound);
            }
            if fh.is_conflict() {
                return Ok(ZfsCap { fh: *fh, flags, verify: [0u8; CAP_VERIFY_LEN] });
            }
            if !super::locally_backed(zfsd, &vol, fh) {
                // the remote owner hands out the capability
                let (master_fh, _) = super::attr::remote_target(&vol, &ifh);
                let node = zfsd.node(master_fh.sid)?;
                let mut reply =
                    client::call(zfsd, &node, &Request::Open { file: master_fh, flags })?;
                return ZfsCap::decode(&mut reply).map_err(|_| ZfsError::InvalidReply);
            }
            super::lock_fh(zfsd, &vol, &ifh, LockLevel::Shared)?;
            let result = update::update_fh_if_needed(zfsd, &vol, &ifh, UpdateMode::AllUpdate)
                .map(|()| super::grant_cap(zfsd, &ifh, flags));
            super::unlock_fh(&vol, &ifh);
            result
        }
    }
}

/// Release a capability. A dirty file schedules its write-back.
pub fn zfs_close(zfsd: &Arc<Zfsd>, cap: &ZfsCap) -> Result<()> {
    match super::resolve(zfsd, &cap.fh) {
        Ok(super::Resolution::Virtual(_)) => Ok(()),
        Ok(super::Resolution::Real { vol, ifh }) => {
            if cap.fh.is_conflict() {
                return Ok(());
            }
            if !super::locally_backed(zfsd, &vol, &cap.fh) {
                let node = zfsd.node(cap.fh.sid)?;
                client::call(zfsd, &node, &Request::Close { cap: *cap })?;
                return Ok(());
            }
            super::revoke_cap(&ifh, cap)?;
            let owes_writeback = {
                let data = ifh.data.lock();
                !data.modified.is_empty() || !data.journal.is_empty()
            };
            if owes_writeback {
                zfsd.schedule_update(cap.fh);
            }
            Ok(())
        }
        Err(err) => Err(err),
    }
}
