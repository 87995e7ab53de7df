//! Data plane: read, write, readlink, block hashing and path info.

use std::os::unix::fs::FileExt;
use std::sync::Arc;

use crate::daemon::Zfsd;
use crate::error::{Result, ZfsError};
use crate::fh::lock::LockLevel;
use crate::fh::{FileType, InternalFh, ZfsFh};
use crate::metadata::IntervalKind;
use crate::rpc::client;
use crate::rpc::proto::{Md5Block, Md5SumRes, ReadRes, Request, WriteRes};
use crate::update::{self, UpdateMode};
use crate::volume::Volume;
use crate::ZFS_MAXDATA;

/// Read up to [`ZFS_MAXDATA`] bytes at `offset`.
pub fn zfs_read(
    zfsd: &Arc<Zfsd>,
    cap: &crate::rpc::proto::ZfsCap,
    offset: u64,
    count: u32,
) -> Result<ReadRes> {
    let count = count.min(ZFS_MAXDATA as u32);
    let (vol, ifh) = data_target(zfsd, &cap.fh)?;
    if !super::locally_backed(zfsd, &vol, &cap.fh) {
        let node = zfsd.node(cap.fh.sid)?;
        let mut reply =
            client::call(zfsd, &node, &Request::Read { cap: *cap, offset, count })?;
        return ReadRes::decode(&mut reply).map_err(|_| ZfsError::InvalidReply);
    }
    super::check_cap(&ifh, cap)?;

    super::lock_fh(zfsd, &vol, &ifh, LockLevel::Shared)?;
    let result = locked_read(zfsd, &vol, &ifh, offset, count);
    super::unlock_fh(&vol, &ifh);
    result
}

fn locked_read(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    ifh: &Arc<InternalFh>,
    offset: u64,
    count: u32,
) -> Result<ReadRes> {
    update::update_fh_if_needed(zfsd, vol, ifh, UpdateMode::AllUpdate)?;
    let path = super::fh_local_path(zfsd, vol, ifh)?;
    let file = zfsd.local_files.open(&ifh.fh, &path)?;
    let mut data = vec![0u8; count as usize];
    let read = file.read_at(&mut data, offset)?;
    data.truncate(read);
    let version = ifh.data.lock().meta.local_version;
    Ok(ReadRes { version, data })
}

/// Write `data` at `offset`; returns the count written and the resulting
/// version.
pub fn zfs_write(
    zfsd: &Arc<Zfsd>,
    cap: &crate::rpc::proto::ZfsCap,
    offset: u64,
    data: &[u8],
) -> Result<WriteRes> {
    if data.len() > ZFS_MAXDATA {
        return Err(ZfsError::InvalidArgument);
    }
    let (vol, ifh) = data_target(zfsd, &cap.fh)?;
    if !super::locally_backed(zfsd, &vol, &cap.fh) {
        let node = zfsd.node(cap.fh.sid)?;
        let request = Request::Write { cap: *cap, offset, data: data.to_vec() };
        let mut reply = client::call(zfsd, &node, &request)?;
        return WriteRes::decode(&mut reply).map_err(|_| ZfsError::InvalidReply);
    }
    super::check_cap(&ifh, cap)?;

    super::lock_fh(zfsd, &vol, &ifh, LockLevel::Exclusive)?;
    let result = locked_write(zfsd, &vol, &ifh, offset, data);
    super::unlock_fh(&vol, &ifh);
    result
}

fn locked_write(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    ifh: &Arc<InternalFh>,
    offset: u64,
    data: &[u8],
) -> Result<WriteRes> {
    update::update_fh_if_needed(zfsd, vol, ifh, UpdateMode::AllUpdate)?;
    let path = super::fh_local_path(zfsd, vol, ifh)?;
    let file = zfsd.local_files.open(&ifh.fh, &path)?;
    file.write_all_at(data, offset)?;

    let end = offset + data.len() as u64;
    let is_copy = vol.data.lock().is_copy;
    if is_copy {
        // a fresh dirty range makes the file owe a reintegration
        let (meta, version) = {
            let mut fh_data = ifh.data.lock();
            if fh_data.meta.is_clean() {
                fh_data.meta.local_version += 1;
            }
            fh_data.attr.size = fh_data.attr.size.max(end);
            (fh_data.meta, fh_data.meta.local_version)
        };
        // the exclusive latch keeps the taken-out set private
        let ino = ifh.fh.ino;
        let mut modified = std::mem::take(&mut ifh.data.lock().modified);
        let persisted = vol.metadata_op(|store| {
            store.flush(&meta)?;
            store.append_interval(&mut modified, ino, IntervalKind::Modified, offset, end)
        });
        ifh.data.lock().modified = modified;
        persisted?;
        Ok(WriteRes { written: data.len() as u32, version })
    } else {
        // writes replayed under a reintegration lease are accounted by
        // the closing reintegrate_ver, not per write
        let leased = ifh.data.lock().lease.is_some();
        if !leased {
            super::bump_master_version(vol, ifh)?;
        }
        let mut fh_data = ifh.data.lock();
        fh_data.attr.size = fh_data.attr.size.max(end);
        Ok(WriteRes { written: data.len() as u32, version: fh_data.meta.local_version })
    }
}

/// Target of the symlink at `fh`.
pub fn zfs_readlink(zfsd: &Arc<Zfsd>, fh: &ZfsFh) -> Result<String> {
    match super::resolve_with_refresh(zfsd, fh)? {
        super::Resolution::Virtual(_) => Err(ZfsError::InvalidArgument),
        super::Resolution::Real { vol, ifh } => {
            if ifh.data.lock().attr.ftype != FileType::Lnk {
                return Err(ZfsError::InvalidArgument);
            }
            if !super::locally_backed(zfsd, &vol, &ifh.fh) {
                let (master_fh, master_sid) = super::attr::remote_target(&vol, &ifh);
                let node = zfsd.node(master_sid)?;
                let mut reply =
                    client::call(zfsd, &node, &Request::ReadLink { file: master_fh })?;
                return crate::rpc::coding::path(&mut reply)
                    .map_err(|_| ZfsError::InvalidReply);
            }
            super::lock_fh(zfsd, &vol, &ifh, LockLevel::Shared)?;
            let result = (|| {
                let path = super::fh_local_path(zfsd, &vol, &ifh)?;
                let target = std::fs::read_link(&path)?;
                target.into_os_string().into_string().map_err(|_| ZfsError::InvalidArgument)
            })();
            super::unlock_fh(&vol, &ifh);
            result
        }
    }
}

/// MD5 sums of the requested block ranges of a locally cached file, with
/// its current size and version. The update engine compares these against
/// the master's to skip transferring blocks that already match.
pub fn local_md5sum(
    zfsd: &Arc<Zfsd>,
    cap: &crate::rpc::proto::ZfsCap,
    ranges: &[(u64, u32)],
) -> Result<Md5SumRes> {
    let (vol, ifh) = data_target(zfsd, &cap.fh)?;
    if !super::locally_backed(zfsd, &vol, &cap.fh) {
        return Err(ZfsError::InvalidArgument);
    }

    super::lock_fh(zfsd, &vol, &ifh, LockLevel::Shared)?;
    let result = (|| {
        let path = super::fh_local_path(zfsd, &vol, &ifh)?;
        let file = zfsd.local_files.open(&ifh.fh, &path)?;
        let (size, version) = {
            let data = ifh.data.lock();
            (data.attr.size, data.meta.local_version)
        };
        let mut blocks = Vec::with_capacity(ranges.len());
        let mut buf = vec![0u8; ZFS_MAXDATA];
        for &(offset, length) in ranges {
            let length = length.min(ZFS_MAXDATA as u32);
            let read = file.read_at(&mut buf[..length as usize], offset)?;
            let digest = md5::compute(&buf[..read]);
            blocks.push(Md5Block { offset, length: read as u32, sum: digest.0 });
        }
        Ok(Md5SumRes { size, version, blocks })
    })();
    super::unlock_fh(&vol, &ifh);
    result
}

/// Volume-relative path of a handle, for stale-handle refresh and the
/// configuration plumbing.
pub fn zfs_file_info(zfsd: &Arc<Zfsd>, fh: &ZfsFh) -> Result<String> {
    match super::resolve(zfsd, fh)? {
        super::Resolution::Virtual(_) => Err(ZfsError::InvalidArgument),
        super::Resolution::Real { ifh, .. } => super::fh_relative_path(zfsd, &ifh),
    }
}

/// Resolve the handle a data operation addresses.
fn data_target(zfsd: &Arc<Zfsd>, fh: &ZfsFh) -> Result<(Arc<Volume>, Arc<InternalFh>)> {
    match super::resolve_with_refresh(zfsd, fh)? {
        super::Resolution::Virtual(_) => Err(ZfsError::IsDir),
        super::Resolution::Real { vol, ifh } => {
            if fh.is_conflict() {
                return Err(ZfsError::IsDir);
            }
            if fh.is_non_exist() {
                return Err(ZfsError::NotFound);
            }
            Ok((vol, ifh))
        }
    }
}
