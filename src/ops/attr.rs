//! Attribute operations.

use std::sync::Arc;

use tracing::debug;

use crate::daemon::Zfsd;
use crate::error::{Result, ZfsError};
use crate::fh::lock::LockLevel;
use crate::fh::{Fattr, InternalFh, Sattr, ZfsFh};
use crate::rpc::client;
use crate::rpc::proto::Request;
use crate::update::{self, UpdateMode};
use crate::volume::Volume;

use super::local;

/// Attributes of a handle, refreshed against the master when the cache is
/// clean.
pub fn zfs_getattr(zfsd: &Arc<Zfsd>, fh: &ZfsFh) -> Result<Fattr> {
    match super::resolve_with_refresh(zfsd, fh)? {
        super::Resolution::Virtual(vd) => Ok(vd.attr),
        super::Resolution::Real { vol, ifh } => {
            if fh.is_conflict() || fh.is_non_exist() {
                return Ok(ifh.data.lock().attr);
            }
            super::lock_fh(zfsd, &vol, &ifh, LockLevel::Shared)?;
            let result = locked_getattr(zfsd, &vol, &ifh);
            super::unlock_fh(&vol, &ifh);
            result
        }
    }
}

fn locked_getattr(zfsd: &Arc<Zfsd>, vol: &Arc<Volume>, ifh: &Arc<InternalFh>) -> Result<Fattr> {
    if super::locally_backed(zfsd, vol, &ifh.fh) {
        update::update_fh_if_needed(zfsd, vol, ifh, UpdateMode::Metadata)?;
        let path = super::fh_local_path(zfsd, vol, ifh)?;
        let md = local::stat_path(&path)?;
        let mut data = ifh.data.lock();
        let attr = local::fattr_from_stat(&md, data.meta.local_version);
        data.attr = attr;
        Ok(attr)
    } else {
        let (master_fh, master_sid) = remote_target(vol, ifh);
        let node = zfsd.node(master_sid)?;
        let mut reply = client::call(zfsd, &node, &Request::GetAttr { file: master_fh })?;
        let attr =
            crate::rpc::proto::fattr(&mut reply).map_err(|_| ZfsError::InvalidReply)?;
        ifh.data.lock().attr = attr;
        Ok(attr)
    }
}

/// Apply an attribute change and return the resulting attributes.
///
/// Attribute changes on a file inside a conflict directory narrow the
/// conflict; when the surviving attributes align and the versions agree,
/// the conflict collapses.
pub fn zfs_setattr(zfsd: &Arc<Zfsd>, fh: &ZfsFh, attr: &Sattr) -> Result<Fattr> {
    match super::resolve_with_refresh(zfsd, fh)? {
        super::Resolution::Virtual(_) => Err(ZfsError::ReadOnly),
        super::Resolution::Real { vol, ifh } => {
            if fh.is_conflict() || fh.is_non_exist() {
                return Err(ZfsError::InvalidArgument);
            }
            super::lock_fh(zfsd, &vol, &ifh, LockLevel::Exclusive)?;
            let result = locked_setattr(zfsd, &vol, &ifh, attr);
            super::unlock_fh(&vol, &ifh);

            if result.is_ok() {
                crate::update::conflict::collapse_if_aligned(zfsd, &vol, fh);
            }
            result
        }
    }
}

fn locked_setattr(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    ifh: &Arc<InternalFh>,
    attr: &Sattr,
) -> Result<Fattr> {
    if !super::locally_backed(zfsd, vol, &ifh.fh) {
        let (master_fh, master_sid) = remote_target(vol, ifh);
        let node = zfsd.node(master_sid)?;
        let mut reply =
            client::call(zfsd, &node, &Request::SetAttr { file: master_fh, attr: *attr })?;
        let new_attr =
            crate::rpc::proto::fattr(&mut reply).map_err(|_| ZfsError::InvalidReply)?;
        ifh.data.lock().attr = new_attr;
        return Ok(new_attr);
    }

    update::update_fh_if_needed(zfsd, vol, ifh, UpdateMode::AllUpdate)?;
    let path = super::fh_local_path(zfsd, vol, ifh)?;
    local::apply_sattr(&path, attr)?;
    if let Some(size) = attr.size {
        zfsd.local_files.invalidate(&ifh.fh);
        let mut data = ifh.data.lock();
        data.updated.clamp(size);
        data.modified.clamp(size);
    }

    let is_copy = vol.data.lock().is_copy;
    if !is_copy {
        // changes replayed under a reintegration lease are accounted by
        // the closing reintegrate_ver
        let leased = ifh.data.lock().lease.is_some();
        if !leased {
            super::bump_master_version(vol, ifh)?;
        }
    } else {
        // a clean file writes the change through and adopts the master's
        // version; a dirty one defers to the next reintegration
        let was_clean = ifh.data.lock().meta.is_clean();
        let (master_fh, master_sid) = remote_target(vol, ifh);
        let pushed_version = if was_clean {
            zfsd.node(master_sid)
                .and_then(|node| {
                    client::call(zfsd, &node, &Request::SetAttr { file: master_fh, attr: *attr })
                })
                .ok()
                .and_then(|mut reply| crate::rpc::proto::fattr(&mut reply).ok())
                .map(|fattr| fattr.version)
        } else {
            None
        };
        let meta = {
            let mut data = ifh.data.lock();
            match pushed_version {
                Some(version) => {
                    data.meta.local_version = version;
                    data.meta.master_version = version;
                }
                None => {
                    data.meta.local_version += 1;
                    debug!(fh = ?ifh.fh, "attribute change deferred to reintegration");
                }
            }
            data.meta
        };
        vol.metadata_op(|store| store.flush(&meta))?;
    }

    let md = local::stat_path(&path)?;
    let mut data = ifh.data.lock();
    let new_attr = local::fattr_from_stat(&md, data.meta.local_version);
    data.attr = new_attr;
    Ok(new_attr)
}

/// Master handle and node of a handle, defaulting to the handle itself.
pub(crate) fn remote_target(vol: &Arc<Volume>, ifh: &Arc<InternalFh>) -> (ZfsFh, u32) {
    let master_sid = vol.data.lock().master_sid;
    let data = ifh.data.lock();
    let master_fh =
        if data.meta.master_fh.is_defined() { data.meta.master_fh } else { ifh.fh };
    (master_fh, master_sid)
}
