//! Reintegration: replaying local changes to the volume master.
//!
//! The copy side walks its per-directory journals and dirty files,
//! acquires the reintegration lease on the master, replays entries and
//! byte ranges, then advances the master's version with `reintegrate_ver`
//! (which also releases the lease). A journal entry disappears only after
//! the master confirmed delivery; partial failures leave the journal
//! intact for the next connection generation.

use std::os::unix::fs::FileExt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::daemon::Zfsd;
use crate::error::{Result, ZfsError};
use crate::fh::lock::ReintegrationLease;
use crate::fh::{FileType, InternalFh, ZfsFh};
use crate::metadata::journal::{JournalEntry, JournalOp};
use crate::metadata::record::{FhMappingRecord, FLAG_SHADOW};
use crate::metadata::IntervalKind;
use crate::ops;
use crate::rpc::client;
use crate::rpc::proto::{CreateRes, DirOp, DirOpRes, Request, ZfsCap};
use crate::volume::Volume;
use crate::ZFS_MAXDATA;

// ---------------------------------------------------------------------------
// master side
// ---------------------------------------------------------------------------

/// Acquire or release the reintegration lease of a file we master.
pub fn zfs_reintegrate(zfsd: &Arc<Zfsd>, from_sid: u32, fh: &ZfsFh, acquire: bool) -> Result<()> {
    let existing = zfsd.fh.lock().get(fh);
    let ifh = match existing {
        Some(ifh) => ifh,
        None => materialize(zfsd, fh)?,
    };
    let mut data = ifh.data.lock();

    if !acquire {
        match data.lease {
            Some(lease) if lease.sid == from_sid => {
                data.lease = None;
                Ok(())
            }
            Some(_) => Err(ZfsError::Busy),
            None => Ok(()),
        }
    } else {
        let generation = zfsd.net.peer_generation_of(from_sid).unwrap_or(0);
        match data.lease {
            None => {
                data.lease = Some(ReintegrationLease { sid: from_sid, generation });
                Ok(())
            }
            Some(lease) if lease.sid == from_sid => {
                data.lease = Some(ReintegrationLease { sid: from_sid, generation });
                Ok(())
            }
            Some(lease) => {
                // a lease granted under an older self-reported generation
                // belongs to a previous life of its owner; a vanished
                // owner is stale too
                let owner_now = zfsd.net.peer_generation_of(lease.sid);
                let stale = owner_now.map_or(true, |now| now > lease.generation);
                if stale {
                    info!(fh = ?ifh.fh, old = lease.sid, new = from_sid, "stealing stale lease");
                    data.lease = Some(ReintegrationLease { sid: from_sid, generation });
                    Ok(())
                } else {
                    Err(ZfsError::Busy)
                }
            }
        }
    }
}

/// Replay of an ADD entry on the master: directories move to the new
/// position, files gain a hard link without losing the original.
pub fn zfs_reintegrate_add(
    zfsd: &Arc<Zfsd>,
    _from_sid: u32,
    fh: &ZfsFh,
    dir: &ZfsFh,
    name: &str,
) -> Result<()> {
    ops::validate_name(name)?;
    let (vol, idir) = match ops::resolve(zfsd, dir)? {
        ops::Resolution::Real { vol, ifh } => (vol, ifh),
        ops::Resolution::Virtual(_) => return Err(ZfsError::InvalidArgument),
    };
    let existing = zfsd.fh.lock().get(fh);
    let file = match existing {
        Some(file) => file,
        None => materialize(zfsd, fh)?,
    };

    ops::lock_fh_pair(zfsd, &vol, &file, &idir, crate::fh::lock::LockLevel::Exclusive)?;
    let result = (|| {
        let to_path = ops::dir_entry_path(zfsd, &vol, &idir, name)?;
        let from_path = ops::fh_local_path(zfsd, &vol, &file)?;
        let is_dir = file.data.lock().attr.ftype == FileType::Dir;
        if is_dir {
            std::fs::rename(&from_path, &to_path)?;
            let from_dentry = zfsd.fh.lock().first_dentry(&file.fh);
            if let Some(from_dentry) = from_dentry {
                if let Some(parent) = from_dentry.parent {
                    zfsd.fh.lock().reparent_dentry(&parent, &from_dentry.name, idir.fh, name);
                }
            }
        } else {
            std::fs::hard_link(&from_path, &to_path)?;
            let (attr, meta) = {
                let mut data = file.data.lock();
                data.attr.nlink += 1;
                (data.attr, data.meta)
            };
            ops::get_dentry(zfsd, &vol, &file.fh, &idir.fh, name, &attr, meta)?;
        }
        vol.metadata_op(|store| {
            store.hardlink_insert(file.fh.dev, file.fh.ino, idir.fh.dev, idir.fh.ino, name)?;
            Ok(())
        })?;
        ops::bump_master_version(&vol, &idir)
    })();
    ops::unlock_fh_pair(&vol, &file, &idir);
    result
}

/// Replay of a DEL entry on the master. `destroy` deletes irreversibly;
/// otherwise the victim moves into the shadow tree. The degenerate form
/// with an undefined directory asks this node to discard its own divergent
/// version of `fh` (conflict resolution from the peer).
pub fn zfs_reintegrate_del(
    zfsd: &Arc<Zfsd>,
    _from_sid: u32,
    fh: &ZfsFh,
    dir: &ZfsFh,
    name: &str,
    destroy: bool,
) -> Result<()> {
    if !dir.is_defined() && name.is_empty() {
        return discard_local_divergence(zfsd, fh);
    }
    ops::validate_name(name)?;
    let (vol, idir) = match ops::resolve(zfsd, dir)? {
        ops::Resolution::Real { vol, ifh } => (vol, ifh),
        ops::Resolution::Virtual(_) => return Err(ZfsError::InvalidArgument),
    };

    ops::lock_fh(zfsd, &vol, &idir, crate::fh::lock::LockLevel::Exclusive)?;
    let result = (|| {
        let path = ops::dir_entry_path(zfsd, &vol, &idir, name)?;
        let md = crate::ops::local::stat_path(&path).map_err(|_| ZfsError::NotFound)?;
        let (victim, mut victim_meta) = ops::dir::victim_record(zfsd, &vol, &md)?;

        if destroy || md.is_dir() {
            if md.is_dir() {
                std::fs::remove_dir(&path).map_err(|err| match err.raw_os_error() {
                    Some(code) if code == libc::ENOTEMPTY => ZfsError::NotEmpty,
                    _ => ZfsError::from(err),
                })?;
            } else {
                std::fs::remove_file(&path)?;
            }
            vol.metadata_op(|store| {
                store.delete(&victim_meta, idir.fh.dev, idir.fh.ino, name)?;
                Ok(())
            })?;
        } else {
            let shadow_root = vol.shadow_path().ok_or(ZfsError::Stale)?;
            std::fs::create_dir_all(&shadow_root)?;
            let shadow_path = shadow_root.join(format!("{}-{}", victim.dev, victim.ino));
            std::fs::rename(&path, &shadow_path)?;
            victim_meta.set_flag(FLAG_SHADOW, true);
            vol.metadata_op(|store| store.flush(&victim_meta))?;
        }
        zfsd.local_files.invalidate(&victim);
        ops::delete_dentry(zfsd, &idir.fh, name);
        ops::bump_master_version(&vol, &idir)
    })();
    ops::unlock_fh(&vol, &idir);
    result
}

/// Advance the version of a file we master and release the lease.
pub fn zfs_reintegrate_ver(
    zfsd: &Arc<Zfsd>,
    from_sid: u32,
    fh: &ZfsFh,
    version_inc: u64,
) -> Result<()> {
    let (vol, ifh) = match ops::resolve(zfsd, fh)? {
        ops::Resolution::Real { vol, ifh } => (vol, ifh),
        ops::Resolution::Virtual(_) => return Err(ZfsError::InvalidArgument),
    };
    let meta = {
        let mut data = ifh.data.lock();
        match data.lease {
            Some(lease) if lease.sid == from_sid => {}
            // version bumps are fenced by the lease
            _ => return Err(ZfsError::Busy),
        }
        data.meta.local_version += version_inc;
        data.meta.master_version = data.meta.local_version;
        data.attr.version = data.meta.local_version;
        data.lease = None;
        data.meta
    };
    vol.metadata_op(|store| store.flush(&meta))?;
    debug!(?fh, version = meta.local_version, "reintegrated version bump");
    Ok(())
}

/// Resolve a master handle we have no in-memory record for through the
/// handle mapping of its volume.
fn materialize(zfsd: &Arc<Zfsd>, fh: &ZfsFh) -> Result<Arc<InternalFh>> {
    let vol = zfsd.volume(fh.vid).map_err(|_| ZfsError::Stale)?;
    if fh.sid == zfsd.this_sid() {
        return Err(ZfsError::Stale);
    }
    let mapping = vol
        .metadata_op(|store| Ok(store.lookup_mapping(fh)))?
        .ok_or(ZfsError::Stale)?;
    let record = vol
        .metadata_op(|store| Ok(store.lookup(mapping.dev, mapping.ino)))?
        .ok_or(ZfsError::Stale)?;
    let local = ZfsFh::new(zfsd.this_sid(), vol.id, mapping.dev, mapping.ino, record.gen);
    zfsd.fh.lock().get(&local).ok_or(ZfsError::Stale)
}

/// Peer-driven conflict resolution: our version of `fh` lost; fall back
/// to the synchronized state so the next access pulls the winner.
fn discard_local_divergence(zfsd: &Arc<Zfsd>, master_fh: &ZfsFh) -> Result<()> {
    let vol = zfsd.volume(master_fh.vid).map_err(|_| ZfsError::Stale)?;
    let mapping = vol
        .metadata_op(|store| Ok(store.lookup_mapping(master_fh)))?
        .ok_or(ZfsError::Stale)?;
    let record = vol
        .metadata_op(|store| Ok(store.lookup(mapping.dev, mapping.ino)))?
        .ok_or(ZfsError::Stale)?;

    let mut record = record;
    record.local_version = record.master_version;
    record.set_flag(crate::metadata::record::FLAG_COMPLETE, false);
    vol.metadata_op(|store| {
        let mut empty = crate::metadata::intervals::IntervalSet::new();
        store.store_intervals(&mut empty, record.ino, IntervalKind::Updated)?;
        store.store_intervals(&mut empty, record.ino, IntervalKind::Modified)?;
        store.flush(&record)
    })?;

    let local = ZfsFh::new(zfsd.this_sid(), vol.id, record.dev, record.ino, record.gen);
    if let Some(ifh) = zfsd.fh.lock().get(&local) {
        let mut data = ifh.data.lock();
        data.meta = record;
        data.updated.clear();
        data.modified.clear();
    }
    zfsd.local_files.invalidate(&local);
    info!(?master_fh, "discarded divergent local version");
    Ok(())
}

// ---------------------------------------------------------------------------
// copy side
// ---------------------------------------------------------------------------

/// Push the dirty ranges of a regular file to the master.
pub fn reintegrate_file(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    ifh: &Arc<InternalFh>,
    master_sid: u32,
) -> Result<()> {
    let (master_fh, local_version, master_version) = {
        let data = ifh.data.lock();
        (data.meta.master_fh, data.meta.local_version, data.meta.master_version)
    };
    if !master_fh.is_defined() {
        // the file itself still rides in its parent's journal
        return Ok(());
    }
    let node = zfsd.node(master_sid)?;

    match client::call(zfsd, &node, &Request::Reintegrate { fh: master_fh, acquire: true }) {
        Ok(_) => {}
        Err(ZfsError::Busy) => {
            debug!(fh = ?ifh.fh, "reintegration lease busy, skipping");
            return Ok(());
        }
        Err(err) => return Err(err),
    }

    let result: Result<()> = (|| {
        let mut reply = client::call(
            zfsd,
            &node,
            &Request::Open { file: master_fh, flags: libc::O_WRONLY as u32 },
        )?;
        let cap = ZfsCap::decode(&mut reply).map_err(|_| ZfsError::InvalidReply)?;

        let path = ops::fh_local_path(zfsd, vol, ifh)?;
        let file = zfsd.local_files.open(&ifh.fh, &path)?;
        let ranges: Vec<(u64, u64)> = ifh.data.lock().modified.iter().collect();
        let push_result = push_ranges(zfsd, &node, &cap, &file, &ranges);
        let _ = client::call(zfsd, &node, &Request::Close { cap });
        push_result?;

        // attribute changes ride along with the content
        let local_attr = ifh.data.lock().attr;
        let sattr = crate::fh::Sattr {
            mode: Some(local_attr.mode),
            uid: Some(local_attr.uid),
            gid: Some(local_attr.gid),
            atime: Some(local_attr.atime),
            mtime: Some(local_attr.mtime),
            ..Default::default()
        };
        client::call(zfsd, &node, &Request::SetAttr { file: master_fh, attr: sattr })?;

        let delta = local_version.saturating_sub(master_version);
        client::call(
            zfsd,
            &node,
            &Request::ReintegrateVer { fh: master_fh, version_inc: delta },
        )?;
        Ok(())
    })();

    match result {
        Ok(()) => {
            let meta = {
                let mut data = ifh.data.lock();
                data.meta.master_version = data.meta.local_version;
                data.modified.clear();
                // the pushed state is by definition current on both sides
                let size = data.attr.size;
                data.updated.clear();
                data.updated.insert(0, size);
                data.meta
            };
            let ino = ifh.fh.ino;
            vol.metadata_op(|store| {
                let mut empty = crate::metadata::intervals::IntervalSet::new();
                store.store_intervals(&mut empty, ino, IntervalKind::Modified)?;
                store.flush(&meta)
            })?;
            info!(fh = ?ifh.fh, version = meta.local_version, "file reintegrated");
            Ok(())
        }
        Err(err) => {
            // leave the dirty state alone; drop the lease so others move on
            let _ = client::call(
                zfsd,
                &node,
                &Request::Reintegrate { fh: master_fh, acquire: false },
            );
            warn!(fh = ?ifh.fh, ?err, "file reintegration failed");
            Err(ZfsError::UpdateFailed)
        }
    }
}

fn push_ranges(
    zfsd: &Arc<Zfsd>,
    node: &Arc<crate::node::Node>,
    cap: &ZfsCap,
    file: &std::fs::File,
    ranges: &[(u64, u64)],
) -> Result<()> {
    for &(lo, hi) in ranges {
        let mut offset = lo;
        while offset < hi {
            let len = ((hi - offset).min(ZFS_MAXDATA as u64)) as usize;
            let mut buf = vec![0u8; len];
            let read = file.read_at(&mut buf, offset)?;
            if read == 0 {
                break;
            }
            buf.truncate(read);
            client::call(
                zfsd,
                node,
                &Request::Write { cap: *cap, offset, data: buf },
            )?;
            offset += read as u64;
        }
    }
    Ok(())
}

/// Replay the journal of a directory to the master.
pub fn reintegrate_dir(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    ifh: &Arc<InternalFh>,
    master_sid: u32,
) -> Result<()> {
    crate::update::ensure_journal_loaded(vol, ifh)?;
    let (dir_master_fh, local_version, master_version) = {
        let data = ifh.data.lock();
        (data.meta.master_fh, data.meta.local_version, data.meta.master_version)
    };
    if !dir_master_fh.is_defined() {
        return Ok(());
    }
    let node = zfsd.node(master_sid)?;

    match client::call(zfsd, &node, &Request::Reintegrate { fh: dir_master_fh, acquire: true }) {
        Ok(_) => {}
        Err(ZfsError::Busy) => {
            debug!(fh = ?ifh.fh, "reintegration lease busy, skipping");
            return Ok(());
        }
        Err(err) => return Err(err),
    }

    let entries: Vec<JournalEntry> = ifh.data.lock().journal.entries().to_vec();
    let mut replayed = 0usize;
    let mut failure = None;
    for entry in &entries {
        match replay_entry(zfsd, vol, ifh, &node, &dir_master_fh, entry) {
            Ok(()) => {
                // confirmed: the entry may leave the journal
                let journal = {
                    let mut data = ifh.data.lock();
                    data.journal.delete(entry.oper, &entry.name);
                    data.journal.clone()
                };
                let ino = ifh.fh.ino;
                vol.metadata_op(|store| store.write_journal(ino, &journal))?;
                replayed += 1;
            }
            Err(err) => {
                failure = Some(err);
                break;
            }
        }
    }

    if let Some(err) = failure {
        let _ = client::call(
            zfsd,
            &node,
            &Request::Reintegrate { fh: dir_master_fh, acquire: false },
        );
        warn!(fh = ?ifh.fh, ?err, replayed, "journal replay interrupted");
        return Err(ZfsError::UpdateFailed);
    }

    let delta = local_version.saturating_sub(master_version);
    client::call(zfsd, &node, &Request::ReintegrateVer { fh: dir_master_fh, version_inc: delta })?;
    let meta = {
        let mut data = ifh.data.lock();
        data.meta.master_version = data.meta.local_version;
        data.meta
    };
    vol.metadata_op(|store| store.flush(&meta))?;
    info!(fh = ?ifh.fh, replayed, "directory reintegrated");
    Ok(())
}

fn replay_entry(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    idir: &Arc<InternalFh>,
    node: &Arc<crate::node::Node>,
    dir_master_fh: &ZfsFh,
    entry: &JournalEntry,
) -> Result<()> {
    match entry.oper {
        JournalOp::Add if entry.master_fh.is_defined() => {
            let request = Request::ReintegrateAdd {
                fh: entry.master_fh,
                dir: *dir_master_fh,
                name: entry.name.clone(),
            };
            client::call(zfsd, node, &request).map(drop)
        }
        JournalOp::Add => introduce_new_entry(zfsd, vol, idir, node, dir_master_fh, entry),
        JournalOp::Del => {
            let request = Request::ReintegrateDel {
                fh: entry.master_fh,
                dir: *dir_master_fh,
                name: entry.name.clone(),
                destroy: true,
            };
            match client::call(zfsd, node, &request) {
                // the master not knowing the name is success enough
                Err(ZfsError::NotFound) | Err(ZfsError::Stale) => Ok(()),
                other => other.map(drop),
            }
        }
    }
}

/// A name born on this copy: create it on the master and record the
/// assigned master handle.
fn introduce_new_entry(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    idir: &Arc<InternalFh>,
    node: &Arc<crate::node::Node>,
    dir_master_fh: &ZfsFh,
    entry: &JournalEntry,
) -> Result<()> {
    let path = ops::dir_entry_path(zfsd, vol, idir, &entry.name)?;
    let md = crate::ops::local::stat_path(&path).map_err(|_| ZfsError::NotFound)?;
    let attr = crate::ops::local::fattr_from_stat(&md, 0);
    let sattr = crate::fh::Sattr {
        mode: Some(attr.mode),
        uid: Some(attr.uid),
        gid: Some(attr.gid),
        ..Default::default()
    };
    let dir_op = DirOp { dir: *dir_master_fh, name: entry.name.clone() };

    let master_res = match attr.ftype {
        FileType::Dir => {
            let mut reply =
                client::call(zfsd, node, &Request::MkDir { dir_op, attr: sattr })?;
            DirOpRes::decode(&mut reply).map_err(|_| ZfsError::InvalidReply)?
        }
        FileType::Lnk => {
            let target = std::fs::read_link(&path)?
                .into_os_string()
                .into_string()
                .map_err(|_| ZfsError::InvalidArgument)?;
            let mut reply = client::call(
                zfsd,
                node,
                &Request::SymLink { dir_op, to: target, attr: sattr },
            )?;
            DirOpRes::decode(&mut reply).map_err(|_| ZfsError::InvalidReply)?
        }
        FileType::Reg => {
            let mut reply = client::call(
                zfsd,
                node,
                &Request::Create {
                    dir_op,
                    flags: (libc::O_WRONLY | libc::O_TRUNC) as u32,
                    attr: sattr,
                },
            )?;
            let res = CreateRes::decode(&mut reply).map_err(|_| ZfsError::InvalidReply)?;
            // ship the whole content through the fresh capability
            let file = std::fs::File::open(&path)?;
            let ranges = [(0u64, md.len())];
            let push_result = push_ranges(zfsd, node, &res.cap, &file, &ranges);
            let _ = client::call(zfsd, node, &Request::Close { cap: res.cap });
            push_result?;
            res.dor
        }
        _ => {
            let mut reply = client::call(
                zfsd,
                node,
                &Request::MkNod {
                    dir_op,
                    attr: sattr,
                    ftype: attr.ftype,
                    rdev: 0,
                },
            )?;
            DirOpRes::decode(&mut reply).map_err(|_| ZfsError::InvalidReply)?
        }
    };

    // remember the identity the master assigned
    use std::os::unix::fs::MetadataExt;
    let mut record = crate::ops::local::get_metadata(vol, zfsd.this_sid(), vol.id, &md, true)?;
    record.master_fh = master_res.file;
    record.master_version = master_res.attr.version;
    record.local_version = record.local_version.max(master_res.attr.version);
    let mapping = FhMappingRecord {
        master_fh: master_res.file,
        dev: md.dev() as u32,
        ino: md.ino() as u32,
    };
    vol.metadata_op(|store| {
        store.flush(&record)?;
        store.flush_mapping(&mapping)
    })?;
    if let Some(child) = zfsd.fh.lock().get(&entry.local_fh) {
        child.data.lock().meta = record;
    }
    Ok(())
}

/// On a fresh connection to `master_sid`, queue every dirty handle of the
/// volumes that node masters.
pub fn kick_reintegration(zfsd: &Arc<Zfsd>, master_sid: u32) {
    let vids: Vec<u32> = {
        let volumes = zfsd.volumes.lock();
        volumes
            .iter()
            .filter(|v| {
                let data = v.data.lock();
                data.is_copy && data.master_sid == master_sid && data.local_path.is_some()
            })
            .map(|v| v.id)
            .collect()
    };
    if vids.is_empty() {
        return;
    }
    let dirty: Vec<ZfsFh> = {
        let table = zfsd.fh.lock();
        table
            .handles()
            .into_iter()
            .filter(|ifh| vids.contains(&ifh.fh.vid))
            .filter(|ifh| {
                let data = ifh.data.lock();
                !data.journal.is_empty()
                    || !data.modified.is_empty()
                    || data.meta.local_version > data.meta.master_version
            })
            .map(|ifh| ifh.fh)
            .collect()
    };
    for fh in dirty {
        zfsd.schedule_update(fh);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::client;
    use crate::testing::{
        copy_daemon, create_file, latched_update, master_daemon, meta_of, peer_daemon, read_file,
        started_master,
    };
    use crate::update::UpdateMode;

    fn lease_of(zfsd: &Arc<Zfsd>, fh: &ZfsFh) -> Option<ReintegrationLease> {
        zfsd.fh.lock().get(fh).unwrap().data.lock().lease
    }

    #[test]
    fn lease_acquire_steal_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let zfsd = master_daemon(1, 7, dir.path());
        let root = ops::zfs_volume_root(&zfsd, 7).unwrap().file;
        let file = create_file(&zfsd, &root, "f", b"data");

        // grant, refresh, then steal from a disconnected owner
        zfs_reintegrate(&zfsd, 2, &file, true).unwrap();
        assert_eq!(lease_of(&zfsd, &file).unwrap().sid, 2);
        zfs_reintegrate(&zfsd, 2, &file, true).unwrap();
        zfs_reintegrate(&zfsd, 3, &file, true).unwrap();
        assert_eq!(lease_of(&zfsd, &file).unwrap().sid, 3);

        // only the holder may release; a version bump without the lease
        // is rejected the same way
        assert_eq!(zfs_reintegrate(&zfsd, 2, &file, false), Err(ZfsError::Busy));
        assert_eq!(zfs_reintegrate_ver(&zfsd, 2, &file, 1), Err(ZfsError::Busy));
        zfs_reintegrate(&zfsd, 3, &file, false).unwrap();
        assert!(lease_of(&zfsd, &file).is_none());
        // releasing an unheld lease is harmless
        zfs_reintegrate(&zfsd, 3, &file, false).unwrap();
    }

    #[test]
    fn connected_owner_keeps_its_lease_until_it_reconnects() {
        let dir = tempfile::tempdir().unwrap();
        let master = started_master(1, 7, dir.path());
        let peer = peer_daemon(2, &master);
        let root = ops::zfs_volume_root(&master, 7).unwrap().file;
        let file = create_file(&master, &root, "f", b"data");

        // establish the owner's connection so its generation is on record
        let node = peer.node(1).unwrap();
        client::call(&peer, &node, &Request::Ping { payload: b"hi".to_vec() }).unwrap();
        let first_generation = master.net.peer_generation_of(2).unwrap();

        zfs_reintegrate(&master, 2, &file, true).unwrap();
        // a live owner is not stealable
        assert_eq!(zfs_reintegrate(&master, 3, &file, true), Err(ZfsError::Busy));

        // reconnecting bumps the owner's self-reported generation and
        // fences the old lease
        let conn = master.net.established(2).unwrap();
        master.net.close(&master, &conn);
        let mut attempts = 0;
        loop {
            std::thread::sleep(std::time::Duration::from_millis(100));
            peer.node(1).unwrap().data.lock().last_connect = None;
            match client::call(&peer, &node, &Request::Ping { payload: b"again".to_vec() }) {
                Ok(_) => break,
                Err(_) if attempts < 20 => attempts += 1,
                Err(err) => panic!("reconnect failed: {err:?}"),
            }
        }
        assert!(master.net.peer_generation_of(2).unwrap() > first_generation);

        zfs_reintegrate(&master, 3, &file, true).unwrap();
        assert_eq!(lease_of(&master, &file).unwrap().sid, 3);

        peer.shutdown();
        master.shutdown();
    }

    #[test]
    fn journal_survives_an_unreachable_master() {
        let dir = tempfile::tempdir().unwrap();
        let copy = master_daemon(2, 7, dir.path());
        // re-declare the volume as a copy of a node nobody can reach
        let volume = copy.volumes.lock().lookup(7).unwrap();
        volume.set_common_info("vol7", "/m7", 1, 2, Default::default());

        let root = ops::zfs_volume_root(&copy, 7).unwrap().file;
        create_file(&copy, &root, "f", b"zz");
        assert!(!volume.metadata_op(|store| store.journal_empty(root.ino)).unwrap());

        // nothing to push against: the entry stays owed
        latched_update(&copy, &root, UpdateMode::Reintegrate).unwrap();
        assert!(!volume.metadata_op(|store| store.journal_empty(root.ino)).unwrap());
    }

    #[test]
    fn journal_replay_introduces_entries_and_empties_only_on_success() {
        let mdir = tempfile::tempdir().unwrap();
        let cdir = tempfile::tempdir().unwrap();
        let master = started_master(1, 7, mdir.path());
        let copy = copy_daemon(2, 7, cdir.path(), &master);

        let master_root = ops::zfs_volume_root(&master, 7).unwrap().file;
        let copy_root = ops::zfs_volume_root(&copy, 7).unwrap().file;
        let file_copy = create_file(&copy, &copy_root, "f", b"zz");
        let copy_volume = copy.volumes.lock().lookup(7).unwrap();
        assert!(!copy_volume.metadata_op(|store| store.journal_empty(copy_root.ino)).unwrap());

        latched_update(&copy, &copy_root, UpdateMode::Reintegrate).unwrap();

        // the master now carries the file with the pushed content
        let on_master = ops::zfs_lookup(&master, &master_root, "f").unwrap();
        assert_eq!(read_file(&master, &on_master.file), b"zz");
        // the confirmed entry left the journal, and the copy learned the
        // identity the master assigned
        assert!(copy_volume.metadata_op(|store| store.journal_empty(copy_root.ino)).unwrap());
        assert_eq!(meta_of(&copy, &file_copy).master_fh, on_master.file);

        copy.shutdown();
        master.shutdown();
    }
}
