//! The update engine: deciding, on each access, whether a handle must be
//! pulled from its master, pushed back, or spliced into a conflict.
//!
//! Callers hold the handle's latch. The engine compares the local version
//! pair against the master's current version: a clean handle with an
//! advanced master pulls, a dirty handle with an unmoved master pushes
//! (reintegrates), divergence on both sides builds a conflict. Transfers
//! run in [`crate::ZFS_MAXDATA`] blocks and skip blocks whose MD5 already
//! matches.

pub mod conflict;

use std::os::unix::fs::FileExt;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use tracing::{debug, trace, warn};

use crate::daemon::Zfsd;
use crate::error::{Result, ZfsError};
use crate::fh::{Fattr, FileType, InternalFh, ZfsFh};
use crate::metadata::record::{FhMappingRecord, FLAG_COMPLETE};
use crate::metadata::IntervalKind;
use crate::ops;
use crate::rpc::client;
use crate::rpc::proto::{DirList, DirOp, DirOpRes, Md5SumRes, ReadRes, Request, ZfsCap};
use crate::volume::Volume;
use crate::ZFS_MAXDATA;

/// How much of the shared state an access needs to be current.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum UpdateMode {
    /// Cached attributes suffice; refresh them when clean.
    Metadata,
    /// Data and namespace must be current.
    AllUpdate,
    /// A write-back is wanted now.
    Reintegrate,
}

/// Reconcile a latched handle with its master as far as `mode` demands.
///
/// An unreachable master is not an error: the access proceeds on the
/// local replica and reconciliation waits for the next connection.
pub fn update_fh_if_needed(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    ifh: &Arc<InternalFh>,
    mode: UpdateMode,
) -> Result<()> {
    let (is_copy, master_sid) = {
        let data = vol.data.lock();
        (data.is_copy, data.master_sid)
    };
    if !is_copy || !ifh.fh.is_regular() || ifh.fh.sid != zfsd.this_sid() {
        return Ok(());
    }
    ensure_intervals_loaded(vol, ifh)?;
    let master_fh = ifh.data.lock().meta.master_fh;
    if !master_fh.is_defined() {
        // never seen by the master yet; only reintegration can introduce it
        if mode == UpdateMode::Reintegrate {
            return push(zfsd, vol, ifh, master_sid);
        }
        return Ok(());
    }

    let node = match zfsd.node(master_sid) {
        Ok(node) => node,
        Err(_) => return Ok(()),
    };
    let master_attr =
        match client::call(zfsd, &node, &Request::GetAttr { file: master_fh }) {
            Ok(mut reply) => {
                crate::rpc::proto::fattr(&mut reply).map_err(|_| ZfsError::InvalidReply)?
            }
            Err(err) if err.is_connection_error() => {
                trace!(?err, "master unreachable, serving local replica");
                return Ok(());
            }
            Err(ZfsError::NotFound) | Err(ZfsError::Stale) => {
                // the master no longer knows the file; local changes win
                // or the handle goes stale on next resolution
                return Ok(());
            }
            Err(err) => return Err(err),
        };

    let (local_version, synced_version) = {
        let data = ifh.data.lock();
        (data.meta.local_version, data.meta.master_version)
    };
    let dirty = local_version > synced_version;
    let master_advanced = master_attr.version > synced_version;

    match (dirty, master_advanced) {
        (false, false) => {
            if mode == UpdateMode::Metadata {
                refresh_cached_attr(ifh, &master_attr);
            }
            Ok(())
        }
        (false, true) => match ifh.data.lock().attr.ftype {
            FileType::Dir => pull_dir(zfsd, vol, ifh, &node, &master_attr),
            _ => pull_file(zfsd, vol, ifh, &node, &master_attr),
        },
        (true, false) => {
            if mode == UpdateMode::Metadata {
                return Ok(());
            }
            push(zfsd, vol, ifh, master_sid)
        }
        (true, true) => {
            debug!(fh = ?ifh.fh, local_version, master = master_attr.version,
                   "divergence detected");
            conflict::build_version_conflict(zfsd, vol, ifh, &master_attr)
        }
    }
}

fn refresh_cached_attr(ifh: &Arc<InternalFh>, master_attr: &Fattr) {
    let mut data = ifh.data.lock();
    data.attr.mode = master_attr.mode;
    data.attr.uid = master_attr.uid;
    data.attr.gid = master_attr.gid;
    data.attr.atime = master_attr.atime;
    data.attr.mtime = master_attr.mtime;
    data.attr.ctime = master_attr.ctime;
}

/// Pull the byte ranges of a regular file that are not locally current.
fn pull_file(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    ifh: &Arc<InternalFh>,
    node: &Arc<crate::node::Node>,
    master_attr: &Fattr,
) -> Result<()> {
    let master_fh = ifh.data.lock().meta.master_fh;
    let path = ops::fh_local_path(zfsd, vol, ifh)?;
    let file = zfsd.local_files.open(&ifh.fh, &path)?;
    let local_size = crate::ops::local::stat_path(&path)?.len();

    let mut reply =
        client::call(zfsd, node, &Request::Open { file: master_fh, flags: libc::O_RDONLY as u32 })?;
    let cap = ZfsCap::decode(&mut reply).map_err(|_| ZfsError::InvalidReply)?;

    let result = pull_file_blocks(zfsd, vol, ifh, node, &cap, &file, local_size, master_attr);
    let _ = client::call(zfsd, node, &Request::Close { cap });
    result?;

    file.set_len(master_attr.size).ok();
    zfsd.local_files.invalidate(&ifh.fh);

    // everything below the master size is now current
    let meta = {
        let mut data = ifh.data.lock();
        data.meta.local_version = master_attr.version;
        data.meta.master_version = master_attr.version;
        data.meta.set_flag(FLAG_COMPLETE, true);
        data.updated.clear();
        data.updated.insert(0, master_attr.size);
        data.attr.size = master_attr.size;
        data.attr.version = master_attr.version;
        data.meta
    };
    let ino = ifh.fh.ino;
    vol.metadata_op(|store| {
        let mut updated = std::mem::take(&mut ifh.data.lock().updated);
        let res = store.store_intervals(&mut updated, ino, IntervalKind::Updated);
        ifh.data.lock().updated = updated;
        res?;
        store.flush(&meta)
    })?;
    debug!(fh = ?ifh.fh, version = master_attr.version, "file pulled");
    Ok(())
}

#[allow(clippy::too_many_arguments)]
fn pull_file_blocks(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    ifh: &Arc<InternalFh>,
    node: &Arc<crate::node::Node>,
    cap: &ZfsCap,
    file: &std::fs::File,
    local_size: u64,
    master_attr: &Fattr,
) -> Result<()> {
    let holes = ifh.data.lock().updated.complement(0, master_attr.size);
    for (lo, hi) in holes {
        let mut offset = lo;
        while offset < hi {
            let len = ((hi - offset).min(ZFS_MAXDATA as u64)) as u32;

            // a block we already hold bytes for may still match the
            // master; hash before transferring
            if offset + u64::from(len) <= local_size
                && block_matches_master(zfsd, node, cap, file, offset, len)?
            {
                mark_updated(vol, ifh, offset, offset + u64::from(len))?;
                offset += u64::from(len);
                continue;
            }

            let mut reply = client::call(
                zfsd,
                node,
                &Request::Read { cap: *cap, offset, count: len },
            )?;
            let res = ReadRes::decode(&mut reply).map_err(|_| ZfsError::InvalidReply)?;
            if res.version != master_attr.version {
                // the master moved underneath the transfer; retry later
                return Err(ZfsError::UpdateFailed);
            }
            file.write_all_at(&res.data, offset)?;
            let end = offset + res.data.len() as u64;
            mark_updated(vol, ifh, offset, end)?;
            if res.data.len() < len as usize {
                break;
            }
            offset = end;
        }
    }
    Ok(())
}

fn block_matches_master(
    zfsd: &Arc<Zfsd>,
    node: &Arc<crate::node::Node>,
    cap: &ZfsCap,
    file: &std::fs::File,
    offset: u64,
    len: u32,
) -> Result<bool> {
    let mut buf = vec![0u8; len as usize];
    let read = file.read_at(&mut buf, offset)?;
    if read != len as usize {
        return Ok(false);
    }
    let local_sum = md5::compute(&buf[..read]);

    let request = Request::Md5Sum { cap: *cap, ignore_changes: true, ranges: vec![(offset, len)] };
    let mut reply = match client::call(zfsd, node, &request) {
        Ok(reply) => reply,
        Err(_) => return Ok(false),
    };
    let res = Md5SumRes::decode(&mut reply).map_err(|_| ZfsError::InvalidReply)?;
    Ok(res
        .blocks
        .first()
        .map_or(false, |b| b.offset == offset && b.length == len && b.sum == local_sum.0))
}

fn mark_updated(vol: &Arc<Volume>, ifh: &Arc<InternalFh>, lo: u64, hi: u64) -> Result<()> {
    let ino = ifh.fh.ino;
    let mut updated = std::mem::take(&mut ifh.data.lock().updated);
    let res = vol.metadata_op(|store| {
        store.append_interval(&mut updated, ino, IntervalKind::Updated, lo, hi)
    });
    ifh.data.lock().updated = updated;
    res
}

/// Pull a directory: list the master, mirror missing entries, drop
/// entries the master no longer has (unless a journal entry shows they
/// were born here).
fn pull_dir(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    ifh: &Arc<InternalFh>,
    node: &Arc<crate::node::Node>,
    master_attr: &Fattr,
) -> Result<()> {
    ensure_journal_loaded(vol, ifh)?;
    let master_fh = ifh.data.lock().meta.master_fh;
    let master_names = list_remote_dir(zfsd, node, &master_fh)?;

    let path = ops::fh_local_path(zfsd, vol, ifh)?;
    let mut local_names = Vec::new();
    for entry in std::fs::read_dir(&path)? {
        let name = entry?.file_name().into_string().map_err(|_| ZfsError::InvalidArgument)?;
        if !crate::volume::Volume::is_special_name(&name) {
            local_names.push(name);
        }
    }

    for name in &master_names {
        if !local_names.contains(name) {
            if let Err(err) = materialize_remote_entry(zfsd, vol, ifh, node, &master_fh, name) {
                warn!(%name, ?err, "cannot mirror master entry");
            }
        }
    }
    for name in &local_names {
        if !master_names.contains(name) {
            let born_here = ifh
                .data
                .lock()
                .journal
                .member(crate::metadata::journal::JournalOp::Add, name);
            if !born_here {
                remove_local_entry(zfsd, vol, ifh, name)?;
            }
        }
    }

    let meta = {
        let mut data = ifh.data.lock();
        data.meta.local_version = master_attr.version;
        data.meta.master_version = master_attr.version;
        data.attr.version = master_attr.version;
        data.meta
    };
    vol.metadata_op(|store| store.flush(&meta))?;
    debug!(fh = ?ifh.fh, version = master_attr.version, "directory pulled");
    Ok(())
}

fn list_remote_dir(
    zfsd: &Arc<Zfsd>,
    node: &Arc<crate::node::Node>,
    dir_fh: &ZfsFh,
) -> Result<Vec<String>> {
    let mut reply =
        client::call(zfsd, node, &Request::Open { file: *dir_fh, flags: libc::O_RDONLY as u32 })?;
    let cap = ZfsCap::decode(&mut reply).map_err(|_| ZfsError::InvalidReply)?;

    let mut names = Vec::new();
    let mut cookie = 0;
    let listing = loop {
        let request = Request::ReadDir { cap, cookie, count: 256 };
        let mut reply = match client::call(zfsd, node, &request) {
            Ok(reply) => reply,
            Err(err) => break Err(err),
        };
        let list = match DirList::decode(&mut reply) {
            Ok(list) => list,
            Err(_) => break Err(ZfsError::InvalidReply),
        };
        cookie = list.entries.last().map_or(cookie, |e| e.cookie);
        let done = list.eof || list.entries.is_empty();
        names.extend(list.entries.into_iter().map(|e| e.name));
        if done {
            break Ok(());
        }
    };
    let _ = client::call(zfsd, node, &Request::Close { cap });
    listing?;
    names.retain(|n| n != "." && n != "..");
    Ok(names)
}

/// Mirror one master entry into the local cache: directories and
/// symlinks whole, regular files as empty placeholders whose content is
/// pulled on access.
fn materialize_remote_entry(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    idir: &Arc<InternalFh>,
    node: &Arc<crate::node::Node>,
    dir_master_fh: &ZfsFh,
    name: &str,
) -> Result<()> {
    let request = Request::Lookup(DirOp { dir: *dir_master_fh, name: name.to_owned() });
    let mut reply = client::call(zfsd, node, &request)?;
    let res = DirOpRes::decode(&mut reply).map_err(|_| ZfsError::InvalidReply)?;

    let path = ops::dir_entry_path(zfsd, vol, idir, name)?;
    match res.attr.ftype {
        FileType::Dir => std::fs::create_dir(&path)?,
        FileType::Lnk => {
            let mut reply = client::call(zfsd, node, &Request::ReadLink { file: res.file })?;
            let target =
                crate::rpc::coding::path(&mut reply).map_err(|_| ZfsError::InvalidReply)?;
            std::os::unix::fs::symlink(target, &path)?;
        }
        _ => {
            std::fs::File::create(&path)?;
        }
    }

    let md = crate::ops::local::stat_path(&path)?;
    use std::os::unix::fs::MetadataExt;
    let mut meta = crate::ops::local::get_metadata(vol, zfsd.this_sid(), vol.id, &md, true)?;
    meta.master_fh = res.file;
    if res.attr.ftype == FileType::Reg {
        // an empty placeholder: staying behind the master's version makes
        // the first access pull the bytes
        meta.local_version = 0;
        meta.master_version = 0;
    } else {
        // directories and links mirror whole
        meta.local_version = res.attr.version;
        meta.master_version = res.attr.version;
        meta.set_flag(FLAG_COMPLETE, true);
    }
    let mapping =
        FhMappingRecord { master_fh: res.file, dev: md.dev() as u32, ino: md.ino() as u32 };
    vol.metadata_op(|store| {
        store.flush(&meta)?;
        store.flush_mapping(&mapping)?;
        store.hardlink_insert(meta.dev, meta.ino, idir.fh.dev, idir.fh.ino, name)?;
        Ok(())
    })?;

    let local_fh = crate::ops::local::local_fh(zfsd.this_sid(), vol.id, &md, &meta);
    let attr = crate::ops::local::fattr_from_stat(&md, meta.local_version);
    ops::get_dentry(zfsd, vol, &local_fh, &idir.fh, name, &attr, meta)?;
    Ok(())
}

/// The master dropped this name; drop the local mirror.
fn remove_local_entry(
    zfsd: &Arc<Zfsd>,
    vol: &Arc<Volume>,
    idir: &Arc<InternalFh>,
    name: &str,
) -> Result<()> {
    let path = ops::dir_entry_path(zfsd, vol, idir, name)?;
    let md = match crate::ops::local::stat_path(&path) {
        Ok(md) => md,
        Err(_) => return Ok(()),
    };
    let (victim, victim_meta) = crate::ops::dir::victim_record(zfsd, vol, &md)?;
    if md.is_dir() {
        std::fs::remove_dir_all(&path)?;
    } else {
        std::fs::remove_file(&path)?;
    }
    vol.metadata_op(|store| {
        store.delete(&victim_meta, idir.fh.dev, idir.fh.ino, name)?;
        Ok(())
    })?;
    zfsd.local_files.invalidate(&victim);
    ops::delete_dentry(zfsd, &idir.fh, name);
    Ok(())
}

/// Load the interval side files of a regular file once, reconciling them
/// against the current size: ranges beyond EOF are clamped and the
/// complete flag survives only when the reconciled set still covers the
/// whole file.
pub(crate) fn ensure_intervals_loaded(vol: &Arc<Volume>, ifh: &Arc<InternalFh>) -> Result<()> {
    let (needs_load, size) = {
        let data = ifh.data.lock();
        (!data.intervals_loaded && data.attr.ftype == FileType::Reg, data.attr.size)
    };
    if !needs_load {
        return Ok(());
    }
    let ino = ifh.fh.ino;
    let updated = vol.metadata_op(|store| store.load_intervals(ino, IntervalKind::Updated, size))?;
    let modified =
        vol.metadata_op(|store| store.load_intervals(ino, IntervalKind::Modified, size))?;
    let meta = {
        let mut data = ifh.data.lock();
        if data.intervals_loaded {
            return Ok(());
        }
        data.updated = updated;
        data.modified = modified;
        data.intervals_loaded = true;
        if data.meta.is_complete() && !data.updated.covers(0, size) {
            data.meta.set_flag(FLAG_COMPLETE, false);
            Some(data.meta)
        } else {
            None
        }
    };
    if let Some(meta) = meta {
        vol.metadata_op(|store| store.flush(&meta))?;
    }
    Ok(())
}

/// Load the on-disk journal of a directory into its handle once.
pub(crate) fn ensure_journal_loaded(vol: &Arc<Volume>, ifh: &Arc<InternalFh>) -> Result<()> {
    let needs_load = {
        let data = ifh.data.lock();
        data.attr.ftype == FileType::Dir && data.journal.is_empty()
    };
    if !needs_load {
        return Ok(());
    }
    let ino = ifh.fh.ino;
    let journal = vol.metadata_op(|store| store.read_journal(ino))?;
    let mut data = ifh.data.lock();
    if data.journal.is_empty() {
        data.journal = journal;
    }
    Ok(())
}

/// Write local changes back to the master: modified ranges of a file,
/// the journal of a directory; then advance the master's version and
/// release the reintegration lease.
fn push(zfsd: &Arc<Zfsd>, vol: &Arc<Volume>, ifh: &Arc<InternalFh>, master_sid: u32) -> Result<()> {
    let ftype = ifh.data.lock().attr.ftype;
    match ftype {
        FileType::Dir => crate::reintegrate::reintegrate_dir(zfsd, vol, ifh, master_sid),
        FileType::Reg => crate::reintegrate::reintegrate_file(zfsd, vol, ifh, master_sid),
        _ => Ok(()),
    }
}

/// Drain the background update queue: each queued handle is latched and
/// run through the engine on the update pool.
pub fn queue_loop(zfsd: &Arc<Zfsd>, rx: &Receiver<ZfsFh>) {
    while let Ok(fh) = rx.recv() {
        if zfsd.is_terminating() {
            break;
        }
        let task_zfsd = zfsd.clone();
        let submitted = zfsd.pools.update.submit(Box::new(move || {
            if let Err(err) = background_update(&task_zfsd, &fh) {
                trace!(?fh, ?err, "background update failed");
            }
        }));
        if submitted.is_err() {
            break;
        }
    }
}

fn background_update(zfsd: &Arc<Zfsd>, fh: &ZfsFh) -> Result<()> {
    let (vol, ifh) = match ops::resolve(zfsd, fh)? {
        ops::Resolution::Real { vol, ifh } => (vol, ifh),
        ops::Resolution::Virtual(_) => return Ok(()),
    };
    ops::lock_fh(zfsd, &vol, &ifh, crate::fh::lock::LockLevel::Exclusive)?;
    let result = update_fh_if_needed(zfsd, &vol, &ifh, UpdateMode::Reintegrate);
    ops::unlock_fh(&vol, &ifh);
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::proto::Procedure;
    use crate::testing::{
        create_file, latched_update, master_daemon, meta_of, read_file, synced_cluster,
        write_file,
    };

    #[test]
    fn master_volumes_are_left_alone() {
        let dir = tempfile::tempdir().unwrap();
        let master = master_daemon(1, 7, dir.path());
        let root = ops::zfs_volume_root(&master, 7).unwrap().file;
        let file = create_file(&master, &root, "a", b"data");

        let before = meta_of(&master, &file);
        latched_update(&master, &file, UpdateMode::AllUpdate).unwrap();
        latched_update(&master, &file, UpdateMode::Reintegrate).unwrap();
        assert_eq!(meta_of(&master, &file), before);
    }

    #[test]
    fn pull_brings_a_stale_copy_current() {
        let cluster = synced_cluster();

        // the pull aligned the version pair and covered the whole file
        let meta = meta_of(&cluster.copy, &cluster.file_copy);
        assert_eq!(meta.local_version, meta.master_version);
        assert!(meta.is_complete());
        {
            let ifh = cluster.copy.fh.lock().get(&cluster.file_copy).unwrap();
            let data = ifh.data.lock();
            assert!(data.updated.covers(0, data.attr.size));
            assert!(data.modified.is_empty());
        }

        // a second read is served from the cache, not the master
        let reads_after_pull = cluster.master.net.calls_served(Procedure::Read);
        assert_eq!(read_file(&cluster.copy, &cluster.file_copy), b"x");
        assert_eq!(cluster.master.net.calls_served(Procedure::Read), reads_after_pull);

        cluster.shutdown();
    }

    #[test]
    fn metadata_mode_refreshes_clean_attributes() {
        let cluster = synced_cluster();

        // a clean handle with a stale attribute cache refreshes without
        // transferring anything
        {
            let ifh = cluster.copy.fh.lock().get(&cluster.file_copy).unwrap();
            ifh.data.lock().attr.mode = 0o777;
        }
        let before = meta_of(&cluster.copy, &cluster.file_copy);
        latched_update(&cluster.copy, &cluster.file_copy, UpdateMode::Metadata).unwrap();
        {
            let ifh = cluster.copy.fh.lock().get(&cluster.file_copy).unwrap();
            assert_eq!(ifh.data.lock().attr.mode, 0o644);
        }
        assert_eq!(meta_of(&cluster.copy, &cluster.file_copy), before);

        cluster.shutdown();
    }

    #[test]
    fn dirty_copy_pushes_back_to_its_master() {
        let cluster = synced_cluster();

        write_file(&cluster.copy, &cluster.file_copy, b"yy");
        let meta = meta_of(&cluster.copy, &cluster.file_copy);
        assert!(meta.local_version > meta.master_version);

        latched_update(&cluster.copy, &cluster.file_copy, UpdateMode::Reintegrate).unwrap();

        assert_eq!(read_file(&cluster.master, &cluster.file_master), b"yy");
        let meta = meta_of(&cluster.copy, &cluster.file_copy);
        assert_eq!(meta.local_version, meta.master_version);
        assert_eq!(
            meta_of(&cluster.master, &cluster.file_master).local_version,
            meta.local_version
        );
        {
            let ifh = cluster.copy.fh.lock().get(&cluster.file_copy).unwrap();
            assert!(ifh.data.lock().modified.is_empty());
        }

        cluster.shutdown();
    }

    #[test]
    fn divergence_splices_a_conflict_with_both_contents() {
        let cluster = synced_cluster();

        // both sides write while nobody reconciles
        write_file(&cluster.copy, &cluster.file_copy, b"BB");
        write_file(&cluster.master, &cluster.file_master, b"AA");

        latched_update(&cluster.copy, &cluster.file_copy, UpdateMode::AllUpdate).unwrap();

        // the name now resolves to a conflict with one entry per node
        let conflicted = ops::zfs_lookup(&cluster.copy, &cluster.copy_root, "b").unwrap();
        assert!(conflicted.file.is_conflict());
        let cap = ops::zfs_open(&cluster.copy, &conflicted.file, libc::O_RDONLY as u32).unwrap();
        let listing = ops::zfs_readdir(&cluster.copy, &cap, 0, 8).unwrap();
        let names: Vec<&str> = listing.entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["n1", "n2"]);
        let _ = ops::zfs_close(&cluster.copy, &cap);

        // each side serves its own bytes
        let master_side =
            ops::zfs_lookup(&cluster.copy, &conflicted.file, "n1").unwrap().file;
        let local_side =
            ops::zfs_lookup(&cluster.copy, &conflicted.file, "n2").unwrap().file;
        assert_eq!(read_file(&cluster.copy, &master_side), b"AA");
        assert_eq!(read_file(&cluster.copy, &local_side), b"BB");

        // the splice is local to the copy; the master's namespace is intact
        let on_master = ops::zfs_lookup(&cluster.master, &cluster.master_root, "b").unwrap();
        assert_eq!(on_master.file, cluster.file_master);

        cluster.shutdown();
    }
}
