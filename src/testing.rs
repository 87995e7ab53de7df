//! Unit-test fixtures: daemons backed by temporary directories, wired to
//! each other over loopback.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use crate::config::LocalConfig;
use crate::daemon::Zfsd;
use crate::fh::{Sattr, ZfsFh};
use crate::ops;

/// A daemon named `n<sid>` with one local volume `vid` cached under
/// `cache`, mounted at `/m<vid>` and mastered locally.
pub(crate) fn master_daemon(sid: u32, vid: u32, cache: &Path) -> Arc<Zfsd> {
    let config = LocalConfig::parse(&format!(
        r#"
        [local_node]
        id = {sid}
        name = "n{sid}"
        port = 0

        [[volumes]]
        id = {vid}
        cache_size = 0
        local_path = "{}"
        "#,
        cache.display()
    ))
    .expect("fixture config parses");
    let zfsd = Zfsd::new(config).expect("daemon builds");

    let volume = zfsd.volumes.lock().lookup(vid).unwrap();
    volume.set_common_info(
        &format!("vol{vid}"),
        &format!("/m{vid}"),
        sid,
        sid,
        BTreeSet::new(),
    );
    zfsd.mount_known_volumes();
    zfsd
}

/// [`master_daemon`] with its listener running.
pub(crate) fn started_master(sid: u32, vid: u32, cache: &Path) -> Arc<Zfsd> {
    let zfsd = master_daemon(sid, vid, cache);
    zfsd.start().expect("master starts");
    zfsd
}

/// A daemon with no volumes that knows `master` by address, and is known
/// back by name so the handshake can succeed.
pub(crate) fn peer_daemon(sid: u32, master: &Arc<Zfsd>) -> Arc<Zfsd> {
    let config = LocalConfig::parse(&format!(
        r#"
        [local_node]
        id = {sid}
        name = "n{sid}"
        port = 0
        "#
    ))
    .expect("fixture config parses");
    let zfsd = Zfsd::new(config).expect("daemon builds");
    wire_nodes(&zfsd, master);
    zfsd
}

/// Register `peer` and `master` in each other's node tables; the master
/// side must be started so its port is known.
pub(crate) fn wire_nodes(peer: &Arc<Zfsd>, master: &Arc<Zfsd>) {
    let port = master.listener_addr().expect("master listener bound").port();
    peer.nodes
        .lock()
        .try_create(master.this_sid(), master.this_name(), "127.0.0.1", port)
        .expect("peer learns master");
    master
        .nodes
        .lock()
        .try_create(peer.this_sid(), peer.this_name(), "127.0.0.1", 0)
        .expect("master learns peer");
}

/// A daemon holding a local cached copy of `vid`, mastered by `master`.
pub(crate) fn copy_daemon(sid: u32, vid: u32, cache: &Path, master: &Arc<Zfsd>) -> Arc<Zfsd> {
    let zfsd = master_daemon(sid, vid, cache);
    wire_nodes(&zfsd, master);
    let volume = zfsd.volumes.lock().lookup(vid).unwrap();
    volume.set_common_info(
        &format!("vol{vid}"),
        &format!("/m{vid}"),
        master.this_sid(),
        sid,
        BTreeSet::new(),
    );
    zfsd
}

/// Create `dir/name` with `bytes` as content; returns its handle.
pub(crate) fn create_file(zfsd: &Arc<Zfsd>, dir: &ZfsFh, name: &str, bytes: &[u8]) -> ZfsFh {
    let created = ops::zfs_create(
        zfsd,
        dir,
        name,
        (libc::O_RDWR | libc::O_CREAT) as u32,
        &Sattr { mode: Some(0o644), ..Default::default() },
    )
    .expect("create succeeds");
    if !bytes.is_empty() {
        ops::zfs_write(zfsd, &created.cap, 0, bytes).expect("write succeeds");
    }
    ops::zfs_close(zfsd, &created.cap).expect("close succeeds");
    created.dor.file
}

/// Whole content of the file at `fh`, through open/read/close.
pub(crate) fn read_file(zfsd: &Arc<Zfsd>, fh: &ZfsFh) -> Vec<u8> {
    let cap = ops::zfs_open(zfsd, fh, libc::O_RDONLY as u32).expect("open succeeds");
    let read = ops::zfs_read(zfsd, &cap, 0, crate::ZFS_MAXDATA as u32).expect("read succeeds");
    let _ = ops::zfs_close(zfsd, &cap);
    read.data
}

/// Overwrite the file at `fh` from offset zero.
pub(crate) fn write_file(zfsd: &Arc<Zfsd>, fh: &ZfsFh, bytes: &[u8]) {
    let cap = ops::zfs_open(zfsd, fh, libc::O_RDWR as u32).expect("open succeeds");
    ops::zfs_write(zfsd, &cap, 0, bytes).expect("write succeeds");
    let _ = ops::zfs_close(zfsd, &cap);
}

/// Run the update engine on a handle under its exclusive latch, the way
/// the operation surface does.
pub(crate) fn latched_update(
    zfsd: &Arc<Zfsd>,
    fh: &ZfsFh,
    mode: crate::update::UpdateMode,
) -> crate::error::Result<()> {
    let (vol, ifh) = match ops::resolve(zfsd, fh).expect("handle resolves") {
        ops::Resolution::Real { vol, ifh } => (vol, ifh),
        ops::Resolution::Virtual(_) => panic!("virtual handle in latched_update"),
    };
    ops::lock_fh(zfsd, &vol, &ifh, crate::fh::lock::LockLevel::Exclusive).expect("latch");
    let result = crate::update::update_fh_if_needed(zfsd, &vol, &ifh, mode);
    ops::unlock_fh(&vol, &ifh);
    result
}

/// Snapshot of a handle's metadata record.
pub(crate) fn meta_of(zfsd: &Arc<Zfsd>, fh: &ZfsFh) -> crate::metadata::record::MetadataRecord {
    zfsd.fh.lock().get(fh).expect("handle exists").data.lock().meta
}

/// A master and a copy of volume 7 wired over loopback, with the file `b`
/// created on the master. The temporary cache directories ride along so
/// they outlive the daemons.
pub(crate) struct Cluster {
    pub master: Arc<Zfsd>,
    pub copy: Arc<Zfsd>,
    pub master_root: ZfsFh,
    pub copy_root: ZfsFh,
    pub file_master: ZfsFh,
    pub file_copy: ZfsFh,
    _dirs: (tempfile::TempDir, tempfile::TempDir),
}

impl Cluster {
    pub(crate) fn shutdown(&self) {
        self.copy.shutdown();
        self.master.shutdown();
    }
}

/// Build the pair and pull `b` to the copy, leaving both sides clean.
pub(crate) fn synced_cluster() -> Cluster {
    let mdir = tempfile::tempdir().unwrap();
    let cdir = tempfile::tempdir().unwrap();
    let master = started_master(1, 7, mdir.path());
    let copy = copy_daemon(2, 7, cdir.path(), &master);

    let master_root = ops::zfs_volume_root(&master, 7).unwrap().file;
    let file_master = create_file(&master, &master_root, "b", b"x");
    let copy_root = ops::zfs_volume_root(&copy, 7).unwrap().file;
    let file_copy = ops::zfs_lookup(&copy, &copy_root, "b").unwrap().file;
    assert_eq!(read_file(&copy, &file_copy), b"x");

    Cluster { master, copy, master_root, copy_root, file_master, file_copy, _dirs: (mdir, cdir) }
}

/// [`synced_cluster`] after both sides wrote divergent content and the
/// copy's update spliced the conflict: `b` is `AA` on the master, `BB` on
/// the copy, and the returned handle names the conflict directory.
pub(crate) fn diverged_cluster() -> (Cluster, ZfsFh) {
    let cluster = synced_cluster();
    write_file(&cluster.copy, &cluster.file_copy, b"BB");
    write_file(&cluster.master, &cluster.file_master, b"AA");
    latched_update(&cluster.copy, &cluster.file_copy, crate::update::UpdateMode::AllUpdate)
        .expect("divergence detection succeeds");
    let conflict = ops::zfs_lookup(&cluster.copy, &cluster.copy_root, "b").unwrap().file;
    assert!(conflict.is_conflict());
    (cluster, conflict)
}
