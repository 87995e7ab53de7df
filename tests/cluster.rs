//! Two daemons in one process: a master serving a volume and a second
//! node reaching it over the real RPC transport.

mod common;

use std::collections::BTreeSet;

use common::{master_daemon, mode, rw_create_flags};
use zlomekfs::config::LocalConfig;
use zlomekfs::daemon::Zfsd;
use zlomekfs::ops;
use zlomekfs::rpc::client;
use zlomekfs::rpc::proto::Request;

#[test]
fn remote_volume_reads_through_master() {
    let tmp = tempfile::tempdir().unwrap();
    let master = master_daemon(1, 9, tmp.path());
    master.start().expect("master starts");
    let port = master.listener_addr().expect("listener bound").port();

    // seed content on the master
    let root = ops::zfs_volume_root(&master, 9).unwrap();
    let created =
        ops::zfs_create(&master, &root.file, "x.txt", rw_create_flags(), &mode(0o644)).unwrap();
    ops::zfs_write(&master, &created.cap, 0, b"payload").unwrap();
    ops::zfs_close(&master, &created.cap).unwrap();

    // the second node holds no cache of volume 9; every access forwards
    let peer = Zfsd::new(
        LocalConfig::parse(
            r#"
            [local_node]
            id = 2
            name = "n2"
            port = 0
            "#,
        )
        .unwrap(),
    )
    .unwrap();
    peer.nodes.lock().try_create(1, "n1", "127.0.0.1", port).unwrap();
    master.nodes.lock().try_create(2, "n2", "127.0.0.1", 0).unwrap();
    {
        let volume = peer.volumes.lock().create(9);
        volume.set_common_info("vol9", "/m9", 1, 2, BTreeSet::new());
    }
    peer.mount_known_volumes();

    // the handshake echoes the payload of a ping afterwards
    let node = peer.node(1).unwrap();
    let mut reply =
        client::call(&peer, &node, &Request::Ping { payload: b"are you there".to_vec() })
            .unwrap();
    let echoed = zlomekfs::rpc::coding::data_buffer(&mut reply).unwrap();
    assert_eq!(echoed, b"are you there");

    // resolve the remote volume root and read the file through the master
    let remote_root = ops::zfs_volume_root(&peer, 9).unwrap();
    assert_eq!(remote_root.file.sid, 1);
    let found = ops::zfs_lookup(&peer, &remote_root.file, "x.txt").unwrap();
    assert_eq!(found.attr.size, 7);

    let cap = ops::zfs_open(&peer, &found.file, libc::O_RDONLY as u32).unwrap();
    let read = ops::zfs_read(&peer, &cap, 0, 64).unwrap();
    assert_eq!(read.data, b"payload");
    ops::zfs_close(&peer, &cap).unwrap();

    // namespace changes forward too
    ops::zfs_mkdir(&peer, &remote_root.file, "made-remotely", &mode(0o755)).unwrap();
    let on_master = ops::zfs_lookup(&master, &root.file, "made-remotely").unwrap();
    assert_eq!(on_master.attr.ftype, zlomekfs::fh::FileType::Dir);

    peer.shutdown();
    master.shutdown();
}
