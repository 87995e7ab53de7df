//! The configuration reader thread.
//!
//! Cluster configuration lives on the config volume and is read through
//! the filesystem itself. A bounded queue feeds this thread relative
//! paths to re-read; each category is applied mark-and-sweep, then the
//! request is broadcast to the slaves of the config volume so the whole
//! subtree reconverges.

use std::collections::BTreeSet;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use tracing::{info, warn};

use crate::daemon::Zfsd;
use crate::error::{Result, ZfsError};
use crate::fh::VOLUME_ID_CONFIG;
use crate::rpc::client;
use crate::rpc::proto::Request;

use super::shared;

/// Sentinel path requesting a re-read of every cluster category.
pub const REREAD_ALL: &str = "";

/// One queued request for the reader.
pub enum ReaderRequest {
    /// Re-read the file at `path` on the config volume.
    Path { path: String, from_sid: u32 },
    /// Re-apply the local volume file (SIGHUP).
    LocalVolumeInfo,
    /// No work; lets the loop observe shutdown.
    Wake,
}

/// Body of the configuration reader thread.
pub fn reader_loop(zfsd: &Arc<Zfsd>, rx: &Receiver<ReaderRequest>) {
    while let Ok(request) = rx.recv() {
        if zfsd.is_terminating() {
            break;
        }
        match request {
            ReaderRequest::Wake => {}
            ReaderRequest::LocalVolumeInfo => {
                info!("re-reading local volume configuration");
                if let Err(err) = zfsd.apply_local_volumes() {
                    warn!(%err, "local volume configuration rejected");
                }
                zfsd.mount_known_volumes();
            }
            ReaderRequest::Path { path, from_sid } => {
                if let Err(err) = apply(zfsd, &path) {
                    warn!(%path, %err, "configuration re-read failed");
                }
                broadcast(zfsd, &path, from_sid);
            }
        }
    }
}

/// Route one relative path to its category handler.
pub fn apply(zfsd: &Arc<Zfsd>, path: &str) -> Result<()> {
    info!(%path, "re-reading cluster configuration");
    match path {
        REREAD_ALL => {
            reread_node_list(zfsd)?;
            reread_volume_list(zfsd)?;
            reread_user_list(zfsd)?;
            reread_group_list(zfsd)?;
            reread_global_mapping(zfsd, true)?;
            reread_global_mapping(zfsd, false)?;
            Ok(())
        }
        "node_list" => reread_node_list(zfsd),
        "volume_list" | "volume_layout" => reread_volume_list(zfsd),
        "user_list" => reread_user_list(zfsd),
        "group_list" => reread_group_list(zfsd),
        "user_mapping" => reread_global_mapping(zfsd, true),
        "group_mapping" => reread_global_mapping(zfsd, false),
        other => {
            if let Some(node_name) = other.strip_prefix("user/") {
                reread_node_mapping(zfsd, node_name, true)
            } else if let Some(node_name) = other.strip_prefix("group/") {
                reread_node_mapping(zfsd, node_name, false)
            } else {
                Err(ZfsError::InvalidArgument)
            }
        }
    }
}

/// Read a whole file from the config volume through the VFS surface.
fn read_config_file(zfsd: &Arc<Zfsd>, rel_path: &str) -> Result<String> {
    let root = crate::ops::zfs_volume_root(zfsd, VOLUME_ID_CONFIG)?;
    let res = crate::ops::zfs_extended_lookup(zfsd, &root.file, rel_path)?;
    let cap = crate::ops::zfs_open(zfsd, &res.file, libc::O_RDONLY as u32)?;

    let mut content = Vec::new();
    let mut offset = 0u64;
    let outcome = loop {
        match crate::ops::zfs_read(zfsd, &cap, offset, crate::ZFS_MAXDATA as u32) {
            Ok(read) => {
                if read.data.is_empty() {
                    break Ok(());
                }
                offset += read.data.len() as u64;
                content.extend_from_slice(&read.data);
            }
            Err(err) => break Err(err),
        }
    };
    let _ = crate::ops::zfs_close(zfsd, &cap);
    outcome?;
    String::from_utf8(content).map_err(|_| ZfsError::InvalidArgument)
}

fn reread_node_list(zfsd: &Arc<Zfsd>) -> Result<()> {
    let text = read_config_file(zfsd, "node_list")?;
    let file = shared::parse_node_list(&text).map_err(|err| {
        warn!(%err, "cannot parse node_list");
        ZfsError::InvalidArgument
    })?;

    let swept = {
        let mut nodes = zfsd.nodes.lock();
        nodes.mark_all();
        for entry in &file.node {
            let port = entry.port.unwrap_or(crate::node::DEFAULT_PORT);
            if nodes.try_create(entry.id, &entry.name, &entry.address, port).is_none() {
                warn!(id = entry.id, name = %entry.name, "conflicting node entry ignored");
            }
        }
        if nodes.this_node().map_or(true, |n| n.data.lock().marked) {
            // a configuration that drops this node is not applied
            warn!("node_list no longer names this node");
            return Err(ZfsError::InvalidArgument);
        }
        nodes.take_marked()
    };

    if !swept.is_empty() {
        // volumes mastered by vanished nodes go out of service
        let gone: BTreeSet<u32> = swept.iter().map(|n| n.id).collect();
        let volumes = zfsd.volumes.lock();
        for volume in volumes.iter() {
            if gone.contains(&volume.data.lock().master_sid) {
                volume.mark_delete();
            }
        }
        for node in swept {
            info!(id = node.id, "node removed from cluster");
        }
    }
    Ok(())
}

fn reread_volume_list(zfsd: &Arc<Zfsd>) -> Result<()> {
    let list_text = read_config_file(zfsd, "volume_list")?;
    let list = shared::parse_volume_list(&list_text).map_err(|err| {
        warn!(%err, "cannot parse volume_list");
        ZfsError::InvalidArgument
    })?;
    let layout_text = read_config_file(zfsd, "volume_layout")?;
    let layout = shared::parse_volume_layout(&layout_text).map_err(|err| {
        warn!(%err, "cannot parse volume_layout");
        ZfsError::InvalidArgument
    })?;

    let this_name = zfsd.this_name().to_owned();
    let swept = {
        let mut volumes = zfsd.volumes.lock();
        volumes.mark_all();
        for entry in &list.volume {
            let place = layout
                .layout
                .iter()
                .find(|l| l.volume == entry.id)
                .and_then(|l| shared::layout_place(&l.tree, &this_name));
            let Some(place) = place else {
                // not in this volume's replication tree; leave it marked
                continue;
            };
            let (master_sid, slave_ids) = {
                let nodes = zfsd.nodes.lock();
                let master_sid = match &place.master {
                    None => zfsd.this_sid(),
                    Some(name) => match nodes.lookup_name(name) {
                        Some(node) => node.id,
                        None => {
                            warn!(volume = entry.id, master = %name, "unknown master node");
                            continue;
                        }
                    },
                };
                let slave_ids: BTreeSet<u32> = place
                    .slaves
                    .iter()
                    .filter_map(|name| nodes.lookup_name(name))
                    .map(|n| n.id)
                    .collect();
                (master_sid, slave_ids)
            };
            let volume = volumes.create(entry.id);
            volume.set_common_info(
                &entry.name,
                &entry.mountpoint,
                master_sid,
                zfsd.this_sid(),
                slave_ids,
            );
        }
        // the config volume must survive its own re-read
        if let Some(config_vol) = volumes.lookup(VOLUME_ID_CONFIG) {
            config_vol.data.lock().marked = false;
        }
        volumes.take_marked()
    };

    for volume in swept {
        info!(vid = volume.id, "volume removed from service");
        teardown_volume(zfsd, &volume);
    }
    zfsd.mount_known_volumes();
    Ok(())
}

/// Drop a removed volume's dentry subtree and its mountpoint.
pub(crate) fn teardown_volume(zfsd: &Arc<Zfsd>, volume: &Arc<crate::volume::Volume>) {
    let root_fh = volume.data.lock().root_fh;
    if let Some(root_fh) = root_fh {
        zfsd.fh.lock().evict_subtree(&root_fh);
    }
    zfsd.vtree.lock().unmount(volume.id);
}

fn reread_user_list(zfsd: &Arc<Zfsd>) -> Result<()> {
    let text = read_config_file(zfsd, "user_list")?;
    let file = shared::parse_user_list(&text).map_err(|_| ZfsError::InvalidArgument)?;
    let mut users = zfsd.users.lock();
    users.mark_users();
    for entry in &file.user {
        users.assert_user(entry.id, &entry.name);
    }
    let swept = users.sweep_users();
    if swept > 0 {
        info!(swept, "users removed");
    }
    Ok(())
}

fn reread_group_list(zfsd: &Arc<Zfsd>) -> Result<()> {
    let text = read_config_file(zfsd, "group_list")?;
    let file = shared::parse_group_list(&text).map_err(|_| ZfsError::InvalidArgument)?;
    let mut users = zfsd.users.lock();
    users.mark_groups();
    for entry in &file.group {
        users.assert_group(entry.id, &entry.name);
    }
    let swept = users.sweep_groups();
    if swept > 0 {
        info!(swept, "groups removed");
    }
    Ok(())
}

fn reread_global_mapping(zfsd: &Arc<Zfsd>, users: bool) -> Result<()> {
    let path = if users { "user_mapping" } else { "group_mapping" };
    let text = match read_config_file(zfsd, path) {
        Ok(text) => text,
        // the mapping files are optional
        Err(ZfsError::NotFound) => return Ok(()),
        Err(err) => return Err(err),
    };
    let file = shared::parse_mapping(&text).map_err(|_| ZfsError::InvalidArgument)?;
    let mut table = zfsd.users.lock();
    let map = if users { &mut table.global_uid_map } else { &mut table.global_gid_map };
    map.clear();
    for entry in &file.map {
        map.insert(entry.cluster, entry.node);
    }
    Ok(())
}

fn reread_node_mapping(zfsd: &Arc<Zfsd>, node_name: &str, users: bool) -> Result<()> {
    let prefix = if users { "user" } else { "group" };
    let text = match read_config_file(zfsd, &format!("{prefix}/{node_name}")) {
        Ok(text) => text,
        Err(ZfsError::NotFound) => return Ok(()),
        Err(err) => return Err(err),
    };
    let file = shared::parse_mapping(&text).map_err(|_| ZfsError::InvalidArgument)?;
    let node = zfsd.nodes.lock().lookup_name(node_name).ok_or(ZfsError::NotFound)?;
    let mut data = node.data.lock();
    let map = if users { &mut data.uid_map } else { &mut data.gid_map };
    map.clear();
    for entry in &file.map {
        map.insert(entry.cluster, entry.node);
    }
    Ok(())
}

/// Forward a re-read request to every slave of the config volume so the
/// change propagates down the replication tree.
fn broadcast(zfsd: &Arc<Zfsd>, path: &str, from_sid: u32) {
    let slaves: Vec<u32> = {
        let volumes = zfsd.volumes.lock();
        match volumes.lookup(VOLUME_ID_CONFIG) {
            Some(volume) => volume.data.lock().slaves.iter().copied().collect(),
            None => return,
        }
    };
    for sid in slaves {
        if sid == from_sid || sid == zfsd.this_sid() {
            continue;
        }
        let Ok(node) = zfsd.node(sid) else { continue };
        let request = Request::RereadConfig { path: path.to_owned() };
        if let Err(err) = client::oneway(zfsd, &node, &request) {
            warn!(sid, %err, "config re-read broadcast failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::testing::master_daemon;

    /// A daemon whose only volume is the config volume, so the reader can
    /// resolve the cluster files through the filesystem itself.
    fn config_master(cache: &Path) -> Arc<Zfsd> {
        master_daemon(1, VOLUME_ID_CONFIG, cache)
    }

    fn write_base_files(cache: &Path) {
        std::fs::write(
            cache.join("node_list"),
            r#"
            [[node]]
            id = 1
            name = "n1"
            address = "127.0.0.1"
            "#,
        )
        .unwrap();
        std::fs::write(
            cache.join("volume_list"),
            r#"
            [[volume]]
            id = 1
            name = "config"
            mountpoint = "/config"

            [[volume]]
            id = 9
            name = "data"
            mountpoint = "/exports/data"
            "#,
        )
        .unwrap();
        std::fs::write(
            cache.join("volume_layout"),
            r#"
            [[layout]]
            volume = 1
            tree = { node = "n1" }

            [[layout]]
            volume = 9
            tree = { node = "n1" }
            "#,
        )
        .unwrap();
    }

    #[test]
    fn volume_list_reload_mounts_and_sweeps() {
        let cache = tempfile::tempdir().unwrap();
        let zfsd = config_master(cache.path());
        write_base_files(cache.path());

        apply(&zfsd, "node_list").unwrap();
        apply(&zfsd, "volume_list").unwrap();

        // the added volume is in service and its mountpoint shows in the
        // virtual root
        let volume = zfsd.volumes.lock().lookup(9).expect("volume 9 exists");
        {
            let data = volume.data.lock();
            assert_eq!(data.name, "data");
            assert_eq!(data.master_sid, 1);
            assert!(!data.is_copy);
        }
        assert!(zfsd.vtree.lock().mountpoint_of(9).is_some());
        let root = crate::ops::zfs_root(&zfsd).unwrap();
        let cap = crate::ops::zfs_open(&zfsd, &root.file, libc::O_RDONLY as u32).unwrap();
        let listing = crate::ops::zfs_readdir(&zfsd, &cap, 0, 16).unwrap();
        assert!(listing.entries.iter().any(|e| e.name == "exports"));

        // dropping the volume from the list sweeps it and prunes the
        // skeleton
        std::fs::write(
            cache.path().join("volume_list"),
            r#"
            [[volume]]
            id = 1
            name = "config"
            mountpoint = "/config"
            "#,
        )
        .unwrap();
        apply(&zfsd, "volume_list").unwrap();
        assert!(zfsd.volumes.lock().lookup(9).is_none());
        assert!(zfsd.vtree.lock().mountpoint_of(9).is_none());
        // the config volume survives its own re-read
        assert!(zfsd.volumes.lock().lookup(VOLUME_ID_CONFIG).is_some());
    }

    #[test]
    fn node_list_reload_keeps_this_node() {
        let cache = tempfile::tempdir().unwrap();
        let zfsd = config_master(cache.path());
        std::fs::write(
            cache.path().join("node_list"),
            r#"
            [[node]]
            id = 1
            name = "n1"
            address = "127.0.0.1"

            [[node]]
            id = 3
            name = "n3"
            address = "10.0.0.3"
            "#,
        )
        .unwrap();
        apply(&zfsd, "node_list").unwrap();
        assert!(zfsd.nodes.lock().lookup(3).is_some());

        // a list that drops this node is rejected whole
        std::fs::write(
            cache.path().join("node_list"),
            "[[node]]\nid = 3\nname = \"n3\"\naddress = \"10.0.0.3\"\n",
        )
        .unwrap();
        assert!(apply(&zfsd, "node_list").is_err());
        assert!(zfsd.nodes.lock().this_node().is_some());

        // a valid list sweeps the vanished node
        std::fs::write(
            cache.path().join("node_list"),
            "[[node]]\nid = 1\nname = \"n1\"\naddress = \"127.0.0.1\"\n",
        )
        .unwrap();
        apply(&zfsd, "node_list").unwrap();
        assert!(zfsd.nodes.lock().lookup(3).is_none());
    }

    #[test]
    fn user_lists_and_mappings_reload() {
        let cache = tempfile::tempdir().unwrap();
        let zfsd = config_master(cache.path());
        std::fs::write(
            cache.path().join("node_list"),
            "[[node]]\nid = 1\nname = \"n1\"\naddress = \"127.0.0.1\"\n",
        )
        .unwrap();
        apply(&zfsd, "node_list").unwrap();

        std::fs::write(
            cache.path().join("user_list"),
            "[[user]]\nid = 0\nname = \"root\"\n[[user]]\nid = 1000\nname = \"alice\"\n",
        )
        .unwrap();
        apply(&zfsd, "user_list").unwrap();
        assert_eq!(zfsd.users.lock().user_by_name("alice"), Some(1000));

        std::fs::write(
            cache.path().join("user_mapping"),
            "[[map]]\ncluster = 1000\nnode = 500\n",
        )
        .unwrap();
        apply(&zfsd, "user_mapping").unwrap();
        assert_eq!(zfsd.users.lock().global_uid_map.to_node(1000), Some(500));

        // per-node mappings live under user/<node>
        std::fs::create_dir_all(cache.path().join("user")).unwrap();
        std::fs::write(
            cache.path().join("user/n1"),
            "[[map]]\ncluster = 1000\nnode = 777\n",
        )
        .unwrap();
        apply(&zfsd, "user/n1").unwrap();
        let node = zfsd.node(1).unwrap();
        assert_eq!(node.data.lock().uid_map.to_node(1000), Some(777));

        // a shrunken list sweeps the stale user
        std::fs::write(cache.path().join("user_list"), "[[user]]\nid = 0\nname = \"root\"\n")
            .unwrap();
        apply(&zfsd, "user_list").unwrap();
        assert!(zfsd.users.lock().user_by_name("alice").is_none());
    }
}
