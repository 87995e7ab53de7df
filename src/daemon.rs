//! Daemon lifecycle and the shared context every subsystem hangs off.

use std::net::{TcpListener, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::config::reader::ReaderRequest;
use crate::config::LocalConfig;
use crate::error::{Result, ZfsError};
use crate::fh::virtdir::VirtualTree;
use crate::fh::{FhTable, ZfsFh};
use crate::node::{Node, NodeTable};
use crate::pool::ThreadPool;
use crate::user_group::UserGroupTable;
use crate::volume::{Volume, VolumeTable, VOLUME_ID_CONFIG};

/// The three worker pools of the daemon.
pub struct Pools {
    /// Host-binding calls.
    pub kernel: ThreadPool,
    /// Incoming RPC requests.
    pub network: ThreadPool,
    /// Background synchronization work.
    pub update: ThreadPool,
}

/// Bound of the configuration reader's request queue.
const READER_QUEUE_LEN: usize = 64;

/// Bound of the background update queue.
const UPDATE_QUEUE_LEN: usize = 1024;

/// Everything one running daemon owns. Latch order across fields:
/// `fh` before `volumes` before a volume before a handle before `nodes`.
pub struct Zfsd {
    pub config: LocalConfig,
    /// The file-handle indices; the outermost latch.
    pub fh: Mutex<FhTable>,
    /// The mount-point skeleton.
    pub vtree: Mutex<VirtualTree>,
    pub volumes: Mutex<VolumeTable>,
    pub nodes: Mutex<NodeTable>,
    pub users: Mutex<UserGroupTable>,
    pub net: crate::rpc::connection::Network,
    pub pools: Pools,
    /// Bounded cache of open descriptors of locally cached files.
    pub local_files: crate::ops::local::LocalFiles,
    /// Set once shutdown begins; every wait observes it.
    pub terminating: AtomicBool,
    /// Source of capability verifiers and other one-shot tokens.
    token_counter: AtomicU64,

    update_tx: Sender<ZfsFh>,
    update_rx: Receiver<ZfsFh>,
    reader_tx: Sender<ReaderRequest>,
    reader_rx: Receiver<ReaderRequest>,

    listener: Mutex<Option<TcpListener>>,
    background: Mutex<Vec<std::thread::JoinHandle<()>>>,
}

impl Zfsd {
    /// Build the daemon context: tables, pools and the volumes named by the
    /// local configuration. Nothing runs yet; see [`Zfsd::start`].
    pub fn new(config: LocalConfig) -> Result<Arc<Zfsd>> {
        let pools = Pools {
            kernel: ThreadPool::new("kernel", config.threads.kernel_thread),
            network: ThreadPool::new("network", config.threads.network_thread),
            update: ThreadPool::new("update", config.threads.update_thread),
        };

        let mut nodes = NodeTable::new(config.local_node.id);
        nodes
            .try_create(config.local_node.id, &config.local_node.name, "127.0.0.1", config.local_node.port)
            .ok_or(ZfsError::InvalidArgument)?;
        if let Some(config_node) = &config.config_node {
            if config_node.id != config.local_node.id {
                nodes
                    .try_create(config_node.id, &config_node.name, &config_node.host, config_node.port)
                    .ok_or(ZfsError::InvalidArgument)?;
            }
        }

        let users = UserGroupTable::new(config.default_uid(), config.default_gid());

        let (update_tx, update_rx) = bounded(UPDATE_QUEUE_LEN);
        let (reader_tx, reader_rx) = bounded(READER_QUEUE_LEN);

        let zfsd = Arc::new(Zfsd {
            fh: Mutex::new(FhTable::new()),
            vtree: Mutex::new(VirtualTree::new()),
            volumes: Mutex::new(VolumeTable::new()),
            nodes: Mutex::new(nodes),
            users: Mutex::new(users),
            net: crate::rpc::connection::Network::new(),
            pools,
            local_files: crate::ops::local::LocalFiles::new(),
            terminating: AtomicBool::new(false),
            token_counter: AtomicU64::new(1),
            update_tx,
            update_rx,
            reader_tx,
            reader_rx,
            listener: Mutex::new(None),
            background: Mutex::new(Vec::new()),
            config,
        });
        zfsd.apply_local_volumes()?;
        Ok(zfsd)
    }

    /// (Re-)apply the `[[volumes]]` entries of the local configuration:
    /// open metadata for new paths, keep open handles when a path is
    /// unchanged.
    pub fn apply_local_volumes(&self) -> Result<()> {
        let tree_depth = self.config.system.metadata_tree_depth;
        let mut volumes = self.volumes.lock();
        for entry in &self.config.volumes {
            let volume = volumes.create(entry.id);
            volume
                .set_local_info(&entry.local_path, entry.cache_size, tree_depth)
                .map_err(|err| {
                    error!(vid = entry.id, %err, "cannot open volume cache");
                    ZfsError::MetadataError
                })?;
            if entry.id == VOLUME_ID_CONFIG {
                let master_sid =
                    self.config.config_node.as_ref().map_or(self.this_sid(), |n| n.id);
                volume.set_common_info(
                    "config",
                    "/config",
                    master_sid,
                    self.this_sid(),
                    Default::default(),
                );
            }
        }
        Ok(())
    }

    /// Bring the daemon up: mount configured volumes into the virtual
    /// tree, start the background threads and the listener, then kick the
    /// first configuration read.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        self.mount_known_volumes();

        // dentry cleanup clock, doubling as the safe point for poisoned
        // volume removal
        self.spawn_background("zfs-cleanup", {
            let zfsd = self.clone();
            move || {
                while !zfsd.terminating.load(Ordering::Acquire) {
                    std::thread::sleep(crate::fh::cleanup::CLEANUP_TICK);
                    {
                        let mut table = zfsd.fh.lock();
                        crate::fh::cleanup::cleanup_pass(
                            &mut table,
                            crate::fh::cleanup::CLEANUP_GRACE,
                        );
                    }
                    zfsd.sweep_poisoned_volumes();
                }
            }
        });

        // configuration reader
        self.spawn_background("zfs-config-reader", {
            let zfsd = self.clone();
            move || {
                crate::config::reader::reader_loop(&zfsd, &zfsd.reader_rx.clone());
            }
        });

        // background update queue
        self.spawn_background("zfs-update-queue", {
            let zfsd = self.clone();
            move || {
                crate::update::queue_loop(&zfsd, &zfsd.update_rx.clone());
            }
        });

        self.start_listener()?;

        // converge with the cluster configuration, best effort
        if let Err(err) = self.request_config_reread(crate::config::reader::REREAD_ALL, self.this_sid())
        {
            warn!(%err, "initial configuration read not queued");
        }
        Ok(())
    }

    fn start_listener(self: &Arc<Self>) -> Result<()> {
        let bind = ("0.0.0.0", self.config.local_node.port);
        let listener = TcpListener::bind(
            bind.to_socket_addrs()
                .map_err(|_| ZfsError::CouldNotConnect)?
                .next()
                .ok_or(ZfsError::CouldNotConnect)?,
        )
        .map_err(|err| {
            error!(%err, port = self.config.local_node.port, "cannot bind listener");
            ZfsError::CouldNotConnect
        })?;
        info!(port = self.config.local_node.port, "listening");
        *self.listener.lock() = Some(listener.try_clone().map_err(|_| ZfsError::CouldNotConnect)?);

        self.spawn_background("zfs-listener", {
            let zfsd = self.clone();
            move || {
                for stream in listener.incoming() {
                    if zfsd.terminating.load(Ordering::Acquire) {
                        break;
                    }
                    match stream {
                        Ok(stream) => {
                            if let Err(err) = zfsd.net.adopt(&zfsd, stream) {
                                warn!(%err, "dropping accepted connection");
                            }
                        }
                        Err(err) => {
                            warn!(%err, "accept failed");
                        }
                    }
                }
            }
        });
        Ok(())
    }

    /// Mount every volume whose mountpoint is already known.
    pub fn mount_known_volumes(&self) {
        let volumes = self.volumes.lock();
        let mut vtree = self.vtree.lock();
        for volume in volumes.iter() {
            let (vid, mountpoint) = {
                let data = volume.data.lock();
                if data.mountpoint.is_empty() || data.root_vd.is_some() {
                    continue;
                }
                (volume.id, data.mountpoint.clone())
            };
            match vtree.mount(&mountpoint, vid) {
                Ok(vd) => volume.data.lock().root_vd = Some(vd),
                Err(err) => warn!(vid, %mountpoint, %err, "cannot mount volume"),
            }
        }
    }

    /// Orderly shutdown: flag it, release every waiter, stop the pools.
    pub fn shutdown(self: &Arc<Self>) {
        if self.terminating.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("shutting down");
        // unblock the listener accept loop
        if let Some(listener) = self.listener.lock().take() {
            if let Ok(addr) = listener.local_addr() {
                let _ = std::net::TcpStream::connect(addr);
            }
        }
        // wake queue sleepers
        let _ = self.reader_tx.try_send(ReaderRequest::Wake);
        let _ = self.update_tx.try_send(ZfsFh::UNDEFINED);
        self.net.shutdown(self);
        self.pools.network.shutdown();
        self.pools.kernel.shutdown();
        self.pools.update.shutdown();
        // wake every latch waiter so it can observe termination
        {
            let fh = self.fh.lock();
            fh.interrupt_all();
        }
        let handles: Vec<_> = std::mem::take(&mut *self.background.lock());
        for handle in handles {
            let _ = handle.join();
        }
        info!("shutdown complete");
    }

    fn spawn_background(
        &self,
        name: &'static str,
        body: impl FnOnce() + Send + 'static,
    ) {
        let handle = std::thread::Builder::new()
            .name(name.into())
            .spawn(body)
            .expect("spawning daemon thread");
        self.background.lock().push(handle);
    }

    // -- small accessors used all over the tree --------------------------------

    /// Address the listener is bound to, once [`Zfsd::start`] ran.
    pub fn listener_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.lock().as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn this_sid(&self) -> u32 {
        self.config.local_node.id
    }

    pub fn this_name(&self) -> &str {
        &self.config.local_node.name
    }

    /// Link speed hint sent in stage 2; nothing measures it yet.
    pub fn link_speed(&self) -> u8 {
        0
    }

    pub fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::Acquire)
    }

    /// A fresh 16-byte verifier for capabilities.
    pub fn next_verifier(&self) -> [u8; 16] {
        let token = self.token_counter.fetch_add(1, Ordering::Relaxed);
        let mut verify = [0u8; 16];
        verify[0..8].copy_from_slice(&token.to_le_bytes());
        verify[8..12].copy_from_slice(&self.this_sid().to_le_bytes());
        verify[12..16].copy_from_slice(&(token as u32 ^ 0x5a5a_5a5a).to_le_bytes());
        verify
    }

    pub fn volume(&self, vid: u32) -> Result<Arc<Volume>> {
        self.volumes.lock().lookup(vid).ok_or(ZfsError::NotFound)
    }

    pub fn node(&self, sid: u32) -> Result<Arc<Node>> {
        self.nodes.lock().lookup(sid).ok_or(ZfsError::NotFound)
    }

    /// Remove volumes poisoned by metadata failures once their latch
    /// counts have drained.
    pub fn sweep_poisoned_volumes(self: &Arc<Self>) {
        let swept = self.volumes.lock().take_delete_marked();
        for volume in swept {
            crate::config::reader::teardown_volume(self, &volume);
        }
    }

    /// Queue a background update of a handle.
    pub fn schedule_update(&self, fh: ZfsFh) {
        if self.is_terminating() {
            return;
        }
        let _ = self.update_tx.try_send(fh);
    }

    /// Queue a configuration re-read request.
    pub fn request_config_reread(&self, path: &str, from_sid: u32) -> Result<()> {
        self.reader_tx
            .try_send(ReaderRequest::Path { path: path.to_owned(), from_sid })
            .map_err(|_| ZfsError::Busy)
    }

    /// Queue a re-read of the local volume file (SIGHUP).
    pub fn request_local_reread(&self) -> Result<()> {
        self.reader_tx.try_send(ReaderRequest::LocalVolumeInfo).map_err(|_| ZfsError::Busy)
    }
}
