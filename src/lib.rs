//! ZlomekFS - a distributed cluster filesystem daemon in Rust.
//!
//! Every node exports local storage, caches remote files on demand and keeps
//! a set of replicas loosely consistent with per-volume masters. The crate
//! contains the daemon core: the file-handle and dentry graph, the per-volume
//! metadata and journal store, the update/reintegration machinery, the framed
//! RPC transport and the cluster configuration reader. Host-OS bindings sit
//! on top of the operation surface exported from [`ops`].

pub mod config;
pub mod daemon;
pub mod error;
pub mod fh;
pub mod metadata;
pub mod node;
pub mod ops;
pub mod pool;
pub mod reintegrate;
pub mod rpc;
pub mod update;
pub mod user_group;
pub mod volume;

#[cfg(test)]
pub(crate) mod testing;

/// Maximum length of a file name crossing the wire or the VFS surface.
pub const ZFS_MAXNAMELEN: usize = 255;

/// Maximum length of a path crossing the wire or the VFS surface.
pub const ZFS_MAXPATHLEN: usize = 1023;

/// Maximum size of a data buffer in one read/write request. Block transfers
/// of the update engine use the same granularity.
pub const ZFS_MAXDATA: usize = 8192;

/// Name of the per-volume shadow tree in the volume root.
pub const SHADOW_DIR: &str = ".shadow";

/// Name of the per-volume metadata directory in the volume root.
pub const CONFIG_DIR: &str = ".config";
