//! The node-to-node RPC layer.
//!
//! Connections carry length-prefixed frames of little-endian encoded
//! messages. Requests and replies are matched by request id; each
//! connection has one reader thread that demultiplexes complete frames,
//! waking waiting callers for replies and handing requests to the network
//! worker pool.

pub mod client;
pub mod coding;
pub mod connection;
pub mod proto;
pub mod server;

/// Upper bound of one encoded frame: the largest data buffer plus headers
/// and the fixed-size argument records around it.
pub const MAX_FRAME_LEN: usize = crate::ZFS_MAXDATA + 1024;
