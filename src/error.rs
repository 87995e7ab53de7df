//! Status codes shared by the VFS surface and the wire protocol.

use std::fmt;
use std::io;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// Result of daemon operations.
pub type Result<T> = std::result::Result<T, ZfsError>;

/// Errors returned from filesystem operations and carried in RPC replies.
///
/// The wire form is a signed 32-bit status: `0` means success, positive
/// values are POSIX errno numbers surfaced unchanged to the host OS,
/// negative values are protocol, connection, consistency and lifecycle
/// conditions private to the daemon.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ZfsError {
    /// No such file or directory.
    NotFound,
    /// The file specified already exists.
    Exists,
    /// The caller does not have permission for the requested operation.
    Access,
    /// Not owner; restricted to owner or privileged user.
    Perm,
    /// Invalid capability or file descriptor.
    BadFd,
    /// Invalid argument for an operation.
    InvalidArgument,
    /// A modifying operation was attempted on a read-only subtree.
    ReadOnly,
    /// Attempt to hard link across volumes.
    CrossDevice,
    /// The caller specified a directory in a non-directory operation.
    IsDir,
    /// The caller specified a non-directory in a directory operation.
    NotDir,
    /// An attempt was made to remove a non-empty directory.
    NotEmpty,
    /// A name component exceeded [`crate::ZFS_MAXNAMELEN`].
    NameTooLong,
    /// A hard error occurred while processing the requested operation.
    Io,

    /// The encoded request does not fit into a message buffer.
    RequestTooLong,
    /// The request could not be decoded.
    InvalidRequest,
    /// The request carried a function number the receiver does not know.
    UnknownFunction,
    /// The reply could not be decoded.
    InvalidReply,

    /// The remote node could not be reached.
    CouldNotConnect,
    /// The authentication handshake failed.
    CouldNotAuth,
    /// The connection was closed while a request was in flight.
    ConnectionClosed,
    /// The request deadline elapsed without a reply.
    RequestTimeout,

    /// The file handle no longer refers to an existing file.
    Stale,
    /// Synchronizing a file with its master failed.
    UpdateFailed,
    /// A metadata operation failed; the volume is marked for removal.
    MetadataError,
    /// The resource is busy, typically a held reintegration lease.
    Busy,

    /// Shutdown has begun; all waits are being released.
    Exiting,
}

/// Wire values of the non-POSIX status group.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
#[repr(i32)]
enum WireStatus {
    RequestTooLong = -1,
    InvalidRequest = -2,
    UnknownFunction = -3,
    InvalidReply = -4,
    CouldNotConnect = -5,
    CouldNotAuth = -6,
    ConnectionClosed = -7,
    RequestTimeout = -8,
    Stale = -9,
    UpdateFailed = -10,
    MetadataError = -11,
    Busy = -12,
    Exiting = -13,
}

impl ZfsError {
    /// Encode the status for the wire.
    pub fn to_wire(self) -> i32 {
        match self {
            ZfsError::NotFound => libc::ENOENT,
            ZfsError::Exists => libc::EEXIST,
            ZfsError::Access => libc::EACCES,
            ZfsError::Perm => libc::EPERM,
            ZfsError::BadFd => libc::EBADF,
            ZfsError::InvalidArgument => libc::EINVAL,
            ZfsError::ReadOnly => libc::EROFS,
            ZfsError::CrossDevice => libc::EXDEV,
            ZfsError::IsDir => libc::EISDIR,
            ZfsError::NotDir => libc::ENOTDIR,
            ZfsError::NotEmpty => libc::ENOTEMPTY,
            ZfsError::NameTooLong => libc::ENAMETOOLONG,
            ZfsError::Io => libc::EIO,
            ZfsError::RequestTooLong => WireStatus::RequestTooLong as i32,
            ZfsError::InvalidRequest => WireStatus::InvalidRequest as i32,
            ZfsError::UnknownFunction => WireStatus::UnknownFunction as i32,
            ZfsError::InvalidReply => WireStatus::InvalidReply as i32,
            ZfsError::CouldNotConnect => WireStatus::CouldNotConnect as i32,
            ZfsError::CouldNotAuth => WireStatus::CouldNotAuth as i32,
            ZfsError::ConnectionClosed => WireStatus::ConnectionClosed as i32,
            ZfsError::RequestTimeout => WireStatus::RequestTimeout as i32,
            ZfsError::Stale => WireStatus::Stale as i32,
            ZfsError::UpdateFailed => WireStatus::UpdateFailed as i32,
            ZfsError::MetadataError => WireStatus::MetadataError as i32,
            ZfsError::Busy => WireStatus::Busy as i32,
            ZfsError::Exiting => WireStatus::Exiting as i32,
        }
    }

    /// Decode a non-zero wire status. Unknown positive values fold to the
    /// closest POSIX condition, unknown negative values to [`ZfsError::Io`].
    pub fn from_wire(status: i32) -> Self {
        if status > 0 {
            return match status {
                x if x == libc::ENOENT => ZfsError::NotFound,
                x if x == libc::EEXIST => ZfsError::Exists,
                x if x == libc::EACCES => ZfsError::Access,
                x if x == libc::EPERM => ZfsError::Perm,
                x if x == libc::EBADF => ZfsError::BadFd,
                x if x == libc::EINVAL => ZfsError::InvalidArgument,
                x if x == libc::EROFS => ZfsError::ReadOnly,
                x if x == libc::EXDEV => ZfsError::CrossDevice,
                x if x == libc::EISDIR => ZfsError::IsDir,
                x if x == libc::ENOTDIR => ZfsError::NotDir,
                x if x == libc::ENOTEMPTY => ZfsError::NotEmpty,
                x if x == libc::ENAMETOOLONG => ZfsError::NameTooLong,
                _ => ZfsError::Io,
            };
        }
        match WireStatus::from_i32(status) {
            Some(WireStatus::RequestTooLong) => ZfsError::RequestTooLong,
            Some(WireStatus::InvalidRequest) => ZfsError::InvalidRequest,
            Some(WireStatus::UnknownFunction) => ZfsError::UnknownFunction,
            Some(WireStatus::InvalidReply) => ZfsError::InvalidReply,
            Some(WireStatus::CouldNotConnect) => ZfsError::CouldNotConnect,
            Some(WireStatus::CouldNotAuth) => ZfsError::CouldNotAuth,
            Some(WireStatus::ConnectionClosed) => ZfsError::ConnectionClosed,
            Some(WireStatus::RequestTimeout) => ZfsError::RequestTimeout,
            Some(WireStatus::Stale) => ZfsError::Stale,
            Some(WireStatus::UpdateFailed) => ZfsError::UpdateFailed,
            Some(WireStatus::MetadataError) => ZfsError::MetadataError,
            Some(WireStatus::Busy) => ZfsError::Busy,
            Some(WireStatus::Exiting) => ZfsError::Exiting,
            None => ZfsError::Io,
        }
    }

    /// Fold the daemon-private status groups into errno values for callers
    /// that do not handle them specifically.
    pub fn to_errno(self) -> i32 {
        match self {
            ZfsError::RequestTooLong
            | ZfsError::InvalidRequest
            | ZfsError::InvalidReply => libc::EPROTO,
            ZfsError::UnknownFunction => libc::EOPNOTSUPP,
            ZfsError::CouldNotConnect | ZfsError::CouldNotAuth => libc::ENOTCONN,
            ZfsError::Stale
            | ZfsError::UpdateFailed
            | ZfsError::MetadataError
            | ZfsError::Busy
            | ZfsError::ConnectionClosed
            | ZfsError::RequestTimeout
            | ZfsError::Exiting => libc::ESTALE,
            other => other.to_wire(),
        }
    }

    /// True for the connection error group, retriable at the connection
    /// layer without poisoning the file-handle graph.
    pub fn is_connection_error(self) -> bool {
        matches!(
            self,
            ZfsError::CouldNotConnect
                | ZfsError::CouldNotAuth
                | ZfsError::ConnectionClosed
                | ZfsError::RequestTimeout
        )
    }
}

impl From<io::Error> for ZfsError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => ZfsError::NotFound,
            io::ErrorKind::AlreadyExists => ZfsError::Exists,
            io::ErrorKind::PermissionDenied => ZfsError::Access,
            io::ErrorKind::InvalidInput => ZfsError::InvalidArgument,
            io::ErrorKind::TimedOut => ZfsError::RequestTimeout,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => ZfsError::ConnectionClosed,
            _ => match err.raw_os_error() {
                Some(code) if code > 0 => ZfsError::from_wire(code),
                _ => ZfsError::Io,
            },
        }
    }
}

impl fmt::Display for ZfsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            ZfsError::NotFound => "no such file or directory",
            ZfsError::Exists => "file exists",
            ZfsError::Access => "permission denied",
            ZfsError::Perm => "operation not permitted",
            ZfsError::BadFd => "bad capability",
            ZfsError::InvalidArgument => "invalid argument",
            ZfsError::ReadOnly => "read-only file system",
            ZfsError::CrossDevice => "cross-device link",
            ZfsError::IsDir => "is a directory",
            ZfsError::NotDir => "not a directory",
            ZfsError::NotEmpty => "directory not empty",
            ZfsError::NameTooLong => "file name too long",
            ZfsError::Io => "input/output error",
            ZfsError::RequestTooLong => "request too long",
            ZfsError::InvalidRequest => "invalid request",
            ZfsError::UnknownFunction => "unknown function",
            ZfsError::InvalidReply => "invalid reply",
            ZfsError::CouldNotConnect => "could not connect",
            ZfsError::CouldNotAuth => "could not authenticate",
            ZfsError::ConnectionClosed => "connection closed",
            ZfsError::RequestTimeout => "request timed out",
            ZfsError::Stale => "stale file handle",
            ZfsError::UpdateFailed => "update failed",
            ZfsError::MetadataError => "metadata error",
            ZfsError::Busy => "resource busy",
            ZfsError::Exiting => "daemon is exiting",
        };
        f.write_str(text)
    }
}

impl std::error::Error for ZfsError {}

#[cfg(test)]
mod tests {
    use super::ZfsError;

    #[test]
    fn wire_roundtrip_posix_and_private() {
        for err in [
            ZfsError::NotFound,
            ZfsError::NotEmpty,
            ZfsError::ConnectionClosed,
            ZfsError::Busy,
            ZfsError::Exiting,
        ] {
            assert_eq!(ZfsError::from_wire(err.to_wire()), err);
        }
    }

    #[test]
    fn unknown_negative_status_folds_to_io() {
        assert_eq!(ZfsError::from_wire(-9999), ZfsError::Io);
    }

    #[test]
    fn errno_folding() {
        assert_eq!(ZfsError::Stale.to_errno(), libc::ESTALE);
        assert_eq!(ZfsError::CouldNotAuth.to_errno(), libc::ENOTCONN);
        assert_eq!(ZfsError::NotFound.to_errno(), libc::ENOENT);
    }
}
