//! Procedure numbers and the argument and result records of every RPC.
//!
//! Function numbers are stable; the argument layout of each procedure is a
//! fixed sequence of the primitives in [`coding`]. Option-carrying
//! attribute fields travel as sentinel values so the records stay fixed
//! size.

use std::io::Read;

use num_derive::FromPrimitive;

use crate::fh::{Fattr, FileType, Sattr, ZfsFh};

use super::coding::{self, Error, Result};

/// Direction byte of a frame.
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromPrimitive)]
#[repr(u8)]
pub enum Direction {
    Request = 0,
    Reply = 1,
    Oneway = 2,
}

/// Stable function numbers.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, FromPrimitive)]
#[repr(u32)]
pub enum Procedure {
    Null = 0,
    Ping = 1,
    Root = 2,
    VolumeRoot = 3,
    GetAttr = 4,
    SetAttr = 5,
    Lookup = 6,
    Create = 7,
    Open = 8,
    Close = 9,
    ReadDir = 10,
    MkDir = 11,
    RmDir = 12,
    Rename = 13,
    Link = 14,
    Unlink = 15,
    Read = 16,
    Write = 17,
    ReadLink = 18,
    SymLink = 19,
    MkNod = 20,
    AuthStage1 = 21,
    AuthStage2 = 22,
    Md5Sum = 23,
    FileInfo = 24,
    RereadConfig = 25,
    Reintegrate = 26,
    ReintegrateAdd = 27,
    ReintegrateDel = 28,
    ReintegrateVer = 29,
}

/// Bytes of the capability verifier.
pub const CAP_VERIFY_LEN: usize = 16;

/// Most block ranges one `md5sum` request may carry.
pub const MAX_MD5_BLOCKS: usize = 32;

/// Sentinel meaning "leave unchanged" in fixed-size attribute updates.
const SATTR_SKIP_U32: u32 = u32::MAX;
const SATTR_SKIP_U64: u64 = u64::MAX;
const SATTR_SKIP_TIME: i64 = i64::MIN;

pub fn put_fh(dst: &mut Vec<u8>, fh: &ZfsFh) {
    coding::put_u32(dst, fh.sid);
    coding::put_u32(dst, fh.vid);
    coding::put_u32(dst, fh.dev);
    coding::put_u32(dst, fh.ino);
    coding::put_u32(dst, fh.gen);
}

pub fn fh(src: &mut impl Read) -> Result<ZfsFh> {
    Ok(ZfsFh {
        sid: coding::u32(src)?,
        vid: coding::u32(src)?,
        dev: coding::u32(src)?,
        ino: coding::u32(src)?,
        gen: coding::u32(src)?,
    })
}

pub fn put_fattr(dst: &mut Vec<u8>, attr: &Fattr) {
    coding::put_u32(dst, attr.ftype as u32);
    coding::put_u32(dst, attr.mode);
    coding::put_u32(dst, attr.uid);
    coding::put_u32(dst, attr.gid);
    coding::put_u32(dst, attr.nlink);
    coding::put_u64(dst, attr.size);
    coding::put_u32(dst, attr.blksize);
    coding::put_u64(dst, attr.blocks);
    coding::put_i64(dst, attr.atime);
    coding::put_i64(dst, attr.mtime);
    coding::put_i64(dst, attr.ctime);
    coding::put_u64(dst, attr.version);
}

pub fn fattr(src: &mut impl Read) -> Result<Fattr> {
    Ok(Fattr {
        ftype: coding::variant::<FileType>(src)?,
        mode: coding::u32(src)?,
        uid: coding::u32(src)?,
        gid: coding::u32(src)?,
        nlink: coding::u32(src)?,
        size: coding::u64(src)?,
        blksize: coding::u32(src)?,
        blocks: coding::u64(src)?,
        atime: coding::i64(src)?,
        mtime: coding::i64(src)?,
        ctime: coding::i64(src)?,
        version: coding::u64(src)?,
    })
}

pub fn put_sattr(dst: &mut Vec<u8>, attr: &Sattr) {
    coding::put_u32(dst, attr.mode.unwrap_or(SATTR_SKIP_U32));
    coding::put_u32(dst, attr.uid.unwrap_or(SATTR_SKIP_U32));
    coding::put_u32(dst, attr.gid.unwrap_or(SATTR_SKIP_U32));
    coding::put_u64(dst, attr.size.unwrap_or(SATTR_SKIP_U64));
    coding::put_i64(dst, attr.atime.unwrap_or(SATTR_SKIP_TIME));
    coding::put_i64(dst, attr.mtime.unwrap_or(SATTR_SKIP_TIME));
}

pub fn sattr(src: &mut impl Read) -> Result<Sattr> {
    let mode = coding::u32(src)?;
    let uid = coding::u32(src)?;
    let gid = coding::u32(src)?;
    let size = coding::u64(src)?;
    let atime = coding::i64(src)?;
    let mtime = coding::i64(src)?;
    Ok(Sattr {
        mode: (mode != SATTR_SKIP_U32).then_some(mode),
        uid: (uid != SATTR_SKIP_U32).then_some(uid),
        gid: (gid != SATTR_SKIP_U32).then_some(gid),
        size: (size != SATTR_SKIP_U64).then_some(size),
        atime: (atime != SATTR_SKIP_TIME).then_some(atime),
        mtime: (mtime != SATTR_SKIP_TIME).then_some(mtime),
    })
}

/// Capability returned by `open` and `create`; read, write, readdir and
/// md5sum requests present it instead of the bare handle.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ZfsCap {
    pub fh: ZfsFh,
    pub flags: u32,
    pub verify: [u8; CAP_VERIFY_LEN],
}

impl ZfsCap {
    pub fn encode(&self, dst: &mut Vec<u8>) {
        put_fh(dst, &self.fh);
        coding::put_u32(dst, self.flags);
        dst.extend_from_slice(&self.verify);
    }

    pub fn decode(src: &mut impl Read) -> Result<ZfsCap> {
        Ok(ZfsCap {
            fh: fh(src)?,
            flags: coding::u32(src)?,
            verify: coding::array::<CAP_VERIFY_LEN>(src)?,
        })
    }
}

/// Directory and name pair of a namespace operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirOp {
    pub dir: ZfsFh,
    pub name: String,
}

impl DirOp {
    pub fn encode(&self, dst: &mut Vec<u8>) {
        put_fh(dst, &self.dir);
        coding::put_string(dst, &self.name);
    }

    pub fn decode(src: &mut impl Read) -> Result<DirOp> {
        Ok(DirOp { dir: fh(src)?, name: coding::name(src)? })
    }
}

/// Handle and attributes of a resolved directory entry.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct DirOpRes {
    pub file: ZfsFh,
    pub attr: Fattr,
}

impl DirOpRes {
    pub fn encode(&self, dst: &mut Vec<u8>) {
        put_fh(dst, &self.file);
        put_fattr(dst, &self.attr);
    }

    pub fn decode(src: &mut impl Read) -> Result<DirOpRes> {
        Ok(DirOpRes { file: fh(src)?, attr: fattr(src)? })
    }
}

/// One entry of a `readdir` result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u32,
    /// Position after this entry, usable as the next request's cookie.
    pub cookie: i32,
    pub name: String,
}

/// Result of `readdir`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirList {
    pub entries: Vec<DirEntry>,
    pub eof: bool,
}

impl DirList {
    pub fn encode(&self, dst: &mut Vec<u8>) {
        coding::put_u32(dst, self.entries.len() as u32);
        coding::put_bool(dst, self.eof);
        for entry in &self.entries {
            coding::put_u32(dst, entry.ino);
            coding::put_i32(dst, entry.cookie);
            coding::put_string(dst, &entry.name);
        }
    }

    pub fn decode(src: &mut impl Read) -> Result<DirList> {
        let count = coding::u32(src)? as usize;
        if count > crate::ZFS_MAXDATA / 8 {
            return Err(Error::MaxElemLimit);
        }
        let eof = coding::bool(src)?;
        let mut entries = Vec::with_capacity(count);
        for _ in 0..count {
            entries.push(DirEntry {
                ino: coding::u32(src)?,
                cookie: coding::i32(src)?,
                name: coding::name(src)?,
            });
        }
        Ok(DirList { entries, eof })
    }
}

/// Result of `read`: the data and the version it was read at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRes {
    pub version: u64,
    pub data: Vec<u8>,
}

impl ReadRes {
    pub fn encode(&self, dst: &mut Vec<u8>) {
        coding::put_u64(dst, self.version);
        coding::put_bytes(dst, &self.data);
    }

    pub fn decode(src: &mut impl Read) -> Result<ReadRes> {
        Ok(ReadRes { version: coding::u64(src)?, data: coding::data_buffer(src)? })
    }
}

/// Result of `write`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct WriteRes {
    pub written: u32,
    pub version: u64,
}

impl WriteRes {
    pub fn encode(&self, dst: &mut Vec<u8>) {
        coding::put_u32(dst, self.written);
        coding::put_u64(dst, self.version);
    }

    pub fn decode(src: &mut impl Read) -> Result<WriteRes> {
        Ok(WriteRes { written: coding::u32(src)?, version: coding::u64(src)? })
    }
}

/// Result of `create`.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct CreateRes {
    pub cap: ZfsCap,
    pub dor: DirOpRes,
}

impl CreateRes {
    pub fn encode(&self, dst: &mut Vec<u8>) {
        self.cap.encode(dst);
        self.dor.encode(dst);
    }

    pub fn decode(src: &mut impl Read) -> Result<CreateRes> {
        Ok(CreateRes { cap: ZfsCap::decode(src)?, dor: DirOpRes::decode(src)? })
    }
}

/// One hashed block range of an `md5sum` reply.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Md5Block {
    pub offset: u64,
    pub length: u32,
    pub sum: [u8; 16],
}

/// Result of `md5sum`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Md5SumRes {
    pub size: u64,
    pub version: u64,
    pub blocks: Vec<Md5Block>,
}

impl Md5SumRes {
    pub fn encode(&self, dst: &mut Vec<u8>) {
        coding::put_u32(dst, self.blocks.len() as u32);
        coding::put_u64(dst, self.size);
        coding::put_u64(dst, self.version);
        for block in &self.blocks {
            coding::put_u64(dst, block.offset);
            coding::put_u32(dst, block.length);
            dst.extend_from_slice(&block.sum);
        }
    }

    pub fn decode(src: &mut impl Read) -> Result<Md5SumRes> {
        let count = coding::u32(src)? as usize;
        if count > MAX_MD5_BLOCKS {
            return Err(Error::MaxElemLimit);
        }
        let size = coding::u64(src)?;
        let version = coding::u64(src)?;
        let mut blocks = Vec::with_capacity(count);
        for _ in 0..count {
            blocks.push(Md5Block {
                offset: coding::u64(src)?,
                length: coding::u32(src)?,
                sum: coding::array::<16>(src)?,
            });
        }
        Ok(Md5SumRes { size, version, blocks })
    }
}

/// A decoded request, one variant per procedure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Request {
    Null,
    /// The receiver echoes the payload back.
    Ping { payload: Vec<u8> },
    Root,
    VolumeRoot { vid: u32 },
    GetAttr { file: ZfsFh },
    SetAttr { file: ZfsFh, attr: Sattr },
    Lookup(DirOp),
    Create { dir_op: DirOp, flags: u32, attr: Sattr },
    Open { file: ZfsFh, flags: u32 },
    Close { cap: ZfsCap },
    ReadDir { cap: ZfsCap, cookie: i32, count: u32 },
    MkDir { dir_op: DirOp, attr: Sattr },
    RmDir(DirOp),
    Rename { from: DirOp, to: DirOp },
    Link { from: ZfsFh, to: DirOp },
    Unlink(DirOp),
    Read { cap: ZfsCap, offset: u64, count: u32 },
    Write { cap: ZfsCap, offset: u64, data: Vec<u8> },
    ReadLink { file: ZfsFh },
    SymLink { dir_op: DirOp, to: String, attr: Sattr },
    MkNod { dir_op: DirOp, attr: Sattr, ftype: FileType, rdev: u32 },
    AuthStage1 { node: String },
    AuthStage2 { speed: u8, generation: u64 },
    Md5Sum { cap: ZfsCap, ignore_changes: bool, ranges: Vec<(u64, u32)> },
    FileInfo { file: ZfsFh },
    RereadConfig { path: String },
    Reintegrate { fh: ZfsFh, acquire: bool },
    ReintegrateAdd { fh: ZfsFh, dir: ZfsFh, name: String },
    ReintegrateDel { fh: ZfsFh, dir: ZfsFh, name: String, destroy: bool },
    ReintegrateVer { fh: ZfsFh, version_inc: u64 },
}

impl Request {
    /// Function number of this request.
    pub fn procedure(&self) -> Procedure {
        match self {
            Request::Null => Procedure::Null,
            Request::Ping { .. } => Procedure::Ping,
            Request::Root => Procedure::Root,
            Request::VolumeRoot { .. } => Procedure::VolumeRoot,
            Request::GetAttr { .. } => Procedure::GetAttr,
            Request::SetAttr { .. } => Procedure::SetAttr,
            Request::Lookup(_) => Procedure::Lookup,
            Request::Create { .. } => Procedure::Create,
            Request::Open { .. } => Procedure::Open,
            Request::Close { .. } => Procedure::Close,
            Request::ReadDir { .. } => Procedure::ReadDir,
            Request::MkDir { .. } => Procedure::MkDir,
            Request::RmDir(_) => Procedure::RmDir,
            Request::Rename { .. } => Procedure::Rename,
            Request::Link { .. } => Procedure::Link,
            Request::Unlink(_) => Procedure::Unlink,
            Request::Read { .. } => Procedure::Read,
            Request::Write { .. } => Procedure::Write,
            Request::ReadLink { .. } => Procedure::ReadLink,
            Request::SymLink { .. } => Procedure::SymLink,
            Request::MkNod { .. } => Procedure::MkNod,
            Request::AuthStage1 { .. } => Procedure::AuthStage1,
            Request::AuthStage2 { .. } => Procedure::AuthStage2,
            Request::Md5Sum { .. } => Procedure::Md5Sum,
            Request::FileInfo { .. } => Procedure::FileInfo,
            Request::RereadConfig { .. } => Procedure::RereadConfig,
            Request::Reintegrate { .. } => Procedure::Reintegrate,
            Request::ReintegrateAdd { .. } => Procedure::ReintegrateAdd,
            Request::ReintegrateDel { .. } => Procedure::ReintegrateDel,
            Request::ReintegrateVer { .. } => Procedure::ReintegrateVer,
        }
    }

    /// Append the argument encoding to a frame body.
    pub fn encode_args(&self, dst: &mut Vec<u8>) {
        match self {
            Request::Null | Request::Root => {}
            Request::Ping { payload } => coding::put_bytes(dst, payload),
            Request::VolumeRoot { vid } => coding::put_u32(dst, *vid),
            Request::GetAttr { file } | Request::ReadLink { file } | Request::FileInfo { file } => {
                put_fh(dst, file)
            }
            Request::SetAttr { file, attr } => {
                put_fh(dst, file);
                put_sattr(dst, attr);
            }
            Request::Lookup(dir_op) | Request::RmDir(dir_op) | Request::Unlink(dir_op) => {
                dir_op.encode(dst)
            }
            Request::Create { dir_op, flags, attr } => {
                dir_op.encode(dst);
                coding::put_u32(dst, *flags);
                put_sattr(dst, attr);
            }
            Request::Open { file, flags } => {
                put_fh(dst, file);
                coding::put_u32(dst, *flags);
            }
            Request::Close { cap } => cap.encode(dst),
            Request::ReadDir { cap, cookie, count } => {
                cap.encode(dst);
                coding::put_i32(dst, *cookie);
                coding::put_u32(dst, *count);
            }
            Request::MkDir { dir_op, attr } => {
                dir_op.encode(dst);
                put_sattr(dst, attr);
            }
            Request::Rename { from, to } => {
                from.encode(dst);
                to.encode(dst);
            }
            Request::Link { from, to } => {
                put_fh(dst, from);
                to.encode(dst);
            }
            Request::Read { cap, offset, count } => {
                cap.encode(dst);
                coding::put_u64(dst, *offset);
                coding::put_u32(dst, *count);
            }
            Request::Write { cap, offset, data } => {
                cap.encode(dst);
                coding::put_u64(dst, *offset);
                coding::put_bytes(dst, data);
            }
            Request::SymLink { dir_op, to, attr } => {
                dir_op.encode(dst);
                coding::put_string(dst, to);
                put_sattr(dst, attr);
            }
            Request::MkNod { dir_op, attr, ftype, rdev } => {
                dir_op.encode(dst);
                put_sattr(dst, attr);
                coding::put_u32(dst, *ftype as u32);
                coding::put_u32(dst, *rdev);
            }
            Request::AuthStage1 { node } => coding::put_string(dst, node),
            Request::AuthStage2 { speed, generation } => {
                coding::put_u8(dst, *speed);
                coding::put_u64(dst, *generation);
            }
            Request::Md5Sum { cap, ignore_changes, ranges } => {
                cap.encode(dst);
                coding::put_bool(dst, *ignore_changes);
                coding::put_u32(dst, ranges.len() as u32);
                for (offset, length) in ranges {
                    coding::put_u64(dst, *offset);
                    coding::put_u32(dst, *length);
                }
            }
            Request::RereadConfig { path } => coding::put_string(dst, path),
            Request::Reintegrate { fh, acquire } => {
                put_fh(dst, fh);
                coding::put_bool(dst, *acquire);
            }
            Request::ReintegrateAdd { fh, dir, name } => {
                put_fh(dst, fh);
                put_fh(dst, dir);
                coding::put_string(dst, name);
            }
            Request::ReintegrateDel { fh, dir, name, destroy } => {
                put_fh(dst, fh);
                put_fh(dst, dir);
                coding::put_string(dst, name);
                coding::put_bool(dst, *destroy);
            }
            Request::ReintegrateVer { fh, version_inc } => {
                put_fh(dst, fh);
                coding::put_u64(dst, *version_inc);
            }
        }
    }

    /// Decode the arguments of `procedure` from a frame body.
    pub fn decode(procedure: Procedure, src: &mut impl Read) -> Result<Request> {
        Ok(match procedure {
            Procedure::Null => Request::Null,
            Procedure::Ping => Request::Ping { payload: coding::data_buffer(src)? },
            Procedure::Root => Request::Root,
            Procedure::VolumeRoot => Request::VolumeRoot { vid: coding::u32(src)? },
            Procedure::GetAttr => Request::GetAttr { file: fh(src)? },
            Procedure::SetAttr => Request::SetAttr { file: fh(src)?, attr: sattr(src)? },
            Procedure::Lookup => Request::Lookup(DirOp::decode(src)?),
            Procedure::Create => Request::Create {
                dir_op: DirOp::decode(src)?,
                flags: coding::u32(src)?,
                attr: sattr(src)?,
            },
            Procedure::Open => Request::Open { file: fh(src)?, flags: coding::u32(src)? },
            Procedure::Close => Request::Close { cap: ZfsCap::decode(src)? },
            Procedure::ReadDir => Request::ReadDir {
                cap: ZfsCap::decode(src)?,
                cookie: coding::i32(src)?,
                count: coding::u32(src)?,
            },
            Procedure::MkDir => {
                Request::MkDir { dir_op: DirOp::decode(src)?, attr: sattr(src)? }
            }
            Procedure::RmDir => Request::RmDir(DirOp::decode(src)?),
            Procedure::Rename => {
                Request::Rename { from: DirOp::decode(src)?, to: DirOp::decode(src)? }
            }
            Procedure::Link => Request::Link { from: fh(src)?, to: DirOp::decode(src)? },
            Procedure::Unlink => Request::Unlink(DirOp::decode(src)?),
            Procedure::Read => Request::Read {
                cap: ZfsCap::decode(src)?,
                offset: coding::u64(src)?,
                count: coding::u32(src)?,
            },
            Procedure::Write => Request::Write {
                cap: ZfsCap::decode(src)?,
                offset: coding::u64(src)?,
                data: coding::data_buffer(src)?,
            },
            Procedure::ReadLink => Request::ReadLink { file: fh(src)? },
            Procedure::SymLink => Request::SymLink {
                dir_op: DirOp::decode(src)?,
                to: coding::path(src)?,
                attr: sattr(src)?,
            },
            Procedure::MkNod => Request::MkNod {
                dir_op: DirOp::decode(src)?,
                attr: sattr(src)?,
                ftype: coding::variant::<FileType>(src)?,
                rdev: coding::u32(src)?,
            },
            Procedure::AuthStage1 => Request::AuthStage1 { node: coding::name(src)? },
            Procedure::AuthStage2 => Request::AuthStage2 {
                speed: coding::u8(src)?,
                generation: coding::u64(src)?,
            },
            Procedure::Md5Sum => {
                let cap = ZfsCap::decode(src)?;
                let ignore_changes = coding::bool(src)?;
                let count = coding::u32(src)? as usize;
                if count > MAX_MD5_BLOCKS {
                    return Err(Error::MaxElemLimit);
                }
                let mut ranges = Vec::with_capacity(count);
                for _ in 0..count {
                    ranges.push((coding::u64(src)?, coding::u32(src)?));
                }
                Request::Md5Sum { cap, ignore_changes, ranges }
            }
            Procedure::FileInfo => Request::FileInfo { file: fh(src)? },
            Procedure::RereadConfig => Request::RereadConfig { path: coding::path(src)? },
            Procedure::Reintegrate => {
                Request::Reintegrate { fh: fh(src)?, acquire: coding::bool(src)? }
            }
            Procedure::ReintegrateAdd => Request::ReintegrateAdd {
                fh: fh(src)?,
                dir: fh(src)?,
                name: coding::name(src)?,
            },
            Procedure::ReintegrateDel => Request::ReintegrateDel {
                fh: fh(src)?,
                dir: fh(src)?,
                name: coding::name(src)?,
                destroy: coding::bool(src)?,
            },
            Procedure::ReintegrateVer => Request::ReintegrateVer {
                fh: fh(src)?,
                version_inc: coding::u64(src)?,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn dir_op_roundtrip() {
        let dir_op = DirOp { dir: ZfsFh::new(2, 7, 11, 42, 1), name: "a.txt".into() };
        let mut buf = Vec::new();
        dir_op.encode(&mut buf);
        assert_eq!(DirOp::decode(&mut Cursor::new(&buf)).unwrap(), dir_op);
    }

    #[test]
    fn sattr_sentinels_mean_unchanged() {
        #[rustfmt::skip]
        const DATA: &[u8] = &[
            0xff, 0xff, 0xff, 0xff,                         // mode: skip
            0xe8, 0x03, 0x00, 0x00,                         // uid = 1000
            0xff, 0xff, 0xff, 0xff,                         // gid: skip
            0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, // size: skip
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x80, // atime: skip
            0x05, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // mtime = 5
        ];
        let attr = sattr(&mut Cursor::new(DATA)).unwrap();
        assert_eq!(attr.mode, None);
        assert_eq!(attr.uid, Some(1000));
        assert_eq!(attr.size, None);
        assert_eq!(attr.atime, None);
        assert_eq!(attr.mtime, Some(5));
    }

    #[test]
    fn request_decode_matches_encode() {
        let request = Request::Write {
            cap: ZfsCap {
                fh: ZfsFh::new(2, 7, 11, 42, 1),
                flags: libc::O_WRONLY as u32,
                verify: [7u8; CAP_VERIFY_LEN],
            },
            offset: 4096,
            data: b"payload".to_vec(),
        };
        let mut buf = Vec::new();
        request.encode_args(&mut buf);
        let decoded = Request::decode(request.procedure(), &mut Cursor::new(&buf)).unwrap();
        assert_eq!(decoded, request);
    }

    #[test]
    fn md5sum_block_count_is_bounded() {
        let mut buf = Vec::new();
        ZfsCap { fh: ZfsFh::UNDEFINED, flags: 0, verify: [0; CAP_VERIFY_LEN] }.encode(&mut buf);
        coding::put_bool(&mut buf, false);
        coding::put_u32(&mut buf, (MAX_MD5_BLOCKS + 1) as u32);
        assert!(matches!(
            Request::decode(Procedure::Md5Sum, &mut Cursor::new(&buf)),
            Err(Error::MaxElemLimit)
        ));
    }
}
