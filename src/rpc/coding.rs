//! Primitive wire data types.
//!
//! Everything on the wire is explicit little-endian: fixed-width integers,
//! length-prefixed byte strings and fixed-size records composed of them.
//! Decoding reads from any `Read` source positioned inside a frame body;
//! encoding appends to a byte buffer.

use std::io::Read;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use num_traits::FromPrimitive;

use crate::{ZFS_MAXDATA, ZFS_MAXNAMELEN, ZFS_MAXPATHLEN};

/// Result of decoding operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Decoding errors. The frame owner maps these to the protocol status
/// group: invalid request on the server side, invalid reply on the client
/// side.
#[derive(Debug)]
pub enum Error {
    /// The source ended inside a value.
    IO(std::io::Error),
    /// A length prefix exceeded its bound.
    MaxElemLimit,
    /// A discriminant did not name a known variant.
    EnumDiscMismatch,
    /// A string was not valid UTF-8.
    IncorrectString(std::string::FromUtf8Error),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::IO(err)
    }
}

/// Decodes a `u8` from the source.
pub fn u8(src: &mut impl Read) -> Result<u8> {
    src.read_u8().map_err(Error::IO)
}

/// Decodes a `u16` from the source.
pub fn u16(src: &mut impl Read) -> Result<u16> {
    src.read_u16::<LittleEndian>().map_err(Error::IO)
}

/// Decodes a `u32` from the source.
pub fn u32(src: &mut impl Read) -> Result<u32> {
    src.read_u32::<LittleEndian>().map_err(Error::IO)
}

/// Decodes an `i32` from the source.
pub fn i32(src: &mut impl Read) -> Result<i32> {
    src.read_i32::<LittleEndian>().map_err(Error::IO)
}

/// Decodes a `u64` from the source.
pub fn u64(src: &mut impl Read) -> Result<u64> {
    src.read_u64::<LittleEndian>().map_err(Error::IO)
}

/// Decodes an `i64` from the source.
pub fn i64(src: &mut impl Read) -> Result<i64> {
    src.read_i64::<LittleEndian>().map_err(Error::IO)
}

/// Decodes a boolean encoded as one byte.
pub fn bool(src: &mut impl Read) -> Result<bool> {
    match u8(src)? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(Error::EnumDiscMismatch),
    }
}

/// Decodes a fixed-size byte array.
pub fn array<const N: usize>(src: &mut impl Read) -> Result<[u8; N]> {
    let mut buf = [0u8; N];
    src.read_exact(&mut buf).map_err(Error::IO)?;
    Ok(buf)
}

/// Decodes a length-prefixed byte vector bounded by `max_size`.
pub fn vec_max_size(src: &mut impl Read, max_size: usize) -> Result<Vec<u8>> {
    let size = u32(src)? as usize;
    if size > max_size {
        return Err(Error::MaxElemLimit);
    }
    let mut vec = vec![0u8; size];
    src.read_exact(vec.as_mut_slice()).map_err(Error::IO)?;
    Ok(vec)
}

/// Decodes a length-prefixed string bounded by `max_size`.
pub fn string_max_size(src: &mut impl Read, max_size: usize) -> Result<String> {
    let vec = vec_max_size(src, max_size)?;
    String::from_utf8(vec).map_err(Error::IncorrectString)
}

/// Decodes a file name, bounded by [`ZFS_MAXNAMELEN`].
pub fn name(src: &mut impl Read) -> Result<String> {
    string_max_size(src, ZFS_MAXNAMELEN)
}

/// Decodes a path, bounded by [`ZFS_MAXPATHLEN`].
pub fn path(src: &mut impl Read) -> Result<String> {
    string_max_size(src, ZFS_MAXPATHLEN)
}

/// Decodes a data buffer, bounded by [`ZFS_MAXDATA`].
pub fn data_buffer(src: &mut impl Read) -> Result<Vec<u8>> {
    vec_max_size(src, ZFS_MAXDATA)
}

/// Decodes an enum variant from its `u32` discriminant.
pub fn variant<T: FromPrimitive>(src: &mut impl Read) -> Result<T> {
    T::from_u32(u32(src)?).ok_or(Error::EnumDiscMismatch)
}

// Encoding appends to a Vec<u8>; frame buffers never fail to grow, so the
// writers below stay infallible.

pub fn put_u8(dst: &mut Vec<u8>, value: u8) {
    dst.write_u8(value).expect("vec write");
}

pub fn put_u16(dst: &mut Vec<u8>, value: u16) {
    dst.write_u16::<LittleEndian>(value).expect("vec write");
}

pub fn put_u32(dst: &mut Vec<u8>, value: u32) {
    dst.write_u32::<LittleEndian>(value).expect("vec write");
}

pub fn put_i32(dst: &mut Vec<u8>, value: i32) {
    dst.write_i32::<LittleEndian>(value).expect("vec write");
}

pub fn put_u64(dst: &mut Vec<u8>, value: u64) {
    dst.write_u64::<LittleEndian>(value).expect("vec write");
}

pub fn put_i64(dst: &mut Vec<u8>, value: i64) {
    dst.write_i64::<LittleEndian>(value).expect("vec write");
}

pub fn put_bool(dst: &mut Vec<u8>, value: bool) {
    put_u8(dst, u8::from(value));
}

pub fn put_bytes(dst: &mut Vec<u8>, bytes: &[u8]) {
    put_u32(dst, bytes.len() as u32);
    dst.extend_from_slice(bytes);
}

pub fn put_string(dst: &mut Vec<u8>, value: &str) {
    put_bytes(dst, value.as_bytes());
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    #[test]
    fn integers_are_little_endian() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 0x0403_0201);
        assert_eq!(buf, [0x01, 0x02, 0x03, 0x04]);
        assert_eq!(u32(&mut Cursor::new(&buf)).unwrap(), 0x0403_0201);
    }

    #[test]
    fn string_is_length_prefixed() {
        let mut buf = Vec::new();
        put_string(&mut buf, "ab");
        assert_eq!(buf, [0x02, 0x00, 0x00, 0x00, b'a', b'b']);
        assert_eq!(name(&mut Cursor::new(&buf)).unwrap(), "ab");
    }

    #[test]
    fn bounds_are_enforced() {
        let mut buf = Vec::new();
        put_bytes(&mut buf, &vec![0u8; ZFS_MAXNAMELEN + 1]);
        assert!(matches!(name(&mut Cursor::new(&buf)), Err(Error::MaxElemLimit)));
        assert!(data_buffer(&mut Cursor::new(&buf)).is_ok());
    }

    #[test]
    fn truncated_source_is_an_error() {
        let buf = [0x05, 0x00, 0x00, 0x00, b'a'];
        assert!(matches!(name(&mut Cursor::new(&buf)), Err(Error::IO(_))));
    }

    #[test]
    fn bool_rejects_junk() {
        assert!(bool(&mut Cursor::new(&[1u8])).unwrap());
        assert!(matches!(bool(&mut Cursor::new(&[7u8])), Err(Error::EnumDiscMismatch)));
    }
}
