//! Fixed little-endian record layouts stored in the per-volume hash files.

use byteorder::{ByteOrder, LittleEndian};

use crate::fh::ZfsFh;

/// The file is fully cached: `updated` covers `[0, size)`.
pub const FLAG_COMPLETE: u32 = 1 << 0;
/// Some file in this directory's subtree is locally modified.
pub const FLAG_MODIFIED_TREE: u32 = 1 << 1;
/// The file lives under the shadow tree.
pub const FLAG_SHADOW: u32 = 1 << 2;
/// The shadow root or one of its descendants.
pub const FLAG_SHADOW_TREE: u32 = 1 << 3;

pub(crate) fn encode_fh(buf: &mut [u8], fh: &ZfsFh) {
    LittleEndian::write_u32(&mut buf[0..4], fh.sid);
    LittleEndian::write_u32(&mut buf[4..8], fh.vid);
    LittleEndian::write_u32(&mut buf[8..12], fh.dev);
    LittleEndian::write_u32(&mut buf[12..16], fh.ino);
    LittleEndian::write_u32(&mut buf[16..20], fh.gen);
}

pub(crate) fn decode_fh(buf: &[u8]) -> ZfsFh {
    ZfsFh {
        sid: LittleEndian::read_u32(&buf[0..4]),
        vid: LittleEndian::read_u32(&buf[4..8]),
        dev: LittleEndian::read_u32(&buf[8..12]),
        ino: LittleEndian::read_u32(&buf[12..16]),
        gen: LittleEndian::read_u32(&buf[16..20]),
    }
}

/// Per-inode persistent metadata, keyed by `(dev, ino)`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct MetadataRecord {
    pub dev: u32,
    pub ino: u32,
    /// Generation of the inode slot, bumped on reuse.
    pub gen: u32,
    pub flags: u32,
    /// Version of the local data.
    pub local_version: u64,
    /// Master version the local data was last synchronized with.
    pub master_version: u64,
    /// Handle of this file on the volume master; undefined on the master
    /// itself.
    pub master_fh: ZfsFh,
}

impl MetadataRecord {
    pub const PAYLOAD_SIZE: usize = 4 * 4 + 8 * 2 + 20;

    pub fn key_bytes(dev: u32, ino: u32) -> [u8; 8] {
        let mut key = [0u8; 8];
        LittleEndian::write_u32(&mut key[0..4], dev);
        LittleEndian::write_u32(&mut key[4..8], ino);
        key
    }

    pub fn encode(&self) -> [u8; Self::PAYLOAD_SIZE] {
        let mut buf = [0u8; Self::PAYLOAD_SIZE];
        LittleEndian::write_u32(&mut buf[0..4], self.dev);
        LittleEndian::write_u32(&mut buf[4..8], self.ino);
        LittleEndian::write_u32(&mut buf[8..12], self.gen);
        LittleEndian::write_u32(&mut buf[12..16], self.flags);
        LittleEndian::write_u64(&mut buf[16..24], self.local_version);
        LittleEndian::write_u64(&mut buf[24..32], self.master_version);
        encode_fh(&mut buf[32..52], &self.master_fh);
        buf
    }

    pub fn decode(buf: &[u8]) -> MetadataRecord {
        MetadataRecord {
            dev: LittleEndian::read_u32(&buf[0..4]),
            ino: LittleEndian::read_u32(&buf[4..8]),
            gen: LittleEndian::read_u32(&buf[8..12]),
            flags: LittleEndian::read_u32(&buf[12..16]),
            local_version: LittleEndian::read_u64(&buf[16..24]),
            master_version: LittleEndian::read_u64(&buf[24..32]),
            master_fh: decode_fh(&buf[32..52]),
        }
    }

    pub fn matches_key(payload: &[u8], dev: u32, ino: u32) -> bool {
        LittleEndian::read_u32(&payload[0..4]) == dev
            && LittleEndian::read_u32(&payload[4..8]) == ino
    }

    pub fn is_complete(&self) -> bool {
        self.flags & FLAG_COMPLETE != 0
    }

    pub fn is_shadow(&self) -> bool {
        self.flags & FLAG_SHADOW != 0
    }

    pub fn set_flag(&mut self, flag: u32, on: bool) {
        if on {
            self.flags |= flag;
        } else {
            self.flags &= !flag;
        }
    }

    /// Clean means the local data equals the master at the same version.
    pub fn is_clean(&self) -> bool {
        self.local_version == self.master_version
    }
}

/// Master-handle to local-inode mapping, keyed by the master handle.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub struct FhMappingRecord {
    pub master_fh: ZfsFh,
    pub dev: u32,
    pub ino: u32,
}

impl FhMappingRecord {
    pub const PAYLOAD_SIZE: usize = 20 + 4 + 4;

    pub fn key_bytes(master_fh: &ZfsFh) -> [u8; 20] {
        let mut key = [0u8; 20];
        encode_fh(&mut key, master_fh);
        key
    }

    pub fn encode(&self) -> [u8; Self::PAYLOAD_SIZE] {
        let mut buf = [0u8; Self::PAYLOAD_SIZE];
        encode_fh(&mut buf[0..20], &self.master_fh);
        LittleEndian::write_u32(&mut buf[20..24], self.dev);
        LittleEndian::write_u32(&mut buf[24..28], self.ino);
        buf
    }

    pub fn decode(buf: &[u8]) -> FhMappingRecord {
        FhMappingRecord {
            master_fh: decode_fh(&buf[0..20]),
            dev: LittleEndian::read_u32(&buf[20..24]),
            ino: LittleEndian::read_u32(&buf[24..28]),
        }
    }

    pub fn matches_key(payload: &[u8], master_fh: &ZfsFh) -> bool {
        decode_fh(&payload[0..20]) == *master_fh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_record_roundtrip() {
        let record = MetadataRecord {
            dev: 3,
            ino: 99,
            gen: 2,
            flags: FLAG_COMPLETE | FLAG_SHADOW,
            local_version: 12,
            master_version: 11,
            master_fh: ZfsFh::new(1, 7, 4, 88, 1),
        };
        let buf = record.encode();
        assert_eq!(MetadataRecord::decode(&buf), record);
        assert!(MetadataRecord::matches_key(&buf, 3, 99));
        assert!(!MetadataRecord::matches_key(&buf, 3, 98));
        assert!(record.is_complete());
        assert!(record.is_shadow());
        assert!(!record.is_clean());
    }

    #[test]
    fn mapping_record_roundtrip() {
        let record = FhMappingRecord { master_fh: ZfsFh::new(1, 7, 4, 88, 1), dev: 3, ino: 99 };
        let buf = record.encode();
        assert_eq!(FhMappingRecord::decode(&buf), record);
        assert!(FhMappingRecord::matches_key(&buf, &record.master_fh));
    }
}
