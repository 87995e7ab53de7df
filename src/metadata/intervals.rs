//! Byte-range interval sets for partially synchronized files.
//!
//! Every cached file carries two of these: `updated` holds the ranges known
//! to equal the master's data at the recorded version, `modified` holds the
//! locally dirty ranges that still owe a write-back. Ranges are half-open
//! `[lo, hi)` and adjacent or overlapping inserts merge.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

/// How many inserts may accumulate before the owning store flushes the tree
/// to its side file.
pub const INTERVAL_FLUSH_DELTA: u32 = 64;

/// An ordered set of disjoint byte ranges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IntervalSet {
    // lo -> hi, disjoint and non-adjacent
    ranges: BTreeMap<u64, u64>,
    dirty: u32,
}

impl IntervalSet {
    pub fn new() -> Self {
        IntervalSet::default()
    }

    /// Insert `[lo, hi)`, merging with any overlapping or adjacent range.
    pub fn insert(&mut self, lo: u64, hi: u64) {
        if lo >= hi {
            return;
        }
        let mut lo = lo;
        let mut hi = hi;

        // absorb a range starting at or before lo that reaches it
        if let Some((&start, &end)) = self.ranges.range(..=lo).next_back() {
            if end >= lo {
                lo = start;
                hi = hi.max(end);
                self.ranges.remove(&start);
            }
        }
        // absorb everything starting inside [lo, hi]
        let absorbed: Vec<u64> =
            self.ranges.range(lo..=hi).map(|(&start, _)| start).collect();
        for start in absorbed {
            let end = self.ranges.remove(&start).unwrap();
            hi = hi.max(end);
        }

        self.ranges.insert(lo, hi);
        self.dirty = self.dirty.saturating_add(1);
    }

    /// True if `[lo, hi)` is fully covered.
    pub fn covers(&self, lo: u64, hi: u64) -> bool {
        if lo >= hi {
            return true;
        }
        match self.ranges.range(..=lo).next_back() {
            Some((_, &end)) => end >= hi,
            None => false,
        }
    }

    /// True if any part of `[lo, hi)` is present.
    pub fn intersects(&self, lo: u64, hi: u64) -> bool {
        if lo >= hi {
            return false;
        }
        if let Some((_, &end)) = self.ranges.range(..=lo).next_back() {
            if end > lo {
                return true;
            }
        }
        self.ranges.range(lo..hi).next().is_some()
    }

    /// The parts of `[lo, hi)` that are not covered, in order.
    pub fn complement(&self, lo: u64, hi: u64) -> Vec<(u64, u64)> {
        let mut holes = Vec::new();
        let mut cursor = lo;
        if let Some((_, &end)) = self.ranges.range(..=lo).next_back() {
            if end > cursor {
                cursor = end;
            }
        }
        for (&start, &end) in self.ranges.range(lo..hi) {
            if start > cursor {
                holes.push((cursor, start.min(hi)));
            }
            cursor = cursor.max(end);
            if cursor >= hi {
                break;
            }
        }
        if cursor < hi {
            holes.push((cursor, hi));
        }
        holes
    }

    /// Ranges intersected with `[lo, hi)`, clipped, in order.
    pub fn intersection(&self, lo: u64, hi: u64) -> Vec<(u64, u64)> {
        let mut out = Vec::new();
        if let Some((&start, &end)) = self.ranges.range(..=lo).next_back() {
            if end > lo {
                out.push((lo, end.min(hi)));
            }
            let _ = start;
        }
        for (&start, &end) in self.ranges.range(lo..hi) {
            if start >= hi {
                break;
            }
            // a range starting exactly at lo was already reported above
            if out.last().map_or(false, |&(o, _)| o == start) {
                continue;
            }
            out.push((start.max(lo), end.min(hi)));
        }
        out
    }

    /// Drop everything at or past `size` (file truncated under us).
    pub fn clamp(&mut self, size: u64) {
        let beyond: Vec<u64> = self.ranges.range(size..).map(|(&start, _)| start).collect();
        for start in beyond {
            self.ranges.remove(&start);
        }
        if let Some((&start, &end)) = self.ranges.range(..size).next_back() {
            if end > size {
                self.ranges.insert(start, size);
            }
        }
    }

    pub fn clear(&mut self) {
        self.ranges.clear();
        self.dirty = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Iterate the ranges in order.
    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.ranges.iter().map(|(&lo, &hi)| (lo, hi))
    }

    /// Number of inserts since the last [`IntervalSet::mark_flushed`].
    pub fn pending_flush(&self) -> u32 {
        self.dirty
    }

    pub fn mark_flushed(&mut self) {
        self.dirty = 0;
    }

    /// Serialize as sorted `u64 lo | u64 hi` pairs.
    pub fn write_to(&self, dst: &mut impl Write) -> io::Result<()> {
        for (&lo, &hi) in &self.ranges {
            dst.write_u64::<LittleEndian>(lo)?;
            dst.write_u64::<LittleEndian>(hi)?;
        }
        Ok(())
    }

    /// Read pairs until EOF; a trailing partial pair is ignored.
    pub fn read_from(src: &mut impl Read) -> io::Result<IntervalSet> {
        let mut set = IntervalSet::new();
        loop {
            let lo = match src.read_u64::<LittleEndian>() {
                Ok(lo) => lo,
                Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            };
            let hi = match src.read_u64::<LittleEndian>() {
                Ok(hi) => hi,
                Err(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            };
            set.insert(lo, hi);
        }
        set.mark_flushed();
        Ok(set)
    }

    /// Load the side file at `path`, reconciling against the current file
    /// size; missing file means an empty set.
    pub fn load(path: &Path, size: u64) -> io::Result<IntervalSet> {
        let mut set = match File::open(path) {
            Ok(mut file) => IntervalSet::read_from(&mut file)?,
            Err(ref e) if e.kind() == io::ErrorKind::NotFound => IntervalSet::new(),
            Err(e) => return Err(e),
        };
        set.clamp(size);
        Ok(set)
    }

    /// Rewrite the side file at `path` whole.
    pub fn store(&mut self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = File::create(path)?;
        self.write_to(&mut file)?;
        file.sync_data()?;
        self.mark_flushed();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ranges(set: &IntervalSet) -> Vec<(u64, u64)> {
        set.iter().collect()
    }

    #[test]
    fn inserts_merge_adjacent_and_overlapping() {
        let mut set = IntervalSet::new();
        set.insert(10, 20);
        set.insert(30, 40);
        assert_eq!(ranges(&set), vec![(10, 20), (30, 40)]);

        set.insert(20, 30);
        assert_eq!(ranges(&set), vec![(10, 40)]);

        set.insert(5, 12);
        set.insert(38, 50);
        assert_eq!(ranges(&set), vec![(5, 50)]);
    }

    #[test]
    fn coverage_and_holes() {
        let mut set = IntervalSet::new();
        set.insert(0, 100);
        set.insert(200, 300);

        assert!(set.covers(0, 100));
        assert!(set.covers(10, 90));
        assert!(!set.covers(50, 150));
        assert!(set.intersects(90, 210));
        assert!(!set.intersects(100, 200));

        assert_eq!(set.complement(0, 300), vec![(100, 200)]);
        assert_eq!(set.complement(50, 250), vec![(100, 200)]);
        assert_eq!(set.complement(300, 400), vec![(300, 400)]);
    }

    #[test]
    fn intersection_clips() {
        let mut set = IntervalSet::new();
        set.insert(10, 20);
        set.insert(30, 40);
        assert_eq!(set.intersection(15, 35), vec![(15, 20), (30, 35)]);
        assert_eq!(set.intersection(0, 5), vec![]);
    }

    #[test]
    fn clamp_truncates() {
        let mut set = IntervalSet::new();
        set.insert(0, 10);
        set.insert(20, 30);
        set.insert(40, 50);
        set.clamp(25);
        assert_eq!(ranges(&set), vec![(0, 10), (20, 25)]);
    }

    #[test]
    fn side_file_roundtrip_reconciles_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("7.u");
        let mut set = IntervalSet::new();
        set.insert(0, 4096);
        set.insert(8192, 12000);
        set.store(&path).unwrap();
        assert_eq!(set.pending_flush(), 0);

        let loaded = IntervalSet::load(&path, 10000).unwrap();
        assert_eq!(
            loaded.iter().collect::<Vec<_>>(),
            vec![(0, 4096), (8192, 10000)]
        );
    }
}
