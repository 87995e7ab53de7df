//! Background destruction of dentry-less file handles.
//!
//! A handle whose last dentry disappears is queued here instead of being
//! freed on the spot; a re-lookup inside the grace window resurrects it
//! cheaply. The cleanup thread revisits the queue, re-validates each
//! candidate and evicts the ones that are still unused.

use std::time::{Duration, Instant};

use tracing::trace;

use super::lock::LockLevel;
use super::FhTable;

/// How long a queued handle survives before the cleanup pass may take it.
pub const CLEANUP_GRACE: Duration = Duration::from_secs(8);

/// Interval between cleanup passes.
pub const CLEANUP_TICK: Duration = Duration::from_secs(1);

/// One pass over the destruction queue. Entries younger than `grace` stay
/// queued; entries whose handle was resurrected or latched meanwhile are
/// dropped from the queue without eviction. Returns evicted handles.
pub fn cleanup_pass(table: &mut FhTable, grace: Duration) -> usize {
    let now = Instant::now();
    let mut evicted = 0;
    while let Some(&(fh, queued_at)) = table.unused.front() {
        if now.duration_since(queued_at) < grace {
            break;
        }
        table.unused.pop_front();
        let Some(ifh) = table.get(&fh) else { continue };
        let still_unused = {
            let data = ifh.data.lock();
            data.ndentries == 0 && data.level == LockLevel::Unlocked && data.users == 0
        };
        if still_unused {
            trace!(?fh, "evicting unused file handle");
            table.evict(&fh);
            evicted += 1;
        }
    }
    evicted
}

#[cfg(test)]
mod tests {
    use super::super::{Fattr, FhTable, ZfsFh};
    use super::*;
    use crate::metadata::record::MetadataRecord;

    fn fh(ino: u32) -> ZfsFh {
        ZfsFh::new(2, 7, 11, ino, 1)
    }

    fn dentryless_handle(table: &mut FhTable, ino: u32) {
        table.intern(fh(ino), Fattr::default(), MetadataRecord::default());
        let dir = fh(1);
        table.intern(dir, Fattr::default(), MetadataRecord::default());
        let dentry = table.add_dentry(Some(dir), &format!("f{ino}"), fh(ino));
        table.remove_dentry(&dentry);
    }

    #[test]
    fn grace_window_delays_eviction() {
        let mut table = FhTable::new();
        dentryless_handle(&mut table, 5);
        assert_eq!(cleanup_pass(&mut table, Duration::from_secs(60)), 0);
        assert!(table.get(&fh(5)).is_some());

        assert_eq!(cleanup_pass(&mut table, Duration::ZERO), 1);
        assert!(table.get(&fh(5)).is_none());
    }

    #[test]
    fn resurrected_handle_survives() {
        let mut table = FhTable::new();
        dentryless_handle(&mut table, 5);
        // a re-lookup interposed the dentry again before the pass ran
        table.add_dentry(Some(fh(1)), "back", fh(5));

        assert_eq!(cleanup_pass(&mut table, Duration::ZERO), 0);
        assert!(table.get(&fh(5)).is_some());
    }
}
