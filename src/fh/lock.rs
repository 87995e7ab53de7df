//! Per-handle latching and the reintegration lease.
//!
//! Handles are latched at three levels with a waiter queue on the handle's
//! condvar. The table mutex is never held while waiting here; after any
//! wait the caller re-resolves its handle from the table, because the
//! record may have been destroyed and recreated in the meantime.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, ZfsError};

use super::{InternalFh, ZfsFh};

/// Latch levels of an [`InternalFh`].
#[derive(Debug, Copy, Clone, PartialEq, Eq, Default)]
pub enum LockLevel {
    #[default]
    Unlocked,
    Shared,
    Exclusive,
}

/// Exclusive right of one node to replay a journal against this file.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ReintegrationLease {
    /// Node holding the lease.
    pub sid: u32,
    /// Connection generation under which the lease was granted. A lease
    /// whose generation is older than the node's current connection
    /// generation belongs to a previous life of that node and may be
    /// stolen.
    pub generation: u64,
}

/// Upper bound of latches one thread may hold at once.
pub const MAX_LOCKED_FILE_HANDLES: usize = 16;

#[cfg(debug_assertions)]
thread_local! {
    static HELD: std::cell::RefCell<Vec<ZfsFh>> = const { std::cell::RefCell::new(Vec::new()) };
}

#[cfg(debug_assertions)]
fn track_acquire(fh: ZfsFh) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        assert!(held.len() < MAX_LOCKED_FILE_HANDLES, "too many held file handle latches");
        held.push(fh);
    });
}

#[cfg(debug_assertions)]
fn track_release(fh: ZfsFh) {
    HELD.with(|held| {
        let mut held = held.borrow_mut();
        if let Some(pos) = held.iter().rposition(|h| *h == fh) {
            held.remove(pos);
        }
    });
}

#[cfg(not(debug_assertions))]
fn track_acquire(_fh: ZfsFh) {}

#[cfg(not(debug_assertions))]
fn track_release(_fh: ZfsFh) {}

impl InternalFh {
    /// Latch the handle at `level`, waiting if an incompatible holder is
    /// present. Returns [`ZfsError::Exiting`] once shutdown begins; the
    /// caller must not hold the table or volume mutex.
    pub fn acquire(&self, level: LockLevel, terminating: &AtomicBool) -> Result<()> {
        debug_assert_ne!(level, LockLevel::Unlocked);
        let mut data = self.data.lock();
        loop {
            if terminating.load(Ordering::Acquire) {
                return Err(ZfsError::Exiting);
            }
            match level {
                LockLevel::Shared if data.level != LockLevel::Exclusive => {
                    data.level = LockLevel::Shared;
                    data.users += 1;
                    break;
                }
                LockLevel::Exclusive if data.level == LockLevel::Unlocked => {
                    data.level = LockLevel::Exclusive;
                    data.users = 1;
                    break;
                }
                _ => {
                    self.cond.wait(&mut data);
                }
            }
        }
        drop(data);
        track_acquire(self.fh);
        Ok(())
    }

    /// Raise a shared latch to exclusive, waiting for other sharers to
    /// leave. May suspend; same re-validation rules as [`Self::acquire`].
    pub fn upgrade(&self, terminating: &AtomicBool) -> Result<()> {
        let mut data = self.data.lock();
        debug_assert_eq!(data.level, LockLevel::Shared);
        loop {
            if terminating.load(Ordering::Acquire) {
                return Err(ZfsError::Exiting);
            }
            if data.users == 1 {
                data.level = LockLevel::Exclusive;
                return Ok(());
            }
            self.cond.wait(&mut data);
        }
    }

    /// Drop one holder of the current latch level.
    pub fn release(&self) {
        let mut data = self.data.lock();
        match data.level {
            LockLevel::Unlocked => {
                debug_assert!(false, "releasing an unlocked file handle");
            }
            LockLevel::Shared => {
                data.users -= 1;
                if data.users == 0 {
                    data.level = LockLevel::Unlocked;
                }
            }
            LockLevel::Exclusive => {
                data.users = 0;
                data.level = LockLevel::Unlocked;
            }
        }
        drop(data);
        track_release(self.fh);
        self.cond.notify_all();
    }

    /// Wake all waiters so they can observe shutdown.
    pub fn interrupt(&self) {
        self.cond.notify_all();
    }
}

/// Latch two handles for an operation spanning two directories. Acquisition
/// follows the total order on the handle tuple, which keeps concurrent
/// two-handle holders deadlock free. The same handle passed twice is
/// latched once.
pub fn acquire_pair(
    a: &Arc<InternalFh>,
    b: &Arc<InternalFh>,
    level: LockLevel,
    terminating: &AtomicBool,
) -> Result<()> {
    if a.fh == b.fh {
        return a.acquire(level, terminating);
    }
    let (first, second) = if a.fh < b.fh { (a, b) } else { (b, a) };
    first.acquire(level, terminating)?;
    if let Err(err) = second.acquire(level, terminating) {
        first.release();
        return Err(err);
    }
    Ok(())
}

/// Release the pair latched by [`acquire_pair`].
pub fn release_pair(a: &Arc<InternalFh>, b: &Arc<InternalFh>) {
    if a.fh == b.fh {
        a.release();
        return;
    }
    a.release();
    b.release();
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::Duration;

    use super::super::{Fattr, FhTable, ZfsFh};
    use super::*;
    use crate::metadata::record::MetadataRecord;

    fn handle(ino: u32) -> Arc<InternalFh> {
        let mut table = FhTable::new();
        table.intern(ZfsFh::new(2, 7, 11, ino, 1), Fattr::default(), MetadataRecord::default())
    }

    #[test]
    fn shared_holders_stack() {
        let ifh = handle(1);
        let term = AtomicBool::new(false);
        ifh.acquire(LockLevel::Shared, &term).unwrap();
        ifh.acquire(LockLevel::Shared, &term).unwrap();
        assert_eq!(ifh.data.lock().users, 2);
        ifh.release();
        ifh.release();
        assert_eq!(ifh.data.lock().level, LockLevel::Unlocked);
    }

    #[test]
    fn exclusive_excludes_and_wakes() {
        let ifh = handle(1);
        let term = Arc::new(AtomicBool::new(false));
        ifh.acquire(LockLevel::Exclusive, &term).unwrap();

        let waiter = {
            let ifh = ifh.clone();
            let term = term.clone();
            std::thread::spawn(move || {
                ifh.acquire(LockLevel::Shared, &term).unwrap();
                ifh.release();
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        ifh.release();
        waiter.join().unwrap();
        assert_eq!(ifh.data.lock().level, LockLevel::Unlocked);
    }

    #[test]
    fn termination_releases_waiters() {
        let ifh = handle(1);
        let term = Arc::new(AtomicBool::new(false));
        ifh.acquire(LockLevel::Exclusive, &term).unwrap();

        let waiter = {
            let ifh = ifh.clone();
            let term = term.clone();
            std::thread::spawn(move || ifh.acquire(LockLevel::Exclusive, &term))
        };
        std::thread::sleep(Duration::from_millis(20));
        term.store(true, std::sync::atomic::Ordering::Release);
        ifh.interrupt();
        assert_eq!(waiter.join().unwrap(), Err(ZfsError::Exiting));
        ifh.release();
    }

    #[test]
    fn pair_acquisition_orders_by_handle() {
        let a = handle(1);
        let b = handle(2);
        let term = AtomicBool::new(false);
        acquire_pair(&a, &b, LockLevel::Exclusive, &term).unwrap();
        assert_eq!(a.data.lock().level, LockLevel::Exclusive);
        assert_eq!(b.data.lock().level, LockLevel::Exclusive);
        release_pair(&a, &b);

        // same handle twice latches once
        acquire_pair(&a, &a, LockLevel::Exclusive, &term).unwrap();
        release_pair(&a, &a);
        assert_eq!(a.data.lock().level, LockLevel::Unlocked);
    }
}
