//! Bounded worker-thread pools.
//!
//! The daemon runs three pools: `kernel` for host-binding calls, `network`
//! for incoming RPC requests and `update` for background synchronization.
//! Each pool keeps `min_spare <= idle <= max_spare` and `total <=
//! max_total`; a regulator thread terminates excess idle workers and
//! spawns new ones under pressure. A worker pulls one task, runs it to
//! completion and re-parks.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, Sender};
use parking_lot::Mutex;
use serde::Deserialize;
use tracing::{debug, trace};

use crate::error::{Result, ZfsError};

/// A unit of pool work.
pub type Task = Box<dyn FnOnce() + Send>;

enum Job {
    Run(Task),
    Exit,
}

/// Worker-count bounds of one pool.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Deserialize)]
pub struct PoolLimits {
    pub max_total: u32,
    pub min_spare: u32,
    pub max_spare: u32,
}

impl PoolLimits {
    /// Clamp nonsense figures into a workable shape.
    pub fn sanitized(self) -> PoolLimits {
        let max_total = self.max_total.max(1);
        let max_spare = self.max_spare.clamp(1, max_total);
        let min_spare = self.min_spare.clamp(1, max_spare);
        PoolLimits { max_total, min_spare, max_spare }
    }
}

impl Default for PoolLimits {
    fn default() -> Self {
        PoolLimits { max_total: 16, min_spare: 2, max_spare: 8 }
    }
}

struct PoolState {
    idle: u32,
    total: u32,
}

struct Shared {
    name: &'static str,
    limits: PoolLimits,
    tx: Sender<Job>,
    rx: Receiver<Job>,
    state: Mutex<PoolState>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    terminating: AtomicBool,
}

/// One worker pool.
pub struct ThreadPool {
    shared: Arc<Shared>,
    regulator: Mutex<Option<JoinHandle<()>>>,
}

const REGULATOR_TICK: Duration = Duration::from_millis(100);

impl ThreadPool {
    /// Create the pool and bring up the initial spare workers plus the
    /// regulator thread.
    pub fn new(name: &'static str, limits: PoolLimits) -> ThreadPool {
        let limits = limits.sanitized();
        let (tx, rx) = unbounded();
        let shared = Arc::new(Shared {
            name,
            limits,
            tx,
            rx,
            state: Mutex::new(PoolState { idle: 0, total: 0 }),
            handles: Mutex::new(Vec::new()),
            terminating: AtomicBool::new(false),
        });
        regulate(&shared);

        let regulator = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name(format!("{name}-regulator"))
                .spawn(move || {
                    while !shared.terminating.load(Ordering::Acquire) {
                        std::thread::sleep(REGULATOR_TICK);
                        regulate(&shared);
                    }
                })
                .expect("spawning pool regulator")
        };
        ThreadPool { shared, regulator: Mutex::new(Some(regulator)) }
    }

    /// Hand one task to the pool.
    pub fn submit(&self, task: Task) -> Result<()> {
        if self.shared.terminating.load(Ordering::Acquire) {
            return Err(ZfsError::Exiting);
        }
        // under pressure the regulator lags a tick; grow eagerly
        {
            let state = self.shared.state.lock();
            if state.idle == 0 && state.total < self.shared.limits.max_total {
                drop(state);
                spawn_worker(&self.shared);
            }
        }
        self.shared.tx.send(Job::Run(task)).map_err(|_| ZfsError::Exiting)
    }

    /// Workers alive right now.
    pub fn total(&self) -> u32 {
        self.shared.state.lock().total
    }

    /// Idle workers right now.
    pub fn idle(&self) -> u32 {
        self.shared.state.lock().idle
    }

    /// Flag shutdown, wake every worker and join them all. Queued tasks
    /// still drain; workers exit once the queue hands them an exit job.
    pub fn shutdown(&self) {
        if self.shared.terminating.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(pool = self.shared.name, "terminating pool");
        if let Some(regulator) = self.regulator.lock().take() {
            let _ = regulator.join();
        }
        let total = self.shared.state.lock().total;
        for _ in 0..total {
            let _ = self.shared.tx.send(Job::Exit);
        }
        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.shared.handles.lock());
        for handle in handles {
            let _ = handle.join();
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Enforce `min_spare <= idle <= max_spare` and the total bound.
fn regulate(shared: &Arc<Shared>) {
    let (mut to_spawn, to_kill) = {
        let state = shared.state.lock();
        let spawn = shared
            .limits
            .min_spare
            .saturating_sub(state.idle)
            .min(shared.limits.max_total.saturating_sub(state.total));
        let kill = state.idle.saturating_sub(shared.limits.max_spare);
        (spawn, kill)
    };
    while to_spawn > 0 {
        spawn_worker(shared);
        to_spawn -= 1;
    }
    for _ in 0..to_kill {
        let _ = shared.tx.send(Job::Exit);
    }
}

fn spawn_worker(shared: &Arc<Shared>) {
    {
        let mut state = shared.state.lock();
        if state.total >= shared.limits.max_total {
            return;
        }
        state.total += 1;
    }
    let worker_shared = shared.clone();
    let handle = std::thread::Builder::new()
        .name(format!("{}-worker", shared.name))
        .spawn(move || worker_loop(worker_shared))
        .expect("spawning pool worker");
    shared.handles.lock().push(handle);
}

fn worker_loop(shared: Arc<Shared>) {
    trace!(pool = shared.name, "worker up");
    loop {
        shared.state.lock().idle += 1;
        let job = shared.rx.recv();
        shared.state.lock().idle -= 1;
        match job {
            Ok(Job::Run(task)) => task(),
            Ok(Job::Exit) | Err(_) => break,
        }
    }
    shared.state.lock().total -= 1;
    trace!(pool = shared.name, "worker down");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::sync::Arc;

    use super::*;

    fn settle() {
        std::thread::sleep(Duration::from_millis(250));
    }

    #[test]
    fn executes_submitted_tasks() {
        let pool = ThreadPool::new("test", PoolLimits { max_total: 4, min_spare: 1, max_spare: 2 });
        let counter = Arc::new(AtomicU32::new(0));
        for _ in 0..16 {
            let counter = counter.clone();
            pool.submit(Box::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();
        }
        settle();
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    }

    #[test]
    fn keeps_spares_within_bounds() {
        let pool = ThreadPool::new("test", PoolLimits { max_total: 8, min_spare: 2, max_spare: 3 });
        settle();
        let idle = pool.idle();
        assert!((2..=3).contains(&idle), "idle={idle}");
        assert!(pool.total() <= 8);
    }

    #[test]
    fn shutdown_rejects_new_work() {
        let pool = ThreadPool::new("test", PoolLimits::default());
        pool.shutdown();
        let err = pool.submit(Box::new(|| {})).unwrap_err();
        assert_eq!(err, ZfsError::Exiting);
        assert_eq!(pool.total(), 0);
    }
}
