//! Locking tiers for the metadata plane.
//!
//! Three tiers, acquired strictly in this order:
//!
//! 1. **Hash-bucket locks** — per-bucket read/write, taken in ascending
//!    bucket order across a request's sorted bucket set. An upgrade
//!    releases the shared set and re-acquires exclusive in the same
//!    order; callers re-validate afterwards.
//! 2. **Per-cache-line locks** — read/write with FIFO waiters. Never
//!    block a thread: a request that cannot take all its lines
//!    synchronously parks as a waiter and is resumed when the last
//!    pending line is granted.
//! 3. **Global exclusive lock** — held only around the eviction/remap
//!    path; mutually exclusive with every hash-bucket holder (bucket
//!    holders keep the global lock shared).
//!
//! Lock-ordering rule observed throughout the crate: bucket locks are
//! never acquired while a request's state mutex is held, and the waiter
//! registry is a leaf (no other lock is taken while it is held, except
//! briefly the state mutex of the request being granted).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{EngineError, Result};
use crate::line::{CacheLine, INVALID_LINE};
use crate::request::{ReqState, Request};
use crate::sync::{spin_loop, yield_now, AtomicU32, Ordering};

const WRITER: u32 = 1 << 31;

/// Spins before yielding, to keep short critical sections cheap.
const SPIN_BUDGET: u32 = 128;

/// Minimal spinning reader-writer lock word.
struct RwSpin {
    word: AtomicU32,
}

impl RwSpin {
    fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
        }
    }

    fn lock_shared(&self) {
        let mut spins = 0;
        loop {
            let curr = self.word.load(Ordering::Relaxed);
            if curr & WRITER == 0
                && self
                    .word
                    .compare_exchange_weak(curr, curr + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            spins += 1;
            if spins > SPIN_BUDGET {
                yield_now();
            } else {
                spin_loop();
            }
        }
    }

    fn unlock_shared(&self) {
        self.word.fetch_sub(1, Ordering::Release);
    }

    fn lock_exclusive(&self) {
        let mut spins = 0;
        while self
            .word
            .compare_exchange_weak(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            spins += 1;
            if spins > SPIN_BUDGET {
                yield_now();
            } else {
                spin_loop();
            }
        }
    }

    fn unlock_exclusive(&self) {
        self.word.store(0, Ordering::Release);
    }
}

/// Hash-bucket locks plus the global metadata lock.
///
/// Bucket holders keep the global lock shared; the eviction path takes
/// the global lock exclusive, which drains and excludes every bucket
/// holder without touching individual buckets.
pub struct BucketLocks {
    global: RwSpin,
    buckets: Box<[RwSpin]>,
}

impl BucketLocks {
    /// One lock per hash bucket.
    pub fn new(buckets: u32) -> Self {
        Self {
            global: RwSpin::new(),
            buckets: (0..buckets).map(|_| RwSpin::new()).collect(),
        }
    }

    /// Take the request's bucket set shared. `buckets` must be sorted and
    /// deduplicated.
    pub fn lock_shared(&self, buckets: &[u32]) {
        debug_assert!(buckets.windows(2).all(|w| w[0] < w[1]));
        self.global.lock_shared();
        for &bucket in buckets {
            self.buckets[bucket as usize].lock_shared();
        }
    }

    /// Release a shared bucket set.
    pub fn unlock_shared(&self, buckets: &[u32]) {
        for &bucket in buckets.iter().rev() {
            self.buckets[bucket as usize].unlock_shared();
        }
        self.global.unlock_shared();
    }

    /// Take the request's bucket set exclusive. `buckets` must be sorted
    /// and deduplicated.
    pub fn lock_exclusive(&self, buckets: &[u32]) {
        debug_assert!(buckets.windows(2).all(|w| w[0] < w[1]));
        self.global.lock_shared();
        for &bucket in buckets {
            self.buckets[bucket as usize].lock_exclusive();
        }
    }

    /// Release an exclusive bucket set.
    pub fn unlock_exclusive(&self, buckets: &[u32]) {
        for &bucket in buckets.iter().rev() {
            self.buckets[bucket as usize].unlock_exclusive();
        }
        self.global.unlock_shared();
    }

    /// Upgrade a held shared set to exclusive.
    ///
    /// The shared set is released first, then exclusive locks are taken
    /// in ascending order, so two upgrading requests with overlapping
    /// sets cannot deadlock. Metadata may change in the window; callers
    /// re-validate every mapping afterwards.
    pub fn upgrade(&self, buckets: &[u32]) {
        for &bucket in buckets.iter().rev() {
            self.buckets[bucket as usize].unlock_shared();
        }
        for &bucket in buckets {
            self.buckets[bucket as usize].lock_exclusive();
        }
    }

    /// Take the global metadata lock exclusive.
    pub fn lock_global_exclusive(&self) {
        self.global.lock_exclusive();
    }

    /// Release the global metadata lock.
    pub fn unlock_global_exclusive(&self) {
        self.global.unlock_exclusive();
    }
}

/// Lock mode for a request's cache lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockKind {
    /// Shared access, many readers.
    Read,
    /// Exclusive access, single writer.
    Write,
}

/// Outcome of an asynchronous lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    /// Every line lock was taken synchronously.
    Acquired,
    /// At least one line is contended; the request's resume callback
    /// fires once the last pending line is granted.
    Pending,
}

struct Waiter {
    req: Arc<Request>,
    idx: usize,
    kind: LockKind,
}

/// Per-cache-line read/write locks with FIFO waiters.
pub struct LineLocks {
    words: Box<[AtomicU32]>,
    waiters: Mutex<HashMap<CacheLine, VecDeque<Waiter>, ahash::RandomState>>,
}

impl LineLocks {
    /// One lock word per cache line.
    pub fn new(lines: u32) -> Self {
        Self {
            words: (0..lines).map(|_| AtomicU32::new(0)).collect(),
            waiters: Mutex::new(HashMap::default()),
        }
    }

    /// Single non-blocking acquisition attempt.
    fn try_lock(&self, line: CacheLine, kind: LockKind) -> bool {
        let word = &self.words[line as usize];
        match kind {
            LockKind::Write => word
                .compare_exchange(0, WRITER, Ordering::Acquire, Ordering::Relaxed)
                .is_ok(),
            LockKind::Read => loop {
                let curr = word.load(Ordering::Relaxed);
                if curr & WRITER != 0 {
                    return false;
                }
                if word
                    .compare_exchange_weak(curr, curr + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
                {
                    return true;
                }
                spin_loop();
            },
        }
    }

    fn unlock_line(&self, line: CacheLine, kind: LockKind) {
        let word = &self.words[line as usize];
        match kind {
            LockKind::Write => word.store(0, Ordering::Release),
            LockKind::Read => {
                word.fetch_sub(1, Ordering::Release);
            }
        }
        self.grant_waiters(line);
    }

    /// Acquire `kind` locks on every mapped line of the request, in map
    /// order. Partial holds are kept; contended lines register FIFO
    /// waiters and the request's resume callback fires when the last one
    /// is granted.
    ///
    /// Fails with [`EngineError::NoLock`] if any entry is unmapped —
    /// locking is only defined for fully mapped requests.
    pub fn lock_request(
        &self,
        req: &Arc<Request>,
        state: &mut ReqState,
        kind: LockKind,
    ) -> Result<LockResult> {
        if state.map.iter().any(|e| e.coll_idx == INVALID_LINE) {
            return Err(EngineError::NoLock);
        }

        // Bias the countdown so grants fired mid-scan cannot resume the
        // request before the scan finishes.
        req.lock_pending.store(1, Ordering::Release);
        state.lock_kind = Some(kind);

        for idx in 0..state.map.len() {
            let line = state.map[idx].coll_idx;
            if self.try_lock(line, kind) {
                state.map[idx].locked = true;
                continue;
            }

            // Re-try under the registry lock so a concurrent release
            // cannot slip between the failed attempt and registration.
            let mut waiters = self.waiters.lock();
            if self.try_lock(line, kind) {
                state.map[idx].locked = true;
            } else {
                req.lock_pending.fetch_add(1, Ordering::AcqRel);
                waiters.entry(line).or_default().push_back(Waiter {
                    req: Arc::clone(req),
                    idx,
                    kind,
                });
            }
        }

        if req.lock_pending.fetch_sub(1, Ordering::AcqRel) == 1 {
            Ok(LockResult::Acquired)
        } else {
            Ok(LockResult::Pending)
        }
    }

    /// Release every line lock the request holds and hand the lines to
    /// the next waiters.
    pub fn unlock_request(&self, req: &Request) {
        let mut held = Vec::new();
        let kind;
        {
            let mut state = req.state.lock();
            kind = state.lock_kind.take();
            for entry in state.map.iter_mut() {
                if entry.locked {
                    entry.locked = false;
                    held.push(entry.coll_idx);
                }
            }
        }
        let Some(kind) = kind else {
            debug_assert!(held.is_empty());
            return;
        };
        for line in held {
            self.unlock_line(line, kind);
        }
    }

    /// Pop and grant as many front waiters of `line` as the lock word
    /// admits. Grant processing runs with no registry lock held.
    fn grant_waiters(&self, line: CacheLine) {
        let mut granted = Vec::new();
        {
            let mut waiters = self.waiters.lock();
            if let Some(queue) = waiters.get_mut(&line) {
                while let Some(kind) = queue.front().map(|w| w.kind) {
                    if !self.try_lock(line, kind) {
                        break;
                    }
                    if let Some(waiter) = queue.pop_front() {
                        granted.push(waiter);
                    }
                }
                if queue.is_empty() {
                    waiters.remove(&line);
                }
            }
        }

        for waiter in granted {
            {
                let mut state = waiter.req.state.lock();
                state.map[waiter.idx].locked = true;
            }
            if waiter.req.lock_pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                let req = Arc::clone(&waiter.req);
                let cbs = req.callbacks();
                cbs.resume(req);
            }
        }
    }

    /// True if no reader or writer holds `line`. Test hook.
    pub fn is_unlocked(&self, line: CacheLine) -> bool {
        self.words[line as usize].load(Ordering::Acquire) == 0
    }
}
