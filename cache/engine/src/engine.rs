//! Request preparation pipeline.
//!
//! `prepare_clines` is the entry point for one request: walk its core
//! lines under the hash-bucket read set, then either take the line locks
//! (fully mapped), bail out (promotion denied, partition disabled), map
//! from the freelist under the exclusive bucket set, or fall back to
//! eviction under the global exclusive lock. `map` and
//! `map_hndl_error` form a transactional pair: any failure mid-map
//! returns every line inserted so far to the freelist.
//!
//! Suspension is state, not stack: a request that cannot take all its
//! line locks parks in the line-lock waiter queues and re-enters through
//! `on_resume`, which installs the refresh interface and re-queues the
//! request at the front of its queue.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cache::Cache;
use crate::concurrency::{LockKind, LockResult};
use crate::error::{EngineError, Result};
use crate::line::{CacheLine, CoreId, CoreLine, INVALID_LINE, SECTOR_SIZE};
use crate::metadata::Metadata;
use crate::policy::{
    CleanerAttribs, EngineCallbacks, EvictOutcome, IoHandler, LockType,
};
use crate::request::{IoDir, IoPhase, LookupStatus, MapEntry, ReqState, Request};

/// Compute per-entry hash buckets and the request's sorted bucket set.
///
/// Returns a local copy of the set so callers can unlock buckets without
/// touching request state (the state mutex must never be held while
/// bucket locks are being acquired).
fn req_hash(req: &Arc<Request>) -> Vec<u32> {
    let cache = req.cache();
    let mut state = req.state.lock();
    let core_id = req.core_id();

    for idx in 0..state.map.len() {
        let core_line = req.core_line_first() + idx as u64;
        state.map[idx].hash_bucket = cache.metadata().hash_func(core_id, core_line);
    }

    let mut buckets: Vec<u32> = state.map.iter().map(|e| e.hash_bucket).collect();
    buckets.sort_unstable();
    buckets.dedup();
    state.buckets = buckets.clone();
    buckets
}

/// Look up one core line in its collision chain.
///
/// Starts from a miss and records the bucket either way, so a later
/// insert knows where to splice. Caller must hold the bucket's lock.
pub fn lookup_map_entry(
    cache: &Cache,
    entry: &mut MapEntry,
    core_id: CoreId,
    core_line: CoreLine,
) {
    let md = cache.metadata();
    let bucket = md.hash_func(core_id, core_line);

    entry.hash_bucket = bucket;
    entry.status = LookupStatus::Miss;
    entry.coll_idx = INVALID_LINE;
    entry.core_id = core_id;
    entry.core_line = core_line;

    let mut line = md.hash_head(bucket);
    while line != INVALID_LINE {
        let (curr_core_id, curr_core_line) = md.core_info(line);
        if curr_core_id == core_id && curr_core_line == core_line {
            entry.coll_idx = line;
            entry.status = LookupStatus::Hit;
            break;
        }
        line = md.collision_next(line);
    }
}

/// True if map entries `idx` and `idx + 1` are both mapped and their
/// cache lines are physically adjacent.
fn clines_phys_cont(md: &Metadata, state: &ReqState, idx: usize) -> bool {
    let first = &state.map[idx];
    let second = &state.map[idx + 1];

    if first.status == LookupStatus::Miss || second.status == LookupStatus::Miss {
        return false;
    }

    let phys1 = md.lg2phy(first.coll_idx);
    let phys2 = md.lg2phy(second.coll_idx);
    phys1 < phys2 && phys1 + 1 == phys2
}

/// Fold entry `idx` into the request's aggregate counters.
fn update_req_info(req: &Request, state: &mut ReqState, idx: usize) {
    let md = req.cache().metadata();
    let start = req.line_start_sector(idx);
    let end = req.line_end_sector(idx);

    match state.map[idx].status {
        LookupStatus::Hit => {
            let line = state.map[idx].coll_idx;
            if md.test_valid_sec(line, start, end) {
                state.info.hit_no += 1;
            } else {
                state.info.invalid_no += 1;
            }

            if md.test_dirty(line) {
                state.info.dirty_any += 1;
                if md.test_dirty_all_sec(line, start, end) {
                    state.info.dirty_all += 1;
                }
            }

            if req.part_id() != md.partition_id(line) {
                // Line needs to move to the request's partition after
                // the mapping commits.
                state.map[idx].re_part = true;
                state.info.re_part_no += 1;
            }
        }
        LookupStatus::Inserted => state.info.insert_no += 1,
        LookupStatus::Miss => {}
        LookupStatus::Remapped => {
            debug_assert!(false, "remapped entries update via patch_req_info")
        }
    }

    if idx > 0 && clines_phys_cont(md, state, idx - 1) {
        state.info.seq_no += 1;
    }
}

/// Counter update for a `Remapped` entry: one insert, plus contiguity
/// against both neighbors.
pub(crate) fn patch_req_info(md: &Metadata, state: &mut ReqState, idx: usize) {
    debug_assert_eq!(state.map[idx].status, LookupStatus::Remapped);

    state.info.insert_no += 1;

    if idx > 0 && clines_phys_cont(md, state, idx - 1) {
        state.info.seq_no += 1;
    }
    if idx + 1 < state.map.len() && clines_phys_cont(md, state, idx) {
        state.info.seq_no += 1;
    }
}

/// Walk the request's core lines, recording hits and aggregate info.
///
/// Caller must hold the request's bucket set (shared is enough) or the
/// global exclusive lock.
pub fn traverse(req: &Arc<Request>) {
    let cache = Arc::clone(req.cache());
    let mut state = req.state.lock();
    state.clear_info();
    let core_id = req.core_id();

    for idx in 0..state.map.len() {
        let core_line = req.core_line_first() + idx as u64;
        lookup_map_entry(&cache, &mut state.map[idx], core_id, core_line);

        if state.map[idx].status != LookupStatus::Hit {
            debug!(core_line, "miss");
            continue;
        }

        debug!(core_line, line = state.map[idx].coll_idx, "hit");
        cache.eviction().set_hot(state.map[idx].coll_idx);
        update_req_info(req, &mut state, idx);
    }
}

/// Re-validate a request's mapping after a suspension.
///
/// Returns `true` when every non-miss entry still maps to the same
/// `(core_id, core_line)`; entries that changed are flagged invalid.
/// Caller must hold the request's bucket set shared.
pub fn check(req: &Arc<Request>) -> bool {
    let cache = Arc::clone(req.cache());
    let mut state = req.state.lock();
    state.clear_info();
    let mut consistent = true;

    for idx in 0..state.map.len() {
        if state.map[idx].status == LookupStatus::Miss {
            continue;
        }

        let (core_id, core_line) = cache.metadata().core_info(state.map[idx].coll_idx);
        if core_id != state.map[idx].core_id || core_line != state.map[idx].core_line {
            debug!(line = state.map[idx].coll_idx, "mapping changed under request");
            state.map[idx].invalid = true;
            consistent = false;
        } else {
            state.map[idx].invalid = false;
            update_req_info(req, &mut state, idx);
        }
    }

    consistent
}

fn map_cache_line_locked(
    cache: &Arc<Cache>,
    req: &Request,
    state: &mut ReqState,
    idx: usize,
    line: CacheLine,
) {
    let md = cache.metadata();
    let bucket = state.map[idx].hash_bucket;
    let core_line = req.core_line_first() + idx as u64;

    md.start_shared_access(line);
    md.add_to_collision(req.core_id(), core_line, bucket, line);
    md.end_shared_access(line);

    cache.cleaning_policy().init_cache_block(cache, line);

    state.map[idx].coll_idx = line;
}

/// Splice `line` into the collision chain for map entry `idx` and run
/// the cleaning policy's per-line init hook.
///
/// Caller must hold the exclusive bucket lock for the entry's bucket or
/// the global exclusive lock. The line must already belong to a
/// partition.
pub fn map_cache_line(req: &Arc<Request>, idx: usize, line: CacheLine) {
    let cache = Arc::clone(req.cache());
    let mut state = req.state.lock();
    map_cache_line_locked(&cache, req, &mut state, idx, line);
}

/// Hand an eviction victim directly to map entry `idx`.
///
/// The line must be fully invalid and detached: not on the freelist, in
/// no partition, in no collision chain. It joins the request's
/// partition, hosts the entry's core line and is marked `Remapped`.
///
/// Same locking requirements as [`map_cache_line`]; intended for
/// eviction policies running under the global exclusive lock.
pub fn remap_cache_line(req: &Arc<Request>, idx: usize, line: CacheLine) {
    let cache = Arc::clone(req.cache());
    let mut state = req.state.lock();

    cache.partitions().add(cache.metadata(), req.part_id(), line);
    map_cache_line_locked(&cache, req, &mut state, idx, line);
    cache.eviction().init_cache_line(line);
    cache.eviction().set_hot(line);

    state.map[idx].status = LookupStatus::Remapped;
    patch_req_info(cache.metadata(), &mut state, idx);
}

/// Allocate a freelist line for entry `idx`: partition membership,
/// collision splice, eviction init + hot.
fn map_line(cache: &Arc<Cache>, req: &Request, state: &mut ReqState, idx: usize) {
    let Some(line) = cache.freelist().pop() else {
        state.mapping_error = true;
        return;
    };

    cache.partitions().add(cache.metadata(), req.part_id(), line);
    map_cache_line_locked(cache, req, state, idx, line);

    cache.eviction().init_cache_line(line);
    cache.eviction().set_hot(line);
}

/// Undo a partially committed `map`: every `Inserted`/`Remapped` entry
/// goes back to `Miss` and its line is invalidated without writeback,
/// which returns it to the freelist. `Hit` and `Miss` entries are
/// untouched.
fn map_hndl_error(cache: &Cache, state: &mut ReqState) {
    let end = cache.metadata().line_end_sector();

    for entry in state.map.iter_mut() {
        match entry.status {
            LookupStatus::Hit | LookupStatus::Miss => {}
            LookupStatus::Inserted | LookupStatus::Remapped => {
                debug!(line = entry.coll_idx, "canceling cache line");
                entry.status = LookupStatus::Miss;
                let line = entry.coll_idx;
                entry.coll_idx = INVALID_LINE;

                cache.metadata().start_shared_access(line);
                cache.set_invalid_no_flush(0, end, line);
                cache.metadata().end_shared_access(line);
            }
        }
    }
}

/// Map every missed core line to a freelist line.
///
/// Short-circuits when nothing is unmapped; flags a mapping error (and
/// commits nothing further) when the freelist cannot cover the misses.
/// Each entry is looked up again first: state may have changed since the
/// original traverse, the bucket set having been re-acquired since.
///
/// Caller must hold the exclusive bucket set or the global exclusive
/// lock.
pub fn map(req: &Arc<Request>) {
    let cache = Arc::clone(req.cache());
    let mut state = req.state.lock();

    let unmapped = state.unmapped_count();
    if unmapped == 0 {
        return;
    }
    if unmapped as u64 > cache.freelist().count() {
        state.mapping_error = true;
        return;
    }

    state.clear_info();
    let core_id = req.core_id();

    for idx in 0..state.map.len() {
        let core_line = req.core_line_first() + idx as u64;
        lookup_map_entry(&cache, &mut state.map[idx], core_id, core_line);

        if state.map[idx].status != LookupStatus::Hit {
            map_line(&cache, req, &mut state, idx);

            if state.mapping_error {
                debug!("mapping error, unwinding");
                map_hndl_error(&cache, &mut state);
                break;
            }

            state.map[idx].status = LookupStatus::Inserted;
        }

        update_req_info(req, &mut state, idx);
    }

    let success = !state.mapping_error;
    drop(state);

    if success {
        // The lines are in cache now; the promotion policy can forget
        // about them.
        cache.promotion().purge(req);
    }
}

/// Take the line locks the engine variant asked for.
fn lock_clines(cache: &Cache, req: &Arc<Request>, state: &mut ReqState) -> Result<LockResult> {
    match req.callbacks().lock_type(req) {
        LockType::None => Ok(LockResult::Acquired),
        LockType::Read => cache.line_locks().lock_request(req, state, LockKind::Read),
        LockType::Write => cache.line_locks().lock_request(req, state, LockKind::Write),
    }
}

fn prepare_clines_miss(
    cache: &Arc<Cache>,
    req: &Arc<Request>,
    buckets: &[u32],
) -> Result<LockResult> {
    // Requests to disabled partitions go pass-through.
    if !cache.partitions().is_enabled(req.part_id()) {
        req.state.lock().mapping_error = true;
        cache.bucket_locks().unlock_shared(buckets);
        return Err(EngineError::NoLock);
    }

    let unmapped = req.state.lock().unmapped_count();
    if cache.partitions().has_space(req.part_id(), unmapped) {
        // Mapping needs at least the exclusive bucket set.
        cache.bucket_locks().upgrade(buckets);

        map(req);

        let mut map_failed = false;
        let mut result = Ok(LockResult::Acquired);
        {
            let mut state = req.state.lock();
            if state.mapping_error {
                map_failed = true;
            } else {
                result = lock_clines(cache, req, &mut state);
                if result.is_err() {
                    // Mapping succeeded but the lock did not. Don't
                    // evict over a lock failure; report it.
                    state.mapping_error = true;
                }
            }
        }
        cache.bucket_locks().unlock_exclusive(buckets);

        if !map_failed {
            return result;
        }
    } else {
        cache.bucket_locks().unlock_shared(buckets);
    }

    // Eviction path, under the global exclusive lock.
    cache.bucket_locks().lock_global_exclusive();

    // Re-traverse to pick up whatever changed while no locks were held.
    traverse(req);

    let unmapped = req.state.lock().unmapped_count();
    {
        let mut state = req.state.lock();
        state.part_evict = !cache.partitions().has_space(req.part_id(), unmapped);
    }

    if cache.eviction().evict_do(cache, req, unmapped) == EvictOutcome::Exhausted {
        req.state.lock().mapping_error = true;
        cache.bucket_locks().unlock_global_exclusive();
        return Err(EngineError::NoSpace);
    }

    map(req);
    if req.state.lock().mapping_error {
        cache.bucket_locks().unlock_global_exclusive();
        return Err(EngineError::NoSpace);
    }

    let result = {
        let mut state = req.state.lock();
        let result = lock_clines(cache, req, &mut state);
        if result.is_err() {
            state.mapping_error = true;
        }
        result
    };
    cache.bucket_locks().unlock_global_exclusive();
    result
}

/// Prepare one request: lookup, map or evict as needed, take line locks.
///
/// On `Ok(Pending)` the request parks until its locks are granted, then
/// re-enters through the refresh interface. On any `Err` the request's
/// `mapping_error` flag tells the variant to go pass-through.
pub fn prepare_clines(req: &Arc<Request>) -> Result<LockResult> {
    let cache = Arc::clone(req.cache());

    // Hashes first, for bucket locking; the local copy of the bucket set
    // lets us unlock without re-entering request state.
    let buckets = req_hash(req);

    // Bucket read locks keep the mapping stable during traversal.
    cache.bucket_locks().lock_shared(&buckets);
    traverse(req);

    {
        let mut state = req.state.lock();
        if state.is_mapped() {
            let result = lock_clines(&cache, req, &mut state);
            drop(state);
            cache.bucket_locks().unlock_shared(&buckets);
            return result;
        }
    }

    if !cache.promotion().should_promote(req) {
        req.state.lock().mapping_error = true;
        cache.bucket_locks().unlock_shared(&buckets);
        return Err(EngineError::NoLock);
    }

    prepare_clines_miss(&cache, req, &buckets)
}

/// Flush the request's dirty hit lines through the cleaner.
///
/// The getter yields the `coll_idx` of each dirty hit in map order. On
/// success the dirty counters are zeroed and the request continues from
/// the front of its queue; on failure its line locks are released and it
/// completes with the cleaner's error.
pub fn clean(req: &Arc<Request>) {
    let cache = Arc::clone(req.cache());
    let count = req.state.lock().info.dirty_any;

    let getter = {
        let cache = Arc::clone(&cache);
        let req = Arc::clone(req);
        let mut item = 0usize;
        Box::new(move || {
            let state = req.state.lock();
            while item < state.map.len() {
                let entry = &state.map[item];
                item += 1;

                if entry.status != LookupStatus::Hit {
                    continue;
                }
                if !cache.metadata().test_dirty(entry.coll_idx) {
                    continue;
                }
                return Some(entry.coll_idx);
            }
            None
        })
    };

    let complete = {
        let req = Arc::clone(req);
        Box::new(move |result: Result<()>| clean_end(&req, result))
    };

    let attribs = CleanerAttribs {
        lock_cachelines: false,
        count,
        queue: Arc::clone(req.queue()),
        getter,
        complete,
    };

    cache.cleaner().fire(&cache, attribs);
}

fn clean_end(req: &Arc<Request>, result: Result<()>) {
    match result {
        Err(err) => {
            debug!("cleaning error");
            req.state.lock().error = Some(err);
            req.cache().line_locks().unlock_request(req);
            req.complete(Err(err));
        }
        Ok(()) => {
            {
                let mut state = req.state.lock();
                state.info.dirty_any = 0;
                state.info.dirty_all = 0;
            }
            push_req_front(Arc::clone(req), true);
        }
    }
}

/// All pending line locks were granted: install the refresh interface
/// and re-queue the request at the front.
pub fn on_resume(req: Arc<Request>) {
    {
        let mut state = req.state.lock();
        if let IoPhase::Normal(io) = state.phase.clone() {
            state.phase = IoPhase::Refreshing { saved: io };
        } else {
            debug_assert!(false, "resume with refresh already installed");
        }
        // The error slot is cleared only here, when the refresh
        // interface is installed; plain front pushes preserve it.
        state.error = None;
    }
    debug!("request resumed");
    push_req_front(req, false);
}

/// Re-validate a resumed request's mapping, then either restore its
/// saved interface and dispatch, or fail it with `Inval`.
fn refresh(req: Arc<Request>) {
    let cache = Arc::clone(req.cache());
    let buckets = req.state.lock().buckets.clone();

    cache.bucket_locks().lock_shared(&buckets);
    let consistent = check(&req);
    cache.bucket_locks().unlock_shared(&buckets);

    if consistent {
        let io = {
            let mut state = req.state.lock();
            let IoPhase::Refreshing { saved } = state.phase.clone() else {
                debug_assert!(false, "refresh without a saved interface");
                return;
            };
            state.phase = IoPhase::Normal(Arc::clone(&saved));
            saved
        };
        match req.rw() {
            IoDir::Read => io.read(req),
            IoDir::Write => io.write(req),
        }
    } else {
        warn!("inconsistent request, failing");
        req.state.lock().error = Some(EngineError::Inval);
        cache.line_locks().unlock_request(&req);
        req.complete(Err(EngineError::Inval));
    }
}

/// Run a dequeued request: refresh first if one is pending, otherwise
/// straight into its I/O interface.
pub fn dispatch(req: Arc<Request>) {
    let phase = req.state.lock().phase.clone();
    match phase {
        IoPhase::Refreshing { .. } => refresh(req),
        IoPhase::Normal(io) => match req.rw() {
            IoDir::Read => io.read(req),
            IoDir::Write => io.write(req),
        },
    }
}

/// Append the request to its queue. Ownership transfers with the push.
pub fn push_req_back(req: Arc<Request>, allow_sync: bool) {
    if !req.is_internal() {
        req.cache().touch();
    }
    let queue = Arc::clone(req.queue());
    queue.push_back(req, allow_sync);
}

/// Prepend the request to its queue. Ownership transfers with the push.
pub fn push_req_front(req: Arc<Request>, allow_sync: bool) {
    if !req.is_internal() {
        req.cache().touch();
    }
    let queue = Arc::clone(req.queue());
    queue.push_front(req, allow_sync);
}

/// Account the request's bytes against its partition.
pub fn update_block_stats(req: &Request) {
    req.cache()
        .stats()
        .block_update(req.part_id(), req.rw(), req.byte_length() as u64);
}

/// Classify the finished request into full hit / partial hit / miss.
pub fn update_request_stats(req: &Request) {
    let info = req.info();
    req.cache()
        .stats()
        .request_update(req.part_id(), req.rw(), info.hit_no, req.core_line_count());
}

/// Report a request-level error, optionally stopping the cache.
pub fn error(req: &Request, stop_cache: bool, msg: &str) {
    if stop_cache {
        req.cache().stop();
    }
    tracing::error!(
        core = req.core_id(),
        sector = req.byte_position() / SECTOR_SIZE,
        bytes = req.byte_length(),
        "{msg}"
    );
}

/// Engine callbacks deriving the lock mode from the request direction,
/// resuming through [`on_resume`].
pub struct DefaultCallbacks;

impl EngineCallbacks for DefaultCallbacks {
    fn lock_type(&self, req: &Request) -> LockType {
        match req.rw() {
            IoDir::Read => LockType::Read,
            IoDir::Write => LockType::Write,
        }
    }

    fn resume(&self, req: Arc<Request>) {
        on_resume(req);
    }
}

/// I/O interface that touches no devices: releases the request's line
/// locks and completes successfully. Stands in for an engine variant's
/// epilogue.
pub struct NopIo;

impl IoHandler for NopIo {
    fn read(&self, req: Arc<Request>) {
        req.cache().line_locks().unlock_request(&req);
        req.complete(Ok(()));
    }

    fn write(&self, req: Arc<Request>) {
        req.cache().line_locks().unlock_request(&req);
        req.complete(Ok(()));
    }
}
