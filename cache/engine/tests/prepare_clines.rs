//! End-to-end tests for the request preparation pipeline.
//!
//! These drive `prepare_clines` against scripted collaborators, checking
//! the mapping outcomes, counter updates, lock handoff and the
//! unwind/refresh paths.

#![cfg(not(feature = "loom"))]

use std::sync::Arc;

use parking_lot::Mutex;

use cache_engine::engine;
use cache_engine::policy::{
    Cleaner, CleanerAttribs, CleaningPolicy, EvictOutcome, EvictionPolicy, PromotionPolicy,
};
use cache_engine::{
    Cache, CacheBuilder, CacheConfig, CacheLine, EngineError, IoDir, LockResult, LookupStatus,
    MapEntry, PartitionConfig, Request, RequestParams, RequestQueue, INVALID_CORE, INVALID_LINE,
};

const LINE_SIZE: u64 = 16 * 1024;

fn init_logs() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// =============================================================================
// Scripted collaborators
// =============================================================================

/// Eviction that reclaims members of the request's partition, recording
/// every hook call.
#[derive(Default)]
struct ScriptedEviction {
    inits: Mutex<Vec<CacheLine>>,
    hots: Mutex<Vec<CacheLine>>,
    victims: Mutex<Vec<CacheLine>>,
    exhausted: bool,
}

impl ScriptedEviction {
    fn exhausted() -> Self {
        Self {
            exhausted: true,
            ..Self::default()
        }
    }
}

impl EvictionPolicy for ScriptedEviction {
    fn init_cache_line(&self, line: CacheLine) {
        self.inits.lock().push(line);
    }

    fn set_hot(&self, line: CacheLine) {
        self.hots.lock().push(line);
    }

    fn evict_do(&self, cache: &Arc<Cache>, req: &Arc<Request>, count: u32) -> EvictOutcome {
        if self.exhausted {
            return EvictOutcome::Exhausted;
        }

        let md = cache.metadata();
        let victims: Vec<CacheLine> = cache
            .partitions()
            .iter(md, req.part_id())
            .take(count as usize)
            .collect();
        if victims.len() < count as usize {
            return EvictOutcome::Exhausted;
        }

        let end = md.line_end_sector();
        for &line in &victims {
            md.start_shared_access(line);
            cache.set_invalid_no_flush(0, end, line);
            md.end_shared_access(line);
        }
        self.victims.lock().extend(victims);
        EvictOutcome::Supplied
    }
}

/// Cleaner that drains the getter and completes with a scripted result.
struct RecordingCleaner {
    yielded: Mutex<Vec<CacheLine>>,
    counts: Mutex<Vec<u32>>,
    fail: Option<EngineError>,
}

impl RecordingCleaner {
    fn ok() -> Self {
        Self {
            yielded: Mutex::new(Vec::new()),
            counts: Mutex::new(Vec::new()),
            fail: None,
        }
    }

    fn failing(err: EngineError) -> Self {
        Self {
            fail: Some(err),
            ..Self::ok()
        }
    }
}

impl Cleaner for RecordingCleaner {
    fn fire(&self, _cache: &Arc<Cache>, attribs: CleanerAttribs) {
        let CleanerAttribs {
            mut getter,
            complete,
            count,
            ..
        } = attribs;
        self.counts.lock().push(count);
        while let Some(line) = getter() {
            self.yielded.lock().push(line);
        }
        match self.fail {
            Some(err) => complete(Err(err)),
            None => complete(Ok(())),
        }
    }
}

/// Promotion that counts purges and optionally denies admission.
struct CountingPromotion {
    admit: bool,
    purges: Mutex<u32>,
}

impl CountingPromotion {
    fn admit() -> Self {
        Self {
            admit: true,
            purges: Mutex::new(0),
        }
    }

    fn deny() -> Self {
        Self {
            admit: false,
            purges: Mutex::new(0),
        }
    }
}

impl PromotionPolicy for CountingPromotion {
    fn should_promote(&self, _req: &Arc<Request>) -> bool {
        self.admit
    }

    fn purge(&self, _req: &Arc<Request>) {
        *self.purges.lock() += 1;
    }
}

/// Cleaning policy that steals a freelist line from inside the per-line
/// init hook, forcing a mid-map allocation failure.
struct ThievingCleaning {
    stolen: Mutex<Option<CacheLine>>,
}

impl CleaningPolicy for ThievingCleaning {
    fn init_cache_block(&self, cache: &Cache, _line: CacheLine) {
        let mut stolen = self.stolen.lock();
        if stolen.is_none() {
            *stolen = cache.freelist().pop();
        }
    }
}

/// Cleaning policy that records every init hook call.
#[derive(Default)]
struct RecordingCleaning {
    inits: Mutex<Vec<CacheLine>>,
}

impl CleaningPolicy for RecordingCleaning {
    fn init_cache_block(&self, _cache: &Cache, line: CacheLine) {
        self.inits.lock().push(line);
    }
}

/// Eviction that hands freelist lines straight to the request's map
/// entries instead of recycling victims through the freelist.
struct RemappingEviction;

impl EvictionPolicy for RemappingEviction {
    fn init_cache_line(&self, _line: CacheLine) {}

    fn set_hot(&self, _line: CacheLine) {}

    fn evict_do(&self, cache: &Arc<Cache>, req: &Arc<Request>, _count: u32) -> EvictOutcome {
        for idx in 0..req.core_line_count() as usize {
            if req.map_entry(idx).status != LookupStatus::Miss {
                continue;
            }
            // A popped line is fully invalid and detached, exactly what
            // remapping requires.
            let Some(line) = cache.freelist().pop() else {
                return EvictOutcome::Exhausted;
            };
            engine::remap_cache_line(req, idx, line);
        }
        EvictOutcome::Supplied
    }
}

// =============================================================================
// Fixtures
// =============================================================================

struct Fixture {
    cache: Arc<Cache>,
    eviction: Arc<ScriptedEviction>,
    cleaning: Arc<RecordingCleaning>,
    cleaner: Arc<RecordingCleaner>,
    promotion: Arc<CountingPromotion>,
    queue: Arc<RequestQueue>,
}

fn fixture(lines: u32) -> Fixture {
    fixture_with(CacheConfig::new(lines))
}

fn fixture_with(config: CacheConfig) -> Fixture {
    fixture_cleaner(config, RecordingCleaner::ok())
}

fn fixture_cleaner(config: CacheConfig, cleaner: RecordingCleaner) -> Fixture {
    init_logs();
    let eviction = Arc::new(ScriptedEviction::default());
    let cleaning = Arc::new(RecordingCleaning::default());
    let cleaner = Arc::new(cleaner);
    let promotion = Arc::new(CountingPromotion::admit());
    let cache = CacheBuilder::new(config)
        .eviction(Arc::clone(&eviction) as Arc<dyn EvictionPolicy>)
        .cleaning_policies(
            vec![Arc::clone(&cleaning) as Arc<dyn CleaningPolicy>],
            0,
        )
        .cleaner(Arc::clone(&cleaner) as Arc<dyn Cleaner>)
        .promotion(Arc::clone(&promotion) as Arc<dyn PromotionPolicy>)
        .build()
        .unwrap();
    Fixture {
        cache,
        eviction,
        cleaning,
        cleaner,
        promotion,
        queue: Arc::new(RequestQueue::new()),
    }
}

type CompletionSlot = Arc<Mutex<Option<cache_engine::Result<()>>>>;

fn completion_slot() -> (CompletionSlot, cache_engine::CompleteFn) {
    let slot: CompletionSlot = Arc::new(Mutex::new(None));
    let inner = Arc::clone(&slot);
    (slot, Box::new(move |result| *inner.lock() = Some(result)))
}

fn request(fx: &Fixture, rw: IoDir, byte_position: u64, byte_length: u32) -> Arc<Request> {
    let (_, complete) = completion_slot();
    fx.cache
        .build_request(
            Arc::clone(&fx.queue),
            complete,
            RequestParams {
                core_id: 0,
                part_id: 0,
                rw,
                byte_position,
                byte_length,
                internal: false,
            },
        )
        .unwrap()
}

/// Prepare a multi-line request and simulate the data I/O landing by
/// validating every mapped sector, then release its line locks.
fn prime_lines(fx: &Fixture, first_core_line: u64, count: u32) -> Vec<CacheLine> {
    let req = request(
        fx,
        IoDir::Write,
        first_core_line * LINE_SIZE,
        count * LINE_SIZE as u32,
    );
    assert_eq!(engine::prepare_clines(&req), Ok(LockResult::Acquired));

    let md = fx.cache.metadata();
    let lines = mapped_lines(&req);
    for &line in &lines {
        md.set_valid_sec(line, 0, md.line_end_sector());
    }
    fx.cache.line_locks().unlock_request(&req);
    lines
}

fn mapped_lines(req: &Arc<Request>) -> Vec<CacheLine> {
    (0..req.core_line_count() as usize)
        .map(|idx| entry(req, idx).coll_idx)
        .collect()
}

fn entry(req: &Arc<Request>, idx: usize) -> MapEntry {
    req.map_entry(idx)
}

/// Look a core line up directly in metadata, bypassing any request.
fn lookup(cache: &Cache, core_line: u64) -> LookupStatus {
    let mut scratch = MapEntry {
        hash_bucket: 0,
        coll_idx: INVALID_LINE,
        core_id: 0,
        core_line: 0,
        status: LookupStatus::Miss,
        invalid: false,
        re_part: false,
        locked: false,
    };
    engine::lookup_map_entry(cache, &mut scratch, 0, core_line);
    scratch.status
}

/// Collect every line reachable from any collision chain.
fn chained_lines(cache: &Cache) -> Vec<CacheLine> {
    let md = cache.metadata();
    let mut lines = Vec::new();
    for bucket in 0..md.bucket_count() {
        let mut line = md.hash_head(bucket);
        while line != INVALID_LINE {
            lines.push(line);
            line = md.collision_next(line);
        }
    }
    lines
}

// =============================================================================
// Scenario 1 + 2: cold miss insert, then hot hit
// =============================================================================

#[test]
fn test_single_line_cold_read_inserts() {
    let fx = fixture(16);
    let req = request(&fx, IoDir::Read, 42 * LINE_SIZE, LINE_SIZE as u32);

    assert_eq!(engine::prepare_clines(&req), Ok(LockResult::Acquired));

    let info = req.info();
    assert_eq!(info.insert_no, 1);
    assert_eq!(info.hit_no, 0);
    assert_eq!(fx.cache.freelist().count(), 15);
    assert_eq!(fx.cache.partitions().get(0).count(), 1);

    let e = entry(&req, 0);
    assert_eq!(e.status, LookupStatus::Inserted);
    assert!(e.coll_idx < 16);
    assert_eq!(*fx.eviction.inits.lock(), vec![e.coll_idx]);
    assert_eq!(*fx.eviction.hots.lock(), vec![e.coll_idx]);
    assert_eq!(*fx.cleaning.inits.lock(), vec![e.coll_idx]);
    assert_eq!(*fx.promotion.purges.lock(), 1);

    // Read lock held until the variant finishes.
    assert!(!fx.cache.line_locks().is_unlocked(e.coll_idx));
    fx.cache.line_locks().unlock_request(&req);
    assert!(fx.cache.line_locks().is_unlocked(e.coll_idx));
}

#[test]
fn test_repeat_read_is_hot_hit() {
    let fx = fixture(16);
    let lines = prime_lines(&fx, 42, 1);
    let free_before = fx.cache.freelist().count();
    let hots_before = fx.eviction.hots.lock().len();

    let req = request(&fx, IoDir::Read, 42 * LINE_SIZE, LINE_SIZE as u32);
    assert_eq!(engine::prepare_clines(&req), Ok(LockResult::Acquired));

    let info = req.info();
    assert_eq!(info.hit_no, 1);
    assert_eq!(info.insert_no, 0);
    assert_eq!(fx.cache.freelist().count(), free_before);
    assert_eq!(entry(&req, 0).coll_idx, lines[0]);
    assert_eq!(fx.eviction.hots.lock().len(), hots_before + 1);

    fx.cache.line_locks().unlock_request(&req);
}

// =============================================================================
// Scenario 3: partially valid hit
// =============================================================================

#[test]
fn test_partial_valid_hit_counts_invalid() {
    let fx = fixture(16);
    let lines = prime_lines(&fx, 42, 1);
    let md = fx.cache.metadata();

    // Invalidate sectors 2-3 of the hosted line.
    fx.cache.bucket_locks().lock_global_exclusive();
    md.start_shared_access(lines[0]);
    fx.cache.set_invalid_no_flush(2, 3, lines[0]);
    md.end_shared_access(lines[0]);
    fx.cache.bucket_locks().unlock_global_exclusive();

    // Read sectors 0-3.
    let req = request(&fx, IoDir::Read, 42 * LINE_SIZE, 4 * 512);
    assert_eq!(engine::prepare_clines(&req), Ok(LockResult::Acquired));

    let info = req.info();
    assert_eq!(info.hit_no, 0);
    assert_eq!(info.invalid_no, 1);
    assert_eq!(entry(&req, 0).status, LookupStatus::Hit);

    fx.cache.line_locks().unlock_request(&req);
}

#[test]
fn test_hit_in_foreign_partition_marks_re_part() {
    let mut config = CacheConfig::new(16);
    config.partitions = vec![
        PartitionConfig {
            name: "fast".to_string(),
            max_lines: 8,
            enabled: true,
        },
        PartitionConfig {
            name: "slow".to_string(),
            max_lines: 8,
            enabled: true,
        },
    ];
    let fx = fixture_with(config);
    prime_lines(&fx, 42, 1);

    // Same core line, different target partition.
    let (_, complete) = completion_slot();
    let req = fx
        .cache
        .build_request(
            Arc::clone(&fx.queue),
            complete,
            RequestParams {
                core_id: 0,
                part_id: 1,
                rw: IoDir::Read,
                byte_position: 42 * LINE_SIZE,
                byte_length: LINE_SIZE as u32,
                internal: false,
            },
        )
        .unwrap();
    assert_eq!(engine::prepare_clines(&req), Ok(LockResult::Acquired));

    let info = req.info();
    assert_eq!(info.hit_no, 1);
    assert_eq!(info.re_part_no, 1);
    assert!(entry(&req, 0).re_part);

    fx.cache.line_locks().unlock_request(&req);
}

// =============================================================================
// Scenario 4: eviction supplies victims when the freelist is dry
// =============================================================================

#[test]
fn test_eviction_path_reclaims_victims() {
    let fx = fixture(4);
    prime_lines(&fx, 0, 4);
    assert_eq!(fx.cache.freelist().count(), 0);

    let req = request(&fx, IoDir::Read, 100 * LINE_SIZE, 3 * LINE_SIZE as u32);
    assert_eq!(engine::prepare_clines(&req), Ok(LockResult::Acquired));

    let info = req.info();
    assert_eq!(info.insert_no, 3);
    assert!(!req.part_evict());
    assert_eq!(fx.eviction.victims.lock().len(), 3);

    // Three previous owners fell out of their collision chains.
    let survivors = (0..4)
        .filter(|&core_line| lookup(&fx.cache, core_line) == LookupStatus::Hit)
        .count();
    assert_eq!(survivors, 1);

    // Every entry is mapped within bounds.
    for idx in 0..3 {
        let e = entry(&req, idx);
        assert_ne!(e.status, LookupStatus::Miss);
        assert!(e.coll_idx < 4);
    }

    fx.cache.line_locks().unlock_request(&req);
}

#[test]
fn test_partition_quota_sets_part_evict() {
    let mut config = CacheConfig::new(8);
    config.partitions = vec![PartitionConfig {
        name: "quota".to_string(),
        max_lines: 2,
        enabled: true,
    }];
    let fx = fixture_with(config);
    prime_lines(&fx, 0, 2);

    let req = request(&fx, IoDir::Read, 10 * LINE_SIZE, 2 * LINE_SIZE as u32);
    assert_eq!(engine::prepare_clines(&req), Ok(LockResult::Acquired));

    assert!(req.part_evict());
    assert_eq!(req.info().insert_no, 2);
    assert_eq!(fx.cache.partitions().get(0).count(), 2);

    fx.cache.line_locks().unlock_request(&req);
}

#[test]
fn test_eviction_exhausted_is_mapping_error() {
    init_logs();
    let eviction = Arc::new(ScriptedEviction::exhausted());
    let cache = CacheBuilder::new(CacheConfig::new(2))
        .eviction(Arc::clone(&eviction) as Arc<dyn EvictionPolicy>)
        .build()
        .unwrap();
    let queue = Arc::new(RequestQueue::new());

    // Drain the freelist so mapping must evict.
    let held: Vec<CacheLine> = std::iter::from_fn(|| cache.freelist().pop()).collect();
    assert_eq!(held.len(), 2);

    let (_, complete) = completion_slot();
    let req = cache
        .build_request(
            queue,
            complete,
            RequestParams {
                core_id: 0,
                part_id: 0,
                rw: IoDir::Read,
                byte_position: 0,
                byte_length: LINE_SIZE as u32,
                internal: false,
            },
        )
        .unwrap();

    assert_eq!(
        engine::prepare_clines(&req),
        Err(EngineError::NoSpace)
    );
    assert!(req.mapping_error());
    assert_eq!(entry(&req, 0).status, LookupStatus::Miss);
    assert!(chained_lines(&cache).is_empty());
}

// =============================================================================
// Scenario 5: dirty lines cleaned before reuse
// =============================================================================

#[test]
fn test_clean_fires_getter_in_map_order() {
    let fx = fixture(16);
    let lines = prime_lines(&fx, 0, 4);
    let md = fx.cache.metadata();

    // Lines 1 and 2 of the range are fully dirty.
    md.set_dirty_sec(lines[1], 0, md.line_end_sector());
    md.set_dirty_sec(lines[2], 0, md.line_end_sector());

    let req = request(&fx, IoDir::Read, 0, 4 * LINE_SIZE as u32);
    assert_eq!(engine::prepare_clines(&req), Ok(LockResult::Acquired));

    let info = req.info();
    assert_eq!(info.hit_no, 4);
    assert_eq!(info.dirty_any, 2);
    assert_eq!(info.dirty_all, 2);

    engine::clean(&req);

    assert_eq!(*fx.cleaner.counts.lock(), vec![2]);
    assert_eq!(*fx.cleaner.yielded.lock(), vec![lines[1], lines[2]]);

    // Dirty counters are zeroed and the request continues from the
    // front of its queue, line locks still held.
    let info = req.info();
    assert_eq!(info.dirty_any, 0);
    assert_eq!(info.dirty_all, 0);
    assert_eq!(fx.queue.depth(), 1);
    let continued = fx.queue.pop().unwrap();
    assert!(Arc::ptr_eq(&continued, &req));
    assert!(!fx.cache.line_locks().is_unlocked(lines[0]));

    fx.cache.line_locks().unlock_request(&req);
}

#[test]
fn test_clean_error_completes_request() {
    let fx = fixture_cleaner(
        CacheConfig::new(8),
        RecordingCleaner::failing(EngineError::Cleaning),
    );
    let lines = prime_lines(&fx, 0, 1);
    let md = fx.cache.metadata();
    md.set_dirty_sec(lines[0], 0, md.line_end_sector());

    let (slot, complete) = completion_slot();
    let req = fx
        .cache
        .build_request(
            Arc::clone(&fx.queue),
            complete,
            RequestParams {
                core_id: 0,
                part_id: 0,
                rw: IoDir::Read,
                byte_position: 0,
                byte_length: LINE_SIZE as u32,
                internal: false,
            },
        )
        .unwrap();
    assert_eq!(engine::prepare_clines(&req), Ok(LockResult::Acquired));
    assert_eq!(req.info().dirty_any, 1);

    engine::clean(&req);

    assert_eq!(*slot.lock(), Some(Err(EngineError::Cleaning)));
    assert_eq!(req.error(), Some(EngineError::Cleaning));
    assert!(fx.cache.line_locks().is_unlocked(lines[0]));
    assert_eq!(fx.queue.depth(), 0);
}

// =============================================================================
// Scenario 6: suspension, resume and refresh
// =============================================================================

#[test]
fn test_resume_refresh_detects_remap() {
    let fx = fixture(16);
    let md = fx.cache.metadata();

    // First writer holds the line's write lock.
    let first = request(&fx, IoDir::Write, 5 * LINE_SIZE, LINE_SIZE as u32);
    assert_eq!(engine::prepare_clines(&first), Ok(LockResult::Acquired));
    let line = entry(&first, 0).coll_idx;
    md.set_valid_sec(line, 0, md.line_end_sector());

    // Second writer targets the same core line and must wait.
    let (slot, complete) = completion_slot();
    let second = fx
        .cache
        .build_request(
            Arc::clone(&fx.queue),
            complete,
            RequestParams {
                core_id: 0,
                part_id: 0,
                rw: IoDir::Write,
                byte_position: 5 * LINE_SIZE,
                byte_length: LINE_SIZE as u32,
                internal: false,
            },
        )
        .unwrap();
    assert_eq!(engine::prepare_clines(&second), Ok(LockResult::Pending));

    // While the second request is suspended, its mapping is torn down.
    fx.cache.bucket_locks().lock_global_exclusive();
    md.start_shared_access(line);
    fx.cache
        .set_invalid_no_flush(0, md.line_end_sector(), line);
    md.end_shared_access(line);
    fx.cache.bucket_locks().unlock_global_exclusive();

    // Releasing the first writer grants the lock and resumes the second
    // request onto the front of its queue with the refresh interface.
    fx.cache.line_locks().unlock_request(&first);
    assert_eq!(fx.queue.depth(), 1);

    let resumed = fx.queue.pop().unwrap();
    assert!(Arc::ptr_eq(&resumed, &second));
    engine::dispatch(resumed);

    assert_eq!(*slot.lock(), Some(Err(EngineError::Inval)));
    assert_eq!(second.error(), Some(EngineError::Inval));
    assert!(fx.cache.line_locks().is_unlocked(line));
}

#[test]
fn test_resume_refresh_consistent_dispatches() {
    let fx = fixture(16);
    let md = fx.cache.metadata();

    let first = request(&fx, IoDir::Write, 7 * LINE_SIZE, LINE_SIZE as u32);
    assert_eq!(engine::prepare_clines(&first), Ok(LockResult::Acquired));
    let line = entry(&first, 0).coll_idx;
    md.set_valid_sec(line, 0, md.line_end_sector());

    let (slot, complete) = completion_slot();
    let second = fx
        .cache
        .build_request(
            Arc::clone(&fx.queue),
            complete,
            RequestParams {
                core_id: 0,
                part_id: 0,
                rw: IoDir::Write,
                byte_position: 7 * LINE_SIZE,
                byte_length: LINE_SIZE as u32,
                internal: false,
            },
        )
        .unwrap();
    assert_eq!(engine::prepare_clines(&second), Ok(LockResult::Pending));

    // Nothing changed while waiting: refresh passes and the saved
    // interface runs, which releases the locks and completes.
    fx.cache.line_locks().unlock_request(&first);
    let resumed = fx.queue.pop().unwrap();
    engine::dispatch(resumed);

    assert_eq!(*slot.lock(), Some(Ok(())));
    assert_eq!(second.info().hit_no, 1);
    assert!(fx.cache.line_locks().is_unlocked(line));
}

// =============================================================================
// Gatekeepers: promotion, disabled partitions
// =============================================================================

#[test]
fn test_promotion_denied_goes_pass_through() {
    init_logs();
    let promotion = Arc::new(CountingPromotion::deny());
    let cache = CacheBuilder::new(CacheConfig::new(8))
        .promotion(Arc::clone(&promotion) as Arc<dyn PromotionPolicy>)
        .build()
        .unwrap();

    let (_, complete) = completion_slot();
    let req = cache
        .build_request(
            Arc::new(RequestQueue::new()),
            complete,
            RequestParams {
                core_id: 0,
                part_id: 0,
                rw: IoDir::Read,
                byte_position: 0,
                byte_length: LINE_SIZE as u32,
                internal: false,
            },
        )
        .unwrap();

    assert_eq!(engine::prepare_clines(&req), Err(EngineError::NoLock));
    assert!(req.mapping_error());
    assert_eq!(cache.freelist().count(), 8);
    assert_eq!(*promotion.purges.lock(), 0);
}

#[test]
fn test_disabled_partition_goes_pass_through() {
    let mut config = CacheConfig::new(8);
    config.partitions = vec![PartitionConfig {
        name: "off".to_string(),
        max_lines: 8,
        enabled: false,
    }];
    let fx = fixture_with(config);

    let req = request(&fx, IoDir::Read, 0, LINE_SIZE as u32);
    assert_eq!(engine::prepare_clines(&req), Err(EngineError::NoLock));
    assert!(req.mapping_error());
    assert_eq!(fx.cache.freelist().count(), 8);
}

// =============================================================================
// Map / unwind transactionality
// =============================================================================

#[test]
fn test_mid_map_failure_unwinds_partial_insert() {
    init_logs();
    let thief = Arc::new(ThievingCleaning {
        stolen: Mutex::new(None),
    });
    let cache = CacheBuilder::new(CacheConfig::new(4))
        .cleaning_policies(
            vec![Arc::clone(&thief) as Arc<dyn CleaningPolicy>],
            0,
        )
        .build()
        .unwrap();

    // Two free lines stay with the test, two remain for mapping.
    let held = [
        cache.freelist().pop().unwrap(),
        cache.freelist().pop().unwrap(),
    ];
    assert_eq!(cache.freelist().count(), 2);

    let (_, complete) = completion_slot();
    let req = cache
        .build_request(
            Arc::new(RequestQueue::new()),
            complete,
            RequestParams {
                core_id: 0,
                part_id: 0,
                rw: IoDir::Read,
                byte_position: 0,
                byte_length: 2 * LINE_SIZE as u32,
                internal: false,
            },
        )
        .unwrap();

    // The init hook steals the second free line mid-map: the first
    // entry's insert must be rolled back when the second pop fails.
    let result = engine::prepare_clines(&req);
    assert_eq!(result, Err(EngineError::NoSpace));
    assert!(req.mapping_error());

    for idx in 0..2 {
        let e = entry(&req, idx);
        assert_eq!(e.status, LookupStatus::Miss);
        assert_eq!(e.coll_idx, INVALID_LINE);
    }

    // Metadata is back to the pre-map state.
    assert!(chained_lines(&cache).is_empty());
    assert_eq!(cache.partitions().get(0).count(), 0);
    assert_eq!(cache.freelist().count(), 1);

    // Returning the stolen and held lines restores the full pool, and
    // none of them is threaded through any chain.
    cache.freelist().push(thief.stolen.lock().take().unwrap());
    for line in held {
        cache.freelist().push(line);
    }
    assert_eq!(cache.freelist().count(), 4);
}

// =============================================================================
// Direct remap: eviction handing victims straight to the request
// =============================================================================

#[test]
fn test_remap_hands_lines_to_entries() {
    init_logs();
    let mut config = CacheConfig::new(4);
    config.partitions = vec![PartitionConfig {
        name: "pinned".to_string(),
        max_lines: 0,
        enabled: true,
    }];
    let cache = CacheBuilder::new(config)
        .eviction(Arc::new(RemappingEviction) as Arc<dyn EvictionPolicy>)
        .build()
        .unwrap();

    let (_, complete) = completion_slot();
    let req = cache
        .build_request(
            Arc::new(RequestQueue::new()),
            complete,
            RequestParams {
                core_id: 0,
                part_id: 0,
                rw: IoDir::Read,
                byte_position: 0,
                byte_length: 2 * LINE_SIZE as u32,
                internal: false,
            },
        )
        .unwrap();

    // Quota zero forces the eviction path straight away; the policy
    // remaps freelist lines directly into the map entries.
    assert_eq!(engine::prepare_clines(&req), Ok(LockResult::Acquired));
    assert!(req.part_evict());

    let info = req.info();
    assert_eq!(info.insert_no, 2);
    for idx in 0..2 {
        let e = entry(&req, idx);
        assert_eq!(e.status, LookupStatus::Remapped);
        assert_eq!(lookup(&cache, e.core_line), LookupStatus::Hit);
    }
    assert_eq!(cache.partitions().get(0).count(), 2);
    assert_eq!(cache.freelist().count(), 2);

    cache.line_locks().unlock_request(&req);
}

#[test]
fn test_map_cache_line_splices_and_inits() {
    let fx = fixture(8);
    let md = fx.cache.metadata();
    let req = request(&fx, IoDir::Read, 9 * LINE_SIZE, LINE_SIZE as u32);

    // Record the bucket without mapping anything.
    fx.cache.bucket_locks().lock_global_exclusive();
    engine::traverse(&req);

    let line = fx.cache.freelist().pop().unwrap();
    fx.cache.partitions().add(md, 0, line);
    engine::map_cache_line(&req, 0, line);
    fx.cache.bucket_locks().unlock_global_exclusive();

    let e = entry(&req, 0);
    assert_eq!(e.coll_idx, line);
    assert_eq!(md.core_info(line), (0, 9));
    assert_eq!(lookup(&fx.cache, 9), LookupStatus::Hit);
    assert_eq!(*fx.cleaning.inits.lock(), vec![line]);
}

#[test]
fn test_freelist_and_chains_stay_disjoint() {
    let fx = fixture(8);
    prime_lines(&fx, 0, 3);

    let chained = chained_lines(&fx.cache);
    assert_eq!(chained.len(), 3);

    let mut free = Vec::new();
    while let Some(line) = fx.cache.freelist().pop() {
        free.push(line);
    }
    assert_eq!(free.len(), 5);
    for line in &free {
        assert!(!chained.contains(line));
        assert_eq!(fx.cache.metadata().core_info(*line).0, INVALID_CORE);
    }
    for line in free {
        fx.cache.freelist().push(line);
    }
}

// =============================================================================
// Counters, sequentiality, stats, fallback
// =============================================================================

#[test]
fn test_map_moves_exactly_k_lines() {
    let fx = fixture(16);
    let req = request(&fx, IoDir::Read, 0, 3 * LINE_SIZE as u32);

    assert_eq!(engine::prepare_clines(&req), Ok(LockResult::Acquired));
    assert_eq!(fx.cache.freelist().count(), 13);
    assert_eq!(fx.cache.partitions().get(0).count(), 3);
    assert_eq!(req.info().insert_no, 3);

    fx.cache.line_locks().unlock_request(&req);
}

#[test]
fn test_seq_no_matches_physical_adjacency() {
    let fx = fixture(16);
    let req = request(&fx, IoDir::Read, 0, 3 * LINE_SIZE as u32);
    assert_eq!(engine::prepare_clines(&req), Ok(LockResult::Acquired));

    let md = fx.cache.metadata();
    let lines = mapped_lines(&req);
    let expected: u32 = lines
        .windows(2)
        .filter(|w| {
            let phys1 = md.lg2phy(w[0]);
            let phys2 = md.lg2phy(w[1]);
            phys1 < phys2 && phys1 + 1 == phys2
        })
        .count() as u32;

    let info = req.info();
    assert_eq!(info.seq_no, expected);
    assert_eq!(
        req.is_sequential(),
        expected == req.core_line_count() - 1
    );

    fx.cache.line_locks().unlock_request(&req);
}

#[test]
fn test_traverse_then_check_is_consistent() {
    let fx = fixture(16);
    prime_lines(&fx, 0, 2);

    let req = request(&fx, IoDir::Read, 0, 2 * LINE_SIZE as u32);
    assert_eq!(engine::prepare_clines(&req), Ok(LockResult::Acquired));
    let buckets = req.buckets();

    fx.cache.bucket_locks().lock_shared(&buckets);
    assert!(engine::check(&req));
    fx.cache.bucket_locks().unlock_shared(&buckets);
    assert_eq!(req.info().hit_no, 2);

    fx.cache.line_locks().unlock_request(&req);
}

#[test]
fn test_stats_classify_requests() {
    let fx = fixture(16);
    prime_lines(&fx, 0, 2);

    let hit = request(&fx, IoDir::Read, 0, 2 * LINE_SIZE as u32);
    assert_eq!(engine::prepare_clines(&hit), Ok(LockResult::Acquired));
    engine::update_block_stats(&hit);
    engine::update_request_stats(&hit);
    fx.cache.line_locks().unlock_request(&hit);

    let partial = request(&fx, IoDir::Read, LINE_SIZE, 2 * LINE_SIZE as u32);
    assert_eq!(engine::prepare_clines(&partial), Ok(LockResult::Acquired));
    engine::update_block_stats(&partial);
    engine::update_request_stats(&partial);
    fx.cache.line_locks().unlock_request(&partial);

    let snap = fx.cache.stats().snapshot(0, IoDir::Read);
    assert_eq!(snap.full_hits, 1);
    assert_eq!(snap.partial_hits, 1);
    assert_eq!(snap.misses, 0);
    assert_eq!(snap.bytes, 4 * LINE_SIZE);
}

#[test]
fn test_push_transfers_requests_to_the_queue() {
    let fx = fixture(8);

    let (slot, complete) = completion_slot();
    let back = fx
        .cache
        .build_request(
            Arc::clone(&fx.queue),
            complete,
            RequestParams {
                core_id: 0,
                part_id: 0,
                rw: IoDir::Read,
                byte_position: 0,
                byte_length: 512,
                internal: false,
            },
        )
        .unwrap();
    engine::push_req_back(back, false);
    engine::push_req_front(request(&fx, IoDir::Read, LINE_SIZE, 512), false);
    assert_eq!(fx.queue.depth(), 2);

    // Front push jumps the line.
    assert_eq!(fx.queue.pop().unwrap().byte_position(), LINE_SIZE);

    // Dispatching a normal-phase request runs its I/O interface, which
    // completes it.
    engine::dispatch(fx.queue.pop().unwrap());
    assert_eq!(*slot.lock(), Some(Ok(())));
    assert_eq!(fx.queue.depth(), 0);
}

#[test]
fn test_internal_requests_do_not_count_as_activity() {
    let fx = fixture(8);
    assert_eq!(fx.cache.last_access_ms(), None);

    let (_, complete) = completion_slot();
    let internal = fx
        .cache
        .build_request(
            Arc::clone(&fx.queue),
            complete,
            RequestParams {
                core_id: 0,
                part_id: 0,
                rw: IoDir::Write,
                byte_position: 0,
                byte_length: 512,
                internal: true,
            },
        )
        .unwrap();
    engine::push_req_back(internal, false);
    assert_eq!(fx.cache.last_access_ms(), None);

    engine::push_req_back(request(&fx, IoDir::Read, 0, 512), false);
    assert!(fx.cache.last_access_ms().is_some());
}

#[test]
fn test_engine_error_can_stop_cache() {
    let fx = fixture(8);
    let req = request(&fx, IoDir::Read, 0, 512);

    assert!(fx.cache.is_running());
    engine::error(&req, false, "transient device error");
    assert!(fx.cache.is_running());

    engine::error(&req, true, "fatal device error");
    assert!(!fx.cache.is_running());
}

#[test]
fn test_fallback_counter_trips_pass_through() {
    let mut config = CacheConfig::new(8);
    config.fallback_error_threshold = Some(2);
    let fx = fixture_with(config);

    fx.cache.fallback().increment();
    assert!(!fx.cache.fallback().is_active());
    fx.cache.fallback().increment();
    assert!(fx.cache.fallback().is_active());
}
