//! Request objects and their per-core-line map.
//!
//! A request covers a contiguous run of core lines. Each core line gets
//! one map entry recording where lookup found it (or didn't), and the
//! aggregate info counters summarize the map for the engine variants.
//!
//! Ownership discipline: exactly one thread works on a request at a
//! time. The state mutex exists for the well-defined handoff points —
//! line-lock grants marking entries locked, and the queue transferring
//! the request to another worker.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::cache::Cache;
use crate::concurrency::LockKind;
use crate::error::{EngineError, Result};
use crate::line::{CacheLine, CoreId, CoreLine, PartId, INVALID_LINE, SECTOR_SIZE};
use crate::policy::{EngineCallbacks, IoHandler};
use crate::queue::RequestQueue;
use crate::sync::AtomicU32;

/// Direction of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoDir {
    /// Read from the cache / core device.
    Read,
    /// Write through the cache.
    Write,
}

/// Where lookup placed one core line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStatus {
    /// No cache line hosts this core line.
    Miss,
    /// Found in a collision chain.
    Hit,
    /// Freshly allocated from the freelist during mapping.
    Inserted,
    /// An eviction victim handed directly to this request.
    Remapped,
}

/// Per-core-line mapping state of one request.
#[derive(Debug, Clone)]
pub struct MapEntry {
    /// Hash bucket for this core line; recorded even on miss so a later
    /// insert knows where to splice.
    pub hash_bucket: u32,
    /// Cache line hosting the core line, or `INVALID_LINE`.
    pub coll_idx: CacheLine,
    /// Owning core device.
    pub core_id: CoreId,
    /// Core line index.
    pub core_line: CoreLine,
    /// Lookup outcome.
    pub status: LookupStatus,
    /// Set by the post-resume check when the mapping changed underneath.
    pub invalid: bool,
    /// The hosting line currently belongs to a different partition.
    pub re_part: bool,
    /// This entry holds its cache-line lock.
    pub locked: bool,
}

impl MapEntry {
    fn new(core_id: CoreId, core_line: CoreLine) -> Self {
        Self {
            hash_bucket: 0,
            coll_idx: INVALID_LINE,
            core_id,
            core_line,
            status: LookupStatus::Miss,
            invalid: false,
            re_part: false,
            locked: false,
        }
    }
}

/// Aggregate counters over a request's map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReqInfo {
    /// Entries fully valid for the request's sector range.
    pub hit_no: u32,
    /// Entries freshly inserted or remapped.
    pub insert_no: u32,
    /// Hit entries whose valid bitmap does not cover the range.
    pub invalid_no: u32,
    /// Hit entries with any dirty sector.
    pub dirty_any: u32,
    /// Hit entries dirty across the whole requested range.
    pub dirty_all: u32,
    /// Hit entries owned by a different partition than the request's.
    pub re_part_no: u32,
    /// Adjacent mapped entries that are physically contiguous.
    pub seq_no: u32,
}

/// The I/O interface a queued request runs when dispatched.
///
/// `Refreshing` is installed on resume from a line-lock wait: the saved
/// interface is only restored after the mapping re-validates.
#[derive(Clone)]
pub enum IoPhase {
    /// Dispatch straight into the interface.
    Normal(Arc<dyn IoHandler>),
    /// Re-validate the mapping first, then restore `saved`.
    Refreshing {
        /// Interface to restore once the check passes.
        saved: Arc<dyn IoHandler>,
    },
}

/// Mutable per-request state, guarded by the request's mutex.
pub struct ReqState {
    /// One entry per core line, in core-line order.
    pub map: Box<[MapEntry]>,
    /// Aggregate counters, rebuilt by traverse/check/map.
    pub info: ReqInfo,
    /// Sorted, deduplicated hash buckets of the map.
    pub buckets: Vec<u32>,
    /// Mapping could not be completed; higher layer goes pass-through.
    pub mapping_error: bool,
    /// Eviction ran because the partition was out of quota.
    pub part_evict: bool,
    /// Terminal error recorded for completion.
    pub error: Option<EngineError>,
    /// Mode of the held line locks, while any are held.
    pub lock_kind: Option<LockKind>,
    /// Current I/O interface.
    pub phase: IoPhase,
}

impl ReqState {
    /// Reset the aggregate counters and the mapping-error flag ahead of
    /// a fresh traverse/map pass.
    pub(crate) fn clear_info(&mut self) {
        self.info = ReqInfo::default();
        self.mapping_error = false;
    }

    /// True when every entry is mapped (any non-miss status).
    pub fn is_mapped(&self) -> bool {
        self.map.iter().all(|e| e.status != LookupStatus::Miss)
    }

    /// Number of entries still missing a cache line.
    pub fn unmapped_count(&self) -> u32 {
        self.map
            .iter()
            .filter(|e| e.status == LookupStatus::Miss)
            .count() as u32
    }

    /// True when adjacent mapped lines are all physically contiguous.
    pub fn is_sequential(&self) -> bool {
        self.info.seq_no == self.map.len() as u32 - 1
    }
}

/// Completion callback, fired exactly once.
pub type CompleteFn = Box<dyn FnOnce(Result<()>) + Send>;

/// Parameters for building a request.
pub struct RequestParams {
    /// Target core device.
    pub core_id: CoreId,
    /// Target partition.
    pub part_id: PartId,
    /// Direction.
    pub rw: IoDir,
    /// Absolute byte position on the core device.
    pub byte_position: u64,
    /// Length in bytes, non-zero.
    pub byte_length: u32,
    /// Internal requests don't count as user activity.
    pub internal: bool,
}

/// One in-flight cache request.
pub struct Request {
    cache: Arc<Cache>,
    core_id: CoreId,
    core_line_first: CoreLine,
    core_line_last: CoreLine,
    rw: IoDir,
    part_id: PartId,
    byte_position: u64,
    byte_length: u32,
    internal: bool,
    queue: Arc<RequestQueue>,
    cbs: Arc<dyn EngineCallbacks>,
    complete: Mutex<Option<CompleteFn>>,
    pub(crate) lock_pending: AtomicU32,
    pub(crate) state: Mutex<ReqState>,
}

impl Request {
    pub(crate) fn new(
        cache: Arc<Cache>,
        queue: Arc<RequestQueue>,
        cbs: Arc<dyn EngineCallbacks>,
        io: Arc<dyn IoHandler>,
        complete: CompleteFn,
        params: RequestParams,
    ) -> Result<Arc<Self>> {
        if params.byte_length == 0 {
            return Err(EngineError::Config("request length must be non-zero"));
        }
        if params.part_id as usize >= cache.partitions().len() {
            return Err(EngineError::Config("unknown partition"));
        }

        let line_size = cache.config().line_size;
        let first = params.byte_position / line_size;
        let last = (params.byte_position + params.byte_length as u64 - 1) / line_size;

        let map = (first..=last)
            .map(|core_line| MapEntry::new(params.core_id, core_line))
            .collect();

        Ok(Arc::new(Self {
            cache,
            core_id: params.core_id,
            core_line_first: first,
            core_line_last: last,
            rw: params.rw,
            part_id: params.part_id,
            byte_position: params.byte_position,
            byte_length: params.byte_length,
            internal: params.internal,
            queue,
            cbs,
            complete: Mutex::new(Some(complete)),
            lock_pending: AtomicU32::new(0),
            state: Mutex::new(ReqState {
                map,
                info: ReqInfo::default(),
                buckets: Vec::new(),
                mapping_error: false,
                part_evict: false,
                error: None,
                lock_kind: None,
                phase: IoPhase::Normal(io),
            }),
        }))
    }

    /// The cache this request targets.
    #[inline]
    pub fn cache(&self) -> &Arc<Cache> {
        &self.cache
    }

    /// Target core device.
    #[inline]
    pub fn core_id(&self) -> CoreId {
        self.core_id
    }

    /// First core line covered.
    #[inline]
    pub fn core_line_first(&self) -> CoreLine {
        self.core_line_first
    }

    /// Last core line covered (inclusive).
    #[inline]
    pub fn core_line_last(&self) -> CoreLine {
        self.core_line_last
    }

    /// Number of core lines covered.
    #[inline]
    pub fn core_line_count(&self) -> u32 {
        (self.core_line_last - self.core_line_first + 1) as u32
    }

    /// Direction.
    #[inline]
    pub fn rw(&self) -> IoDir {
        self.rw
    }

    /// Target partition.
    #[inline]
    pub fn part_id(&self) -> PartId {
        self.part_id
    }

    /// Absolute byte position on the core device.
    #[inline]
    pub fn byte_position(&self) -> u64 {
        self.byte_position
    }

    /// Request length in bytes.
    #[inline]
    pub fn byte_length(&self) -> u32 {
        self.byte_length
    }

    /// Internal requests don't count as user activity.
    #[inline]
    pub fn is_internal(&self) -> bool {
        self.internal
    }

    /// The queue this request runs on.
    #[inline]
    pub fn queue(&self) -> &Arc<RequestQueue> {
        &self.queue
    }

    pub(crate) fn callbacks(&self) -> Arc<dyn EngineCallbacks> {
        Arc::clone(&self.cbs)
    }

    /// First requested sector within map entry `idx`.
    pub fn line_start_sector(&self, idx: usize) -> u8 {
        if idx == 0 {
            let line_size = self.cache.config().line_size;
            ((self.byte_position % line_size) / SECTOR_SIZE) as u8
        } else {
            0
        }
    }

    /// Last requested sector within map entry `idx` (inclusive).
    pub fn line_end_sector(&self, idx: usize) -> u8 {
        if idx + 1 == self.core_line_count() as usize {
            let line_size = self.cache.config().line_size;
            let last_byte = self.byte_position + self.byte_length as u64 - 1;
            ((last_byte % line_size) / SECTOR_SIZE) as u8
        } else {
            self.cache.metadata().line_end_sector()
        }
    }

    /// Fire the completion callback. Subsequent calls are no-ops.
    pub fn complete(&self, result: Result<()>) {
        if let Some(complete) = self.complete.lock().take() {
            complete(result);
        }
    }

    /// Snapshot of the aggregate info counters.
    pub fn info(&self) -> ReqInfo {
        self.state.lock().info
    }

    /// Whether a mapping error is flagged.
    pub fn mapping_error(&self) -> bool {
        self.state.lock().mapping_error
    }

    /// Whether eviction ran due to partition quota pressure.
    pub fn part_evict(&self) -> bool {
        self.state.lock().part_evict
    }

    /// Terminal error recorded for this request, if any.
    pub fn error(&self) -> Option<EngineError> {
        self.state.lock().error
    }

    /// Snapshot of one map entry.
    pub fn map_entry(&self, idx: usize) -> MapEntry {
        self.state.lock().map[idx].clone()
    }

    /// The request's sorted, deduplicated hash-bucket set.
    pub fn buckets(&self) -> Vec<u32> {
        self.state.lock().buckets.clone()
    }

    /// True when every core line is mapped.
    pub fn is_mapped(&self) -> bool {
        self.state.lock().is_mapped()
    }

    /// Core lines still missing a cache line.
    pub fn unmapped_count(&self) -> u32 {
        self.state.lock().unmapped_count()
    }

    /// True when every core line fully hit.
    pub fn is_hit(&self) -> bool {
        let state = self.state.lock();
        state.info.hit_no == state.map.len() as u32
    }

    /// True when the mapped lines are physically contiguous.
    pub fn is_sequential(&self) -> bool {
        self.state.lock().is_sequential()
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;
    use crate::cache::CacheBuilder;
    use crate::config::CacheConfig;

    fn fixture(byte_position: u64, byte_length: u32) -> Arc<Request> {
        let cache = CacheBuilder::new(CacheConfig::new(16)).build().unwrap();
        cache
            .build_request(
                Arc::new(RequestQueue::new()),
                Box::new(|_| {}),
                RequestParams {
                    core_id: 0,
                    part_id: 0,
                    rw: IoDir::Read,
                    byte_position,
                    byte_length,
                    internal: false,
                },
            )
            .unwrap()
    }

    #[test]
    fn test_core_line_range() {
        // Default line size is 16 KiB.
        let req = fixture(16 * 1024, 32 * 1024);
        assert_eq!(req.core_line_first(), 1);
        assert_eq!(req.core_line_last(), 2);
        assert_eq!(req.core_line_count(), 2);
    }

    #[test]
    fn test_unaligned_range_rounds_out() {
        let req = fixture(16 * 1024 - 512, 1024);
        assert_eq!(req.core_line_first(), 0);
        assert_eq!(req.core_line_last(), 1);
        assert_eq!(req.core_line_count(), 2);
    }

    #[test]
    fn test_partial_line_sectors() {
        // Sectors 2..=5 of line 0 (2 KiB at byte 1024).
        let req = fixture(1024, 2048);
        assert_eq!(req.core_line_count(), 1);
        assert_eq!(req.line_start_sector(0), 2);
        assert_eq!(req.line_end_sector(0), 5);
    }

    #[test]
    fn test_interior_lines_cover_fully() {
        let req = fixture(8 * 1024, 48 * 1024);
        assert_eq!(req.core_line_count(), 4);
        assert_eq!(req.line_start_sector(0), 16);
        assert_eq!(req.line_end_sector(0), 31);
        assert_eq!(req.line_start_sector(1), 0);
        assert_eq!(req.line_end_sector(1), 31);
        assert_eq!(req.line_start_sector(3), 0);
        assert_eq!(req.line_end_sector(3), 15);
    }

    #[test]
    fn test_zero_length_rejected() {
        let cache = CacheBuilder::new(CacheConfig::new(16)).build().unwrap();
        let result = cache.build_request(
            Arc::new(RequestQueue::new()),
            Box::new(|_| {}),
            RequestParams {
                core_id: 0,
                part_id: 0,
                rw: IoDir::Read,
                byte_position: 0,
                byte_length: 0,
                internal: false,
            },
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_complete_fires_once() {
        use std::sync::atomic::{AtomicU32, Ordering};
        let calls = Arc::new(AtomicU32::new(0));
        let cache = CacheBuilder::new(CacheConfig::new(16)).build().unwrap();
        let counted = Arc::clone(&calls);
        let req = cache
            .build_request(
                Arc::new(RequestQueue::new()),
                Box::new(move |_| {
                    counted.fetch_add(1, Ordering::SeqCst);
                }),
                RequestParams {
                    core_id: 0,
                    part_id: 0,
                    rw: IoDir::Write,
                    byte_position: 0,
                    byte_length: 512,
                    internal: false,
                },
            )
            .unwrap();

        req.complete(Ok(()));
        req.complete(Err(EngineError::Inval));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
