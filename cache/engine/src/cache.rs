//! The cache handle: owns all shared metadata state.
//!
//! Global mutable state (freelist, partition membership, collision
//! chains) lives behind this handle as owned aggregates; requests borrow
//! access through the locking tiers, never through process globals.

use std::sync::Arc;
use std::time::Instant;

use crate::concurrency::{BucketLocks, LineLocks};
use crate::config::CacheConfig;
use crate::error::{EngineError, Result};
use crate::fallback::FallbackCounter;
use crate::freelist::Freelist;
use crate::line::{CacheLine, INVALID_CORE};
use crate::metadata::Metadata;
use crate::partition::PartitionTable;
use crate::policy::{
    AlwaysPromote, Cleaner, CleaningPolicy, EngineCallbacks, EvictionPolicy, IoHandler,
    NopCleaner, NopCleaning, NopEviction, PromotionPolicy,
};
use crate::queue::RequestQueue;
use crate::request::{CompleteFn, Request, RequestParams};
use crate::stats::CacheStats;
use crate::sync::{AtomicBool, AtomicU64, Ordering};

/// Sentinel for "no user request seen yet".
const NEVER_ACCESSED: u64 = u64::MAX;

/// One cache instance.
pub struct Cache {
    config: CacheConfig,
    metadata: Metadata,
    freelist: Freelist,
    partitions: PartitionTable,
    bucket_locks: BucketLocks,
    line_locks: LineLocks,
    eviction: Arc<dyn EvictionPolicy>,
    cleaning: Box<[Arc<dyn CleaningPolicy>]>,
    cleaning_policy: usize,
    promotion: Arc<dyn PromotionPolicy>,
    cleaner: Arc<dyn Cleaner>,
    stats: CacheStats,
    fallback: FallbackCounter,
    running: AtomicBool,
    started: Instant,
    last_access_ms: AtomicU64,
}

impl Cache {
    /// Configuration the cache was built with.
    #[inline]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// The metadata store.
    #[inline]
    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    /// The freelist.
    #[inline]
    pub fn freelist(&self) -> &Freelist {
        &self.freelist
    }

    /// The partition table.
    #[inline]
    pub fn partitions(&self) -> &PartitionTable {
        &self.partitions
    }

    /// Hash-bucket and global metadata locks.
    #[inline]
    pub fn bucket_locks(&self) -> &BucketLocks {
        &self.bucket_locks
    }

    /// Per-cache-line locks.
    #[inline]
    pub fn line_locks(&self) -> &LineLocks {
        &self.line_locks
    }

    /// The eviction policy.
    #[inline]
    pub fn eviction(&self) -> &Arc<dyn EvictionPolicy> {
        &self.eviction
    }

    /// The active cleaning policy.
    #[inline]
    pub fn cleaning_policy(&self) -> &Arc<dyn CleaningPolicy> {
        &self.cleaning[self.cleaning_policy]
    }

    /// The promotion policy.
    #[inline]
    pub fn promotion(&self) -> &Arc<dyn PromotionPolicy> {
        &self.promotion
    }

    /// The writeback cleaner.
    #[inline]
    pub fn cleaner(&self) -> &Arc<dyn Cleaner> {
        &self.cleaner
    }

    /// Cache-wide statistics.
    #[inline]
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    /// Pass-through fallback counter.
    #[inline]
    pub fn fallback(&self) -> &FallbackCounter {
        &self.fallback
    }

    /// Whether the cache is still serving requests.
    #[inline]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Record user activity. Internal requests don't call this.
    pub(crate) fn touch(&self) {
        let elapsed = self.started.elapsed().as_millis() as u64;
        self.last_access_ms
            .store(elapsed.min(NEVER_ACCESSED - 1), Ordering::Relaxed);
    }

    /// Milliseconds from cache start to the last user request, if any.
    pub fn last_access_ms(&self) -> Option<u64> {
        match self.last_access_ms.load(Ordering::Relaxed) {
            NEVER_ACCESSED => None,
            ms => Some(ms),
        }
    }

    /// Clear valid bits for sectors `start..=end` of `line` without any
    /// writeback. A line left with no valid sector is reclaimed: it is
    /// unspliced from its collision chain, removed from its partition
    /// and pushed back on the freelist.
    ///
    /// Caller must hold the exclusive hash-bucket lock for the line's
    /// bucket or the global exclusive lock, plus the line's access
    /// guard.
    pub fn set_invalid_no_flush(&self, start: u8, end: u8, line: CacheLine) {
        if self.metadata.clear_valid_sec(line, start, end) {
            return;
        }

        let (core_id, core_line) = self.metadata.core_info(line);
        if core_id == INVALID_CORE {
            // Never owned; nothing to reclaim.
            return;
        }
        let bucket = self.metadata.hash_func(core_id, core_line);
        self.metadata.clear_sectors(line);
        self.metadata.remove_from_collision(bucket, line);
        self.partitions.remove(&self.metadata, line);
        self.freelist.push(line);
    }

    /// Build a request with the direction-derived lock callbacks and the
    /// inert I/O interface. Tests and simple variants use this; real
    /// variants attach their own interface via
    /// [`Cache::build_request_with`].
    pub fn build_request(
        self: &Arc<Self>,
        queue: Arc<RequestQueue>,
        complete: CompleteFn,
        params: RequestParams,
    ) -> Result<Arc<Request>> {
        self.build_request_with(
            queue,
            Arc::new(crate::engine::DefaultCallbacks),
            Arc::new(crate::engine::NopIo),
            complete,
            params,
        )
    }

    /// Build a request with explicit engine callbacks and I/O interface.
    pub fn build_request_with(
        self: &Arc<Self>,
        queue: Arc<RequestQueue>,
        cbs: Arc<dyn EngineCallbacks>,
        io: Arc<dyn IoHandler>,
        complete: CompleteFn,
        params: RequestParams,
    ) -> Result<Arc<Request>> {
        Request::new(Arc::clone(self), queue, cbs, io, complete, params)
    }
}

/// Builder for [`Cache`].
pub struct CacheBuilder {
    config: CacheConfig,
    eviction: Arc<dyn EvictionPolicy>,
    cleaning: Vec<Arc<dyn CleaningPolicy>>,
    cleaning_policy: usize,
    promotion: Arc<dyn PromotionPolicy>,
    cleaner: Arc<dyn Cleaner>,
}

impl CacheBuilder {
    /// Start from a configuration with inert default collaborators.
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            eviction: Arc::new(NopEviction),
            cleaning: vec![Arc::new(NopCleaning) as Arc<dyn CleaningPolicy>],
            cleaning_policy: 0,
            promotion: Arc::new(AlwaysPromote),
            cleaner: Arc::new(NopCleaner),
        }
    }

    /// Attach an eviction policy.
    pub fn eviction(mut self, eviction: Arc<dyn EvictionPolicy>) -> Self {
        self.eviction = eviction;
        self
    }

    /// Register the cleaning policy array and select the active one.
    pub fn cleaning_policies(
        mut self,
        policies: Vec<Arc<dyn CleaningPolicy>>,
        active: usize,
    ) -> Self {
        self.cleaning = policies;
        self.cleaning_policy = active;
        self
    }

    /// Attach a promotion policy.
    pub fn promotion(mut self, promotion: Arc<dyn PromotionPolicy>) -> Self {
        self.promotion = promotion;
        self
    }

    /// Attach a writeback cleaner.
    pub fn cleaner(mut self, cleaner: Arc<dyn Cleaner>) -> Self {
        self.cleaner = cleaner;
        self
    }

    /// Validate and assemble the cache.
    pub fn build(self) -> Result<Arc<Cache>> {
        self.config.validate()?;
        if self.cleaning.is_empty() || self.cleaning_policy >= self.cleaning.len() {
            return Err(EngineError::Config("invalid cleaning policy selection"));
        }

        Ok(Arc::new(Cache {
            metadata: Metadata::new(&self.config),
            freelist: Freelist::new(self.config.lines),
            partitions: PartitionTable::new(&self.config.partitions),
            bucket_locks: BucketLocks::new(self.config.hash_buckets() as u32),
            line_locks: LineLocks::new(self.config.lines),
            stats: CacheStats::new(self.config.partitions.len()),
            fallback: FallbackCounter::new(self.config.fallback_error_threshold),
            running: AtomicBool::new(true),
            started: Instant::now(),
            last_access_ms: AtomicU64::new(NEVER_ACCESSED),
            eviction: self.eviction,
            cleaning: self.cleaning.into_boxed_slice(),
            cleaning_policy: self.cleaning_policy,
            promotion: self.promotion,
            cleaner: self.cleaner,
            config: self.config,
        }))
    }
}
