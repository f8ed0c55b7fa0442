//! Arena metadata store.
//!
//! Maps cache-line indices to their owning `(core_id, core_line)` and back
//! through per-bucket collision chains. Each slot carries the owning core,
//! partition id, valid/dirty sector bitmaps, the collision-chain next
//! pointer, and partition-list prev/next pointers.
//!
//! All fields are atomics so slots can be shared across worker threads,
//! but chain mutation is only correct under the locking tiers of
//! [`crate::concurrency`]: a bucket's collision chain may be traversed
//! under the bucket's shared lock and mutated under its exclusive lock or
//! the global exclusive lock. The per-line access guard additionally
//! covers collision membership changes against concurrent per-line
//! observers (LRU maintenance, metadata maintenance).

use ahash::RandomState;

use crate::config::CacheConfig;
use crate::line::{sector_mask, CacheLine, CoreId, CoreLine, PartId, INVALID_CORE, INVALID_LINE, INVALID_PART};
use crate::sync::{AtomicU32, AtomicU64, Ordering};

/// Per-line access guard bits: one writer bit over a reader count.
const ACCESS_EXCLUSIVE: u32 = 1 << 31;

/// Metadata slot for one cache line.
struct LineMeta {
    core_id: AtomicU32,
    core_line: AtomicU64,
    partition: AtomicU32,
    collision_next: AtomicU32,
    part_prev: AtomicU32,
    part_next: AtomicU32,
    valid: AtomicU64,
    dirty: AtomicU64,
    access: AtomicU32,
}

impl LineMeta {
    fn new() -> Self {
        Self {
            core_id: AtomicU32::new(INVALID_CORE),
            core_line: AtomicU64::new(0),
            partition: AtomicU32::new(INVALID_PART),
            collision_next: AtomicU32::new(INVALID_LINE),
            part_prev: AtomicU32::new(INVALID_LINE),
            part_next: AtomicU32::new(INVALID_LINE),
            valid: AtomicU64::new(0),
            dirty: AtomicU64::new(0),
            access: AtomicU32::new(0),
        }
    }
}

/// The metadata store: one slot per cache line plus the hash-bucket heads.
pub struct Metadata {
    lines: Box<[LineMeta]>,
    heads: Box<[AtomicU32]>,
    mask: u64,
    hash_builder: RandomState,
    sectors_per_line: u8,
}

impl Metadata {
    /// Build an all-invalid store for the configured geometry.
    pub fn new(config: &CacheConfig) -> Self {
        // Fixed seeds in tests for deterministic bucket placement.
        #[cfg(test)]
        let hash_builder = RandomState::with_seeds(
            0x243f6a8885a308d3,
            0x13198a2e03707344,
            0xa4093822299f31d0,
            0x082efa98ec4e6c89,
        );
        #[cfg(not(test))]
        let hash_builder = RandomState::new();

        let buckets = config.hash_buckets();
        Self {
            lines: (0..config.lines).map(|_| LineMeta::new()).collect(),
            heads: (0..buckets).map(|_| AtomicU32::new(INVALID_LINE)).collect(),
            mask: (buckets as u64) - 1,
            hash_builder,
            sectors_per_line: config.sectors_per_line(),
        }
    }

    /// Number of cache-line slots.
    #[inline]
    pub fn line_count(&self) -> u32 {
        self.lines.len() as u32
    }

    /// Number of hash buckets.
    #[inline]
    pub fn bucket_count(&self) -> u32 {
        self.heads.len() as u32
    }

    /// Sectors per cache line.
    #[inline]
    pub fn sectors_per_line(&self) -> u8 {
        self.sectors_per_line
    }

    /// Last sector index of a cache line.
    #[inline]
    pub fn line_end_sector(&self) -> u8 {
        self.sectors_per_line - 1
    }

    #[inline]
    fn slot(&self, line: CacheLine) -> &LineMeta {
        &self.lines[line as usize]
    }

    /// Hash a `(core_id, core_line)` pair to its bucket.
    #[inline]
    pub fn hash_func(&self, core_id: CoreId, core_line: CoreLine) -> u32 {
        (self.hash_builder.hash_one((core_id, core_line)) & self.mask) as u32
    }

    /// Head of a bucket's collision chain, or `INVALID_LINE`.
    #[inline]
    pub fn hash_head(&self, bucket: u32) -> CacheLine {
        self.heads[bucket as usize].load(Ordering::Acquire)
    }

    /// Next line in a collision chain, or `INVALID_LINE` at the tail.
    #[inline]
    pub fn collision_next(&self, line: CacheLine) -> CacheLine {
        self.slot(line).collision_next.load(Ordering::Acquire)
    }

    /// Owning `(core_id, core_line)` of a slot.
    ///
    /// `core_id` is `INVALID_CORE` for unowned slots.
    #[inline]
    pub fn core_info(&self, line: CacheLine) -> (CoreId, CoreLine) {
        let slot = self.slot(line);
        (
            slot.core_id.load(Ordering::Acquire),
            slot.core_line.load(Ordering::Acquire),
        )
    }

    /// Logical-to-physical cache-line translation.
    ///
    /// The layout is sequential, so this is the identity; it stays a named
    /// seam so a striping layout can replace it without touching callers.
    #[inline]
    pub fn lg2phy(&self, line: CacheLine) -> CacheLine {
        line
    }

    /// Partition currently owning a slot, or `INVALID_PART`.
    #[inline]
    pub fn partition_id(&self, line: CacheLine) -> PartId {
        self.slot(line).partition.load(Ordering::Acquire)
    }

    pub(crate) fn set_partition_id(&self, line: CacheLine, part: PartId) {
        self.slot(line).partition.store(part, Ordering::Release);
    }

    pub(crate) fn part_prev(&self, line: CacheLine) -> CacheLine {
        self.slot(line).part_prev.load(Ordering::Acquire)
    }

    pub(crate) fn part_next(&self, line: CacheLine) -> CacheLine {
        self.slot(line).part_next.load(Ordering::Acquire)
    }

    pub(crate) fn set_part_links(&self, line: CacheLine, prev: CacheLine, next: CacheLine) {
        let slot = self.slot(line);
        slot.part_prev.store(prev, Ordering::Release);
        slot.part_next.store(next, Ordering::Release);
    }

    pub(crate) fn set_part_prev(&self, line: CacheLine, prev: CacheLine) {
        self.slot(line).part_prev.store(prev, Ordering::Release);
    }

    pub(crate) fn set_part_next(&self, line: CacheLine, next: CacheLine) {
        self.slot(line).part_next.store(next, Ordering::Release);
    }

    /// Splice a line at the head of `bucket`'s collision chain and record
    /// its owner.
    ///
    /// Caller must hold the bucket's exclusive lock or the global
    /// exclusive lock, plus the line's access guard.
    pub fn add_to_collision(
        &self,
        core_id: CoreId,
        core_line: CoreLine,
        bucket: u32,
        line: CacheLine,
    ) {
        let slot = self.slot(line);
        slot.core_id.store(core_id, Ordering::Release);
        slot.core_line.store(core_line, Ordering::Release);

        let head = self.heads[bucket as usize].load(Ordering::Acquire);
        slot.collision_next.store(head, Ordering::Release);
        self.heads[bucket as usize].store(line, Ordering::Release);
    }

    /// Unsplice a line from `bucket`'s collision chain and clear its owner.
    ///
    /// Same locking requirements as [`Metadata::add_to_collision`].
    pub fn remove_from_collision(&self, bucket: u32, line: CacheLine) {
        let next = self.collision_next(line);
        let head = self.hash_head(bucket);

        if head == line {
            self.heads[bucket as usize].store(next, Ordering::Release);
        } else {
            let mut curr = head;
            while curr != INVALID_LINE {
                let curr_next = self.collision_next(curr);
                if curr_next == line {
                    self.slot(curr).collision_next.store(next, Ordering::Release);
                    break;
                }
                curr = curr_next;
            }
        }

        let slot = self.slot(line);
        slot.collision_next.store(INVALID_LINE, Ordering::Release);
        slot.core_id.store(INVALID_CORE, Ordering::Release);
        slot.core_line.store(0, Ordering::Release);
    }

    // -------------------------------------------------------------------
    // Valid / dirty sector bitmaps
    // -------------------------------------------------------------------

    /// True if every sector in `start..=end` is valid.
    #[inline]
    pub fn test_valid_sec(&self, line: CacheLine, start: u8, end: u8) -> bool {
        let mask = sector_mask(start, end);
        self.slot(line).valid.load(Ordering::Acquire) & mask == mask
    }

    /// True if the line holds at least one valid sector.
    #[inline]
    pub fn test_valid_any(&self, line: CacheLine) -> bool {
        self.slot(line).valid.load(Ordering::Acquire) != 0
    }

    /// Mark sectors `start..=end` valid.
    pub fn set_valid_sec(&self, line: CacheLine, start: u8, end: u8) {
        let mask = sector_mask(start, end);
        self.slot(line).valid.fetch_or(mask, Ordering::AcqRel);
    }

    /// Clear valid bits for sectors `start..=end`.
    ///
    /// Returns `true` if the line still holds a valid sector afterwards.
    pub fn clear_valid_sec(&self, line: CacheLine, start: u8, end: u8) -> bool {
        let mask = sector_mask(start, end);
        let prev = self.slot(line).valid.fetch_and(!mask, Ordering::AcqRel);
        prev & !mask != 0
    }

    /// True if the line holds at least one dirty sector.
    #[inline]
    pub fn test_dirty(&self, line: CacheLine) -> bool {
        self.slot(line).dirty.load(Ordering::Acquire) != 0
    }

    /// True if every sector in `start..=end` is dirty.
    #[inline]
    pub fn test_dirty_all_sec(&self, line: CacheLine, start: u8, end: u8) -> bool {
        let mask = sector_mask(start, end);
        self.slot(line).dirty.load(Ordering::Acquire) & mask == mask
    }

    /// Mark sectors `start..=end` dirty (and valid).
    pub fn set_dirty_sec(&self, line: CacheLine, start: u8, end: u8) {
        let mask = sector_mask(start, end);
        let slot = self.slot(line);
        slot.valid.fetch_or(mask, Ordering::AcqRel);
        slot.dirty.fetch_or(mask, Ordering::AcqRel);
    }

    /// Clear dirty bits for sectors `start..=end`.
    pub fn clear_dirty_sec(&self, line: CacheLine, start: u8, end: u8) {
        let mask = sector_mask(start, end);
        self.slot(line).dirty.fetch_and(!mask, Ordering::AcqRel);
    }

    /// Clear all sector state of a line.
    pub(crate) fn clear_sectors(&self, line: CacheLine) {
        let slot = self.slot(line);
        slot.valid.store(0, Ordering::Release);
        slot.dirty.store(0, Ordering::Release);
    }

    // -------------------------------------------------------------------
    // Per-line access guard
    // -------------------------------------------------------------------

    /// Take the line's access guard shared. Spins.
    pub fn start_shared_access(&self, line: CacheLine) {
        let access = &self.slot(line).access;
        loop {
            let curr = access.load(Ordering::Relaxed);
            if curr & ACCESS_EXCLUSIVE == 0
                && access
                    .compare_exchange_weak(curr, curr + 1, Ordering::Acquire, Ordering::Relaxed)
                    .is_ok()
            {
                return;
            }
            crate::sync::spin_loop();
        }
    }

    /// Release a shared hold of the line's access guard.
    pub fn end_shared_access(&self, line: CacheLine) {
        self.slot(line).access.fetch_sub(1, Ordering::Release);
    }

    /// Take the line's access guard exclusive. Spins until all shared
    /// holders drain.
    pub fn start_exclusive_access(&self, line: CacheLine) {
        let access = &self.slot(line).access;
        while access
            .compare_exchange_weak(0, ACCESS_EXCLUSIVE, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            crate::sync::spin_loop();
        }
    }

    /// Release the exclusive hold of the line's access guard.
    pub fn end_exclusive_access(&self, line: CacheLine) {
        self.slot(line).access.store(0, Ordering::Release);
    }
}
