//! User partitions: capacity quota, enable bit, membership list.
//!
//! Membership is an intrusive doubly-linked list threaded through the
//! metadata arena (`part_prev`/`part_next` per slot), so a line is on the
//! freelist or in exactly one partition's list, never both. Lists are
//! mutated only under the global exclusive lock or while holding the
//! exclusive hash-bucket lock for the line's bucket.

use crate::config::PartitionConfig;
use crate::line::{CacheLine, PartId, INVALID_LINE, INVALID_PART};
use crate::metadata::Metadata;
use crate::sync::{AtomicBool, AtomicU32, Ordering};

/// One user partition.
pub struct Partition {
    name: String,
    max_lines: u32,
    enabled: AtomicBool,
    head: AtomicU32,
    tail: AtomicU32,
    count: AtomicU32,
}

impl Partition {
    fn new(config: &PartitionConfig) -> Self {
        Self {
            name: config.name.clone(),
            max_lines: config.max_lines,
            enabled: AtomicBool::new(config.enabled),
            head: AtomicU32::new(INVALID_LINE),
            tail: AtomicU32::new(INVALID_LINE),
            count: AtomicU32::new(0),
        }
    }

    /// Partition name, for logs.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lines currently owned by the partition.
    #[inline]
    pub fn count(&self) -> u32 {
        self.count.load(Ordering::Acquire)
    }

    /// Maximum lines the partition may own.
    #[inline]
    pub fn max_lines(&self) -> u32 {
        self.max_lines
    }
}

/// Table of all user partitions.
pub struct PartitionTable {
    parts: Box<[Partition]>,
}

impl PartitionTable {
    /// Build the table from configuration.
    pub fn new(configs: &[PartitionConfig]) -> Self {
        Self {
            parts: configs.iter().map(Partition::new).collect(),
        }
    }

    /// Number of partitions.
    #[inline]
    pub fn len(&self) -> usize {
        self.parts.len()
    }

    /// True if the table is empty (never the case for a validated config).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// Access a partition.
    #[inline]
    pub fn get(&self, part: PartId) -> &Partition {
        &self.parts[part as usize]
    }

    /// Whether requests targeting `part` may allocate.
    #[inline]
    pub fn is_enabled(&self, part: PartId) -> bool {
        self.parts[part as usize].enabled.load(Ordering::Acquire)
    }

    /// Enable or disable a partition.
    pub fn set_enabled(&self, part: PartId, enabled: bool) {
        self.parts[part as usize].enabled.store(enabled, Ordering::Release);
    }

    /// True if `extra` more lines fit within the partition's quota.
    #[inline]
    pub fn has_space(&self, part: PartId, extra: u32) -> bool {
        let p = &self.parts[part as usize];
        p.count().saturating_add(extra) <= p.max_lines
    }

    /// Splice `line` at the head of `part`'s membership list.
    ///
    /// Caller must hold the global exclusive lock or the exclusive
    /// hash-bucket lock for the line's bucket.
    pub fn add(&self, metadata: &Metadata, part: PartId, line: CacheLine) {
        debug_assert_eq!(metadata.partition_id(line), INVALID_PART);
        let p = &self.parts[part as usize];

        let head = p.head.load(Ordering::Acquire);
        metadata.set_part_links(line, INVALID_LINE, head);
        if head != INVALID_LINE {
            metadata.set_part_prev(head, line);
        } else {
            p.tail.store(line, Ordering::Release);
        }
        p.head.store(line, Ordering::Release);
        metadata.set_partition_id(line, part);
        p.count.fetch_add(1, Ordering::AcqRel);
    }

    /// Unsplice `line` from its partition's membership list.
    ///
    /// Same locking requirements as [`PartitionTable::add`].
    pub fn remove(&self, metadata: &Metadata, line: CacheLine) {
        let part = metadata.partition_id(line);
        debug_assert_ne!(part, INVALID_PART);
        let p = &self.parts[part as usize];

        let prev = metadata.part_prev(line);
        let next = metadata.part_next(line);

        if prev != INVALID_LINE {
            metadata.set_part_next(prev, next);
        } else {
            p.head.store(next, Ordering::Release);
        }
        if next != INVALID_LINE {
            metadata.set_part_prev(next, prev);
        } else {
            p.tail.store(prev, Ordering::Release);
        }

        metadata.set_part_links(line, INVALID_LINE, INVALID_LINE);
        metadata.set_partition_id(line, INVALID_PART);
        p.count.fetch_sub(1, Ordering::AcqRel);
    }

    /// Iterate a partition's members, head to tail.
    pub fn iter<'a>(&'a self, metadata: &'a Metadata, part: PartId) -> PartIter<'a> {
        PartIter {
            metadata,
            curr: self.parts[part as usize].head.load(Ordering::Acquire),
        }
    }
}

/// Iterator over a partition's membership list.
pub struct PartIter<'a> {
    metadata: &'a Metadata,
    curr: CacheLine,
}

impl Iterator for PartIter<'_> {
    type Item = CacheLine;

    fn next(&mut self) -> Option<CacheLine> {
        if self.curr == INVALID_LINE {
            return None;
        }
        let line = self.curr;
        self.curr = self.metadata.part_next(line);
        Some(line)
    }
}
