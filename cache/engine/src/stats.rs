//! Per-partition request and volume counters.

use crate::line::PartId;
use crate::request::IoDir;
use crate::sync::{AtomicU64, Ordering};

/// Counters for one direction within one partition.
struct DirStats {
    bytes: AtomicU64,
    full_hits: AtomicU64,
    partial_hits: AtomicU64,
    misses: AtomicU64,
}

impl DirStats {
    fn new() -> Self {
        Self {
            bytes: AtomicU64::new(0),
            full_hits: AtomicU64::new(0),
            partial_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }
}

/// Snapshot of one direction's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DirSnapshot {
    /// Bytes moved.
    pub bytes: u64,
    /// Requests where every core line hit.
    pub full_hits: u64,
    /// Requests with at least one hit and one miss.
    pub partial_hits: u64,
    /// Requests with no hits.
    pub misses: u64,
}

struct PartStats {
    read: DirStats,
    write: DirStats,
}

/// Cache-wide statistics, sharded by partition.
pub struct CacheStats {
    parts: Box<[PartStats]>,
}

impl CacheStats {
    pub(crate) fn new(partitions: usize) -> Self {
        Self {
            parts: (0..partitions)
                .map(|_| PartStats {
                    read: DirStats::new(),
                    write: DirStats::new(),
                })
                .collect(),
        }
    }

    fn dir(&self, part: PartId, rw: IoDir) -> &DirStats {
        let part = &self.parts[part as usize];
        match rw {
            IoDir::Read => &part.read,
            IoDir::Write => &part.write,
        }
    }

    /// Account moved bytes.
    pub fn block_update(&self, part: PartId, rw: IoDir, bytes: u64) {
        self.dir(part, rw).bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Classify one finished request by its hit count.
    pub fn request_update(&self, part: PartId, rw: IoDir, hit_no: u32, core_line_count: u32) {
        let dir = self.dir(part, rw);
        if hit_no == core_line_count {
            dir.full_hits.fetch_add(1, Ordering::Relaxed);
        } else if hit_no > 0 {
            dir.partial_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            dir.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Snapshot one partition/direction pair.
    pub fn snapshot(&self, part: PartId, rw: IoDir) -> DirSnapshot {
        let dir = self.dir(part, rw);
        DirSnapshot {
            bytes: dir.bytes.load(Ordering::Relaxed),
            full_hits: dir.full_hits.load(Ordering::Relaxed),
            partial_hits: dir.partial_hits.load(Ordering::Relaxed),
            misses: dir.misses.load(Ordering::Relaxed),
        }
    }
}

#[cfg(all(test, not(feature = "loom")))]
mod tests {
    use super::*;

    #[test]
    fn test_block_update_accumulates() {
        let stats = CacheStats::new(2);
        stats.block_update(0, IoDir::Read, 4096);
        stats.block_update(0, IoDir::Read, 512);
        stats.block_update(1, IoDir::Write, 8192);

        assert_eq!(stats.snapshot(0, IoDir::Read).bytes, 4608);
        assert_eq!(stats.snapshot(0, IoDir::Write).bytes, 0);
        assert_eq!(stats.snapshot(1, IoDir::Write).bytes, 8192);
    }

    #[test]
    fn test_request_classification() {
        let stats = CacheStats::new(1);
        stats.request_update(0, IoDir::Read, 4, 4);
        stats.request_update(0, IoDir::Read, 1, 4);
        stats.request_update(0, IoDir::Read, 0, 4);

        let snap = stats.snapshot(0, IoDir::Read);
        assert_eq!(snap.full_hits, 1);
        assert_eq!(snap.partial_hits, 1);
        assert_eq!(snap.misses, 1);
    }
}
