//! cache-engine: core of a block-level caching engine.
//!
//! Sits between client block devices ("cores") and a faster cache
//! device, mapping fixed-size core-line ranges onto cache-line slots.
//! This crate owns the request preparation pipeline — lookup, mapping,
//! eviction coordination, flush-before-reuse, line locking — plus the
//! shared metadata it runs over:
//!
//! - **Metadata**: arena of cache-line slots with per-bucket collision
//!   chains, valid/dirty sector bitmaps, partition ids
//! - **Freelist**: pool of unowned cache-line indices
//! - **Partitions**: quota-limited membership lists over the arena
//! - **Concurrency**: hash-bucket locks, per-line async locks, the
//!   global exclusive metadata lock
//! - **Requests & queues**: per-core-line map entries, FIFO dispatch,
//!   suspension via the refresh interface
//! - **Engine**: `prepare_clines` and friends
//!
//! Eviction, cleaning, promotion and the writeback cleaner are consumed
//! through the traits in [`policy`]; the raw block I/O path and metadata
//! persistence live outside this crate.
//!
//! # Architecture
//!
//! ```text
//!    request ──► prepare_clines
//!                  │ hash + bucket rd locks
//!                  ▼
//!               traverse ── fully mapped ──► line locks ──► I/O engine
//!                  │ miss
//!                  ▼
//!               promotion? ──► map (freelist, bucket wr locks)
//!                  │ no space
//!                  ▼
//!               eviction (global exclusive) ──► map ──► line locks
//! ```
//!
//! On a line-lock wait the request parks; the grant resumes it through a
//! refresh pass that re-validates its mapping before the variant's I/O
//! interface runs.

#![warn(missing_docs)]
#![warn(clippy::all)]

mod cache;
mod concurrency;
mod config;
mod error;
mod fallback;
mod freelist;
mod line;
mod metadata;
mod partition;
mod queue;
mod request;
mod stats;
mod sync;

/// Collaborator traits: eviction, cleaning, promotion, cleaner, I/O.
pub mod policy;

/// The request preparation pipeline.
pub mod engine;

pub use cache::{Cache, CacheBuilder};
pub use concurrency::{BucketLocks, LineLocks, LockKind, LockResult};
pub use config::{CacheConfig, PartitionConfig};
pub use error::{EngineError, Result};
pub use fallback::FallbackCounter;
pub use freelist::Freelist;
pub use line::{
    CacheLine, CoreId, CoreLine, PartId, INVALID_CORE, INVALID_LINE, INVALID_PART,
    MAX_SECTORS_PER_LINE, SECTOR_SIZE,
};
pub use metadata::Metadata;
pub use partition::{PartIter, Partition, PartitionTable};
pub use queue::{KickFn, RequestQueue};
pub use request::{
    CompleteFn, IoDir, IoPhase, LookupStatus, MapEntry, ReqInfo, ReqState, Request,
    RequestParams,
};
pub use stats::{CacheStats, DirSnapshot};
