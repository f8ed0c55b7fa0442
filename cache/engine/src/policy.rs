//! Collaborator interfaces the engine consumes.
//!
//! The engine does not implement eviction, cleaning, promotion or the
//! writeback cleaner; it drives them through these traits. The provided
//! defaults are inert stand-ins so a cache can be built before real
//! policies are attached: the default eviction supplies nothing, the
//! default promotion admits everything, and the default cleaner reports
//! success without writing.

use std::sync::Arc;

use crate::cache::Cache;
use crate::error::Result;
use crate::line::CacheLine;
use crate::queue::RequestQueue;
use crate::request::Request;

/// Outcome of an eviction pass.
///
/// A dedicated enum rather than overloading the lookup status: "could
/// not reclaim" is an allocation failure, not a lookup result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictOutcome {
    /// The requested number of victims was reclaimed.
    Supplied,
    /// The policy could not reclaim enough lines.
    Exhausted,
}

/// Eviction policy: picks victims and tracks hotness.
///
/// `evict_do` runs under the global exclusive metadata lock and is
/// expected to return victims to the freelist (fully invalidating them
/// via [`Cache::set_invalid_no_flush`]) or splice them straight into the
/// request with [`crate::engine::remap_cache_line`].
pub trait EvictionPolicy: Send + Sync {
    /// A line starts hosting data.
    fn init_cache_line(&self, line: CacheLine);

    /// A line was accessed.
    fn set_hot(&self, line: CacheLine);

    /// Reclaim `count` lines for `req`.
    fn evict_do(&self, cache: &Arc<Cache>, req: &Arc<Request>, count: u32) -> EvictOutcome;
}

/// Cleaning policy hook set. Policies are registered in an array and
/// selected by id; the init hook is optional per policy.
pub trait CleaningPolicy: Send + Sync {
    /// A line starts hosting data. Default: no bookkeeping.
    fn init_cache_block(&self, _cache: &Cache, _line: CacheLine) {}
}

/// Promotion policy: admission control for misses.
pub trait PromotionPolicy: Send + Sync {
    /// Whether the missed lines of `req` are worth admitting.
    fn should_promote(&self, req: &Arc<Request>) -> bool;

    /// The request's lines were inserted; drop any pending admission
    /// state for them. Called from under the request's metadata locks;
    /// implementations must not re-enter the engine.
    fn purge(&self, req: &Arc<Request>);
}

/// Attributes handed to the cleaner for one flush batch.
pub struct CleanerAttribs {
    /// Whether the cleaner must take cache-line locks itself (the engine
    /// already holds them on the clean-before-reuse path).
    pub lock_cachelines: bool,
    /// Number of lines the getter will yield.
    pub count: u32,
    /// Queue to run cleaner I/O on.
    pub queue: Arc<RequestQueue>,
    /// Yields the next line to flush, `None` to stop.
    pub getter: Box<dyn FnMut() -> Option<CacheLine> + Send>,
    /// Completion, fired exactly once with the flush outcome.
    pub complete: Box<dyn FnOnce(Result<()>) + Send>,
}

/// Writeback cleaner: flushes dirty lines to the core device.
pub trait Cleaner: Send + Sync {
    /// Start an asynchronous flush described by `attribs`.
    fn fire(&self, cache: &Arc<Cache>, attribs: CleanerAttribs);
}

/// Lock mode an engine variant wants for a request's lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    /// No line locks.
    None,
    /// Shared line locks.
    Read,
    /// Exclusive line locks.
    Write,
}

/// Engine-variant callbacks attached to each request.
pub trait EngineCallbacks: Send + Sync {
    /// Lock mode for the request's lines.
    fn lock_type(&self, req: &Request) -> LockType;

    /// The request's pending line locks were all granted.
    fn resume(&self, req: Arc<Request>);
}

/// I/O interface pair; the engine transiently swaps in its refresh
/// interface around resume.
pub trait IoHandler: Send + Sync {
    /// Run the read side.
    fn read(&self, req: Arc<Request>);

    /// Run the write side.
    fn write(&self, req: Arc<Request>);
}

/// Inert eviction: supplies no victims.
pub struct NopEviction;

impl EvictionPolicy for NopEviction {
    fn init_cache_line(&self, _line: CacheLine) {}

    fn set_hot(&self, _line: CacheLine) {}

    fn evict_do(&self, _cache: &Arc<Cache>, _req: &Arc<Request>, _count: u32) -> EvictOutcome {
        EvictOutcome::Exhausted
    }
}

/// Cleaning policy with no per-line state.
pub struct NopCleaning;

impl CleaningPolicy for NopCleaning {}

/// Admits every miss, tracks nothing.
pub struct AlwaysPromote;

impl PromotionPolicy for AlwaysPromote {
    fn should_promote(&self, _req: &Arc<Request>) -> bool {
        true
    }

    fn purge(&self, _req: &Arc<Request>) {}
}

/// Cleaner that reports success without writing anything. Placeholder
/// until a real writeback cleaner is attached.
pub struct NopCleaner;

impl Cleaner for NopCleaner {
    fn fire(&self, _cache: &Arc<Cache>, attribs: CleanerAttribs) {
        let CleanerAttribs {
            mut getter,
            complete,
            ..
        } = attribs;
        while getter().is_some() {}
        complete(Ok(()));
    }
}
