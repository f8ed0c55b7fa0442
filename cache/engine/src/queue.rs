//! Per-queue request FIFO.
//!
//! Workers drain queues; the engine only pushes. Pushing transfers
//! ownership of the request: it may be picked up and completed by a
//! concurrent worker before the push returns, so the pusher must not
//! touch the request afterwards. The kick hook runs after the push and
//! may wake a worker synchronously when `allow_sync` permits.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::request::Request;
use crate::sync::{AtomicU64, Ordering};

/// Worker wake hook, invoked after every push.
pub type KickFn = Box<dyn Fn(bool) + Send + Sync>;

/// FIFO of requests owned by one I/O worker context.
pub struct RequestQueue {
    list: Mutex<VecDeque<Arc<Request>>>,
    depth: AtomicU64,
    kick: Option<KickFn>,
}

impl RequestQueue {
    /// Queue with no kick hook; workers poll via [`RequestQueue::pop`].
    pub fn new() -> Self {
        Self {
            list: Mutex::new(VecDeque::new()),
            depth: AtomicU64::new(0),
            kick: None,
        }
    }

    /// Queue that invokes `kick` after every push.
    pub fn with_kick(kick: KickFn) -> Self {
        Self {
            list: Mutex::new(VecDeque::new()),
            depth: AtomicU64::new(0),
            kick: Some(kick),
        }
    }

    /// Append a request and kick the worker.
    pub fn push_back(&self, req: Arc<Request>, allow_sync: bool) {
        {
            let mut list = self.list.lock();
            self.depth.fetch_add(1, Ordering::AcqRel);
            list.push_back(req);
        }
        // The request may already be running on another worker here.
        if let Some(kick) = &self.kick {
            kick(allow_sync);
        }
    }

    /// Prepend a request (continuations jump the line) and kick.
    pub fn push_front(&self, req: Arc<Request>, allow_sync: bool) {
        {
            let mut list = self.list.lock();
            self.depth.fetch_add(1, Ordering::AcqRel);
            list.push_front(req);
        }
        if let Some(kick) = &self.kick {
            kick(allow_sync);
        }
    }

    /// Take the next request, front first.
    pub fn pop(&self) -> Option<Arc<Request>> {
        let mut list = self.list.lock();
        let req = list.pop_front();
        if req.is_some() {
            self.depth.fetch_sub(1, Ordering::AcqRel);
        }
        req
    }

    /// Number of queued requests.
    #[inline]
    pub fn depth(&self) -> u64 {
        self.depth.load(Ordering::Acquire)
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new()
    }
}
