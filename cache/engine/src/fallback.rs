//! Pass-through fallback on repeated device errors.

use tracing::info;

use crate::sync::{AtomicU32, Ordering};

/// Monotonic error counter that trips pass-through mode at a threshold.
///
/// Only the increment that crosses the threshold logs; later increments
/// stay silent.
pub struct FallbackCounter {
    count: AtomicU32,
    threshold: Option<u32>,
}

impl FallbackCounter {
    pub(crate) fn new(threshold: Option<u32>) -> Self {
        Self {
            count: AtomicU32::new(0),
            threshold,
        }
    }

    /// Record one device error.
    pub fn increment(&self) {
        let Some(threshold) = self.threshold else {
            return;
        };
        if self.count.fetch_add(1, Ordering::AcqRel) + 1 == threshold {
            info!(threshold, "error threshold reached, pass-through activated");
        }
    }

    /// Whether the cache is in pass-through mode.
    pub fn is_active(&self) -> bool {
        match self.threshold {
            Some(threshold) => self.count.load(Ordering::Acquire) >= threshold,
            None => false,
        }
    }

    /// Errors recorded so far.
    pub fn count(&self) -> u32 {
        match self.threshold {
            Some(_) => self.count.load(Ordering::Acquire),
            None => 0,
        }
    }
}
