//! Overlap guard for timer-driven work.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Marks a unit of periodic work as running
///
/// `try_acquire` hands out at most one permit at a time; the guard is free
/// again when the permit drops.
#[derive(Debug, Clone, Default)]
pub struct InFlightGuard {
    flag: Arc<AtomicBool>,
}

#[derive(Debug)]
pub struct InFlightPermit {
    flag: Arc<AtomicBool>,
}

impl InFlightGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self) -> Option<InFlightPermit> {
        self.flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlightPermit {
                flag: Arc::clone(&self.flag),
            })
    }

    pub fn is_in_flight(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}
