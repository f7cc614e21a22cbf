//! [`DelayNs`] implementations for dispatcher backoff.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use embedded_hal::delay::DelayNs;

/// Blocks the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadDelay;

impl DelayNs for ThreadDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(std::time::Duration::from_nanos(u64::from(ns)));
    }
}

/// Returns immediately and only accumulates the requested time.  Used by
/// the simulator so a simulated day does not take a day.
#[derive(Debug, Default, Clone)]
pub struct SkipDelay {
    total_ns: Arc<AtomicU64>,
}

impl SkipDelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total time that would have been slept.
    pub fn total(&self) -> std::time::Duration {
        std::time::Duration::from_nanos(self.total_ns.load(Ordering::Relaxed))
    }
}

impl DelayNs for SkipDelay {
    fn delay_ns(&mut self, ns: u32) {
        self.total_ns.fetch_add(u64::from(ns), Ordering::Relaxed);
    }
}
