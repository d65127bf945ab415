//! Backend metrics seam.
//!
//! The host application provides two monotonic counters: one incremented
//! before every container engine call, one incremented when an engine call
//! fails with a recoverable error. The backend only drives the counters; the
//! collection and export pipeline belongs to the host.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A monotonic counter provided by the host application.
pub trait Counter: Send + Sync {
    /// Increment the counter by one.
    fn increment(&self);
}

/// The counter pair threaded through every engine interaction.
#[derive(Clone)]
pub struct BackendMetrics {
    /// Incremented before every engine API call.
    pub requests: Arc<dyn Counter>,
    /// Incremented when an engine API call fails with a recoverable error.
    pub failures: Arc<dyn Counter>,
}

impl BackendMetrics {
    /// Create a metrics pair from host-provided counters.
    pub fn new(requests: Arc<dyn Counter>, failures: Arc<dyn Counter>) -> Self {
        Self { requests, failures }
    }

    /// Create a metrics pair backed by process-local atomic counters.
    ///
    /// Useful for embedders without a metrics pipeline and for tests.
    pub fn unregistered() -> Self {
        Self {
            requests: Arc::new(AtomicCounter::default()),
            failures: Arc::new(AtomicCounter::default()),
        }
    }
}

impl std::fmt::Debug for BackendMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendMetrics").finish_non_exhaustive()
    }
}

/// Process-local counter implementation.
#[derive(Debug, Default)]
pub struct AtomicCounter(AtomicU64);

impl AtomicCounter {
    /// Current counter value.
    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Counter for AtomicCounter {
    fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_atomic_counter_increments() {
        let counter = AtomicCounter::default();
        assert_eq!(counter.value(), 0);
        counter.increment();
        counter.increment();
        assert_eq!(counter.value(), 2);
    }

    #[test]
    fn test_unregistered_metrics() {
        let metrics = BackendMetrics::unregistered();
        metrics.requests.increment();
        metrics.failures.increment();
    }
}
