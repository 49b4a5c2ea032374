//! Metrics sink consumed by the reopen protocol.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;

use crate::index::version::VersionId;
use crate::reopen::ReopenType;

/// Receives reopen events. All methods default to doing nothing.
pub trait ReopenMetrics: Send + Sync + Debug {
    fn on_reopen(&self, _reopen_type: ReopenType, _elapsed: Duration, _succeeded: bool) {}

    fn on_rollback(&self, _step: &'static str) {}

    fn on_reader_detached(&self, _version: VersionId) {}

    fn on_redo_pass(&self, _replayed: usize) {}
}

#[derive(Debug, Default)]
pub struct NoopMetrics;

impl ReopenMetrics for NoopMetrics {}

/// Atomic counters, mostly useful for tests and status pages.
#[derive(Debug, Default)]
pub struct CounterMetrics {
    pub attempts: AtomicU64,
    pub successes: AtomicU64,
    pub failures: AtomicU64,
    pub rollbacks: AtomicU64,
    pub readers_detached: AtomicU64,
    pub redo_passes: AtomicU64,
    pub redo_operations: AtomicU64,
    last_reopen_type: Mutex<Option<ReopenType>>,
}

impl CounterMetrics {
    pub fn get(counter: &AtomicU64) -> u64 {
        counter.load(Ordering::SeqCst)
    }

    /// Classification of the most recent reopen attempt.
    pub fn last_reopen_type(&self) -> Option<ReopenType> {
        *self.last_reopen_type.lock()
    }
}

impl ReopenMetrics for CounterMetrics {
    fn on_reopen(&self, reopen_type: ReopenType, _elapsed: Duration, succeeded: bool) {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        *self.last_reopen_type.lock() = Some(reopen_type);
        if succeeded {
            self.successes.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn on_rollback(&self, _step: &'static str) {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
    }

    fn on_reader_detached(&self, _version: VersionId) {
        self.readers_detached.fetch_add(1, Ordering::SeqCst);
    }

    fn on_redo_pass(&self, replayed: usize) {
        self.redo_passes.fetch_add(1, Ordering::SeqCst);
        self.redo_operations
            .fetch_add(replayed as u64, Ordering::SeqCst);
    }
}
