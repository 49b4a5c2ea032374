//! Per-attempt reopen state.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use parking_lot::RawMutex;
use parking_lot::lock_api::ArcMutexGuard;

use crate::index::partition_data::PartitionData;
use crate::index::reader::PartitionReader;
use crate::index::version::Version;
use crate::memory::MemoryReservation;
use crate::oplog::{Cursor, OperationReplayer};
use crate::partition::PartitionCore;
use crate::reopen::{ReopenFailure, ReopenType};

pub(crate) type DataGuard = ArcMutexGuard<RawMutex, ()>;

/// Proof that the partition data lock is held.
///
/// Only obtainable from a held guard; operations that change live state take
/// one as a parameter.
pub struct WriteToken<'a> {
    guard: &'a DataGuard,
}

impl<'a> WriteToken<'a> {
    pub(crate) fn new(guard: &'a DataGuard) -> Self {
        Self { guard }
    }

    pub(crate) fn guards(&self, lock: &Arc<parking_lot::Mutex<()>>) -> bool {
        Arc::ptr_eq(ArcMutexGuard::mutex(self.guard), lock)
    }
}

/// On-disk state of the target version, loaded ahead of any destructive step.
#[derive(Debug)]
pub(crate) struct Preloaded {
    pub data: PartitionData,
    pub reader: Arc<PartitionReader>,
}

/// The preloaded state with the log replayed up to `cursor`.
#[derive(Debug)]
pub(crate) struct Prejoined {
    pub data: PartitionData,
    pub cursor: Cursor,
}

/// Private partition data prepared by the optimized path.
#[derive(Debug)]
pub(crate) struct Branch {
    pub data: PartitionData,
    pub reader: Arc<PartitionReader>,
    /// Live applied cursor when the branch was forked.
    pub cursor: Cursor,
}

/// Everything the steps of one reopen attempt share.
///
/// Created holding the partition data lock. Dropping the context releases
/// whatever lock and memory it still holds.
pub struct ReopenContext {
    pub(crate) core: Arc<PartitionCore>,
    reopen_type: ReopenType,
    target: Arc<Version>,
    loaded: Arc<Version>,
    pub(crate) replayer: Arc<dyn OperationReplayer>,
    guard: Option<DataGuard>,
    pub(crate) preload: Option<Preloaded>,
    pub(crate) prejoin: Option<Prejoined>,
    pub(crate) partition_data: Option<PartitionData>,
    pub(crate) branch: Option<Branch>,
    reservation: MemoryReservation,
    pub(crate) failure: Option<ReopenFailure>,
}

impl ReopenContext {
    pub(crate) fn new(core: Arc<PartitionCore>, target: Arc<Version>, reopen_type: ReopenType) -> Self {
        let guard = core.data_lock.lock_arc();
        core.reopening.store(true, Ordering::SeqCst);
        let loaded = core.live().data.version().clone();
        let replayer: Arc<dyn OperationReplayer> = core.oplog.clone();
        let reservation = core.memory.empty_reservation();
        Self {
            core,
            reopen_type,
            target,
            loaded,
            replayer,
            guard: Some(guard),
            preload: None,
            prejoin: None,
            partition_data: None,
            branch: None,
            reservation,
            failure: None,
        }
    }

    pub fn reopen_type(&self) -> ReopenType {
        self.reopen_type
    }

    pub fn target_version(&self) -> &Arc<Version> {
        &self.target
    }

    /// Version that was live when the attempt started.
    pub fn loaded_version(&self) -> &Arc<Version> {
        &self.loaded
    }

    /// Replace the log replayed by redo steps.
    pub fn set_replayer(&mut self, replayer: Arc<dyn OperationReplayer>) {
        self.replayer = replayer;
    }

    pub fn holds_lock(&self) -> bool {
        self.guard.is_some()
    }

    pub fn failure(&self) -> Option<&ReopenFailure> {
        self.failure.as_ref()
    }

    /// Memory reserved by the steps executed so far.
    pub fn reserved_bytes(&self) -> u64 {
        self.reservation.bytes()
    }

    pub fn preload_reader(&self) -> Option<Arc<PartitionReader>> {
        self.preload.as_ref().map(|p| p.reader.clone())
    }

    pub fn branch_reader(&self) -> Option<Arc<PartitionReader>> {
        self.branch.as_ref().map(|b| b.reader.clone())
    }

    pub(crate) fn lock(&mut self) {
        assert!(self.guard.is_none(), "partition data lock taken twice");
        self.guard = Some(self.core.data_lock.lock_arc());
    }

    pub(crate) fn unlock(&mut self) {
        assert!(self.guard.take().is_some(), "partition data lock not held");
    }

    pub(crate) fn write_token(&self) -> WriteToken<'_> {
        match self.guard.as_ref() {
            Some(guard) => WriteToken::new(guard),
            None => panic!("partition data lock required but not held"),
        }
    }

    /// Record why the current step aborts.
    pub(crate) fn fail<T>(&mut self, failure: ReopenFailure) -> Option<T> {
        self.failure = Some(failure);
        None
    }

    /// Reserve `bytes` for this attempt. Records an out-of-memory failure on
    /// refusal.
    pub(crate) fn reserve(&mut self, bytes: u64) -> bool {
        match self.core.memory.try_reserve(bytes) {
            Some(reservation) => {
                self.reservation.merge(reservation);
                true
            }
            None => {
                self.failure = Some(ReopenFailure::OutOfMemory {
                    requested: bytes,
                    free: self.core.memory.free(),
                });
                false
            }
        }
    }

    pub(crate) fn release_reserved(&mut self, bytes: u64) {
        let keep = self.reservation.bytes().saturating_sub(bytes);
        self.reservation.shrink_to(keep);
    }

    pub(crate) fn take_reservation(&mut self) -> MemoryReservation {
        std::mem::replace(&mut self.reservation, self.core.memory.empty_reservation())
    }
}

impl Drop for ReopenContext {
    fn drop(&mut self) {
        self.core.reopening.store(false, Ordering::SeqCst);
    }
}
