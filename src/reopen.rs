//! Online reopen protocol.
//!
//! A reopen moves a serving partition to another on-disk version, or sheds
//! memory, while readers and writers keep running. It is driven as:
//!
//! 1. [`decider::ReopenDecider`] classifies the attempt into a [`ReopenType`].
//! 2. [`creator::ChainCreator`] assembles the [`chain::ReopenChain`] recipe for it.
//! 3. The chain executes its [`step::ReopenStep`]s against a
//!    [`context::ReopenContext`]. Every executed step leaves an undo record; on
//!    the first failure the records are replayed in reverse, so a failed
//!    attempt leaves the partition exactly as it found it.

pub mod chain;
pub mod context;
pub mod creator;
pub mod decider;
pub mod resource;
pub mod step;

use std::fmt;

pub use chain::{ChainOutcome, ReopenChain};
pub use context::ReopenContext;
pub use creator::ChainCreator;
pub use decider::{DeciderInput, ReopenDecider, ReopenDecision};
pub use resource::ResourceCalculator;
pub use step::{DumpMode, ReopenStep};

/// What a reopen attempt has to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReopenType {
    /// Switch to a newer version.
    Normal,
    /// Switch while the caller holds exclusivity.
    Force,
    /// Keep the version, swap to a reader without reclaimable overhead.
    ReclaimReader,
    /// Keep the version, switch dumped realtime segments in.
    SwitchRtSegment,
    /// Nothing to do.
    NoNeed,
    /// A normal reopen would not fit in memory.
    UnableNormal,
    /// A forced reopen would not fit in memory.
    UnableForce,
    /// The target was built against another schema.
    InconsistentSchema,
    /// The target is older than the loaded version.
    IndexRollback,
    /// The target cannot be read.
    Invalid,
}

impl ReopenType {
    pub fn name(&self) -> &'static str {
        match self {
            ReopenType::Normal => "NORMAL_REOPEN",
            ReopenType::Force => "FORCE_REOPEN",
            ReopenType::ReclaimReader => "RECLAIM_READER_REOPEN",
            ReopenType::SwitchRtSegment => "SWITCH_RT_SEGMENT_REOPEN",
            ReopenType::NoNeed => "NO_NEED_REOPEN",
            ReopenType::UnableNormal => "UNABLE_NORMAL_REOPEN",
            ReopenType::UnableForce => "UNABLE_FORCE_REOPEN",
            ReopenType::InconsistentSchema => "INCONSISTENT_SCHEMA_REOPEN",
            ReopenType::IndexRollback => "INDEX_ROLLBACK_REOPEN",
            ReopenType::Invalid => "INVALID_REOPEN",
        }
    }
}

impl fmt::Display for ReopenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of [`crate::partition::OnlinePartition::reopen`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenStatus {
    Ok,
    Exception,
    OutOfMemory,
}

/// Why a step aborted its chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReopenFailure {
    /// A memory reservation was refused.
    OutOfMemory { requested: u64, free: u64 },
    /// A version or segment could not be loaded.
    Io(String),
    /// Redo kept falling behind the writers.
    RedoNotConverged { iterations: u32, replayed: usize },
    Internal(String),
}

impl ReopenFailure {
    pub fn status(&self) -> OpenStatus {
        match self {
            ReopenFailure::OutOfMemory { .. } => OpenStatus::OutOfMemory,
            _ => OpenStatus::Exception,
        }
    }
}

impl fmt::Display for ReopenFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReopenFailure::OutOfMemory { requested, free } => {
                write!(f, "out of memory: requested {requested} bytes, {free} free")
            }
            ReopenFailure::Io(msg) => write!(f, "io failure: {msg}"),
            ReopenFailure::RedoNotConverged {
                iterations,
                replayed,
            } => write!(
                f,
                "redo did not converge after {iterations} passes ({replayed} operations in the last pass)"
            ),
            ReopenFailure::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}
