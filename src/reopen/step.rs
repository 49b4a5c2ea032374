//! Reopen steps.
//!
//! Every step follows one contract: `execute` either commits its effect and
//! returns the [`StepUndo`] that reverses it, or returns `None` after
//! recording a [`crate::reopen::ReopenFailure`] in the context, having left
//! nothing behind. Undo records are only ever produced by committed steps.

mod branch;
mod dump;
mod join;
mod preload;
mod reader;
mod reclaim;

use std::fmt;
use std::sync::Arc;

use crate::index::partition_data::PartitionData;
use crate::index::reader::PartitionReader;
use crate::index::segment::{BuildingSegment, SegmentData, SegmentId};
use crate::partition::LiveState;
use crate::reopen::context::ReopenContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpMode {
    /// Seal the building segment and start a new one.
    SealBuilding,
    /// Dump every sealed segment that has no dumped copy yet.
    Flush,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReopenStep {
    Lock,
    Unlock,
    /// Reserve memory for the target version and load it.
    Preload,
    /// Replay the log onto the preloaded data without the write lock.
    Prejoin,
    DumpSegment(DumpMode),
    /// Drop realtime segments and documents the target version covers.
    ReclaimRtIndex { inplace: bool },
    /// Whole-segment reclaim for KV and KKV tables.
    ReclaimRtSegments {
        include_building: bool,
        drop_all: bool,
    },
    /// Stitch the realtime segments onto the target version.
    GenerateJoinSegment { redo: bool },
    Prepatch,
    RedoAndLock,
    SwitchBranch,
    ReclaimReaderMemory,
    ReleasePartitionReader,
    ReopenPartitionReader { has_preload: bool },
}

impl ReopenStep {
    pub fn name(&self) -> &'static str {
        match self {
            ReopenStep::Lock => "Lock",
            ReopenStep::Unlock => "Unlock",
            ReopenStep::Preload => "Preload",
            ReopenStep::Prejoin => "Prejoin",
            ReopenStep::DumpSegment(DumpMode::SealBuilding) => "DumpBuildingSegment",
            ReopenStep::DumpSegment(DumpMode::Flush) => "FlushDumpSegment",
            ReopenStep::ReclaimRtIndex { .. } => "ReclaimRtIndex",
            ReopenStep::ReclaimRtSegments { .. } => "ReclaimRtSegments",
            ReopenStep::GenerateJoinSegment { .. } => "GenerateJoinSegment",
            ReopenStep::Prepatch => "Prepatch",
            ReopenStep::RedoAndLock => "RedoAndLock",
            ReopenStep::SwitchBranch => "SwitchBranch",
            ReopenStep::ReclaimReaderMemory => "ReclaimReaderMemory",
            ReopenStep::ReleasePartitionReader => "ReleasePartitionReader",
            ReopenStep::ReopenPartitionReader { .. } => "ReopenPartitionReader",
        }
    }

    /// Whether the step touches live state and needs the data lock held.
    pub fn requires_lock(&self) -> bool {
        matches!(
            self,
            ReopenStep::DumpSegment(DumpMode::SealBuilding)
                | ReopenStep::ReclaimRtSegments { .. }
                | ReopenStep::GenerateJoinSegment { .. }
                | ReopenStep::SwitchBranch
                | ReopenStep::ReclaimReaderMemory
                | ReopenStep::ReleasePartitionReader
                | ReopenStep::ReopenPartitionReader { .. }
        )
    }

    pub(crate) fn execute(&self, ctx: &mut ReopenContext) -> Option<StepUndo> {
        if self.requires_lock() {
            assert!(
                ctx.holds_lock(),
                "{} requires the partition data lock",
                self.name()
            );
        }
        match *self {
            ReopenStep::Lock => {
                ctx.lock();
                Some(StepUndo::ReleaseLock)
            }
            ReopenStep::Unlock => {
                ctx.unlock();
                Some(StepUndo::ReacquireLock)
            }
            ReopenStep::Preload => preload::execute_preload(ctx),
            ReopenStep::Prejoin => join::execute_prejoin(ctx),
            ReopenStep::DumpSegment(mode) => dump::execute_dump(ctx, mode),
            ReopenStep::ReclaimRtIndex { inplace: true } => reclaim::execute_reclaim_inplace(ctx),
            ReopenStep::ReclaimRtIndex { inplace: false } => reclaim::execute_reclaim_rt_index(ctx),
            ReopenStep::ReclaimRtSegments {
                include_building,
                drop_all,
            } => reclaim::execute_reclaim_rt_segments(ctx, include_building, drop_all),
            ReopenStep::GenerateJoinSegment { redo } => join::execute_generate_join(ctx, redo),
            ReopenStep::Prepatch => branch::execute_prepatch(ctx),
            ReopenStep::RedoAndLock => branch::execute_redo_and_lock(ctx),
            ReopenStep::SwitchBranch => branch::execute_switch_branch(ctx),
            ReopenStep::ReclaimReaderMemory => reclaim::execute_reclaim_reader_memory(ctx),
            ReopenStep::ReleasePartitionReader => reader::execute_release_reader(ctx),
            ReopenStep::ReopenPartitionReader { has_preload } => {
                reader::execute_reopen_reader(ctx, has_preload)
            }
        }
    }
}

impl fmt::Display for ReopenStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReopenStep::ReclaimRtIndex { inplace } => write!(f, "ReclaimRtIndex(inplace={inplace})"),
            ReopenStep::ReclaimRtSegments {
                include_building,
                drop_all,
            } => write!(
                f,
                "ReclaimRtSegments(include_building={include_building}, drop_all={drop_all})"
            ),
            ReopenStep::GenerateJoinSegment { redo } => write!(f, "GenerateJoinSegment(redo={redo})"),
            ReopenStep::ReopenPartitionReader { has_preload } => {
                write!(f, "ReopenPartitionReader(has_preload={has_preload})")
            }
            other => f.write_str(other.name()),
        }
    }
}

/// Changes made by an in-place reclaim, in application order.
#[derive(Debug, Default)]
pub(crate) struct ReclaimJournal {
    pub removed: Vec<(usize, SegmentData)>,
    pub deleted: Vec<(SegmentId, u32)>,
}

/// How to reverse one committed step.
pub(crate) enum StepUndo {
    /// The step's effect is invisible or equivalent to the prior state.
    Nothing,
    ReleaseLock,
    ReacquireLock,
    DiscardPreload { reserved: u64 },
    DiscardPrejoin,
    RestorePartitionData {
        previous: Option<PartitionData>,
        reserved: u64,
    },
    RevertInplaceReclaim(ReclaimJournal),
    DiscardBranch { reserved: u64 },
    ReleaseRedoLock,
    /// Drop the dumped copies a flush produced.
    DiscardDumped(Vec<SegmentId>),
    /// Put the pre-seal live state back and reopen its building segment,
    /// unless writes already landed in the segment that replaced it.
    UnsealBuilding {
        previous: Arc<LiveState>,
        added: Arc<PartitionReader>,
        fresh: Arc<BuildingSegment>,
    },
    RestoreLive {
        previous: Arc<LiveState>,
        added: Option<Arc<PartitionReader>>,
        detached: Vec<Arc<PartitionReader>>,
    },
}

impl StepUndo {
    pub(crate) fn undo(self, ctx: &mut ReopenContext) {
        match self {
            StepUndo::Nothing => {}
            StepUndo::ReleaseLock | StepUndo::ReleaseRedoLock => ctx.unlock(),
            StepUndo::ReacquireLock => ctx.lock(),
            StepUndo::DiscardPreload { reserved } => {
                ctx.preload = None;
                ctx.release_reserved(reserved);
            }
            StepUndo::DiscardPrejoin => ctx.prejoin = None,
            StepUndo::RestorePartitionData { previous, reserved } => {
                ctx.partition_data = previous;
                ctx.release_reserved(reserved);
            }
            StepUndo::RevertInplaceReclaim(journal) => {
                let Some(branch) = ctx.branch.as_mut() else {
                    log::error!("in-place reclaim undo without a branch");
                    return;
                };
                for (segment_id, local) in journal.deleted.into_iter().rev() {
                    branch.data.deletions().undelete(segment_id, local);
                }
                for (index, segment) in journal.removed {
                    let index = index.min(branch.data.realtime.len());
                    branch.data.realtime.insert(index, segment);
                }
            }
            StepUndo::DiscardBranch { reserved } => {
                ctx.branch = None;
                ctx.release_reserved(reserved);
            }
            StepUndo::DiscardDumped(ids) => ctx.core.dump_container.discard(&ids),
            StepUndo::UnsealBuilding {
                previous,
                added,
                fresh,
            } => {
                let core = ctx.core.clone();
                let token = ctx.write_token();
                if !fresh.is_empty() || !Arc::ptr_eq(core.live().data.building(), &fresh) {
                    log::info!(
                        "keeping sealed segment {}: writes landed in {} after the seal",
                        previous.data.building().id(),
                        fresh.id()
                    );
                    return;
                }
                core.readers.remove(added.id());
                previous.data.building().unseal();
                core.restore_live(&token, previous);
            }
            StepUndo::RestoreLive {
                previous,
                added,
                detached,
            } => {
                let core = ctx.core.clone();
                if let Some(reader) = added {
                    core.readers.remove(reader.id());
                }
                core.readers.restore(detached);
                core.restore_live(&ctx.write_token(), previous);
            }
        }
    }

    pub(crate) fn name(&self) -> &'static str {
        match self {
            StepUndo::Nothing => "Nothing",
            StepUndo::ReleaseLock => "ReleaseLock",
            StepUndo::ReacquireLock => "ReacquireLock",
            StepUndo::DiscardPreload { .. } => "DiscardPreload",
            StepUndo::DiscardPrejoin => "DiscardPrejoin",
            StepUndo::RestorePartitionData { .. } => "RestorePartitionData",
            StepUndo::RevertInplaceReclaim(_) => "RevertInplaceReclaim",
            StepUndo::DiscardBranch { .. } => "DiscardBranch",
            StepUndo::ReleaseRedoLock => "ReleaseRedoLock",
            StepUndo::DiscardDumped(_) => "DiscardDumped",
            StepUndo::UnsealBuilding { .. } => "UnsealBuilding",
            StepUndo::RestoreLive { .. } => "RestoreLive",
        }
    }
}

/// A reader over `data`, not yet registered anywhere.
pub(crate) fn open_reader(ctx: &ReopenContext, data: PartitionData) -> Arc<PartitionReader> {
    Arc::new(PartitionReader::new(data, ctx.core.schema.clone()))
}
