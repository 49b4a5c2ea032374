//! Reclaiming realtime data the target version already covers, and reader
//! overhead.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use crate::index::partition_data::{PartitionData, first_realtime_local};
use crate::index::segment::{BuildingSegment, SegmentData, SegmentId};
use crate::oplog::Cursor;
use crate::reopen::context::ReopenContext;
use crate::reopen::step::{ReclaimJournal, StepUndo};

/// Mark every document of `segment` at or below `locator` deleted in `data`.
/// Calls `on_delete` for each newly deleted document.
fn delete_covered(
    data: &PartitionData,
    segment: &SegmentData,
    locator: Cursor,
    mut on_delete: impl FnMut(SegmentId, u32),
) {
    for local in 0..segment.doc_count() {
        if segment.doc_cursor(local).is_some_and(|c| c <= locator)
            && data.deletions().delete(segment.id(), local)
        {
            on_delete(segment.id(), local);
        }
    }
}

/// Builds a replacement partition data without covered realtime segments.
/// Live state is not touched.
pub(super) fn execute_reclaim_rt_index(ctx: &mut ReopenContext) -> Option<StepUndo> {
    let source = ctx
        .partition_data
        .clone()
        .unwrap_or_else(|| ctx.core.live().data.clone());
    let locator = ctx.target_version().locator;

    let mut reclaimed = PartitionData {
        deletions: Arc::new(source.deletions().deep_clone()),
        patches: Arc::new(source.patches().deep_clone()),
        applied_cursor: Arc::new(AtomicU64::new(source.applied_cursor())),
        ..source.clone()
    };
    let (covered, kept): (Vec<SegmentData>, Vec<SegmentData>) = source
        .realtime_segments()
        .iter()
        .cloned()
        .partition(|s| s.info().is_covered_by(locator));
    reclaimed.realtime = kept;

    let mut partial = 0;
    for segment in reclaimed.segments().iter().filter(|s| !s.id().is_on_disk()) {
        delete_covered(&reclaimed, segment, locator, |_, _| partial += 1);
    }
    let removed: Vec<SegmentId> = covered.iter().map(SegmentData::id).collect();
    reclaimed.deletions().retain_segments(|id| !removed.contains(&id));
    reclaimed.patches().retain_segments(|id| !removed.contains(&id));

    log::info!(
        "reclaimed {} realtime segments and {partial} documents covered by locator {locator}",
        removed.len()
    );
    let previous = ctx.partition_data.replace(reclaimed);
    Some(StepUndo::RestorePartitionData {
        previous,
        reserved: 0,
    })
}

/// Reclaims inside the private branch, journaling every change.
pub(super) fn execute_reclaim_inplace(ctx: &mut ReopenContext) -> Option<StepUndo> {
    let locator = ctx.target_version().locator;
    let Some(branch) = ctx.branch.as_mut() else {
        panic!("in-place reclaim requires a branch");
    };

    let mut journal = ReclaimJournal::default();
    let mut index = 0;
    let mut original = 0;
    while index < branch.data.realtime.len() {
        if branch.data.realtime[index].info().is_covered_by(locator) {
            let segment = branch.data.realtime.remove(index);
            journal.removed.push((original, segment));
        } else {
            index += 1;
        }
        original += 1;
    }
    for segment in branch.data.segments().iter().filter(|s| !s.id().is_on_disk()) {
        delete_covered(&branch.data, segment, locator, |id, local| {
            journal.deleted.push((id, local))
        });
    }

    log::info!(
        "in-place reclaim removed {} realtime segments and {} documents",
        journal.removed.len(),
        journal.deleted.len()
    );
    Some(StepUndo::RevertInplaceReclaim(journal))
}

/// Whole-segment reclaim for KV tables, and for rollbacks (`drop_all`).
pub(super) fn execute_reclaim_rt_segments(
    ctx: &mut ReopenContext,
    include_building: bool,
    drop_all: bool,
) -> Option<StepUndo> {
    let source = ctx
        .partition_data
        .clone()
        .unwrap_or_else(|| ctx.core.live().data.clone());
    let target = ctx.target_version().clone();

    let mut reclaimed = source.clone();
    let mut removed: Vec<SegmentId> = Vec::new();
    if drop_all {
        removed.extend(source.realtime_segments().iter().map(SegmentData::id));
        removed.push(source.building().id());
        reclaimed.realtime.clear();
        reclaimed.building = Arc::new(BuildingSegment::new(SegmentId::realtime(
            first_realtime_local(&target),
        )));
    } else {
        reclaimed.realtime.retain(|segment| {
            let covered = segment.info().is_covered_by(target.locator);
            if covered {
                removed.push(segment.id());
            }
            !covered
        });
        let building = source.building();
        if include_building && !building.is_empty() && building.info().is_covered_by(target.locator)
        {
            removed.push(building.id());
            reclaimed.building = Arc::new(BuildingSegment::new(SegmentId::realtime(
                source.next_realtime_local(),
            )));
        }
    }

    let deletions = source.deletions().deep_clone();
    deletions.retain_segments(|id| !removed.contains(&id));
    let patches = source.patches().deep_clone();
    patches.retain_segments(|id| !removed.contains(&id));
    reclaimed.deletions = Arc::new(deletions);
    reclaimed.patches = Arc::new(patches);
    reclaimed.applied_cursor = Arc::new(AtomicU64::new(source.applied_cursor()));

    log::info!(
        "reclaimed {} realtime segments{}",
        removed.len(),
        if drop_all { " (all)" } else { "" }
    );
    let previous = ctx.partition_data.replace(reclaimed);
    Some(StepUndo::RestorePartitionData {
        previous,
        reserved: 0,
    })
}

/// Sheds overwritten patch values; the version stays.
pub(super) fn execute_reclaim_reader_memory(ctx: &mut ReopenContext) -> Option<StepUndo> {
    let source = ctx
        .partition_data
        .clone()
        .unwrap_or_else(|| ctx.core.live().data.clone());
    let wasted = source.patches().wasted_bytes();
    let compacted = source.with_compacted_patches();
    log::info!("reclaiming {wasted} bytes of overwritten patch values");
    let previous = ctx.partition_data.replace(compacted);
    Some(StepUndo::RestorePartitionData {
        previous,
        reserved: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OnlineConfig;
    use crate::index::document::Document;
    use crate::reopen::ReopenType;
    use crate::reopen::step::testing::two_versions;

    #[test]
    fn test_reclaim_deletes_only_covered_documents() {
        let (partition, target) = two_versions(OnlineConfig::default());
        // Version 1 covers the write of `b`; `c` comes after it.
        partition.add_document(Document::new("b")).unwrap();
        partition.add_document(Document::new("c")).unwrap();
        let building = partition.partition_data().building().id();
        let mut ctx = partition.create_reopen_context(target, ReopenType::Normal);

        let undo = execute_reclaim_rt_index(&mut ctx).unwrap();
        let reclaimed = ctx.partition_data.clone().unwrap();
        assert!(reclaimed.deletions().is_deleted(building, 0));
        assert!(!reclaimed.deletions().is_deleted(building, 1));
        // Live state is untouched until a later step installs the result.
        assert!(!partition.partition_data().deletions().is_deleted(building, 0));

        undo.undo(&mut ctx);
        assert!(ctx.partition_data.is_none());
    }

    #[test]
    fn test_reclaim_segments_drop_all() {
        let (partition, target) = two_versions(OnlineConfig::default());
        partition.add_document(Document::new("c")).unwrap();
        let live = partition.partition_data();
        live.deletions().delete(live.building().id(), 0);
        let mut ctx = partition.create_reopen_context(target.clone(), ReopenType::IndexRollback);

        assert!(execute_reclaim_rt_segments(&mut ctx, true, true).is_some());
        let reclaimed = ctx.partition_data.clone().unwrap();
        assert!(reclaimed.realtime_segments().is_empty());
        assert!(reclaimed.building().is_empty());
        assert_eq!(
            reclaimed.building().id(),
            SegmentId::realtime(first_realtime_local(&target))
        );
        assert_eq!(reclaimed.deletions().deleted_count(live.building().id()), 0);
        assert_eq!(live.building().doc_count(), 1);
    }
}
