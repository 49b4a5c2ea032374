//! Join-segment path: realtime segments are renumbered to follow the target
//! version and stitched onto it.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicU64;

use crate::index::deletion::DeletionMap;
use crate::index::modifier::{ModifyMode, PartitionModifier};
use crate::index::partition_data::{PartitionData, first_realtime_local};
use crate::index::patch::PatchStore;
use crate::index::segment::{BuildingSegment, BuiltSegment, SegmentData, SegmentId, SegmentInfo};
use crate::partition::load_version_data;
use crate::reopen::ReopenFailure;
use crate::reopen::context::{Prejoined, ReopenContext};
use crate::reopen::resource::ResourceCalculator;
use crate::reopen::step::StepUndo;

pub(super) fn execute_prejoin(ctx: &mut ReopenContext) -> Option<StepUndo> {
    let Some(preload) = ctx.preload.as_ref() else {
        panic!("Prejoin requires a preloaded version");
    };
    let data = preload.data.fork();
    let locator = ctx.target_version().locator;
    let cursor = ctx.replayer.last_cursor();
    let records: Vec<_> = ctx
        .replayer
        .read_since(locator, usize::MAX)
        .into_iter()
        .take_while(|r| r.cursor <= cursor)
        .collect();
    let replayed =
        PartitionModifier::new(&data, &ctx.core.schema, ModifyMode::Redo).replay(&records);
    data.advance_applied_cursor(cursor);
    log::debug!("prejoin replayed {replayed} operations in ({locator}, {cursor}]");

    ctx.prejoin = Some(Prejoined { data, cursor });
    Some(StepUndo::DiscardPrejoin)
}

pub(super) fn execute_generate_join(ctx: &mut ReopenContext, redo: bool) -> Option<StepUndo> {
    let core = ctx.core.clone();
    let live = core.live();
    let target = ctx.target_version().clone();
    let source = ctx
        .partition_data
        .clone()
        .unwrap_or_else(|| live.data.clone());

    // On-disk side: prejoined, preloaded, or loaded here.
    let mut reserved = 0;
    let (on_disk, from_cursor) = if let Some(prejoin) = ctx.prejoin.as_ref() {
        (prejoin.data.fork(), prejoin.cursor)
    } else if let Some(preload) = ctx.preload.as_ref() {
        (preload.data.fork(), target.locator)
    } else {
        let bytes = ResourceCalculator::new(&live.data, &core.dump_container)
            .estimate_diff_version_memory(&target);
        if !ctx.reserve(bytes) {
            log::warn!(
                "join of version {} refused: {bytes} bytes requested",
                target.version_id
            );
            return None;
        }
        match load_version_data(core.directory.as_ref(), &target, Some(&live.data)) {
            Ok(data) => {
                reserved = bytes;
                (data, target.locator)
            }
            Err(e) => {
                ctx.release_reserved(bytes);
                log::warn!("join of version {} failed: {e}", target.version_id);
                return ctx.fail(ReopenFailure::Io(e.to_string()));
            }
        }
    };

    // Realtime side: every realtime segment, and the building segment if it
    // holds documents, becomes a built segment numbered after the target.
    let first = first_realtime_local(&target);
    let mut carried: Vec<Arc<BuiltSegment>> = source
        .realtime_segments()
        .iter()
        .map(|segment| match segment {
            SegmentData::Built(built) => built.clone(),
            SegmentData::Building(building) => core
                .dump_container
                .get(building)
                .unwrap_or_else(|| Arc::new(building.freeze())),
        })
        .collect();
    if !source.building().is_empty() {
        carried.push(Arc::new(source.building().freeze()));
    }

    let mut mapping = BTreeMap::new();
    let mut realtime = Vec::with_capacity(carried.len());
    for (i, built) in carried.iter().enumerate() {
        let id = SegmentId::realtime(first + i as u32);
        mapping.insert(built.id(), id);
        realtime.push(SegmentData::Built(Arc::new(built.with_id(id))));
    }

    let deletions = DeletionMap::new();
    deletions.absorb(on_disk.deletions(), |id| id.is_on_disk());
    deletions.absorb(&source.deletions().remap(&mapping), |id| !id.is_on_disk());
    let patches = PatchStore::new();
    patches.absorb(on_disk.patches(), |id| id.is_on_disk());
    patches.absorb(&source.patches().remap(&mapping), |id| !id.is_on_disk());

    let join_info = SegmentInfo {
        segment_id: SegmentId::join(first),
        doc_count: carried.iter().map(|s| s.info().doc_count).sum(),
        mem_bytes: 0,
        min_cursor: carried.iter().map(|s| s.info().min_cursor).min().unwrap_or(0),
        max_cursor: carried.iter().map(|s| s.info().max_cursor).max().unwrap_or(0),
    };
    let building = BuildingSegment::new(SegmentId::realtime(first + carried.len() as u32));

    let joined = PartitionData {
        version: on_disk.version().clone(),
        on_disk: on_disk.on_disk_segments().to_vec(),
        realtime,
        building: Arc::new(building),
        deletions: Arc::new(deletions),
        patches: Arc::new(patches),
        applied_cursor: Arc::new(AtomicU64::new(on_disk.applied_cursor().max(from_cursor))),
        join_segment: Some(join_info),
    };

    if redo {
        let records = ctx.replayer.read_since(from_cursor, usize::MAX);
        let replayed =
            PartitionModifier::new(&joined, &core.schema, ModifyMode::Redo).replay(&records);
        joined.advance_applied_cursor(source.applied_cursor());
        log::debug!("join redo replayed {replayed} operations after cursor {from_cursor}");
    }

    log::info!(
        "joined {} realtime segments onto version {} as {}",
        carried.len(),
        target.version_id,
        SegmentId::join(first)
    );
    let previous = ctx.partition_data.replace(joined);
    Some(StepUndo::RestorePartitionData { previous, reserved })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OnlineConfig;
    use crate::index::document::Document;
    use crate::index::version::VersionId;
    use crate::reopen::ReopenType;
    use crate::reopen::step::ReopenStep;
    use crate::reopen::step::testing::two_versions;

    #[test]
    fn test_prejoin_replays_up_to_log_end() {
        let (partition, target) = two_versions(OnlineConfig::default());
        partition.add_document(Document::new("b")).unwrap();
        partition.add_document(Document::new("a")).unwrap();
        let mut ctx = partition.create_reopen_context(target, ReopenType::Normal);
        assert!(ReopenStep::Preload.execute(&mut ctx).is_some());

        let undo = execute_prejoin(&mut ctx).unwrap();
        let prejoin = ctx.prejoin.as_ref().unwrap();
        assert_eq!(prejoin.cursor, 3);
        assert_eq!(prejoin.data.applied_cursor(), 3);
        // The re-add of `a` retires the on-disk instance.
        assert!(prejoin.data.deletions().is_deleted(SegmentId::on_disk(0), 0));
        let preload = &ctx.preload.as_ref().unwrap().data;
        assert!(!preload.deletions().is_deleted(SegmentId::on_disk(0), 0));

        undo.undo(&mut ctx);
        assert!(ctx.prejoin.is_none());
    }

    #[test]
    fn test_generate_join_carries_realtime_segments() {
        let (partition, target) = two_versions(OnlineConfig::default());
        partition.add_document(Document::new("b")).unwrap();
        partition.add_document(Document::new("c")).unwrap();
        let mut ctx = partition.create_reopen_context(target.clone(), ReopenType::Normal);

        let undo = execute_generate_join(&mut ctx, true).unwrap();
        let joined = ctx.partition_data.clone().unwrap();
        assert_eq!(joined.version().version_id, VersionId(1));
        assert_eq!(joined.join_segment().unwrap().segment_id, SegmentId::join(2));
        assert_eq!(joined.realtime_segments().len(), 1);
        assert_eq!(joined.realtime_segments()[0].id(), SegmentId::realtime(2));
        assert!(joined.building().is_empty());
        assert_eq!(joined.applied_cursor(), 3);
        assert!(ctx.reserved_bytes() > 0);

        undo.undo(&mut ctx);
        assert!(ctx.partition_data.is_none());
        assert_eq!(ctx.reserved_bytes(), 0);
    }
}
