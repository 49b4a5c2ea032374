//! Optimized path: the new version is layered under the realtime segments in
//! a private branch, caught up with the writers, and swapped in.

use std::sync::Arc;
use std::sync::atomic::AtomicU64;
use std::time::Instant;

use crate::index::modifier::{ModifyMode, PartitionModifier};
use crate::index::segment::SegmentId;
use crate::partition::LiveState;
use crate::reopen::ReopenFailure;
use crate::reopen::context::{Branch, ReopenContext};
use crate::reopen::step::{StepUndo, open_reader};

/// Builds the branch from a lock-free snapshot of the live data. The branch
/// starts at the target locator; redo brings it forward.
pub(super) fn execute_prepatch(ctx: &mut ReopenContext) -> Option<StepUndo> {
    let Some(preload) = ctx.preload.as_ref() else {
        panic!("Prepatch requires a preloaded version");
    };
    let core = ctx.core.clone();
    let live = core.live();
    let forked_at = live.data.applied_cursor();
    let locator = ctx.target_version().locator;

    let mut data = live.data.fork().rebase_on(&preload.data);
    data.applied_cursor = Arc::new(AtomicU64::new(locator));
    data.join_segment = None;

    let patch_bytes = data.patches().used_bytes();
    if !ctx.reserve(patch_bytes) {
        log::warn!("prepatch refused: {patch_bytes} bytes of patches");
        return None;
    }

    let reader = open_reader(ctx, data.clone());
    log::info!(
        "branch prepared on version {} from live cursor {forked_at} ({} realtime segments, {patch_bytes} patch bytes)",
        data.version().version_id,
        data.realtime_segments().len()
    );
    ctx.branch = Some(Branch {
        data,
        reader,
        cursor: forked_at,
    });
    Some(StepUndo::DiscardBranch {
        reserved: patch_bytes,
    })
}

/// Replays the log onto the branch until a pass is short enough, then takes
/// the lock for one final pass and keeps it.
pub(super) fn execute_redo_and_lock(ctx: &mut ReopenContext) -> Option<StepUndo> {
    let Some(branch) = ctx.branch.as_ref() else {
        panic!("RedoAndLock requires a branch");
    };
    let data = branch.data.clone();
    let forked_at = branch.cursor;
    let core = ctx.core.clone();
    let replayer = ctx.replayer.clone();
    let modifier = PartitionModifier::new(&data, &core.schema, ModifyMode::Redo);

    let started = Instant::now();
    let max_time = core.config.max_redo_time();
    let max_iterations = core.config.max_redo_iterations;
    let mut threshold = core.config.redo_converge_threshold;
    let mut iterations = 0;
    let mut replayed = 0;
    let mut converged = false;
    while iterations < max_iterations {
        if started.elapsed() >= max_time {
            log::warn!("redo time bound {max_time:?} hit after {iterations} passes");
            break;
        }
        let records = replayer.read_since(data.applied_cursor(), usize::MAX);
        replayed = modifier.replay(&records);
        core.metrics.on_redo_pass(replayed);
        iterations += 1;
        log::debug!("redo pass {iterations}: {replayed} operations, threshold {threshold}");
        if replayed <= threshold {
            converged = true;
            break;
        }
        threshold /= 2;
    }
    if !converged {
        return ctx.fail(ReopenFailure::RedoNotConverged {
            iterations,
            replayed,
        });
    }

    ctx.lock();
    let records = replayer.read_since(data.applied_cursor(), usize::MAX);
    let last = modifier.replay(&records);
    core.metrics.on_redo_pass(last);
    log::info!(
        "redo converged after {iterations} passes; final locked pass replayed {last} operations up to cursor {} (branch forked at {forked_at})",
        data.applied_cursor()
    );
    Some(StepUndo::ReleaseRedoLock)
}

/// Installs the branch as the live state.
pub(super) fn execute_switch_branch(ctx: &mut ReopenContext) -> Option<StepUndo> {
    let Some(branch) = ctx.branch.as_ref() else {
        panic!("SwitchBranch requires a branch");
    };
    let core = ctx.core.clone();
    let live = core.live();
    let mut data = branch.data.clone();

    let held: Vec<SegmentId> = data
        .segment_ids()
        .into_iter()
        .filter(|id| !id.is_on_disk())
        .collect();
    let merged = data
        .deletions()
        .merge_from(live.data.deletions(), |id| held.contains(&id));

    let obsolete: Vec<SegmentId> = data
        .realtime_segments()
        .iter()
        .filter(|s| data.deletions().deleted_count(s.id()) as u32 >= s.doc_count())
        .map(|s| s.id())
        .collect();
    data.realtime.retain(|s| !obsolete.contains(&s.id()));
    data.deletions().retain_segments(|id| !obsolete.contains(&id));
    data.patches().retain_segments(|id| !obsolete.contains(&id));
    data.advance_applied_cursor(live.data.applied_cursor());

    let (data, switched) = data.switch_dumped(|segment| core.dump_container.get(segment));
    let reader = open_reader(ctx, data.clone());
    core.readers.add(reader.clone());
    let previous = core.install(
        &ctx.write_token(),
        LiveState {
            data,
            reader: reader.clone(),
        },
    );
    log::info!(
        "switched to branch on version {}: {merged} live deletions merged, {} obsolete segments trimmed, {switched} dumped segments switched",
        reader.version_id(),
        obsolete.len()
    );
    Some(StepUndo::RestoreLive {
        previous,
        added: Some(reader),
        detached: Vec::new(),
    })
}
