use crate::partition::load_version_data;
use crate::reopen::ReopenFailure;
use crate::reopen::context::{Preloaded, ReopenContext};
use crate::reopen::resource::ResourceCalculator;
use crate::reopen::step::{StepUndo, open_reader};

/// Admission control: reserve the estimated cost of the target version, then
/// load it into a standalone partition data with its own reader.
pub(super) fn execute_preload(ctx: &mut ReopenContext) -> Option<StepUndo> {
    let core = ctx.core.clone();
    let live = core.live();
    let target = ctx.target_version().clone();

    let bytes = ResourceCalculator::new(&live.data, &core.dump_container).estimate_reopen_memory(&target);
    if !ctx.reserve(bytes) {
        log::warn!(
            "preload of version {} refused: {bytes} bytes requested, {} free",
            target.version_id,
            core.memory.free()
        );
        return None;
    }

    let data = match load_version_data(core.directory.as_ref(), &target, Some(&live.data)) {
        Ok(data) => data,
        Err(e) => {
            ctx.release_reserved(bytes);
            log::warn!("preload of version {} failed: {e}", target.version_id);
            return ctx.fail(ReopenFailure::Io(e.to_string()));
        }
    };
    let reader = open_reader(ctx, data.clone());
    log::info!(
        "preloaded version {} ({} segments, {bytes} bytes reserved)",
        target.version_id,
        data.on_disk_segments().len()
    );
    ctx.preload = Some(Preloaded { data, reader });
    Some(StepUndo::DiscardPreload { reserved: bytes })
}
