use crate::partition::LiveState;
use crate::reopen::context::ReopenContext;
use crate::reopen::step::{StepUndo, open_reader};

/// Installs the resolved partition data behind a new reader.
pub(super) fn execute_reopen_reader(ctx: &mut ReopenContext, has_preload: bool) -> Option<StepUndo> {
    let core = ctx.core.clone();
    let mut data = ctx
        .partition_data
        .clone()
        .unwrap_or_else(|| core.live().data.clone());
    if has_preload {
        if let Some(preload) = ctx.preload.as_ref() {
            if data.version().version_id != preload.data.version().version_id {
                data = data.rebase_on(&preload.data);
            }
        }
    }

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
        "reader {} installed on version {} (was {}), {switched} dumped segments switched",
        reader.id(),
        reader.version_id(),
        previous.reader.version_id()
    );
    Some(StepUndo::RestoreLive {
        previous,
        added: Some(reader),
        detached: Vec::new(),
    })
}

/// Detaches the readers of the loaded version and serves realtime data only
/// until the new version is installed.
pub(super) fn execute_release_reader(ctx: &mut ReopenContext) -> Option<StepUndo> {
    let core = ctx.core.clone();
    let live = core.live();
    let old = live.data.version().version_id;

    let data = live.data.realtime_only();
    let reader = open_reader(ctx, data.clone());
    let detached = core.readers.detach_version(old);
    core.readers.add(reader.clone());
    let previous = core.install(
        &ctx.write_token(),
        LiveState {
            data,
            reader: reader.clone(),
        },
    );
    core.metrics.on_reader_detached(old);
    log::info!(
        "detached {} readers of version {old}; serving realtime data only",
        detached.len()
    );
    Some(StepUndo::RestoreLive {
        previous,
        added: Some(reader),
        detached,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::OnlineConfig;
    use crate::index::document::Document;
    use crate::index::version::VersionId;
    use crate::reopen::ReopenType;
    use crate::reopen::step::ReopenStep;
    use crate::reopen::step::testing::two_versions;

    #[test]
    fn test_reopen_reader_on_preloaded_version() {
        let (partition, target) = two_versions(OnlineConfig::default());
        partition.add_document(Document::new("c")).unwrap();
        let old = partition.reader();
        let mut ctx = partition.create_reopen_context(target, ReopenType::Normal);
        assert!(ReopenStep::Preload.execute(&mut ctx).is_some());

        let undo = execute_reopen_reader(&mut ctx, true).unwrap();
        let reader = partition.reader();
        assert_eq!(reader.version_id(), VersionId(1));
        assert!(reader.contains("b"));
        assert!(reader.contains("c"));
        assert_eq!(partition.reader_container().len(), 2);

        undo.undo(&mut ctx);
        assert!(Arc::ptr_eq(&old, &partition.reader()));
        assert_eq!(partition.reader_container().len(), 1);
    }

    #[test]
    fn test_release_reader_serves_realtime_only() {
        let (partition, _) = two_versions(OnlineConfig::default());
        partition.add_document(Document::new("c")).unwrap();
        let old = partition.reader();
        let mut ctx = partition.create_reopen_context(old.version().clone(), ReopenType::Force);

        let undo = execute_release_reader(&mut ctx).unwrap();
        let reader = partition.reader();
        assert!(reader.is_realtime_only());
        assert!(!reader.contains("a"));
        assert!(reader.contains("c"));
        assert!(!partition.reader_container().has_reader(VersionId(0)));

        undo.undo(&mut ctx);
        assert!(Arc::ptr_eq(&old, &partition.reader()));
        assert!(partition.reader_container().has_reader(VersionId(0)));
        assert_eq!(partition.reader_container().len(), 1);
    }
}
