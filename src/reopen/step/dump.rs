use crate::partition::LiveState;
use crate::reopen::context::ReopenContext;
use crate::reopen::step::{DumpMode, StepUndo, open_reader};

/// Sealing installs a new live state; flushing dumps synchronously, so a
/// rolled-back flush never leaves a dumped copy behind.
pub(super) fn execute_dump(ctx: &mut ReopenContext, mode: DumpMode) -> Option<StepUndo> {
    let core = ctx.core.clone();
    let live = core.live();
    match mode {
        DumpMode::SealBuilding => {
            let building = live.data.building().clone();
            if building.is_empty() {
                return Some(StepUndo::Nothing);
            }
            let sealed = live.data.seal_building();
            let fresh = sealed.building().clone();
            let reader = open_reader(ctx, sealed.clone());
            core.readers.add(reader.clone());
            let previous = core.install(
                &ctx.write_token(),
                LiveState {
                    data: sealed,
                    reader: reader.clone(),
                },
            );
            log::debug!(
                "sealed building segment {} ({} docs)",
                building.id(),
                building.doc_count()
            );
            Some(StepUndo::UnsealBuilding {
                previous,
                added: reader,
                fresh,
            })
        }
        DumpMode::Flush => {
            let dumped = core.dump_container.flush(&live.data);
            if !dumped.is_empty() {
                log::debug!("flushed {} realtime segments", dumped.len());
            }
            Some(StepUndo::DiscardDumped(dumped))
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::OnlineConfig;
    use crate::index::document::Document;
    use crate::reopen::ReopenType;
    use crate::reopen::step::testing::two_versions;

    fn seal(ctx: &mut ReopenContext) -> StepUndo {
        execute_dump(ctx, DumpMode::SealBuilding).unwrap()
    }

    #[test]
    fn test_seal_of_empty_building_is_a_no_op() {
        let (partition, target) = two_versions(OnlineConfig::default());
        let reader = partition.reader();
        let mut ctx = partition.create_reopen_context(target, ReopenType::Normal);
        assert_eq!(seal(&mut ctx).name(), "Nothing");
        assert!(Arc::ptr_eq(&reader, &partition.reader()));
    }

    #[test]
    fn test_undone_seal_reopens_building() {
        let (partition, target) = two_versions(OnlineConfig::default());
        partition.add_document(Document::new("b")).unwrap();
        let reader = partition.reader();
        let mut ctx = partition.create_reopen_context(target, ReopenType::Normal);

        let undo = seal(&mut ctx);
        let data = partition.partition_data();
        assert_eq!(data.sealed_segments().len(), 1);
        assert!(data.building().is_empty());
        assert!(partition.reader().contains("b"));

        undo.undo(&mut ctx);
        let data = partition.partition_data();
        assert!(Arc::ptr_eq(&reader, &partition.reader()));
        assert!(data.sealed_segments().is_empty());
        assert!(!data.building().is_sealed());
        assert_eq!(data.building().doc_count(), 1);
    }

    #[test]
    fn test_undone_seal_keeps_later_writes() {
        let (partition, target) = two_versions(OnlineConfig::default());
        partition.add_document(Document::new("b")).unwrap();
        let mut ctx = partition.create_reopen_context(target, ReopenType::Normal);

        let undo = seal(&mut ctx);
        ctx.unlock();
        partition.add_document(Document::new("c")).unwrap();
        ctx.lock();
        undo.undo(&mut ctx);

        let data = partition.partition_data();
        assert_eq!(data.sealed_segments().len(), 1);
        assert_eq!(data.building().doc_count(), 1);
        let reader = partition.reader();
        assert!(reader.contains("b"));
        assert!(reader.contains("c"));
    }

    #[test]
    fn test_flush_dumps_and_undo_discards() {
        let (partition, target) = two_versions(OnlineConfig::default());
        partition.add_document(Document::new("b")).unwrap();
        let mut ctx = partition.create_reopen_context(target, ReopenType::Normal);
        let _sealed = seal(&mut ctx);

        let undo = execute_dump(&mut ctx, DumpMode::Flush).unwrap();
        assert_eq!(partition.dump_container().len(), 1);
        assert!(execute_dump(&mut ctx, DumpMode::Flush).is_some());
        assert_eq!(partition.dump_container().len(), 1);

        undo.undo(&mut ctx);
        assert!(partition.dump_container().is_empty());
    }
}
