//! Ordered step execution with reverse rollback.

use crate::reopen::ReopenType;
use crate::reopen::context::ReopenContext;
use crate::reopen::step::{ReopenStep, StepUndo};

/// What happened to a chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainOutcome {
    pub succeeded: bool,
    /// Index and step that aborted the chain.
    pub failed_step: Option<(usize, ReopenStep)>,
    /// Number of undo records replayed.
    pub rolled_back: usize,
}

/// A reopen recipe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReopenChain {
    reopen_type: ReopenType,
    steps: Vec<ReopenStep>,
}

impl ReopenChain {
    pub fn new(reopen_type: ReopenType, steps: Vec<ReopenStep>) -> Self {
        Self { reopen_type, steps }
    }

    pub fn reopen_type(&self) -> ReopenType {
        self.reopen_type
    }

    pub fn steps(&self) -> &[ReopenStep] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn contains(&self, step: ReopenStep) -> bool {
        self.steps.contains(&step)
    }

    /// Run every step in order. On the first failure, the steps that
    /// committed are undone in reverse and the chain reports failure.
    pub fn execute(&self, ctx: &mut ReopenContext) -> ChainOutcome {
        let names: Vec<String> = self.steps.iter().map(ToString::to_string).collect();
        log::info!(
            "executing {} chain: [{}]",
            self.reopen_type,
            names.join(", ")
        );

        let mut undos: Vec<StepUndo> = Vec::with_capacity(self.steps.len());
        for (index, step) in self.steps.iter().enumerate() {
            match step.execute(ctx) {
                Some(undo) => undos.push(undo),
                None => {
                    match ctx.failure() {
                        Some(failure) => log::warn!("step {index} ({step}) failed: {failure}"),
                        None => log::warn!("step {index} ({step}) failed"),
                    }
                    let rolled_back = Self::rollback(ctx, undos);
                    return ChainOutcome {
                        succeeded: false,
                        failed_step: Some((index, *step)),
                        rolled_back,
                    };
                }
            }
        }
        ChainOutcome {
            succeeded: true,
            failed_step: None,
            rolled_back: 0,
        }
    }

    fn rollback(ctx: &mut ReopenContext, undos: Vec<StepUndo>) -> usize {
        let count = undos.len();
        for undo in undos.into_iter().rev() {
            let name = undo.name();
            undo.undo(ctx);
            ctx.core.metrics.on_rollback(name);
            log::info!("rolled back {name}");
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::config::OnlineConfig;
    use crate::metrics::ReopenMetrics;
    use crate::reopen::ReopenFailure;
    use crate::reopen::step::DumpMode;
    use crate::reopen::step::testing::{two_versions_with, unstored_version};

    /// Remembers the undo records in the order they ran.
    #[derive(Debug, Default)]
    struct UndoLog(Mutex<Vec<&'static str>>);

    impl ReopenMetrics for UndoLog {
        fn on_rollback(&self, step: &'static str) {
            self.0.lock().push(step);
        }
    }

    #[test]
    fn test_rollback_runs_in_reverse() {
        let undo_log = Arc::new(UndoLog::default());
        let (partition, _) =
            two_versions_with(OnlineConfig::default(), |builder| builder.metrics(undo_log.clone()));
        let mut ctx = partition.create_reopen_context(unstored_version(), ReopenType::Normal);
        let chain = ReopenChain::new(
            ReopenType::Normal,
            vec![
                ReopenStep::DumpSegment(DumpMode::Flush),
                ReopenStep::Unlock,
                ReopenStep::Lock,
                ReopenStep::Unlock,
                ReopenStep::Preload,
            ],
        );

        let outcome = chain.execute(&mut ctx);
        assert!(!outcome.succeeded);
        assert_eq!(outcome.failed_step, Some((4, ReopenStep::Preload)));
        assert_eq!(outcome.rolled_back, 4);
        assert_eq!(
            *undo_log.0.lock(),
            vec!["ReacquireLock", "ReleaseLock", "ReacquireLock", "DiscardDumped"]
        );
        assert!(matches!(ctx.failure(), Some(ReopenFailure::Io(_))));
        assert!(ctx.holds_lock());
        assert_eq!(ctx.reserved_bytes(), 0);
        drop(ctx);
        assert!(!partition.is_write_locked());
    }

    #[test]
    fn test_failure_of_first_step_rolls_back_nothing() {
        let undo_log = Arc::new(UndoLog::default());
        let (partition, _) =
            two_versions_with(OnlineConfig::default(), |builder| builder.metrics(undo_log.clone()));
        let reader = partition.reader();
        let mut ctx = partition.create_reopen_context(unstored_version(), ReopenType::Normal);
        let chain = ReopenChain::new(
            ReopenType::Normal,
            vec![ReopenStep::Preload, ReopenStep::Unlock],
        );

        let outcome = chain.execute(&mut ctx);
        assert_eq!(
            outcome,
            ChainOutcome {
                succeeded: false,
                failed_step: Some((0, ReopenStep::Preload)),
                rolled_back: 0,
            }
        );
        assert!(undo_log.0.lock().is_empty());
        assert!(ctx.holds_lock());
        drop(ctx);
        assert!(Arc::ptr_eq(&reader, &partition.reader()));
    }

    #[test]
    fn test_successful_chain_keeps_every_step() {
        let (partition, target) = two_versions_with(OnlineConfig::default(), |builder| builder);
        let mut ctx = partition.create_reopen_context(target, ReopenType::Normal);
        let chain = ReopenChain::new(
            ReopenType::Normal,
            vec![ReopenStep::Unlock, ReopenStep::Preload, ReopenStep::Lock],
        );
        assert!(chain.contains(ReopenStep::Preload));
        assert_eq!(chain.reopen_type(), ReopenType::Normal);

        let outcome = chain.execute(&mut ctx);
        assert!(outcome.succeeded);
        assert_eq!(outcome.rolled_back, 0);
        assert!(ctx.preload_reader().is_some());
        assert!(ctx.reserved_bytes() > 0);
    }
}
