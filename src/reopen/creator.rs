//! Per-type reopen recipes.

use crate::config::OnlineConfig;
use crate::reopen::ReopenType;
use crate::reopen::chain::ReopenChain;
use crate::reopen::step::{DumpMode, ReopenStep};
use crate::schema::TableType;

const SEAL: ReopenStep = ReopenStep::DumpSegment(DumpMode::SealBuilding);
const FLUSH: ReopenStep = ReopenStep::DumpSegment(DumpMode::Flush);

/// Assembles the chain for a classified reopen.
///
/// Every chain starts holding the partition data lock, the state the context
/// is created in. Recipes that prepare work unlocked begin with `Unlock`.
pub struct ChainCreator<'a> {
    config: &'a OnlineConfig,
    table_type: TableType,
}

impl<'a> ChainCreator<'a> {
    pub fn new(config: &'a OnlineConfig, table_type: TableType) -> Self {
        Self { config, table_type }
    }

    pub fn create(&self, reopen_type: ReopenType, has_loaded_version: bool) -> ReopenChain {
        use ReopenStep::*;

        let steps = match reopen_type {
            ReopenType::Normal if self.table_type.is_kv_like() => vec![
                Unlock,
                Preload,
                FLUSH,
                Lock,
                FLUSH,
                ReclaimRtSegments {
                    include_building: true,
                    drop_all: false,
                },
                ReopenPartitionReader { has_preload: true },
            ],
            ReopenType::Normal if self.config.enable_optimized_reopen => vec![
                Unlock,
                FLUSH,
                Preload,
                Prepatch,
                ReclaimRtIndex { inplace: true },
                RedoAndLock,
                SwitchBranch,
                Unlock,
                Lock,
            ],
            ReopenType::Normal => {
                let mut steps = vec![Unlock, Preload, Prejoin, Lock, SEAL];
                if self.config.enable_async_dump_segment {
                    steps.extend([Unlock, FLUSH, Lock, SEAL, FLUSH]);
                }
                steps.extend([
                    ReclaimRtIndex { inplace: false },
                    GenerateJoinSegment { redo: true },
                    ReopenPartitionReader { has_preload: true },
                ]);
                steps
            }
            ReopenType::Force => {
                let mut steps = vec![
                    SEAL,
                    FLUSH,
                    ReclaimRtIndex { inplace: false },
                    GenerateJoinSegment { redo: true },
                ];
                if has_loaded_version {
                    steps.push(ReleasePartitionReader);
                }
                steps.push(ReopenPartitionReader { has_preload: false });
                steps
            }
            ReopenType::IndexRollback => {
                let mut steps = vec![
                    ReclaimRtSegments {
                        include_building: true,
                        drop_all: true,
                    },
                    GenerateJoinSegment { redo: false },
                ];
                if has_loaded_version {
                    steps.push(ReleasePartitionReader);
                }
                steps.push(ReopenPartitionReader { has_preload: false });
                steps
            }
            ReopenType::ReclaimReader => vec![
                ReclaimReaderMemory,
                ReopenPartitionReader { has_preload: false },
            ],
            ReopenType::SwitchRtSegment => vec![ReopenPartitionReader { has_preload: false }],
            ReopenType::NoNeed
            | ReopenType::UnableNormal
            | ReopenType::UnableForce
            | ReopenType::InconsistentSchema
            | ReopenType::Invalid => Vec::new(),
        };
        ReopenChain::new(reopen_type, steps)
    }
}
