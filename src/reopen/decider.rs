//! Reopen classification.

use std::sync::Arc;

use crate::config::OnlineConfig;
use crate::index::dump::DumpContainer;
use crate::index::partition_data::PartitionData;
use crate::index::version::Version;
use crate::memory::MemoryQuotaController;
use crate::reopen::ReopenType;
use crate::reopen::resource::ResourceCalculator;
use crate::schema::Schema;

/// Everything the decider looks at.
pub struct DeciderInput<'a> {
    /// Live partition data.
    pub data: &'a PartitionData,
    pub dump_container: &'a DumpContainer,
    pub memory: &'a MemoryQuotaController,
    /// Resolved target version; `None` when it could not be read.
    pub target: Option<&'a Arc<Version>>,
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReopenDecision {
    pub reopen_type: ReopenType,
    pub version: Option<Arc<Version>>,
}

impl ReopenDecision {
    fn new(reopen_type: ReopenType, version: Option<&Arc<Version>>) -> Self {
        Self {
            reopen_type,
            version: version.cloned(),
        }
    }
}

/// Classifies a reopen attempt. Read-only: classifying the same state twice
/// gives the same answer.
pub struct ReopenDecider<'a> {
    config: &'a OnlineConfig,
    schema: &'a Schema,
}

impl<'a> ReopenDecider<'a> {
    pub fn new(config: &'a OnlineConfig, schema: &'a Schema) -> Self {
        Self { config, schema }
    }

    pub fn classify(&self, input: &DeciderInput<'_>) -> ReopenDecision {
        let loaded = input.data.version();
        let Some(target) = input.target else {
            return ReopenDecision::new(ReopenType::Invalid, None);
        };
        let decide = |reopen_type| ReopenDecision::new(reopen_type, Some(target));

        if !target.is_readable() || (!target.is_valid() && target.version_id != loaded.version_id)
        {
            log::warn!(
                "version {} is unreadable (format {})",
                target.version_id,
                target.format_version
            );
            return decide(ReopenType::Invalid);
        }
        if target.schema_id != self.schema.schema_id {
            log::warn!(
                "version {} uses schema {}, partition uses {}",
                target.version_id,
                target.schema_id,
                self.schema.schema_id
            );
            return decide(ReopenType::InconsistentSchema);
        }
        if loaded.is_valid() && target.version_id < loaded.version_id {
            return decide(ReopenType::IndexRollback);
        }

        let calculator = ResourceCalculator::new(input.data, input.dump_container);
        let free = input.memory.free();
        log::debug!(
            "classifying reopen to version {}: {} bytes on disk, {} realtime, {} in patches, {free} free",
            target.version_id,
            calculator.current_index_memory(),
            calculator.realtime_memory(),
            calculator.patch_memory()
        );

        if input.force {
            let needed = calculator.estimate_diff_version_memory(target);
            let available = free
                .saturating_add(calculator.reclaimable_realtime_memory(target.locator))
                .saturating_add(calculator.current_index_memory());
            if needed > available {
                log::warn!("force reopen needs {needed} bytes, {available} available");
                return decide(ReopenType::UnableForce);
            }
            return decide(ReopenType::Force);
        }

        let reclaimable_patch = calculator.reclaimable_patch_memory();
        let over_ceiling = reclaimable_patch > self.config.max_cur_reader_reclaimable_mem;
        // A version switch swaps dumped copies in as well.
        let same_version = target.version_id == loaded.version_id;
        let switchable = same_version && calculator.switchable_memory() > 0;

        if same_version && !over_ceiling && !switchable {
            return decide(ReopenType::NoNeed);
        }
        if over_ceiling {
            return decide(ReopenType::ReclaimReader);
        }
        if switchable {
            return decide(ReopenType::SwitchRtSegment);
        }

        let needed = calculator.estimate_diff_version_memory(target);
        let available = free.saturating_add(calculator.reclaimable_realtime_memory(target.locator));
        if needed > available {
            log::warn!(
                "reopen to version {} needs {needed} bytes, {available} available",
                target.version_id
            );
            return decide(ReopenType::UnableNormal);
        }
        decide(ReopenType::Normal)
    }
}
