//! Memory estimates for a prospective version switch.

use crate::index::dump::DumpContainer;
use crate::index::partition_data::PartitionData;
use crate::index::segment::SegmentData;
use crate::index::version::Version;
use crate::oplog::Cursor;

/// Memory figures of one partition state.
///
/// On-disk figures come from version metadata, realtime figures from the
/// segments themselves.
pub struct ResourceCalculator<'a> {
    data: &'a PartitionData,
    dump_container: &'a DumpContainer,
}

impl<'a> ResourceCalculator<'a> {
    pub fn new(data: &'a PartitionData, dump_container: &'a DumpContainer) -> Self {
        Self {
            data,
            dump_container,
        }
    }

    /// Memory held by the loaded on-disk version.
    pub fn current_index_memory(&self) -> u64 {
        self.data.version().mem_bytes()
    }

    pub fn realtime_memory(&self) -> u64 {
        self.data.realtime_mem_bytes()
    }

    /// Updatable-attribute patch memory, overwritten values included.
    pub fn patch_memory(&self) -> u64 {
        self.data.patches().total_bytes()
    }

    /// Patch memory a compacted reader would shed.
    pub fn reclaimable_patch_memory(&self) -> u64 {
        self.data.patches().wasted_bytes()
    }

    /// Realtime segments a version with this locator fully covers.
    pub fn reclaimable_realtime_memory(&self, locator: Cursor) -> u64 {
        self.data
            .realtime_segments()
            .iter()
            .filter(|s| s.info().is_covered_by(locator))
            .map(SegmentData::mem_bytes)
            .sum()
    }

    /// Memory freed by switching every dumped copy in.
    pub fn switchable_memory(&self) -> u64 {
        self.data
            .sealed_segments()
            .iter()
            .filter_map(|sealed| {
                self.dump_container
                    .get(sealed)
                    .map(|built| sealed.mem_bytes().saturating_sub(built.info().mem_bytes))
            })
            .sum()
    }

    /// Memory of the segments `target` adds over the loaded version.
    pub fn estimate_diff_version_memory(&self, target: &Version) -> u64 {
        target
            .diff(self.data.version())
            .iter()
            .map(|s| s.mem_bytes)
            .sum()
    }

    /// Memory to reserve before loading `target`.
    ///
    /// Patch memory is already paid by the live partition and is not part of
    /// the estimate. Realtime segments the target covers will be released.
    pub fn estimate_reopen_memory(&self, target: &Version) -> u64 {
        self.estimate_diff_version_memory(target)
            .saturating_sub(self.reclaimable_realtime_memory(target.locator))
    }
}
