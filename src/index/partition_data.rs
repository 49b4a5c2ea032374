//! Partition data: one logical partition state.
//!
//! A [`PartitionData`] is a list of segment handles plus shared mutable side
//! structures (deletions, patches, applied cursor). Cloning gives a snapshot
//! that shares everything; [`PartitionData::fork`] gives a private branch that
//! shares segment bytes but copies the side structures.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::index::deletion::DeletionMap;
use crate::index::patch::PatchStore;
use crate::index::segment::{BuildingSegment, BuiltSegment, SegmentData, SegmentId, SegmentInfo};
use crate::index::version::Version;
use crate::oplog::Cursor;
use crate::schema::SchemaId;

#[derive(Debug, Clone)]
pub struct PartitionData {
    pub(crate) version: Arc<Version>,
    /// On-disk segments of `version`, ordered by id.
    pub(crate) on_disk: Vec<Arc<BuiltSegment>>,
    /// Realtime segments (dumped or sealed), ordered by id.
    pub(crate) realtime: Vec<SegmentData>,
    pub(crate) building: Arc<BuildingSegment>,
    pub(crate) deletions: Arc<DeletionMap>,
    pub(crate) patches: Arc<PatchStore>,
    pub(crate) applied_cursor: Arc<AtomicU64>,
    pub(crate) join_segment: Option<SegmentInfo>,
}

/// Local id of the first realtime segment following `version`.
pub fn first_realtime_local(version: &Version) -> u32 {
    version.last_segment_local().map_or(0, |last| last + 1)
}

impl PartitionData {
    /// Partition data over a loaded version with no realtime state.
    pub fn new(version: Arc<Version>, on_disk: Vec<Arc<BuiltSegment>>) -> Self {
        let building = BuildingSegment::new(SegmentId::realtime(first_realtime_local(&version)));
        PartitionData {
            deletions: Arc::new(DeletionMap::from_version(&version)),
            patches: Arc::new(PatchStore::new()),
            applied_cursor: Arc::new(AtomicU64::new(version.locator)),
            version,
            on_disk,
            realtime: Vec::new(),
            building: Arc::new(building),
            join_segment: None,
        }
    }

    pub fn empty(schema_id: SchemaId) -> Self {
        Self::new(Arc::new(Version::empty(schema_id)), Vec::new())
    }

    pub fn version(&self) -> &Arc<Version> {
        &self.version
    }

    pub fn on_disk_segments(&self) -> &[Arc<BuiltSegment>] {
        &self.on_disk
    }

    pub fn realtime_segments(&self) -> &[SegmentData] {
        &self.realtime
    }

    pub fn building(&self) -> &Arc<BuildingSegment> {
        &self.building
    }

    pub fn deletions(&self) -> &Arc<DeletionMap> {
        &self.deletions
    }

    pub fn patches(&self) -> &Arc<PatchStore> {
        &self.patches
    }

    pub fn join_segment(&self) -> Option<&SegmentInfo> {
        self.join_segment.as_ref()
    }

    /// Every segment, oldest first, the building segment last.
    pub fn segments(&self) -> Vec<SegmentData> {
        let mut segments: Vec<SegmentData> = self
            .on_disk
            .iter()
            .map(|s| SegmentData::Built(s.clone()))
            .collect();
        segments.extend(self.realtime.iter().cloned());
        segments.push(SegmentData::Building(self.building.clone()));
        segments
    }

    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.segments().iter().map(SegmentData::id).collect()
    }

    pub fn applied_cursor(&self) -> Cursor {
        self.applied_cursor.load(Ordering::SeqCst)
    }

    pub fn advance_applied_cursor(&self, cursor: Cursor) {
        self.applied_cursor.fetch_max(cursor, Ordering::SeqCst);
    }

    /// Newest operation a reader of this snapshot may observe.
    ///
    /// The applied cursor moves only after an operation is fully applied.
    /// Once the building segment is sealed, later writes land in segments
    /// this snapshot does not hold, so the view stops at the seal.
    pub fn visible_cursor(&self) -> Cursor {
        let applied = self.applied_cursor();
        match self.building.sealed_at() {
            Some(sealed) => applied.min(sealed),
            None => applied,
        }
    }

    /// A private branch. Segment bytes and the building segment stay shared.
    pub fn fork(&self) -> Self {
        PartitionData {
            deletions: Arc::new(self.deletions.deep_clone()),
            patches: Arc::new(self.patches.deep_clone()),
            applied_cursor: Arc::new(AtomicU64::new(self.applied_cursor())),
            ..self.clone()
        }
    }

    /// Local id following every realtime segment, building included.
    pub fn next_realtime_local(&self) -> u32 {
        let realtime_max = self.realtime.iter().map(|s| s.id().local()).max();
        realtime_max
            .unwrap_or(0)
            .max(self.building.id().local())
            + 1
    }

    /// Seal the building segment and start a new one.
    ///
    /// The returned data shares deletions, patches and cursor with `self`.
    pub fn seal_building(&self) -> Self {
        self.building.seal(self.applied_cursor());
        let mut sealed = self.clone();
        sealed.realtime.push(SegmentData::Building(self.building.clone()));
        sealed.building = Arc::new(BuildingSegment::new(SegmentId::realtime(
            self.next_realtime_local(),
        )));
        sealed
    }

    /// Sealed building segments still waiting for their dumped copy.
    pub fn sealed_segments(&self) -> Vec<Arc<BuildingSegment>> {
        self.realtime
            .iter()
            .filter(|s| s.is_sealed_building())
            .filter_map(|s| match s {
                SegmentData::Building(b) => Some(b.clone()),
                SegmentData::Built(_) => None,
            })
            .collect()
    }

    /// Replace sealed segments with the dumped copies `lookup` provides.
    /// Returns the new data and the number of switched segments.
    pub fn switch_dumped(
        &self,
        lookup: impl Fn(&Arc<BuildingSegment>) -> Option<Arc<BuiltSegment>>,
    ) -> (Self, usize) {
        let mut switched = 0;
        let mut data = self.clone();
        for segment in data.realtime.iter_mut() {
            let built = match segment {
                SegmentData::Building(building) if building.is_sealed() => lookup(building),
                _ => None,
            };
            if let Some(built) = built {
                *segment = SegmentData::Built(built);
                switched += 1;
            }
        }
        (data, switched)
    }

    /// The realtime state of `self` on top of the on-disk state of `base`.
    ///
    /// On-disk deletions and patches come from `base`, realtime ones from
    /// `self`. The result owns private side structures.
    pub fn rebase_on(&self, base: &PartitionData) -> Self {
        let deletions = DeletionMap::new();
        deletions.absorb(&base.deletions, |id| id.is_on_disk());
        deletions.absorb(&self.deletions, |id| !id.is_on_disk());
        let patches = PatchStore::new();
        patches.absorb(&base.patches, |id| id.is_on_disk());
        patches.absorb(&self.patches, |id| !id.is_on_disk());
        PartitionData {
            version: base.version.clone(),
            on_disk: base.on_disk.clone(),
            realtime: self.realtime.clone(),
            building: self.building.clone(),
            deletions: Arc::new(deletions),
            patches: Arc::new(patches),
            applied_cursor: Arc::new(AtomicU64::new(
                self.applied_cursor().max(base.applied_cursor()),
            )),
            join_segment: self.join_segment.clone(),
        }
    }

    /// Only the realtime segments, with no version loaded.
    pub fn realtime_only(&self) -> Self {
        let version = Version::empty(self.version.schema_id).with_locator(self.version.locator);
        PartitionData {
            version: Arc::new(version),
            on_disk: Vec::new(),
            ..self.clone()
        }
    }

    /// The same state with overwritten patch values released.
    pub fn with_compacted_patches(&self) -> Self {
        PartitionData {
            patches: Arc::new(self.patches.compacted()),
            ..self.clone()
        }
    }

    pub fn realtime_mem_bytes(&self) -> u64 {
        self.realtime.iter().map(SegmentData::mem_bytes).sum()
    }

    pub fn doc_count(&self) -> u64 {
        self.segments().iter().map(|s| s.doc_count() as u64).sum()
    }
}
