//! Version and segment storage.
//!
//! The reopen protocol treats segment files as opaque artifacts and only
//! talks to them through the [`Directory`] trait.

pub mod file;

use std::fmt::Debug;

use ahash::AHashMap;
use parking_lot::RwLock;

use crate::error::{IrisError, Result};
use crate::index::segment::{BuiltSegment, SegmentId};
use crate::index::version::{Version, VersionId};

pub use file::FileDirectory;

pub trait Directory: Send + Sync + Debug {
    /// Stored version ids, ascending.
    fn list_versions(&self) -> Result<Vec<VersionId>>;

    fn load_version(&self, id: VersionId) -> Result<Version>;

    fn load_segment(&self, id: SegmentId) -> Result<BuiltSegment>;

    fn store_version(&self, version: &Version) -> Result<()>;

    fn store_segment(&self, segment: &BuiltSegment) -> Result<()>;

    /// The newest stored version, if any.
    fn latest_version(&self) -> Result<Option<Version>> {
        match self.list_versions()?.last() {
            Some(id) => self.load_version(*id).map(Some),
            None => Ok(None),
        }
    }
}

/// Directory kept entirely in memory.
#[derive(Debug, Default)]
pub struct MemoryDirectory {
    versions: RwLock<AHashMap<VersionId, Version>>,
    segments: RwLock<AHashMap<SegmentId, BuiltSegment>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget a segment, as if its file had been removed.
    pub fn remove_segment(&self, id: SegmentId) -> bool {
        self.segments.write().remove(&id).is_some()
    }
}

impl Directory for MemoryDirectory {
    fn list_versions(&self) -> Result<Vec<VersionId>> {
        let mut ids: Vec<VersionId> = self.versions.read().keys().copied().collect();
        ids.sort();
        Ok(ids)
    }

    fn load_version(&self, id: VersionId) -> Result<Version> {
        self.versions
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| IrisError::not_found(format!("version {id}")))
    }

    fn load_segment(&self, id: SegmentId) -> Result<BuiltSegment> {
        self.segments
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| IrisError::not_found(format!("segment {id}")))
    }

    fn store_version(&self, version: &Version) -> Result<()> {
        if !version.is_valid() {
            return Err(IrisError::invalid_argument(
                "cannot store a version without an id",
            ));
        }
        self.versions
            .write()
            .insert(version.version_id, version.clone());
        Ok(())
    }

    fn store_segment(&self, segment: &BuiltSegment) -> Result<()> {
        if !segment.id().is_on_disk() {
            return Err(IrisError::invalid_argument(format!(
                "segment {} is not an on-disk segment",
                segment.id()
            )));
        }
        self.segments.write().insert(segment.id(), segment.clone());
        Ok(())
    }
}
