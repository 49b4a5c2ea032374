//! Versions: immutable, numbered sets of on-disk segments.

use std::fmt;

use ahash::AHashSet;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::index::segment::{SegmentId, SegmentInfo};
use crate::oplog::Cursor;
use crate::schema::SchemaId;

/// Newest version layout this crate can read.
pub const CURRENT_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionId(pub i64);

impl VersionId {
    /// Marker for "nothing loaded".
    pub const INVALID: VersionId = VersionId(-1);

    pub fn is_valid(&self) -> bool {
        self.0 >= 0
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Documents deleted from one on-disk segment by a later build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentDeletions {
    pub segment_id: SegmentId,
    pub docs: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub version_id: VersionId,

    /// On-disk segments, ordered by id.
    pub segments: Vec<SegmentInfo>,

    /// Highest operation-log cursor consumed by the build.
    pub locator: Cursor,

    /// Build time, milliseconds since the Unix epoch.
    pub timestamp: i64,

    pub format_version: u32,

    pub schema_id: SchemaId,

    #[serde(default)]
    pub deletions: Vec<SegmentDeletions>,
}

impl Version {
    pub fn new(version_id: VersionId, schema_id: SchemaId) -> Self {
        Version {
            version_id,
            segments: Vec::new(),
            locator: 0,
            timestamp: Utc::now().timestamp_millis(),
            format_version: CURRENT_FORMAT_VERSION,
            schema_id,
            deletions: Vec::new(),
        }
    }

    /// The version of a partition that has never loaded anything.
    pub fn empty(schema_id: SchemaId) -> Self {
        Self::new(VersionId::INVALID, schema_id)
    }

    pub fn with_segment(mut self, info: SegmentInfo) -> Self {
        self.add_segment(info);
        self
    }

    pub fn with_locator(mut self, locator: Cursor) -> Self {
        self.locator = locator;
        self
    }

    pub fn add_segment(&mut self, info: SegmentInfo) {
        let pos = self
            .segments
            .partition_point(|s| s.segment_id < info.segment_id);
        self.segments.insert(pos, info);
    }

    pub fn is_valid(&self) -> bool {
        self.version_id.is_valid()
    }

    pub fn is_readable(&self) -> bool {
        self.format_version <= CURRENT_FORMAT_VERSION
    }

    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.segments.iter().map(|s| s.segment_id).collect()
    }

    pub fn contains_segment(&self, id: SegmentId) -> bool {
        self.segments.iter().any(|s| s.segment_id == id)
    }

    pub fn segment(&self, id: SegmentId) -> Option<&SegmentInfo> {
        self.segments.iter().find(|s| s.segment_id == id)
    }

    /// Local id of the newest on-disk segment, if any.
    pub fn last_segment_local(&self) -> Option<u32> {
        self.segments.iter().map(|s| s.segment_id.local()).max()
    }

    pub fn doc_count(&self) -> u64 {
        self.segments.iter().map(|s| s.doc_count).sum()
    }

    /// Memory needed to hold every segment of this version.
    pub fn mem_bytes(&self) -> u64 {
        self.segments.iter().map(|s| s.mem_bytes).sum()
    }

    /// Segments of `self` that `base` does not hold.
    pub fn diff(&self, base: &Version) -> Vec<SegmentInfo> {
        let held: AHashSet<&SegmentInfo> = base.segments.iter().collect();
        self.segments
            .iter()
            .filter(|s| !held.contains(s))
            .cloned()
            .collect()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }
}
