//! Segments: contiguous runs of indexed documents.
//!
//! A segment is either *built* (immutable, loaded from a directory or dumped
//! from memory) or *building* (append-only, receiving realtime writes).
//!
//! Segment ids share one 32-bit space:
//!
//! - Bit 30: realtime segment
//! - Bit 29: join segment
//! - Bits 0-28: local id

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::AHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::index::document::StoredDoc;
use crate::oplog::Cursor;

pub const RT_SEGMENT_ID_MASK: u32 = 1 << 30;
pub const JOIN_SEGMENT_ID_MASK: u32 = 1 << 29;
pub const LOCAL_SEGMENT_ID_MASK: u32 = JOIN_SEGMENT_ID_MASK - 1;

/// In-memory overhead of a building segment relative to its dumped form.
pub const BUILDING_MEMORY_FACTOR: u64 = 2;

const UNSEALED: Cursor = Cursor::MAX;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SegmentId(pub u32);

impl SegmentId {
    pub fn on_disk(local: u32) -> Self {
        SegmentId(local & LOCAL_SEGMENT_ID_MASK)
    }

    pub fn realtime(local: u32) -> Self {
        SegmentId(RT_SEGMENT_ID_MASK | (local & LOCAL_SEGMENT_ID_MASK))
    }

    pub fn join(local: u32) -> Self {
        SegmentId(JOIN_SEGMENT_ID_MASK | (local & LOCAL_SEGMENT_ID_MASK))
    }

    pub fn local(&self) -> u32 {
        self.0 & LOCAL_SEGMENT_ID_MASK
    }

    pub fn is_realtime(&self) -> bool {
        self.0 & RT_SEGMENT_ID_MASK != 0
    }

    pub fn is_join(&self) -> bool {
        self.0 & JOIN_SEGMENT_ID_MASK != 0
    }

    pub fn is_on_disk(&self) -> bool {
        !self.is_realtime() && !self.is_join()
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_realtime() {
            write!(f, "rt:{}", self.local())
        } else if self.is_join() {
            write!(f, "join:{}", self.local())
        } else {
            write!(f, "{}", self.local())
        }
    }
}

/// Metadata about a segment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SegmentInfo {
    pub segment_id: SegmentId,

    /// Number of documents (including tombstones) in this segment.
    pub doc_count: u64,

    /// Resident memory once loaded.
    pub mem_bytes: u64,

    /// Smallest document cursor, 0 when empty.
    pub min_cursor: Cursor,

    /// Largest document cursor, 0 when empty.
    pub max_cursor: Cursor,
}

impl SegmentInfo {
    fn from_docs(segment_id: SegmentId, docs: &[StoredDoc]) -> Self {
        SegmentInfo {
            segment_id,
            doc_count: docs.len() as u64,
            mem_bytes: docs.iter().map(StoredDoc::estimated_bytes).sum(),
            min_cursor: docs.iter().map(|d| d.cursor).min().unwrap_or(0),
            max_cursor: docs.iter().map(|d| d.cursor).max().unwrap_or(0),
        }
    }

    /// Every document in the segment is at or below `locator`.
    pub fn is_covered_by(&self, locator: Cursor) -> bool {
        self.doc_count == 0 || self.max_cursor <= locator
    }
}

#[derive(Debug)]
pub struct SegmentDocs {
    docs: Vec<StoredDoc>,
    pk_index: AHashMap<String, Vec<u32>>,
}

impl SegmentDocs {
    fn new(docs: Vec<StoredDoc>) -> Self {
        let mut pk_index: AHashMap<String, Vec<u32>> = AHashMap::new();
        for (local, stored) in docs.iter().enumerate() {
            pk_index
                .entry(stored.doc.pk.clone())
                .or_default()
                .push(local as u32);
        }
        Self { docs, pk_index }
    }
}

/// An immutable segment.
///
/// Cloning and renumbering share the document storage.
#[derive(Debug, Clone)]
pub struct BuiltSegment {
    info: SegmentInfo,
    docs: Arc<SegmentDocs>,
}

impl BuiltSegment {
    pub fn new(segment_id: SegmentId, docs: Vec<StoredDoc>) -> Self {
        let info = SegmentInfo::from_docs(segment_id, &docs);
        Self {
            info,
            docs: Arc::new(SegmentDocs::new(docs)),
        }
    }

    /// The same documents under a different id.
    pub fn with_id(&self, segment_id: SegmentId) -> Self {
        let mut info = self.info.clone();
        info.segment_id = segment_id;
        Self {
            info,
            docs: self.docs.clone(),
        }
    }

    pub fn info(&self) -> &SegmentInfo {
        &self.info
    }

    pub fn id(&self) -> SegmentId {
        self.info.segment_id
    }

    pub fn doc_count(&self) -> u32 {
        self.docs.docs.len() as u32
    }

    pub fn docs(&self) -> &[StoredDoc] {
        &self.docs.docs
    }

    pub fn doc(&self, local: u32) -> Option<&StoredDoc> {
        self.docs.docs.get(local as usize)
    }

    pub fn instances(&self, pk: &str) -> &[u32] {
        self.docs
            .pk_index
            .get(pk)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn shares_docs_with(&self, other: &BuiltSegment) -> bool {
        Arc::ptr_eq(&self.docs, &other.docs)
    }
}

#[derive(Debug, Default)]
struct BuildingInner {
    docs: Vec<StoredDoc>,
    pk_index: AHashMap<String, Vec<u32>>,
    bytes: u64,
}

/// The in-memory segment receiving realtime writes.
///
/// Appends happen under the partition data lock; readers read concurrently
/// through the internal lock. A sealed segment takes no appends.
#[derive(Debug)]
pub struct BuildingSegment {
    segment_id: SegmentId,
    inner: RwLock<BuildingInner>,
    /// Applied cursor of the partition at seal time, `UNSEALED` while open.
    sealed_at: AtomicU64,
}

impl BuildingSegment {
    pub fn new(segment_id: SegmentId) -> Self {
        Self {
            segment_id,
            inner: RwLock::new(BuildingInner::default()),
            sealed_at: AtomicU64::new(UNSEALED),
        }
    }

    pub fn id(&self) -> SegmentId {
        self.segment_id
    }

    pub fn append(&self, stored: StoredDoc) -> u32 {
        debug_assert!(!self.is_sealed(), "append to sealed segment {}", self.segment_id);
        let mut inner = self.inner.write();
        let local = inner.docs.len() as u32;
        inner.bytes += stored.estimated_bytes();
        inner
            .pk_index
            .entry(stored.doc.pk.clone())
            .or_default()
            .push(local);
        inner.docs.push(stored);
        local
    }

    /// Stop taking appends. `cursor` is the last operation the segment saw.
    pub fn seal(&self, cursor: Cursor) {
        self.sealed_at.store(cursor, Ordering::SeqCst);
    }

    /// Accept appends again; only a rolled-back seal does this.
    pub(crate) fn unseal(&self) {
        self.sealed_at.store(UNSEALED, Ordering::SeqCst);
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed_at().is_some()
    }

    pub fn sealed_at(&self) -> Option<Cursor> {
        let cursor = self.sealed_at.load(Ordering::SeqCst);
        (cursor != UNSEALED).then_some(cursor)
    }

    pub fn doc_count(&self) -> u32 {
        self.inner.read().docs.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().docs.is_empty()
    }

    pub fn doc(&self, local: u32) -> Option<StoredDoc> {
        self.inner.read().docs.get(local as usize).cloned()
    }

    pub fn doc_cursor(&self, local: u32) -> Option<Cursor> {
        self.inner.read().docs.get(local as usize).map(|d| d.cursor)
    }

    pub fn instances(&self, pk: &str) -> Vec<u32> {
        self.inner
            .read()
            .pk_index
            .get(pk)
            .cloned()
            .unwrap_or_default()
    }

    pub fn mem_bytes(&self) -> u64 {
        self.inner.read().bytes * BUILDING_MEMORY_FACTOR
    }

    pub fn info(&self) -> SegmentInfo {
        SegmentInfo::from_docs(self.segment_id, &self.inner.read().docs)
    }

    /// Dump the current contents into an immutable segment with the same id.
    pub fn freeze(&self) -> BuiltSegment {
        let docs = self.inner.read().docs.clone();
        BuiltSegment::new(self.segment_id, docs)
    }
}

/// Either kind of segment, as held by partition data.
#[derive(Debug, Clone)]
pub enum SegmentData {
    Built(Arc<BuiltSegment>),
    Building(Arc<BuildingSegment>),
}

impl SegmentData {
    pub fn id(&self) -> SegmentId {
        match self {
            SegmentData::Built(s) => s.id(),
            SegmentData::Building(s) => s.id(),
        }
    }

    pub fn doc_count(&self) -> u32 {
        match self {
            SegmentData::Built(s) => s.doc_count(),
            SegmentData::Building(s) => s.doc_count(),
        }
    }

    pub fn doc(&self, local: u32) -> Option<StoredDoc> {
        match self {
            SegmentData::Built(s) => s.doc(local).cloned(),
            SegmentData::Building(s) => s.doc(local),
        }
    }

    pub fn doc_cursor(&self, local: u32) -> Option<Cursor> {
        match self {
            SegmentData::Built(s) => s.doc(local).map(|d| d.cursor),
            SegmentData::Building(s) => s.doc_cursor(local),
        }
    }

    pub fn instances(&self, pk: &str) -> Vec<u32> {
        match self {
            SegmentData::Built(s) => s.instances(pk).to_vec(),
            SegmentData::Building(s) => s.instances(pk),
        }
    }

    pub fn mem_bytes(&self) -> u64 {
        match self {
            SegmentData::Built(s) => s.info().mem_bytes,
            SegmentData::Building(s) => s.mem_bytes(),
        }
    }

    pub fn info(&self) -> SegmentInfo {
        match self {
            SegmentData::Built(s) => s.info().clone(),
            SegmentData::Building(s) => s.info(),
        }
    }

    /// A sealed building segment that still waits to be switched to its
    /// dumped form.
    pub fn is_sealed_building(&self) -> bool {
        matches!(self, SegmentData::Building(s) if s.is_sealed())
    }
}
