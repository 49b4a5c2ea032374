//! Partition readers and the container keeping them alive.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::index::document::{Document, StoredDoc};
use crate::index::partition_data::PartitionData;
use crate::index::segment::SegmentId;
use crate::index::version::{Version, VersionId};
use crate::oplog::Cursor;
use crate::schema::Schema;

static NEXT_READER_ID: AtomicU64 = AtomicU64::new(1);

/// Read-only view over one [`PartitionData`] snapshot.
#[derive(Debug)]
pub struct PartitionReader {
    reader_id: u64,
    data: PartitionData,
    schema: Arc<Schema>,
}

impl PartitionReader {
    pub fn new(data: PartitionData, schema: Arc<Schema>) -> Self {
        Self {
            reader_id: NEXT_READER_ID.fetch_add(1, Ordering::Relaxed),
            data,
            schema,
        }
    }

    pub fn id(&self) -> u64 {
        self.reader_id
    }

    pub fn data(&self) -> &PartitionData {
        &self.data
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn version(&self) -> &Arc<Version> {
        self.data.version()
    }

    pub fn version_id(&self) -> VersionId {
        self.data.version().version_id
    }

    pub fn applied_cursor(&self) -> Cursor {
        self.data.applied_cursor()
    }

    pub fn segment_ids(&self) -> Vec<SegmentId> {
        self.data.segment_ids()
    }

    /// No on-disk version behind this reader.
    pub fn is_realtime_only(&self) -> bool {
        !self.data.version().is_valid() && self.data.on_disk_segments().is_empty()
    }

    /// The current document for `pk`, with patches applied.
    ///
    /// The lookup only observes operations up to the snapshot's visible
    /// cursor, so a write racing with it is seen either whole or not at all.
    pub fn get(&self, pk: &str) -> Option<Document> {
        let visible = self.data.visible_cursor();
        if self.schema.table_type.is_kv_like() {
            return self.get_kv(pk, visible);
        }
        let deletions = self.data.deletions();
        for segment in self.data.segments().into_iter().rev() {
            for local in segment.instances(pk).into_iter().rev() {
                if deletions.is_deleted_as_of(segment.id(), local, visible) {
                    continue;
                }
                let Some(stored) = segment.doc(local) else {
                    continue;
                };
                if stored.cursor > visible {
                    continue;
                }
                let mut doc = stored.doc;
                if let Some(patch) = self.data.patches().get(segment.id(), local) {
                    doc.fields.extend(patch);
                }
                return Some(doc);
            }
        }
        None
    }

    fn get_kv(&self, pk: &str, visible: Cursor) -> Option<Document> {
        let mut latest: Option<StoredDoc> = None;
        for segment in self.data.segments() {
            for local in segment.instances(pk) {
                if let Some(stored) = segment.doc(local) {
                    if stored.cursor <= visible
                        && latest.as_ref().is_none_or(|l| l.cursor < stored.cursor)
                    {
                        latest = Some(stored);
                    }
                }
            }
        }
        latest.filter(|s| !s.tombstone).map(|s| s.doc)
    }

    pub fn contains(&self, pk: &str) -> bool {
        self.get(pk).is_some()
    }

    /// Stored documents, including deleted and superseded ones.
    pub fn doc_count(&self) -> u64 {
        self.data.doc_count()
    }

    pub fn live_doc_count(&self) -> u64 {
        if self.schema.table_type.is_kv_like() {
            let mut latest: ahash::AHashMap<String, (Cursor, bool)> = ahash::AHashMap::new();
            for segment in self.data.segments() {
                for local in 0..segment.doc_count() {
                    let Some(stored) = segment.doc(local) else {
                        continue;
                    };
                    let entry = latest
                        .entry(stored.doc.pk)
                        .or_insert((stored.cursor, stored.tombstone));
                    if entry.0 < stored.cursor {
                        *entry = (stored.cursor, stored.tombstone);
                    }
                }
            }
            return latest.values().filter(|(_, tombstone)| !tombstone).count() as u64;
        }
        let deletions = self.data.deletions();
        self.data
            .segments()
            .iter()
            .map(|s| (s.doc_count() as u64).saturating_sub(deletions.deleted_count(s.id()) as u64))
            .sum()
    }
}

/// Readers handed out by a partition, newest last.
///
/// An entry stays alive as long as the container holds it; once nothing else
/// references an old reader it is evicted.
#[derive(Debug, Default)]
pub struct ReaderContainer {
    readers: Mutex<Vec<(VersionId, Arc<PartitionReader>)>>,
}

impl ReaderContainer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, reader: Arc<PartitionReader>) {
        self.readers.lock().push((reader.version_id(), reader));
    }

    pub fn latest(&self) -> Option<Arc<PartitionReader>> {
        self.readers.lock().last().map(|(_, r)| r.clone())
    }

    pub fn has_reader(&self, version_id: VersionId) -> bool {
        self.readers.lock().iter().any(|(v, _)| *v == version_id)
    }

    pub fn len(&self) -> usize {
        self.readers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.readers.lock().is_empty()
    }

    /// Remove a reader by id.
    pub fn remove(&self, reader_id: u64) -> Option<Arc<PartitionReader>> {
        let mut readers = self.readers.lock();
        let pos = readers.iter().position(|(_, r)| r.id() == reader_id)?;
        Some(readers.remove(pos).1)
    }

    /// Remove every reader of `version_id` and return them.
    pub fn detach_version(&self, version_id: VersionId) -> Vec<Arc<PartitionReader>> {
        let mut readers = self.readers.lock();
        let mut detached = Vec::new();
        readers.retain(|(v, r)| {
            if *v == version_id {
                detached.push(r.clone());
                false
            } else {
                true
            }
        });
        detached
    }

    /// Put detached readers back, keeping the newest entry last.
    pub fn restore(&self, detached: Vec<Arc<PartitionReader>>) {
        let mut readers = self.readers.lock();
        let tail = readers.pop();
        readers.extend(detached.into_iter().map(|r| (r.version_id(), r)));
        readers.extend(tail);
    }

    /// Drop readers nobody else references. The newest reader always stays.
    pub fn evict_unused(&self) -> usize {
        let mut readers = self.readers.lock();
        let Some(last) = readers.pop() else {
            return 0;
        };
        let before = readers.len();
        readers.retain(|(_, r)| Arc::strong_count(r) > 1);
        let evicted = before - readers.len();
        readers.push(last);
        evicted
    }
}
