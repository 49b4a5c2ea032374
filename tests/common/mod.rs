#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use iris_online::index::segment::BuiltSegment;
use iris_online::index::version::SegmentDeletions;
use iris_online::index::StoredDoc;
use iris_online::schema::SchemaId;
use iris_online::{
    Cursor, Directory, Document, MemoryDirectory, OnlineConfig, OnlinePartition, Operation,
    OperationRecord, OperationReplayer, Schema, SegmentId, TableType, Version, VersionId,
};

pub const SCHEMA_ID: SchemaId = 11;

pub fn schema(table_type: TableType) -> Arc<Schema> {
    Arc::new(
        Schema::builder("products")
            .schema_id(SCHEMA_ID)
            .table_type(table_type)
            .add_field("title")
            .add_updatable_field("price")
            .build(),
    )
}

pub fn doc(pk: &str, price: &str) -> Document {
    Document::new(pk)
        .with_field("title", format!("item {pk}"))
        .with_field("price", price)
}

pub fn price(value: &str) -> BTreeMap<String, String> {
    BTreeMap::from([("price".to_string(), value.to_string())])
}

/// Builds versions the way an offline builder would: it consumes operation
/// records and writes new segments plus deletions of superseded documents.
pub struct OfflineBuilder {
    directory: Arc<dyn Directory>,
    table_type: TableType,
    version: Version,
    /// Newest live instance of every pk (normal tables).
    locations: HashMap<String, (SegmentId, u32)>,
    docs: HashMap<SegmentId, Vec<StoredDoc>>,
    deleted: BTreeMap<SegmentId, Vec<u32>>,
    /// Current value of every key (KV tables).
    values: HashMap<String, Document>,
}

impl OfflineBuilder {
    pub fn new(directory: Arc<dyn Directory>, table_type: TableType) -> Self {
        Self {
            directory,
            table_type,
            version: Version::empty(SCHEMA_ID),
            locations: HashMap::new(),
            docs: HashMap::new(),
            deleted: BTreeMap::new(),
            values: HashMap::new(),
        }
    }

    pub fn locator(&self) -> Cursor {
        self.version.locator
    }

    pub fn version(&self) -> &Version {
        &self.version
    }

    /// Build the next version from `records`, spreading the new documents
    /// over `segments` segments.
    pub fn build(&mut self, records: &[OperationRecord], segments: usize) -> Version {
        let first_local = self.version.last_segment_local().map_or(0, |l| l + 1);
        let mut pending: Vec<StoredDoc> = Vec::new();
        let mut pending_index: HashMap<String, usize> = HashMap::new();
        let mut locator = self.version.locator;

        for record in records {
            locator = locator.max(record.cursor);
            if self.table_type.is_kv_like() {
                self.apply_kv(record, &mut pending);
            } else {
                self.apply_normal(record, &mut pending, &mut pending_index);
            }
        }

        let mut version = Version::new(VersionId(self.version.version_id.0 + 1), SCHEMA_ID)
            .with_locator(locator);
        for info in &self.version.segments {
            version.add_segment(info.clone());
        }

        // Split pending docs into contiguous chunks, one per new segment.
        let live: Vec<(usize, StoredDoc)> = pending.into_iter().enumerate().collect();
        let chunk = live.len().div_ceil(segments.max(1)).max(1);
        let mut new_locations = Vec::new();
        for (n, part) in live.chunks(chunk).enumerate() {
            let id = SegmentId::on_disk(first_local + n as u32);
            let docs: Vec<StoredDoc> = part.iter().map(|(_, d)| d.clone()).collect();
            for (local, (index, stored)) in part.iter().enumerate() {
                new_locations.push((*index, stored.doc.pk.clone(), id, local as u32));
            }
            let segment = BuiltSegment::new(id, docs.clone());
            self.directory.store_segment(&segment).unwrap();
            version.add_segment(segment.info().clone());
            self.docs.insert(id, docs);
        }
        if !self.table_type.is_kv_like() {
            for (index, pk, id, local) in new_locations {
                if pending_index.get(&pk) == Some(&index) {
                    self.locations.insert(pk, (id, local));
                }
            }
            // Superseded pending docs are never written live; mark them.
            for (id, docs) in &self.docs {
                if id.local() < first_local {
                    continue;
                }
                for (local, stored) in docs.iter().enumerate() {
                    if self.locations.get(&stored.doc.pk) != Some(&(*id, local as u32)) {
                        self.deleted.entry(*id).or_default().push(local as u32);
                    }
                }
            }
        }
        version.deletions = self
            .deleted
            .iter()
            .map(|(id, docs)| SegmentDeletions {
                segment_id: *id,
                docs: docs.clone(),
            })
            .collect();

        self.directory.store_version(&version).unwrap();
        self.version = version.clone();
        version
    }

    fn apply_normal(
        &mut self,
        record: &OperationRecord,
        pending: &mut Vec<StoredDoc>,
        pending_index: &mut HashMap<String, usize>,
    ) {
        match &record.operation {
            Operation::Add { document } => {
                self.retire(&document.pk, pending_index);
                pending_index.insert(document.pk.clone(), pending.len());
                pending.push(StoredDoc::new(document.clone(), record.cursor));
            }
            Operation::Delete { pk } => self.retire(pk, pending_index),
            Operation::Update { pk, fields } => {
                let current = match pending_index.get(pk) {
                    Some(&i) => Some(pending[i].clone()),
                    None => self.locations.get(pk).map(|(id, local)| {
                        self.docs[id][*local as usize].clone()
                    }),
                };
                let Some(mut stored) = current else {
                    return;
                };
                stored
                    .doc
                    .fields
                    .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                self.retire(pk, pending_index);
                pending_index.insert(pk.clone(), pending.len());
                pending.push(stored);
            }
        }
    }

    fn retire(&mut self, pk: &str, pending_index: &mut HashMap<String, usize>) {
        pending_index.remove(pk);
        if let Some((id, local)) = self.locations.remove(pk) {
            self.deleted.entry(id).or_default().push(local);
        }
    }

    fn apply_kv(&mut self, record: &OperationRecord, pending: &mut Vec<StoredDoc>) {
        let stored = match &record.operation {
            Operation::Add { document } => StoredDoc::new(document.clone(), record.cursor),
            Operation::Delete { pk } => StoredDoc::tombstone(pk.clone(), record.cursor),
            Operation::Update { pk, fields } => {
                let Some(mut current) = self.values.get(pk).cloned() else {
                    return;
                };
                current
                    .fields
                    .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                StoredDoc::new(current, record.cursor)
            }
        };
        if stored.tombstone {
            self.values.remove(&stored.doc.pk);
        } else {
            self.values.insert(stored.doc.pk.clone(), stored.doc.clone());
        }
        pending.push(stored);
    }
}

/// A partition over a fresh memory directory, with an offline builder that
/// already produced version 0 from `initial`.
pub struct Fixture {
    pub directory: Arc<MemoryDirectory>,
    pub builder: OfflineBuilder,
    pub schema: Arc<Schema>,
}

impl Fixture {
    pub fn new(table_type: TableType, initial: &[Document]) -> Self {
        let directory = Arc::new(MemoryDirectory::new());
        let mut builder = OfflineBuilder::new(directory.clone(), table_type);
        let records: Vec<OperationRecord> = initial
            .iter()
            .enumerate()
            .map(|(i, d)| OperationRecord {
                cursor: i as Cursor + 1,
                operation: Operation::Add {
                    document: d.clone(),
                },
            })
            .collect();
        let version = builder.build(&records, 1);
        assert_eq!(version.version_id, VersionId(0));
        Self {
            directory,
            builder,
            schema: schema(table_type),
        }
    }

    pub fn open(&self, config: OnlineConfig) -> OnlinePartition {
        OnlinePartition::builder(config, self.schema.clone(), self.directory.clone())
            .open(None)
            .unwrap()
    }

    /// Offline-build the next version from everything the partition logged
    /// after the builder's locator.
    pub fn build_from(&mut self, partition: &OnlinePartition, segments: usize) -> Version {
        let records = partition
            .operation_log()
            .read_since(self.builder.locator(), usize::MAX);
        self.builder.build(&records, segments)
    }
}

/// A log that always has another batch of operations waiting, as if writers
/// never paused.
#[derive(Debug)]
pub struct EndlessReplayer {
    next: AtomicU64,
    batch: usize,
    delay: Duration,
}

impl EndlessReplayer {
    pub fn new(after: Cursor, batch: usize) -> Self {
        Self {
            next: AtomicU64::new(after + 1),
            batch,
            delay: Duration::ZERO,
        }
    }

    /// Make every read take at least `delay`.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

impl OperationReplayer for EndlessReplayer {
    fn last_cursor(&self) -> Cursor {
        self.next.load(Ordering::SeqCst) - 1
    }

    fn read_since(&self, cursor: Cursor, limit: usize) -> Vec<OperationRecord> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        let count = self.batch.min(limit) as u64;
        let start = self
            .next
            .fetch_add(count, Ordering::SeqCst)
            .max(cursor + 1);
        (start..start + count)
            .map(|cursor| OperationRecord {
                cursor,
                operation: Operation::Delete {
                    pk: "ghost".to_string(),
                },
            })
            .collect()
    }
}
