//! Applying operations to partition data.
//!
//! Operations are applied "as of" their cursor: an operation at cursor `c`
//! only affects document instances produced by operations before `c`. That
//! makes replaying a suffix of the log onto data that already saw part of it
//! harmless, which is what redo relies on.

use crate::error::{IrisError, Result};
use crate::index::document::{Document, StoredDoc};
use crate::index::partition_data::PartitionData;
use crate::index::segment::SegmentData;
use crate::oplog::{Cursor, Operation, OperationRecord};
use crate::schema::Schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyMode {
    /// Writer path: adds append to the building segment.
    Live,
    /// Replay path: the added documents already sit in shared segments, so
    /// adds only retire older instances.
    Redo,
}

pub struct PartitionModifier<'a> {
    data: &'a PartitionData,
    schema: &'a Schema,
    mode: ModifyMode,
}

impl<'a> PartitionModifier<'a> {
    pub fn new(data: &'a PartitionData, schema: &'a Schema, mode: ModifyMode) -> Self {
        Self { data, schema, mode }
    }

    /// Reject an operation that cannot be applied to the current state.
    pub fn check(&self, operation: &Operation) -> Result<()> {
        if operation.pk().is_empty() {
            return Err(IrisError::invalid_argument("empty primary key"));
        }
        if let Operation::Update { pk, fields } = operation {
            if !self.schema.table_type.is_kv_like() {
                self.schema.check_update(fields.keys())?;
            }
            let cursor = self.data.applied_cursor() + 1;
            let found = if self.schema.table_type.is_kv_like() {
                self.latest_kv(pk, cursor).is_some()
            } else {
                self.newest_live(pk, cursor).is_some()
            };
            if !found {
                return Err(IrisError::not_found(format!("document '{pk}'")));
            }
        }
        Ok(())
    }

    pub fn apply(&self, record: &OperationRecord) -> Result<()> {
        if self.schema.table_type.is_kv_like() {
            self.apply_kv(record)?;
        } else {
            self.apply_normal(record)?;
        }
        self.data.advance_applied_cursor(record.cursor);
        Ok(())
    }

    /// Apply records in order, skipping ones that no longer apply.
    pub fn replay(&self, records: &[OperationRecord]) -> usize {
        for record in records {
            if let Err(e) = self.apply(record) {
                log::debug!("skipping operation at cursor {}: {e}", record.cursor);
                self.data.advance_applied_cursor(record.cursor);
            }
        }
        records.len()
    }

    fn apply_normal(&self, record: &OperationRecord) -> Result<()> {
        let cursor = record.cursor;
        match &record.operation {
            Operation::Add { document } => {
                // Append before retiring, so concurrent readers never see
                // the pk without a live instance.
                if self.mode == ModifyMode::Live {
                    self.data
                        .building()
                        .append(StoredDoc::new(document.clone(), cursor));
                }
                self.retire_before(&document.pk, cursor);
            }
            Operation::Delete { pk } => {
                self.retire_before(pk, cursor);
            }
            Operation::Update { pk, fields } => match self.newest_live(pk, cursor) {
                Some((segment, local)) => {
                    self.data.patches().apply(segment.id(), local, fields);
                }
                None if self.mode == ModifyMode::Live => {
                    return Err(IrisError::not_found(format!("document '{pk}'")));
                }
                None => {}
            },
        }
        Ok(())
    }

    fn apply_kv(&self, record: &OperationRecord) -> Result<()> {
        if self.mode == ModifyMode::Redo {
            return Ok(());
        }
        let cursor = record.cursor;
        let stored = match &record.operation {
            Operation::Add { document } => StoredDoc::new(document.clone(), cursor),
            Operation::Delete { pk } => StoredDoc::tombstone(pk.clone(), cursor),
            Operation::Update { pk, fields } => {
                let Some(mut current) = self.latest_kv(pk, cursor) else {
                    return Err(IrisError::not_found(format!("key '{pk}'")));
                };
                current
                    .fields
                    .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
                StoredDoc::new(current, cursor)
            }
        };
        self.data.building().append(stored);
        Ok(())
    }

    /// Delete every instance of `pk` produced before `cursor`.
    fn retire_before(&self, pk: &str, cursor: Cursor) {
        for segment in self.data.segments() {
            for local in segment.instances(pk) {
                if segment.doc_cursor(local).is_some_and(|c| c < cursor) {
                    self.data.deletions().delete_at(segment.id(), local, cursor);
                }
            }
        }
    }

    /// The newest undeleted instance of `pk` produced before `cursor`.
    fn newest_live(&self, pk: &str, cursor: Cursor) -> Option<(SegmentData, u32)> {
        let deletions = self.data.deletions();
        for segment in self.data.segments().into_iter().rev() {
            let found = segment.instances(pk).into_iter().rev().find(|&local| {
                segment.doc_cursor(local).is_some_and(|c| c < cursor)
                    && !deletions.is_deleted(segment.id(), local)
            });
            if let Some(local) = found {
                return Some((segment, local));
            }
        }
        None
    }

    /// Current value of a KV key as of `cursor`, `None` when absent or deleted.
    fn latest_kv(&self, pk: &str, cursor: Cursor) -> Option<Document> {
        let mut latest: Option<StoredDoc> = None;
        for segment in self.data.segments() {
            for local in segment.instances(pk) {
                let Some(stored) = segment.doc(local) else {
                    continue;
                };
                if stored.cursor < cursor
                    && latest.as_ref().is_none_or(|l| l.cursor < stored.cursor)
                {
                    latest = Some(stored);
                }
            }
        }
        latest.filter(|s| !s.tombstone).map(|s| s.doc)
    }
}
