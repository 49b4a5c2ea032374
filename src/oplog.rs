//! Operation log for realtime writes.
//!
//! Every write accepted by an online partition is appended here before it is
//! applied, and receives a monotonically increasing [`Cursor`]. The reopen
//! protocol replays the log to catch a freshly loaded version up with the
//! writes that happened after the version's locator:
//!
//! ```text
//! cursor:  1 .. locator | locator+1 .. branch cursor | .. last_cursor
//!          (on disk)    | (prepatch / prejoin)       | (redo)
//! ```
//!
//! Entries at or below the locator of the loaded version are truncated once a
//! reopen commits.

use std::collections::{BTreeMap, VecDeque};
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::index::document::Document;

/// Sequence number of an operation.
pub type Cursor = u64;

/// A single write operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Operation {
    /// Insert a document, replacing older documents with the same pk.
    Add { document: Document },
    /// Change updatable fields of the current document with this pk.
    Update {
        pk: String,
        fields: BTreeMap<String, String>,
    },
    /// Delete the current document with this pk.
    Delete { pk: String },
}

impl Operation {
    pub fn pk(&self) -> &str {
        match self {
            Operation::Add { document } => &document.pk,
            Operation::Update { pk, .. } | Operation::Delete { pk } => pk,
        }
    }
}

/// An operation stamped with its cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub cursor: Cursor,
    pub operation: Operation,
}

/// Read side of the operation log, as consumed by redo.
pub trait OperationReplayer: Send + Sync + Debug {
    /// Cursor of the newest appended operation, or the starting cursor when empty.
    fn last_cursor(&self) -> Cursor;

    /// Up to `limit` records with a cursor strictly greater than `cursor`, in order.
    fn read_since(&self, cursor: Cursor, limit: usize) -> Vec<OperationRecord>;
}

/// In-memory append-only operation log.
///
/// Appends are serialized by the internal lock so that cursor order always
/// matches log order.
#[derive(Debug)]
pub struct OperationLog {
    records: RwLock<VecDeque<OperationRecord>>,
    next_cursor: AtomicU64,
}

impl Default for OperationLog {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationLog {
    pub fn new() -> Self {
        Self::starting_after(0)
    }

    /// A log whose first append receives `cursor + 1`.
    pub fn starting_after(cursor: Cursor) -> Self {
        Self {
            records: RwLock::new(VecDeque::new()),
            next_cursor: AtomicU64::new(cursor + 1),
        }
    }

    pub fn append(&self, operation: Operation) -> Cursor {
        let mut records = self.records.write();
        let cursor = self.next_cursor.fetch_add(1, Ordering::SeqCst);
        records.push_back(OperationRecord { cursor, operation });
        cursor
    }

    /// Drop every record with a cursor at or below `cursor`.
    pub fn truncate_through(&self, cursor: Cursor) {
        let mut records = self.records.write();
        while records.front().is_some_and(|r| r.cursor <= cursor) {
            records.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }

    /// Cursor of the oldest retained record.
    pub fn first_cursor(&self) -> Option<Cursor> {
        self.records.read().front().map(|r| r.cursor)
    }
}

impl OperationReplayer for OperationLog {
    fn last_cursor(&self) -> Cursor {
        self.next_cursor.load(Ordering::SeqCst).saturating_sub(1)
    }

    fn read_since(&self, cursor: Cursor, limit: usize) -> Vec<OperationRecord> {
        let records = self.records.read();
        let start = records.partition_point(|r| r.cursor <= cursor);
        records.range(start..).take(limit).cloned().collect()
    }
}
