use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::oplog::Cursor;

/// A document identified by its primary key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub pk: String,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl Document {
    pub fn new(pk: impl Into<String>) -> Self {
        Self {
            pk: pk.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }

    /// Rough in-memory footprint, used for memory accounting.
    pub fn estimated_bytes(&self) -> u64 {
        let fields: usize = self
            .fields
            .iter()
            .map(|(k, v)| k.len() + v.len() + 2 * std::mem::size_of::<String>())
            .sum();
        (std::mem::size_of::<Self>() + self.pk.len() + fields) as u64
    }
}

/// A document as held by a segment, with the cursor of the operation that
/// produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredDoc {
    pub doc: Document,
    pub cursor: Cursor,
    /// KV tables record deletes as tombstones.
    #[serde(default)]
    pub tombstone: bool,
}

impl StoredDoc {
    pub fn new(doc: Document, cursor: Cursor) -> Self {
        Self {
            doc,
            cursor,
            tombstone: false,
        }
    }

    pub fn tombstone(pk: impl Into<String>, cursor: Cursor) -> Self {
        Self {
            doc: Document::new(pk),
            cursor,
            tombstone: true,
        }
    }

    pub fn estimated_bytes(&self) -> u64 {
        self.doc.estimated_bytes() + std::mem::size_of::<Cursor>() as u64 + 1
    }
}
