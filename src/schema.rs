//! Partition schema.
//!
//! Schemas are immutable and identified by `schema_id`. A version built
//! against a different schema id cannot be reopened into a partition.

use serde::{Deserialize, Serialize};

use crate::error::{IrisError, Result};

pub type SchemaId = u32;

/// Storage layout of a table. Decides which reopen recipe applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TableType {
    /// Inverted/attribute table with deletion maps and updatable fields.
    #[default]
    Normal,
    /// Key-value table; writes are appended puts and tombstones.
    Kv,
    /// Key-key-value table; shares the KV write and reopen model.
    Kkv,
}

impl TableType {
    pub fn is_kv_like(&self) -> bool {
        matches!(self, TableType::Kv | TableType::Kkv)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSchema {
    pub name: String,
    /// Whether the field may be changed in place by an update operation.
    #[serde(default)]
    pub updatable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    pub schema_id: SchemaId,
    pub name: String,
    #[serde(default)]
    pub table_type: TableType,
    pub fields: Vec<FieldSchema>,
}

impl Schema {
    pub fn builder(name: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            schema: Schema {
                schema_id: 0,
                name: name.into(),
                table_type: TableType::Normal,
                fields: Vec::new(),
            },
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSchema> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn is_updatable(&self, name: &str) -> bool {
        self.field(name).is_some_and(|f| f.updatable)
    }

    /// Reject an update touching unknown or non-updatable fields.
    pub fn check_update(&self, fields: impl IntoIterator<Item = impl AsRef<str>>) -> Result<()> {
        for name in fields {
            let name = name.as_ref();
            match self.field(name) {
                None => {
                    return Err(IrisError::invalid_argument(format!(
                        "unknown field '{name}' in schema '{}'",
                        self.name
                    )));
                }
                Some(field) if !field.updatable => {
                    return Err(IrisError::invalid_argument(format!(
                        "field '{name}' is not updatable"
                    )));
                }
                Some(_) => {}
            }
        }
        Ok(())
    }
}

pub struct SchemaBuilder {
    schema: Schema,
}

impl SchemaBuilder {
    pub fn schema_id(mut self, id: SchemaId) -> Self {
        self.schema.schema_id = id;
        self
    }

    pub fn table_type(mut self, table_type: TableType) -> Self {
        self.schema.table_type = table_type;
        self
    }

    pub fn add_field(mut self, name: impl Into<String>) -> Self {
        self.schema.fields.push(FieldSchema {
            name: name.into(),
            updatable: false,
        });
        self
    }

    pub fn add_updatable_field(mut self, name: impl Into<String>) -> Self {
        self.schema.fields.push(FieldSchema {
            name: name.into(),
            updatable: true,
        });
        self
    }

    pub fn build(self) -> Schema {
        self.schema
    }
}
