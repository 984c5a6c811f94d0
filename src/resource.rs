use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use crate::schema::{
    TableRef, CREATED_AT_COLUMN, DATA_COLUMN, ID_COLUMN, PARENT_ID_COLUMN,
    UPDATED_AT_COLUMN,
};
use crate::sync::{SyncError, SyncResult};
use crate::value::{Map, Value};

/// One output record: an instance of a [`crate::schema::Table`].
///
/// A resource is a plain value. Nested resources only remember their parent's document ID
/// (which fills `__parent_id`), never the parent resource itself.
#[derive(Clone, Debug, PartialEq)]
pub struct Resource {
    table: TableRef,
    parent_id: Option<String>,
    values: BTreeMap<String, Value>,
}

impl Resource {
    pub fn new(table: TableRef, parent_id: Option<String>) -> Self {
        Self {
            table,
            parent_id,
            values: BTreeMap::new(),
        }
    }

    /// Build a complete resource for a document of `table`.
    ///
    /// `parent_id` must be set for nested tables and only for them, otherwise discovery and
    /// sync disagree about the table set and the error aborts the table's sync.
    pub fn build(
        table: &TableRef,
        parent_id: Option<&str>,
        document_id: &str,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        data: Map,
    ) -> SyncResult<Self> {
        match (table.is_nested(), parent_id) {
            (true, None) => {
                return Err(SyncError::MissingParentId {
                    table: table.name.clone(),
                    document_id: document_id.to_string(),
                })
            }
            (false, Some(_)) => {
                return Err(SyncError::UnexpectedParentId {
                    table: table.name.clone(),
                    document_id: document_id.to_string(),
                })
            }
            _ => {}
        }

        let mut resource = Self::new(table.clone(), parent_id.map(str::to_string));
        resource.set(ID_COLUMN, document_id)?;
        if let Some(parent_id) = parent_id {
            resource.set(PARENT_ID_COLUMN, parent_id)?;
        }
        resource.set(CREATED_AT_COLUMN, created_at)?;
        resource.set(UPDATED_AT_COLUMN, updated_at)?;
        resource.set(DATA_COLUMN, data)?;
        Ok(resource)
    }

    pub fn set(&mut self, column: &str, value: impl Into<Value>) -> SyncResult<()> {
        if self.table.column(column).is_none() {
            return Err(SyncError::ColumnNotFound {
                table: self.table.name.clone(),
                column: column.to_string(),
            });
        }
        self.values.insert(column.to_string(), value.into());
        Ok(())
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    pub fn table_name(&self) -> &str {
        &self.table.name
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_id.as_deref()
    }

    pub fn id(&self) -> Option<&str> {
        self.get(ID_COLUMN).and_then(Value::as_str)
    }

    pub fn data(&self) -> Option<&Map> {
        self.get(DATA_COLUMN).and_then(Value::as_map)
    }

    // JSON object of all set values, in column order
    pub fn to_json(&self) -> serde_json::Value {
        let values: serde_json::Map<String, serde_json::Value> = self
            .table
            .columns
            .iter()
            .filter_map(|c| {
                self.values
                    .get(&c.name)
                    .map(|v| (c.name.clone(), v.to_json()))
            })
            .collect();

        serde_json::json!({
            "table": self.table.name,
            "values": values,
        })
    }
}
