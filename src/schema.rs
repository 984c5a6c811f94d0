use std::collections::HashMap;
use std::sync::Arc;

use arrow_schema::{
    DataType, Field as ArrowField, Schema as ArrowSchema, SchemaRef as ArrowSchemaRef,
    TimeUnit,
};
use strum_macros::{Display, EnumString};

pub const ID_COLUMN: &str = "__id";
pub const PARENT_ID_COLUMN: &str = "__parent_id";
pub const CREATED_AT_COLUMN: &str = "__created_at";
pub const UPDATED_AT_COLUMN: &str = "__updated_at";
pub const DATA_COLUMN: &str = "data";

const EXTENSION_NAME_KEY: &str = "ARROW:extension:name";
const JSON_EXTENSION_NAME: &str = "arrow.json";
const PRIMARY_KEY_KEY: &str = "docflat:primary_key";
const UNIQUE_KEY: &str = "docflat:unique";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
pub enum ColumnType {
    String,
    Timestamp,
    // Opaque structured blob, serialized as JSON text
    Json,
}

impl ColumnType {
    pub fn to_arrow(self) -> DataType {
        match self {
            ColumnType::String | ColumnType::Json => DataType::Utf8,
            ColumnType::Timestamp => {
                DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub column_type: ColumnType,
    pub primary_key: bool,
    pub unique: bool,
    pub not_null: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            primary_key: false,
            unique: false,
            not_null: false,
        }
    }

    // Identity column: part of the primary key, unique and non-nullable
    fn key(name: &str) -> Self {
        Self {
            name: name.to_string(),
            column_type: ColumnType::String,
            primary_key: true,
            unique: true,
            not_null: true,
        }
    }

    pub fn to_arrow_field(&self) -> ArrowField {
        let mut metadata = HashMap::new();
        if self.column_type == ColumnType::Json {
            metadata.insert(
                EXTENSION_NAME_KEY.to_string(),
                JSON_EXTENSION_NAME.to_string(),
            );
        }
        if self.primary_key {
            metadata.insert(PRIMARY_KEY_KEY.to_string(), "true".to_string());
        }
        if self.unique {
            metadata.insert(UNIQUE_KEY.to_string(), "true".to_string());
        }

        ArrowField::new(&self.name, self.column_type.to_arrow(), !self.not_null)
            .with_metadata(metadata)
    }
}

/// A destination table, derived either from a top-level collection or from a sub-collection
/// nested one level below the documents of a top-level collection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Table {
    pub name: String,
    pub columns: Vec<Column>,
    // Name of the parent collection, only set for nested tables
    pub parent: Option<String>,
}

pub type TableRef = Arc<Table>;

impl Table {
    pub fn for_collection(collection_id: &str) -> Self {
        Self {
            name: collection_id.to_string(),
            columns: vec![
                Column::key(ID_COLUMN),
                Column::new(CREATED_AT_COLUMN, ColumnType::Timestamp),
                Column::new(UPDATED_AT_COLUMN, ColumnType::Timestamp),
                Column::new(DATA_COLUMN, ColumnType::Json),
            ],
            parent: None,
        }
    }

    // A child document ID is only unique within its parent, hence the composite key
    pub fn for_nested_collection(parent_collection_id: &str, nested_id: &str) -> Self {
        Self {
            name: Self::nested_table_name(parent_collection_id, nested_id),
            columns: vec![
                Column::key(ID_COLUMN),
                Column::key(PARENT_ID_COLUMN),
                Column::new(CREATED_AT_COLUMN, ColumnType::Timestamp),
                Column::new(UPDATED_AT_COLUMN, ColumnType::Timestamp),
                Column::new(DATA_COLUMN, ColumnType::Json),
            ],
            parent: Some(parent_collection_id.to_string()),
        }
    }

    pub fn nested_table_name(parent_collection_id: &str, nested_id: &str) -> String {
        format!("{parent_collection_id}_{nested_id}")
    }

    pub fn is_nested(&self) -> bool {
        self.parent.is_some()
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    pub fn primary_keys(&self) -> Vec<&str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
            .collect()
    }

    pub fn arrow_schema(&self) -> ArrowSchemaRef {
        let fields: Vec<ArrowField> =
            self.columns.iter().map(Column::to_arrow_field).collect();
        let metadata = HashMap::from([("table".to_string(), self.name.clone())]);

        Arc::new(ArrowSchema::new_with_metadata(fields, metadata))
    }
}

/// The full, de-duplicated set of tables produced by discovery.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Tables {
    tables: Vec<TableRef>,
}

impl Tables {
    pub fn new() -> Self {
        Self::default()
    }

    // Returns false (and leaves the set untouched) if a table with the same name exists
    pub fn push(&mut self, table: Table) -> bool {
        if self.get(&table.name).is_some() {
            return false;
        }
        self.tables.push(Arc::new(table));
        true
    }

    pub fn get(&self, name: &str) -> Option<&TableRef> {
        self.tables.iter().find(|t| t.name == name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &TableRef> {
        self.tables.iter()
    }

    pub fn top_level(&self) -> impl Iterator<Item = &TableRef> {
        self.tables.iter().filter(|t| !t.is_nested())
    }

    pub fn names(&self) -> Vec<&str> {
        self.tables.iter().map(|t| t.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }
}

impl FromIterator<Table> for Tables {
    fn from_iter<I: IntoIterator<Item = Table>>(iter: I) -> Self {
        let mut tables = Tables::new();
        for table in iter {
            tables.push(table);
        }
        tables
    }
}
