//! Boundary to the hierarchical document database.
//!
//! The synchronization and discovery engines only talk to the database through the
//! [`DocumentStore`] trait. [`memory::MemoryStore`] is the bundled implementation, used for
//! local runs from a JSON dump and in tests.

use std::fmt::{self, Debug, Display};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use strum_macros::{Display as StrumDisplay, EnumString};

use crate::value::{lookup, Map, Value};

pub mod memory;

/// Field name that orders documents by their identity, the database's native order
pub const DOCUMENT_ID_FIELD: &str = "__name__";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Query on collection {collection:?} failed: {reason}")]
    Query { collection: String, reason: String },

    #[error("Invalid document path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("Failed reading store dump: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed parsing store dump: {0}")]
    Json(#[from] serde_json::Error),
}

pub type StoreResult<T, E = StoreError> = Result<T, E>;

/// A reference to a collection, either top-level or nested under a document.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CollectionRef {
    pub id: String,
    // Slash-separated path from the database root, e.g. `users/42/orders`
    pub path: String,
}

impl CollectionRef {
    pub fn root(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            path: id.clone(),
            id,
        }
    }

    pub fn doc(&self, id: impl Into<String>) -> DocumentRef {
        let id = id.into();
        DocumentRef {
            path: format!("{}/{id}", self.path),
            id,
        }
    }

    pub fn is_root(&self) -> bool {
        !self.path.contains('/')
    }
}

impl Display for CollectionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DocumentRef {
    pub id: String,
    pub path: String,
}

impl DocumentRef {
    pub fn collection(&self, id: impl Into<String>) -> CollectionRef {
        let id = id.into();
        CollectionRef {
            path: format!("{}/{id}", self.path),
            id,
        }
    }
}

impl Display for DocumentRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path)
    }
}

/// A document as returned by a query. A snapshot may refer to a document that no longer
/// exists (deleted between listing and read), in which case `exists` is false and the
/// payload is empty.
#[derive(Clone, Debug, PartialEq)]
pub struct DocumentSnapshot {
    pub reference: DocumentRef,
    pub exists: bool,
    pub create_time: DateTime<Utc>,
    pub update_time: DateTime<Utc>,
    pub data: Map,
}

impl DocumentSnapshot {
    pub fn id(&self) -> &str {
        &self.reference.id
    }

    // Value of the field the query was ordered by, used to resume after this document
    pub fn order_value(&self, field: &str) -> Option<Value> {
        if field == DOCUMENT_ID_FIELD {
            return Some(Value::String(self.reference.id.clone()));
        }
        lookup(&self.data, field).cloned()
    }

    pub fn cursor(&self, order_by: &OrderBy) -> Cursor {
        Cursor {
            document_id: self.reference.id.clone(),
            order_value: self.order_value(&order_by.field),
        }
    }
}

#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, StrumDisplay, EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum Direction {
    #[default]
    Asc,
    Desc,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OrderBy {
    pub field: String,
    pub direction: Direction,
}

impl OrderBy {
    pub fn new(field: impl Into<String>, direction: Direction) -> Self {
        Self {
            field: field.into(),
            direction,
        }
    }

    pub fn document_id() -> Self {
        Self::new(DOCUMENT_ID_FIELD, Direction::Asc)
    }
}

impl Default for OrderBy {
    fn default() -> Self {
        Self::document_id()
    }
}

/// Opaque resume position: the last-seen document and its value of the ordering field.
#[derive(Clone, Debug, PartialEq)]
pub struct Cursor {
    pub document_id: String,
    pub order_value: Option<Value>,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct Query {
    pub order_by: Option<OrderBy>,
    pub start_after: Option<Cursor>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn order_by(mut self, order_by: OrderBy) -> Self {
        self.order_by = Some(order_by);
        self
    }

    pub fn start_after(mut self, cursor: Cursor) -> Self {
        self.start_after = Some(cursor);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

#[async_trait]
pub trait DocumentStore: Send + Sync + Debug {
    /// List all top-level collections
    async fn collections(&self) -> StoreResult<Vec<CollectionRef>>;

    /// List the immediate sub-collections of a document
    async fn subcollections(&self, document: &DocumentRef)
        -> StoreResult<Vec<CollectionRef>>;

    /// Run an ordered, optionally limited query against a collection
    async fn query(
        &self,
        collection: &CollectionRef,
        query: &Query,
    ) -> StoreResult<Vec<DocumentSnapshot>>;
}
