use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use super::{
    CollectionRef, Cursor, Direction, DocumentRef, DocumentSnapshot, DocumentStore, Query,
    StoreError, StoreResult, DOCUMENT_ID_FIELD,
};
use crate::schema::{CREATED_AT_COLUMN, UPDATED_AT_COLUMN};
use crate::value::{lookup, Map, Value};

/// Key holding the nested collections of a document in a JSON dump
pub const COLLECTIONS_KEY: &str = "__collections";

#[derive(Debug, Clone)]
struct QueryFailure {
    after: usize,
    reason: String,
}

#[derive(Debug, Clone)]
struct StoredDocument {
    exists: bool,
    create_time: DateTime<Utc>,
    update_time: DateTime<Utc>,
    data: Map,
}

/// An in-memory document database.
///
/// Collections are keyed by their full path (`users`, `users/42/orders`), so a nested
/// collection can outlive its parent document, the same way it does in a hosted document
/// database. Deleting a document leaves a tombstone that queries still return with
/// `exists = false`.
///
/// Queries follow the usual document database semantics: ordering by a field excludes documents
/// that lack it, ties are broken by document ID in the same direction, and `start_after`
/// resumes strictly after the cursor position.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<BTreeMap<String, BTreeMap<String, StoredDocument>>>,
    // Number of queries issued per collection path
    query_counts: Mutex<HashMap<String, usize>>,
    // Collections whose queries fail with the given reason, once more than `after` ran
    failures: Mutex<HashMap<String, QueryFailure>>,
    latency: Option<Duration>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Delay every store call, so that concurrent callers actually overlap
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn insert(&self, collection_path: &str, id: &str, data: Map) {
        let now = Utc::now();
        self.insert_with_times(collection_path, id, data, now, now)
    }

    pub fn insert_with_times(
        &self,
        collection_path: &str,
        id: &str,
        data: Map,
        create_time: DateTime<Utc>,
        update_time: DateTime<Utc>,
    ) {
        self.collections
            .write()
            .entry(collection_path.to_string())
            .or_default()
            .insert(
                id.to_string(),
                StoredDocument {
                    exists: true,
                    create_time,
                    update_time,
                    data,
                },
            );
    }

    // Replace the document with a tombstone, keeping any nested collections around
    pub fn delete(&self, collection_path: &str, id: &str) {
        let mut collections = self.collections.write();
        let documents = collections.entry(collection_path.to_string()).or_default();
        let now = Utc::now();
        let create_time = documents.get(id).map(|d| d.create_time).unwrap_or(now);
        documents.insert(
            id.to_string(),
            StoredDocument {
                exists: false,
                create_time,
                update_time: now,
                data: Map::new(),
            },
        );
    }

    pub fn fail_queries(&self, collection_path: &str, reason: &str) {
        self.fail_queries_after(collection_path, 0, reason)
    }

    // Let the next `after` queries on the collection succeed, then fail every one after them
    pub fn fail_queries_after(&self, collection_path: &str, after: usize, reason: &str) {
        let after = self.query_count(collection_path) + after;
        self.failures.lock().insert(
            collection_path.to_string(),
            QueryFailure {
                after,
                reason: reason.to_string(),
            },
        );
    }

    pub fn query_count(&self, collection_path: &str) -> usize {
        self.query_counts
            .lock()
            .get(collection_path)
            .copied()
            .unwrap_or(0)
    }

    /// Build a store from a JSON dump.
    ///
    /// The dump is an object of collection ID to an object of document ID to document. A `null`
    /// document is a tombstone. A document may carry its nested collections under
    /// `__collections` (same shape, recursively) and RFC 3339 `__created_at`/`__updated_at`
    /// fields, which are lifted out of the payload into the document's timestamps.
    pub fn from_json(dump: serde_json::Value) -> StoreResult<Self> {
        let store = Self::new();
        store.load_collections(None, dump)?;
        Ok(store)
    }

    pub fn from_json_str(dump: &str) -> StoreResult<Self> {
        Self::from_json(serde_json::from_str(dump)?)
    }

    pub fn from_json_file(path: &Path) -> StoreResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    fn load_collections(
        &self,
        parent: Option<&str>,
        collections: serde_json::Value,
    ) -> StoreResult<()> {
        let path_prefix = parent.map(|p| format!("{p}/")).unwrap_or_default();
        let serde_json::Value::Object(collections) = collections else {
            return Err(StoreError::InvalidPath {
                path: parent.unwrap_or("/").to_string(),
                reason: "expected an object of collections".to_string(),
            });
        };

        for (collection_id, documents) in collections {
            if collection_id.contains('/') {
                return Err(StoreError::InvalidPath {
                    path: format!("{path_prefix}{collection_id}"),
                    reason: "collection IDs must not contain '/'".to_string(),
                });
            }
            let collection_path = format!("{path_prefix}{collection_id}");
            let serde_json::Value::Object(documents) = documents else {
                return Err(StoreError::InvalidPath {
                    path: collection_path,
                    reason: "expected an object of documents".to_string(),
                });
            };

            // Make sure empty collections are listed too
            self.collections
                .write()
                .entry(collection_path.clone())
                .or_default();

            for (id, document) in documents {
                match document {
                    serde_json::Value::Null => self.delete(&collection_path, &id),
                    serde_json::Value::Object(mut fields) => {
                        if let Some(nested) = fields.remove(COLLECTIONS_KEY) {
                            self.load_collections(
                                Some(&format!("{collection_path}/{id}")),
                                nested,
                            )?;
                        }
                        let now = Utc::now();
                        let create_time = take_timestamp(&mut fields, CREATED_AT_COLUMN)
                            .unwrap_or(now);
                        let update_time = take_timestamp(&mut fields, UPDATED_AT_COLUMN)
                            .unwrap_or(create_time);
                        let data = fields
                            .into_iter()
                            .map(|(k, v)| (k, Value::from(v)))
                            .collect();
                        self.insert_with_times(
                            &collection_path,
                            &id,
                            data,
                            create_time,
                            update_time,
                        );
                    }
                    _ => {
                        return Err(StoreError::InvalidPath {
                            path: format!("{collection_path}/{id}"),
                            reason: "a document must be an object or null".to_string(),
                        })
                    }
                }
            }
        }
        Ok(())
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

fn take_timestamp(
    fields: &mut serde_json::Map<String, serde_json::Value>,
    key: &str,
) -> Option<DateTime<Utc>> {
    let serde_json::Value::String(raw) = fields.remove(key)? else {
        return None;
    };
    DateTime::parse_from_rfc3339(&raw)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

// Position of a document in a query's sort order
type SortKey<'a> = (Option<&'a Value>, &'a str);

fn compare_keys(a: SortKey<'_>, b: SortKey<'_>, direction: Direction) -> Ordering {
    let ordering = match (a.0, b.0) {
        (Some(x), Some(y)) => x.total_cmp(y),
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
    }
    .then_with(|| a.1.cmp(b.1));

    match direction {
        Direction::Asc => ordering,
        Direction::Desc => ordering.reverse(),
    }
}

fn cursor_key(cursor: &Cursor, by_document_id: bool) -> SortKey<'_> {
    if by_document_id {
        (None, &cursor.document_id)
    } else {
        (cursor.order_value.as_ref(), &cursor.document_id)
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn collections(&self) -> StoreResult<Vec<CollectionRef>> {
        self.simulate_latency().await;
        Ok(self
            .collections
            .read()
            .keys()
            .filter(|path| !path.contains('/'))
            .map(CollectionRef::root)
            .collect())
    }

    async fn subcollections(
        &self,
        document: &DocumentRef,
    ) -> StoreResult<Vec<CollectionRef>> {
        self.simulate_latency().await;
        let prefix = format!("{}/", document.path);
        Ok(self
            .collections
            .read()
            .range(prefix.clone()..)
            .take_while(|(path, _)| path.starts_with(&prefix))
            .filter_map(|(path, _)| {
                let id = &path[prefix.len()..];
                (!id.contains('/')).then(|| document.collection(id))
            })
            .collect())
    }

    async fn query(
        &self,
        collection: &CollectionRef,
        query: &Query,
    ) -> StoreResult<Vec<DocumentSnapshot>> {
        let count = {
            let mut counts = self.query_counts.lock();
            let count = counts.entry(collection.path.clone()).or_default();
            *count += 1;
            *count
        };
        self.simulate_latency().await;

        if let Some(failure) = self
            .failures
            .lock()
            .get(&collection.path)
            .filter(|failure| count > failure.after)
        {
            return Err(StoreError::Query {
                collection: collection.path.clone(),
                reason: failure.reason.clone(),
            });
        }

        let order_by = query.order_by.clone().unwrap_or_default();
        let by_document_id = order_by.field == DOCUMENT_ID_FIELD;

        let collections = self.collections.read();
        let Some(documents) = collections.get(&collection.path) else {
            return Ok(vec![]);
        };

        let mut matching: Vec<(SortKey<'_>, &StoredDocument)> = documents
            .iter()
            .filter_map(|(id, doc)| {
                if by_document_id {
                    Some(((None, id.as_str()), doc))
                } else {
                    lookup(&doc.data, &order_by.field).map(|v| ((Some(v), id.as_str()), doc))
                }
            })
            .collect();
        matching.sort_by(|(a, _), (b, _)| compare_keys(*a, *b, order_by.direction));

        let start = match &query.start_after {
            Some(cursor) => {
                let after = cursor_key(cursor, by_document_id);
                matching.partition_point(|(key, _)| {
                    compare_keys(*key, after, order_by.direction) != Ordering::Greater
                })
            }
            None => 0,
        };
        let limit = query.limit.unwrap_or(usize::MAX);

        let snapshots: Vec<DocumentSnapshot> = matching[start..]
            .iter()
            .take(limit)
            .map(|((_, id), doc)| DocumentSnapshot {
                reference: collection.doc(*id),
                exists: doc.exists,
                create_time: doc.create_time,
                update_time: doc.update_time,
                data: doc.data.clone(),
            })
            .collect();
        debug!(
            "Query on {collection} returned {} document(s) starting at {start}",
            snapshots.len()
        );
        Ok(snapshots)
    }
}
