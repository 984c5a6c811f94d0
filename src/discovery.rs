//! Derives the destination tables from the shape of the document database.
//!
//! Every top-level collection becomes a table. With nested tables included, a sample of each
//! collection's documents is probed for sub-collections, and every distinct
//! `(collection, sub-collection)` pair becomes a nested table named `{collection}_{nested}`.
//! Only one level of nesting is discovered.

use std::collections::BTreeSet;
use std::sync::Arc;

use itertools::Itertools;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::schema::{Table, Tables};
use crate::store::{CollectionRef, DocumentStore, Query};
use crate::sync::group::{cancellable, ErrorGroup};
use crate::sync::{SyncOptions, SyncResult, DEFAULT_DOCUMENT_CONCURRENCY};

/// Number of documents per collection probed for nested collections
pub const DISCOVERY_SAMPLE_SIZE: usize = 1000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DiscoveryOptions {
    pub include_nested_tables: bool,
    // Maximum number of documents of one collection probed at the same time
    pub document_concurrency: usize,
}

impl Default for DiscoveryOptions {
    fn default() -> Self {
        Self {
            include_nested_tables: false,
            document_concurrency: DEFAULT_DOCUMENT_CONCURRENCY,
        }
    }
}

impl From<&SyncOptions> for DiscoveryOptions {
    fn from(options: &SyncOptions) -> Self {
        Self {
            include_nested_tables: options.include_nested_tables,
            document_concurrency: options.document_concurrency,
        }
    }
}

/// Discover the tables of the store.
///
/// Each top-level table is listed before its nested tables, which are sorted by name. Any
/// store error aborts discovery, so a returned schema is always complete.
pub async fn discover(
    store: Arc<dyn DocumentStore>,
    options: &DiscoveryOptions,
    token: &CancellationToken,
) -> SyncResult<Tables> {
    let collections = cancellable(token, store.collections()).await?;
    info!(
        "Found {} collection(s): {}",
        collections.len(),
        collections.iter().map(|c| c.id.as_str()).join(", ")
    );

    let top_level: BTreeSet<String> = collections.iter().map(|c| c.id.clone()).collect();
    let mut tables = Tables::new();
    for collection in collections {
        tables.push(Table::for_collection(&collection.id));
        if !options.include_nested_tables {
            continue;
        }

        let nested = probe_collection(store.clone(), &collection, options, token).await?;
        for nested_id in nested {
            let name = Table::nested_table_name(&collection.id, &nested_id);
            if top_level.contains(&name) {
                warn!(
                    "Nested collection {}/*/{nested_id} collides with collection {name}, skipping",
                    collection.id
                );
                continue;
            }
            if !tables.push(Table::for_nested_collection(&collection.id, &nested_id)) {
                warn!(
                    "Nested collection {}/*/{nested_id} collides with another nested table {name}, skipping",
                    collection.id
                );
            }
        }
    }

    info!("Discovered {} table(s)", tables.len());
    Ok(tables)
}

// Distinct IDs of the sub-collections found under a sample of the collection's documents
async fn probe_collection(
    store: Arc<dyn DocumentStore>,
    collection: &CollectionRef,
    options: &DiscoveryOptions,
    token: &CancellationToken,
) -> SyncResult<BTreeSet<String>> {
    let sample = cancellable(
        token,
        store.query(collection, &Query::new().limit(DISCOVERY_SAMPLE_SIZE)),
    )
    .await?;

    let found = Arc::new(Mutex::new(BTreeSet::new()));
    let mut group = ErrorGroup::new(token).with_limit(options.document_concurrency);

    for document in sample {
        if !document.exists {
            debug!("Skipping missing document {}", document.reference);
            continue;
        }

        let store = store.clone();
        let found = found.clone();
        let token = group.token().clone();
        let spawned = group
            .spawn(async move {
                debug!("Probing {} for nested collections", document.reference);
                let nested =
                    cancellable(&token, store.subcollections(&document.reference)).await?;

                let mut found = found.lock();
                for collection in nested {
                    found.insert(collection.id);
                }
                Ok(())
            })
            .await;

        if let Err(err) = spawned {
            return group.wait().await.and(Err(err));
        }
    }
    group.wait().await?;

    let found = std::mem::take(&mut *found.lock());
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{CREATED_AT_COLUMN, DATA_COLUMN, ID_COLUMN, PARENT_ID_COLUMN};
    use crate::store::memory::MemoryStore;
    use crate::sync::SyncError;
    use crate::value::Map;
    use rstest::rstest;

    fn store() -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store.insert("users", "1", Map::new());
        store.insert("users", "2", Map::new());
        store.insert("users/1/orders", "o1", Map::new());
        store.insert("users/2/orders", "o2", Map::new());
        store.insert("users/2/addresses", "a1", Map::new());
        store.insert("products", "p1", Map::new());
        store
    }

    #[rstest]
    #[case::flat(false, vec!["products", "users"])]
    #[case::nested(true, vec!["products", "users", "users_addresses", "users_orders"])]
    #[tokio::test]
    async fn test_discovered_tables(
        #[case] include_nested_tables: bool,
        #[case] expected: Vec<&str>,
    ) {
        let options = DiscoveryOptions {
            include_nested_tables,
            ..Default::default()
        };

        let tables = discover(store(), &options, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(tables.names(), expected);
    }

    #[tokio::test]
    async fn test_nested_columns() {
        let options = DiscoveryOptions {
            include_nested_tables: true,
            ..Default::default()
        };

        let tables = discover(store(), &options, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(
            tables.get("users").unwrap().column_names(),
            vec![ID_COLUMN, CREATED_AT_COLUMN, "__updated_at", DATA_COLUMN]
        );
        let orders = tables.get("users_orders").unwrap();
        assert_eq!(orders.parent.as_deref(), Some("users"));
        assert_eq!(orders.column_names()[1], PARENT_ID_COLUMN);
    }

    #[tokio::test]
    async fn test_tombstones_are_not_probed() {
        let store = Arc::new(MemoryStore::new());
        store.insert("users", "1", Map::new());
        store.delete("users", "1");
        store.insert("users/1/orders", "o1", Map::new());
        let options = DiscoveryOptions {
            include_nested_tables: true,
            ..Default::default()
        };

        let tables = discover(store, &options, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(tables.names(), vec!["users"]);
    }

    #[tokio::test]
    async fn test_colliding_nested_names() {
        let store = Arc::new(MemoryStore::new());
        store.insert("a", "1", Map::new());
        store.insert("a/1/b_c", "x", Map::new());
        store.insert("a_b", "2", Map::new());
        store.insert("a_b/2/c", "y", Map::new());
        let options = DiscoveryOptions {
            include_nested_tables: true,
            ..Default::default()
        };

        let tables = discover(store, &options, &CancellationToken::new())
            .await
            .unwrap();

        // The first parent to derive the name keeps the table
        assert_eq!(tables.names(), vec!["a", "a_b_c", "a_b"]);
        assert_eq!(tables.get("a_b_c").unwrap().parent.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_store_error_aborts_discovery() {
        let store = store();
        store.fail_queries("users", "permission denied");
        let options = DiscoveryOptions {
            include_nested_tables: true,
            ..Default::default()
        };

        let err = discover(store, &options, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err.to_string(),
            "Query on collection \"users\" failed: permission denied"
        );
    }

    #[tokio::test]
    async fn test_cancelled_discovery() {
        let token = CancellationToken::new();
        token.cancel();

        let err = discover(store(), &DiscoveryOptions::default(), &token)
            .await
            .unwrap_err();

        assert!(matches!(err, SyncError::Cancelled));
    }
}
