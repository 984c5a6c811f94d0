use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use metrics::{counter, describe_counter, Counter};

const RESOURCES: &str = "docflat_sync_resources_total";
const SKIPPED: &str = "docflat_sync_skipped_total";
const ERRORS: &str = "docflat_sync_errors_total";

/// Counters of a single table as synced by a single connector instance.
pub struct TableClientMetrics {
    resources: AtomicU64,
    skipped: AtomicU64,
    errors: AtomicU64,
    // Mirrors of the counters above, exported through the `metrics` facade
    resources_counter: Counter,
    skipped_counter: Counter,
    errors_counter: Counter,
}

impl TableClientMetrics {
    fn new(table: &str, client_id: &str) -> Self {
        let counter = |name: &'static str| {
            counter!(name, "table" => table.to_string(), "client" => client_id.to_string())
        };
        Self {
            resources: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            resources_counter: counter(RESOURCES),
            skipped_counter: counter(SKIPPED),
            errors_counter: counter(ERRORS),
        }
    }

    pub fn resources(&self) -> u64 {
        self.resources.load(Ordering::Relaxed)
    }

    pub fn skipped(&self) -> u64 {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    pub(crate) fn add_resource(&self) {
        self.resources.fetch_add(1, Ordering::Relaxed);
        self.resources_counter.increment(1);
    }

    pub(crate) fn add_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
        self.skipped_counter.increment(1);
    }

    pub(crate) fn add_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        self.errors_counter.increment(1);
    }

    pub fn snapshot(&self) -> TableMetricsSnapshot {
        TableMetricsSnapshot {
            resources: self.resources(),
            skipped: self.skipped(),
            errors: self.errors(),
        }
    }
}

impl fmt::Debug for TableClientMetrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TableClientMetrics")
            .field("resources", &self.resources())
            .field("skipped", &self.skipped())
            .field("errors", &self.errors())
            .finish()
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TableMetricsSnapshot {
    pub resources: u64,
    pub skipped: u64,
    pub errors: u64,
}

/// Sync metrics of a run: table name => connector instance ID => counters.
///
/// Entries are created up front, before any task starts, and only the atomic counters are
/// mutated concurrently afterwards.
#[derive(Debug)]
pub struct SourceMetrics {
    tables: DashMap<String, DashMap<String, Arc<TableClientMetrics>>>,
}

impl Default for SourceMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceMetrics {
    pub fn new() -> Self {
        describe_counter!(RESOURCES, "The total number of resources emitted per table");
        describe_counter!(
            SKIPPED,
            "The total number of documents skipped because they no longer exist"
        );
        describe_counter!(ERRORS, "The total number of failed table syncs");

        Self {
            tables: DashMap::new(),
        }
    }

    // Idempotent: an existing entry is returned untouched
    pub fn init_table(&self, table: &str, client_id: &str) -> Arc<TableClientMetrics> {
        self.tables
            .entry(table.to_string())
            .or_default()
            .entry(client_id.to_string())
            .or_insert_with(|| Arc::new(TableClientMetrics::new(table, client_id)))
            .clone()
    }

    pub fn get(&self, table: &str, client_id: &str) -> Option<Arc<TableClientMetrics>> {
        let clients = self.tables.get(table)?;
        let metrics = clients.get(client_id)?.value().clone();
        Some(metrics)
    }

    pub fn total_resources(&self) -> u64 {
        self.tables
            .iter()
            .map(|clients| {
                clients
                    .iter()
                    .map(|metrics| metrics.resources())
                    .sum::<u64>()
            })
            .sum()
    }

    pub fn snapshot(&self) -> BTreeMap<String, BTreeMap<String, TableMetricsSnapshot>> {
        self.tables
            .iter()
            .map(|clients| {
                (
                    clients.key().clone(),
                    clients
                        .iter()
                        .map(|metrics| (metrics.key().clone(), metrics.snapshot()))
                        .collect(),
                )
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let metrics = SourceMetrics::new();
        let first = metrics.init_table("users", "memory");
        first.add_resource();

        let second = metrics.init_table("users", "memory");
        assert_eq!(second.resources(), 1);
        assert!(metrics.get("users", "other").is_none());
        assert!(metrics.get("orders", "memory").is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_increments() {
        let metrics = Arc::new(SourceMetrics::new());
        let users = metrics.init_table("users", "memory");

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let users = users.clone();
                tokio::spawn(async move {
                    for _ in 0..1000 {
                        users.add_resource();
                    }
                    users.add_skipped();
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(
            metrics.snapshot()["users"]["memory"],
            TableMetricsSnapshot {
                resources: 8000,
                skipped: 8,
                errors: 0
            }
        );
        assert_eq!(metrics.total_resources(), 8000);
    }
}
