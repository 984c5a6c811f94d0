use std::sync::Arc;

use crate::schema::Tables;
use crate::sync::metrics::{SourceMetrics, TableClientMetrics};

/// Everything a sync run shares across its tasks: the discovered tables and the metrics store.
///
/// Created once discovery has finished; the table set is immutable from then on.
#[derive(Debug)]
pub struct SyncContext {
    client_id: String,
    tables: Tables,
    metrics: Arc<SourceMetrics>,
}

impl SyncContext {
    pub fn new(client_id: impl Into<String>, tables: Tables) -> Self {
        Self::new_with_metrics(client_id, tables, Arc::new(SourceMetrics::new()))
    }

    // Use an existing metrics store, e.g. one the host is already reporting from
    pub fn new_with_metrics(
        client_id: impl Into<String>,
        tables: Tables,
        metrics: Arc<SourceMetrics>,
    ) -> Self {
        let client_id = client_id.into();
        for table in tables.iter() {
            metrics.init_table(&table.name, &client_id);
        }

        Self {
            client_id,
            tables,
            metrics,
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn tables(&self) -> &Tables {
        &self.tables
    }

    pub fn metrics(&self) -> &Arc<SourceMetrics> {
        &self.metrics
    }

    pub fn table_metrics(&self, table: &str) -> Option<Arc<TableClientMetrics>> {
        self.metrics.get(table, &self.client_id)
    }
}
