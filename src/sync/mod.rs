//! Synchronization of the discovered tables into an output channel.
//!
//! Every top-level table is synced by its own task. Within a table documents are paged through
//! in a stable order; when nested collections are included each document is processed by its
//! own (bounded) task, so nested reads of sibling documents overlap. Tasks of one table share
//! an [`group::ErrorGroup`]: the first failure cancels the rest and is the error returned for
//! the whole run.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::context::SyncContext;
use crate::resource::Resource;
use crate::schema::TableRef;
use crate::store::{Direction, DocumentStore, OrderBy, StoreError, DOCUMENT_ID_FIELD};

pub(crate) mod group;
pub mod metrics;
mod pager;
mod table;

use group::ErrorGroup;
use table::TableSyncer;

pub const DEFAULT_BATCH_SIZE: usize = 1000;
pub const DEFAULT_DOCUMENT_CONCURRENCY: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Column {column:?} not found in table {table:?}")]
    ColumnNotFound { table: String, column: String },

    #[error("Document {document_id:?} of nested table {table:?} has no parent")]
    MissingParentId { table: String, document_id: String },

    #[error("Document {document_id:?} of top-level table {table:?} has a parent")]
    UnexpectedParentId { table: String, document_id: String },

    #[error("Table {name:?} was not discovered")]
    TableNotFound { name: String },

    #[error("Invalid sync options: {reason}")]
    InvalidOptions { reason: String },

    #[error("Sync cancelled")]
    Cancelled,

    #[error("Output channel closed")]
    OutputClosed,

    #[error("Sync task failed: {reason}")]
    TaskFailed { reason: String },
}

pub type SyncResult<T, E = SyncError> = Result<T, E>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SyncOptions {
    // Discover nested collections as tables and fetch them along with each document
    pub include_nested_tables: bool,
    // Emit nested documents into their own tables instead of embedding them in `data`
    pub flatten_nested_tables: bool,
    pub batch_size: usize,
    // Field to page through collections by; the document ID when unset
    pub order_by: Option<String>,
    pub order_direction: Direction,
    // Maximum number of documents of one table processed at the same time
    pub document_concurrency: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            include_nested_tables: false,
            flatten_nested_tables: false,
            batch_size: DEFAULT_BATCH_SIZE,
            order_by: None,
            order_direction: Direction::Asc,
            document_concurrency: DEFAULT_DOCUMENT_CONCURRENCY,
        }
    }
}

impl SyncOptions {
    pub fn order(&self) -> OrderBy {
        OrderBy::new(
            self.order_by.as_deref().unwrap_or(DOCUMENT_ID_FIELD),
            self.order_direction,
        )
    }

    pub fn validate(&self) -> SyncResult<()> {
        let reason = if self.batch_size == 0 {
            "batch size must be positive"
        } else if self.document_concurrency == 0 {
            "document concurrency must be positive"
        } else if self.order_by.as_deref().is_some_and(|f| f.trim().is_empty()) {
            "order by field must not be empty"
        } else {
            return Ok(());
        };

        Err(SyncError::InvalidOptions {
            reason: reason.to_string(),
        })
    }
}

/// Sync every top-level table of the context into `output`.
///
/// Returns once all tables are drained, or with the first error of any table, in which case
/// all other tables are cancelled. Cancelling `token` stops the run with
/// [`SyncError::Cancelled`].
pub async fn sync(
    ctx: Arc<SyncContext>,
    store: Arc<dyn DocumentStore>,
    options: SyncOptions,
    output: mpsc::Sender<Resource>,
    token: CancellationToken,
) -> SyncResult<()> {
    options.validate()?;

    let tables: Vec<TableRef> = ctx.tables().top_level().cloned().collect();
    if tables.is_empty() {
        warn!("No tables to sync");
        return Ok(());
    }
    info!("Syncing {} table(s)", tables.len());

    let syncer = Arc::new(TableSyncer::new(ctx.clone(), store, options, output));
    let mut group = ErrorGroup::new(&token).with_limit(tables.len());

    for table in tables {
        let syncer = syncer.clone();
        let ctx = ctx.clone();
        let token = group.token().clone();
        let spawned = group
            .spawn(async move {
                let result = syncer.sync_table(table.clone(), token).await;
                if let Err(ref err) = result {
                    if !matches!(err, SyncError::Cancelled) {
                        warn!("Failed syncing table {}: {err}", table.name);
                        if let Some(metrics) = ctx.table_metrics(&table.name) {
                            metrics.add_error();
                        }
                    }
                }
                result
            })
            .await;

        if let Err(err) = spawned {
            return group.wait().await.and(Err(err));
        }
    }

    group.wait().await
}
