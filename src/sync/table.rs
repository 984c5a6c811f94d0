use std::sync::Arc;

use futures::TryStreamExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::group::{cancellable, ErrorGroup};
use super::metrics::TableClientMetrics;
use super::pager::DocumentPager;
use super::{SyncError, SyncOptions, SyncResult};
use crate::context::SyncContext;
use crate::resource::Resource;
use crate::schema::{Table, TableRef, CREATED_AT_COLUMN, ID_COLUMN, UPDATED_AT_COLUMN};
use crate::store::{CollectionRef, DocumentSnapshot, DocumentStore, Query};
use crate::value::{Map, Value};

/// Syncs a single top-level table (and, through its documents, its nested tables).
pub(super) struct TableSyncer {
    ctx: Arc<SyncContext>,
    store: Arc<dyn DocumentStore>,
    options: SyncOptions,
    output: mpsc::Sender<Resource>,
}

impl TableSyncer {
    pub fn new(
        ctx: Arc<SyncContext>,
        store: Arc<dyn DocumentStore>,
        options: SyncOptions,
        output: mpsc::Sender<Resource>,
    ) -> Self {
        Self {
            ctx,
            store,
            options,
            output,
        }
    }

    /// Page through the table's collection and emit one resource per existing document.
    ///
    /// With nested tables included every document is processed in its own task, at most
    /// `document_concurrency` at a time. The first failing document or page cancels the rest of
    /// the table, and its error is returned once every task has finished.
    pub async fn sync_table(
        self: &Arc<Self>,
        table: TableRef,
        token: CancellationToken,
    ) -> SyncResult<()> {
        info!("Syncing table {}", table.name);
        let metrics = self.table_metrics(&table.name)?;

        let mut group =
            ErrorGroup::new(&token).with_limit(self.options.document_concurrency);
        let pager = DocumentPager::new(
            self.store.clone(),
            CollectionRef::root(table.name.as_str()),
            self.options.order(),
            self.options.batch_size,
        );
        let mut pages = Box::pin(pager.into_stream(group.token().clone()));

        let mut synced = 0;
        let mut skipped = 0;
        let paged = async {
            while let Some(page) = pages.try_next().await? {
                for document in page {
                    if !document.exists {
                        debug!("Skipping missing document {}", document.reference);
                        metrics.add_skipped();
                        skipped += 1;
                        continue;
                    }
                    synced += 1;

                    if self.options.include_nested_tables {
                        let syncer = self.clone();
                        let table = table.clone();
                        let metrics = metrics.clone();
                        let token = group.token().clone();
                        group
                            .spawn(async move {
                                syncer
                                    .process_document(&table, document, &metrics, &token)
                                    .await
                            })
                            .await?;
                    } else {
                        self.process_document(&table, document, &metrics, group.token())
                            .await?;
                    }
                }
            }
            Ok::<_, SyncError>(())
        }
        .await;

        // A failed page stops the documents still in flight, same as a failed document
        if paged.is_err() {
            group.token().cancel();
        }
        group.wait().await.and(paged)?;

        info!("Synced {synced} documents from {}", table.name);
        if skipped > 0 {
            info!("Skipped {skipped} documents from {}", table.name);
        }
        Ok(())
    }

    async fn process_document(
        &self,
        table: &TableRef,
        document: DocumentSnapshot,
        metrics: &TableClientMetrics,
        token: &CancellationToken,
    ) -> SyncResult<()> {
        let DocumentSnapshot {
            reference,
            create_time,
            update_time,
            mut data,
            ..
        } = document;

        if self.options.include_nested_tables {
            let collections =
                cancellable(token, self.store.subcollections(&reference)).await?;
            for collection in collections {
                let documents =
                    cancellable(token, self.store.query(&collection, &Query::new())).await?;

                if self.options.flatten_nested_tables {
                    self.emit_nested(table, &reference.id, &collection, documents, token)
                        .await?;
                } else {
                    let embedded = self.embed(table, &collection, documents);
                    data.insert(collection.id, Value::Map(embedded));
                }
            }
        }

        let resource =
            Resource::build(table, None, &reference.id, create_time, update_time, data)?;
        self.emit(resource, metrics, token).await
    }

    // One resource per nested document, linked to the parent through `__parent_id`
    async fn emit_nested(
        &self,
        parent: &Table,
        parent_id: &str,
        collection: &CollectionRef,
        documents: Vec<DocumentSnapshot>,
        token: &CancellationToken,
    ) -> SyncResult<()> {
        let name = Table::nested_table_name(&parent.name, &collection.id);
        // A table of the same name derived from another parent is not ours
        let table = self
            .ctx
            .tables()
            .get(&name)
            .filter(|table| table.parent.as_deref() == Some(parent.name.as_str()))
            .cloned()
            .ok_or(SyncError::TableNotFound { name })?;
        let metrics = self.table_metrics(&table.name)?;

        for document in documents {
            if !document.exists {
                debug!("Skipping missing document {}", document.reference);
                metrics.add_skipped();
                continue;
            }

            let resource = Resource::build(
                &table,
                Some(parent_id),
                &document.reference.id,
                document.create_time,
                document.update_time,
                document.data,
            )?;
            self.emit(resource, &metrics, token).await?;
        }
        Ok(())
    }

    // Nested documents keyed by ID, each carrying its own identity and timestamps
    fn embed(
        &self,
        parent: &Table,
        collection: &CollectionRef,
        documents: Vec<DocumentSnapshot>,
    ) -> Map {
        let metrics = self
            .ctx
            .table_metrics(&Table::nested_table_name(&parent.name, &collection.id));

        documents
            .into_iter()
            .filter_map(|document| {
                if !document.exists {
                    if let Some(metrics) = &metrics {
                        metrics.add_skipped();
                    }
                    return None;
                }

                let DocumentSnapshot {
                    reference,
                    create_time,
                    update_time,
                    mut data,
                    ..
                } = document;
                data.insert(ID_COLUMN.to_string(), Value::from(reference.id.as_str()));
                data.insert(CREATED_AT_COLUMN.to_string(), Value::from(create_time));
                data.insert(UPDATED_AT_COLUMN.to_string(), Value::from(update_time));
                Some((reference.id, Value::Map(data)))
            })
            .collect()
    }

    async fn emit(
        &self,
        resource: Resource,
        metrics: &TableClientMetrics,
        token: &CancellationToken,
    ) -> SyncResult<()> {
        cancellable(token, async {
            self.output
                .send(resource)
                .await
                .map_err(|_| SyncError::OutputClosed)
        })
        .await?;
        metrics.add_resource();
        Ok(())
    }

    fn table_metrics(&self, name: &str) -> SyncResult<Arc<TableClientMetrics>> {
        self.ctx
            .table_metrics(name)
            .ok_or_else(|| SyncError::TableNotFound {
                name: name.to_string(),
            })
    }
}
