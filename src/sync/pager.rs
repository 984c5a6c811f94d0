use std::sync::Arc;

use futures::stream::{self, Stream};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::group::cancellable;
use super::SyncResult;
use crate::store::{CollectionRef, Cursor, DocumentSnapshot, DocumentStore, OrderBy, Query};

/// Pages through a collection in a stable order.
///
/// Each page is a fresh query resuming after the last document of the previous page. A page
/// shorter than the batch size marks the end of the collection, so a collection whose size is
/// an exact multiple of the batch size costs one extra (empty) page.
pub(super) struct DocumentPager {
    store: Arc<dyn DocumentStore>,
    collection: CollectionRef,
    order_by: OrderBy,
    batch_size: usize,
    cursor: Option<Cursor>,
    done: bool,
}

impl DocumentPager {
    pub fn new(
        store: Arc<dyn DocumentStore>,
        collection: CollectionRef,
        order_by: OrderBy,
        batch_size: usize,
    ) -> Self {
        Self {
            store,
            collection,
            order_by,
            batch_size,
            cursor: None,
            done: false,
        }
    }

    // Fetch the next page, or `None` once the collection is exhausted
    pub async fn next_page(
        &mut self,
        token: &CancellationToken,
    ) -> SyncResult<Option<Vec<DocumentSnapshot>>> {
        if self.done {
            return Ok(None);
        }

        let mut query = Query::new()
            .order_by(self.order_by.clone())
            .limit(self.batch_size);
        if let Some(cursor) = &self.cursor {
            info!("Starting after {}", cursor.document_id);
            query = query.start_after(cursor.clone());
        }

        let documents = cancellable(token, self.store.query(&self.collection, &query)).await?;
        if documents.len() < self.batch_size {
            self.done = true;
        }
        // Resume after the last returned document, whether it still exists or not
        if let Some(last) = documents.last() {
            self.cursor = Some(last.cursor(&self.order_by));
        }
        Ok(Some(documents))
    }

    pub fn into_stream(
        self,
        token: CancellationToken,
    ) -> impl Stream<Item = SyncResult<Vec<DocumentSnapshot>>> + Send {
        stream::try_unfold((self, token), |(mut pager, token)| async move {
            let page = pager.next_page(&token).await?;
            Ok(page.map(|documents| (documents, (pager, token))))
        })
    }
}
