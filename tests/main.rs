// Single main.rs for all integration tests
// https://endler.dev/2020/rust-compile-times/#combine-all-integration-tests-in-a-single-binary

use std::sync::Arc;

use docflat::context::SyncContext;
use docflat::discovery::{discover, DiscoveryOptions};
use docflat::resource::Resource;
use docflat::schema::Tables;
use docflat::store::memory::MemoryStore;
use docflat::sync::{sync, SyncOptions, SyncResult};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod failures;
mod fixtures;

const TEST_CLIENT_ID: &str = "memory:test";

// Small enough for the writer side to apply backpressure in every test
const TEST_CHANNEL_CAPACITY: usize = 4;

pub struct SyncRun {
    pub ctx: Arc<SyncContext>,
    pub result: SyncResult<()>,
    pub resources: Vec<Resource>,
}

impl SyncRun {
    // Resources of one table, in emission order
    pub fn table(&self, name: &str) -> Vec<&Resource> {
        self.resources
            .iter()
            .filter(|r| r.table_name() == name)
            .collect()
    }

    pub fn ids(&self, table: &str) -> Vec<String> {
        self.table(table)
            .iter()
            .filter_map(|r| r.id().map(str::to_string))
            .collect()
    }
}

pub async fn discover_tables(store: Arc<MemoryStore>, options: &SyncOptions) -> Tables {
    discover(
        store,
        &DiscoveryOptions::from(options),
        &CancellationToken::new(),
    )
    .await
    .expect("discovery succeeds")
}

// Discover the store's tables and sync all of them, collecting every emitted resource
pub async fn run_sync(store: Arc<MemoryStore>, options: SyncOptions) -> SyncRun {
    run_sync_with_token(store, options, CancellationToken::new()).await
}

pub async fn run_sync_with_token(
    store: Arc<MemoryStore>,
    options: SyncOptions,
    token: CancellationToken,
) -> SyncRun {
    let tables = discover_tables(store.clone(), &options).await;
    run_sync_with_tables(store, options, tables, token).await
}

pub async fn run_sync_with_tables(
    store: Arc<MemoryStore>,
    options: SyncOptions,
    tables: Tables,
    token: CancellationToken,
) -> SyncRun {
    let ctx = Arc::new(SyncContext::new(TEST_CLIENT_ID, tables));
    let (tx, mut rx) = mpsc::channel(TEST_CHANNEL_CAPACITY);
    let handle = tokio::spawn(sync(ctx.clone(), store, options, tx, token));

    let mut resources = vec![];
    while let Some(resource) = rx.recv().await {
        resources.push(resource);
    }
    let result = handle.await.expect("sync task does not panic");

    SyncRun {
        ctx,
        result,
        resources,
    }
}
